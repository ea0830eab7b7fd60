use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};

use super::{body, AppState, AuthUser};
use crate::{
    models::users::{UserProfile, UserUpdate},
    services::{dispatch, users::UserRequest, ServiceError},
};

fn ensure_self(auth: &AuthUser, user_id: &str) -> Result<(), ServiceError> {
    if auth.0.id == user_id {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Access denied".to_string()))
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ServiceError> {
    ensure_self(&auth, &user_id)?;

    let user = dispatch(&state.channels.users, "users", |response| UserRequest::GetUser {
        id: user_id,
        response,
    })
    .await?
    .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    Ok(Json(user.profile()))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<String>,
    payload: Result<Json<UserUpdate>, JsonRejection>,
) -> Result<Json<UserProfile>, ServiceError> {
    ensure_self(&auth, &user_id)?;
    let update = body(payload)?;

    let user = dispatch(&state.channels.users, "users", |response| {
        UserRequest::UpdateProfile {
            id: user_id,
            update,
            response,
        }
    })
    .await?
    .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    Ok(Json(user.profile()))
}
