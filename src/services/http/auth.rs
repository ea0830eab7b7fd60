use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::{body, message, AppState};
use crate::{
    models::{
        users::{AuthResponse, Credentials, NewUser},
        verification::{CodeCheck, CodeRequest, PasswordReset, TokenCheck},
    },
    services::{dispatch, users::UserRequest, verification::VerificationRequest, ServiceError},
};

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), ServiceError> {
    let user = body(payload)?;
    let response = dispatch(&state.channels.users, "users", |response| {
        UserRequest::Register { user, response }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<AuthResponse>, ServiceError> {
    let credentials = body(payload)?;
    let response = dispatch(&state.channels.users, "users", |response| {
        UserRequest::Login {
            credentials,
            response,
        }
    })
    .await?;

    Ok(Json(response))
}

/// Answers `{valid}` for any input; a token is valid only while its account exists.
pub async fn verify_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenCheck>, JsonRejection>,
) -> impl IntoResponse {
    let invalid = (StatusCode::UNAUTHORIZED, Json(json!({ "valid": false })));

    let Some(token) = payload.ok().and_then(|Json(check)| check.token) else {
        return invalid;
    };
    let Ok(claims) = state.tokens.verify(&token) else {
        return invalid;
    };

    let id = claims.sub;
    match dispatch(&state.channels.users, "users", |response| UserRequest::GetUser {
        id,
        response,
    })
    .await
    {
        Ok(Some(_)) => (StatusCode::OK, Json(json!({ "valid": true }))),
        Ok(None) => invalid,
        Err(e) => {
            log::error!("Token check failed: {}", e);
            invalid
        }
    }
}

pub async fn send_signup_code(
    State(state): State<AppState>,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let email = body(payload)?.email;
    dispatch(&state.channels.verification, "verification", |response| {
        VerificationRequest::SendSignupCode { email, response }
    })
    .await?;

    Ok(message("Signup code sent to email"))
}

pub async fn request_password_reset(
    State(state): State<AppState>,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let email = body(payload)?.email;
    dispatch(&state.channels.verification, "verification", |response| {
        VerificationRequest::RequestPasswordReset { email, response }
    })
    .await?;

    Ok(message("Reset code sent to email"))
}

pub async fn verify_signup_code(
    State(state): State<AppState>,
    payload: Result<Json<CodeCheck>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let CodeCheck { email, code } = body(payload)?;
    dispatch(&state.channels.verification, "verification", |response| {
        VerificationRequest::VerifySignupCode {
            email,
            code,
            response,
        }
    })
    .await?;

    Ok(message("Code verified"))
}

pub async fn verify_reset_code(
    State(state): State<AppState>,
    payload: Result<Json<CodeCheck>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let CodeCheck { email, code } = body(payload)?;
    dispatch(&state.channels.verification, "verification", |response| {
        VerificationRequest::VerifyResetCode {
            email,
            code,
            response,
        }
    })
    .await?;

    Ok(message("Code verified"))
}

pub async fn reset_password(
    State(state): State<AppState>,
    payload: Result<Json<PasswordReset>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let PasswordReset {
        email,
        code,
        new_password,
    } = body(payload)?;
    dispatch(&state.channels.verification, "verification", |response| {
        VerificationRequest::ResetPassword {
            email,
            code,
            new_password,
            response,
        }
    })
    .await?;

    Ok(message("Password reset successful"))
}
