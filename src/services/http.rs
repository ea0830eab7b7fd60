use std::{sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        request::Parts,
        Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{auth::TokenSigner, dispatch, users::UserRequest, ServiceChannels, ServiceError};
use crate::models::users::User;

mod auth;
mod campaigns;
mod users;

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    channels: ServiceChannels,
    tokens: Arc<TokenSigner>,
    storage: &'static str,
}

impl AppState {
    pub fn new(channels: ServiceChannels, tokens: Arc<TokenSigner>, storage: &'static str) -> Self {
        AppState {
            channels,
            tokens,
            storage,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Validation(_) | ServiceError::InvalidCode => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Internal(_)
            | ServiceError::Database(_)
            | ServiceError::Communication(_, _) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status.is_server_error() {
            log::error!("Request failed: {}", self);
            "Server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// Unwraps a JSON body, turning a missing or unreadable one into a 400.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload.map(|Json(value)| value).map_err(|e| {
        log::debug!("Rejected request body: {}", e);
        let text = match e {
            JsonRejection::JsonDataError(e) => format!("Invalid request body: {}", e.body_text()),
            JsonRejection::JsonSyntaxError(e) => format!("Invalid request body: {}", e.body_text()),
            _ => "Invalid request: missing body".to_string(),
        };
        ServiceError::Validation(text)
    })
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": text }))
}

/// The account behind the request's bearer token.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Authorization token required".to_string()))?;

        let claims = state.tokens.verify(token).map_err(|e| {
            log::debug!("Bearer token refused: {}", e);
            ServiceError::Unauthorized("Invalid or expired token".to_string())
        })?;

        let id = claims.sub;
        let user = dispatch(&state.channels.users, "users", |response| UserRequest::GetUser {
            id,
            response,
        })
        .await?
        .ok_or_else(|| ServiceError::Unauthorized("User not found".to_string()))?;

        Ok(AuthUser(user))
    }
}

async fn welcome() -> impl IntoResponse {
    message("Welcome to Funderr API")
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "storage": state.storage }))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/", get(welcome))
        .route("/api/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/verify-token", post(auth::verify_token))
        .route(
            "/api/auth/request-password-reset",
            post(auth::request_password_reset),
        )
        .route("/api/auth/reset-password", post(auth::reset_password))
        .route("/api/auth/send-signup-code", post(auth::send_signup_code))
        .route("/api/auth/verify-signup-code", post(auth::verify_signup_code))
        .route("/api/auth/verify-reset-code", post(auth::verify_reset_code))
        .route(
            "/api/campaigns",
            post(campaigns::create_campaign).get(campaigns::list_campaigns),
        )
        .route(
            "/api/campaigns/user/{user_id}",
            get(campaigns::list_user_campaigns),
        )
        .route("/api/campaigns/{id}/approve", put(campaigns::approve_campaign))
        .route("/api/campaigns/{id}/reject", put(campaigns::reject_campaign))
        .route(
            "/api/campaigns/{id}/resubmit",
            put(campaigns::resubmit_campaign),
        )
        .route("/api/campaigns/{id}/donate", post(campaigns::donate))
        .route(
            "/api/users/{id}",
            get(users::get_user).put(users::update_user),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(address: &str, state: AppState) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(address).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("HTTP server shut down.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                log::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
