use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    repositories::{RepositoryError, Repositories},
    settings::Settings,
    utils::{Clock, SystemClock},
};

pub mod auth;
pub mod campaigns;
pub mod http;
pub mod users;
pub mod verification;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Invalid or expired code")]
    InvalidCode,
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

impl From<RepositoryError> for ServiceError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound => ServiceError::NotFound("Record not found".to_string()),
            RepositoryError::Duplicate(what) => {
                ServiceError::Conflict(format!("Duplicate record: {}", what))
            }
            RepositoryError::InvalidTransition { from } => {
                ServiceError::Conflict(format!("Campaign is already {}", from))
            }
            RepositoryError::ExceedsRemaining { remaining } => ServiceError::Validation(format!(
                "Donation exceeds the remaining target of {}",
                remaining
            )),
            RepositoryError::AlreadyFunded => {
                ServiceError::Conflict("Campaign is already fully funded".to_string())
            }
            RepositoryError::ClosedToDonations { status } => ServiceError::Conflict(format!(
                "Campaign is {} and cannot take donations",
                status
            )),
            RepositoryError::Database(e) => ServiceError::Database(e.to_string()),
            RepositoryError::Migration(e) => ServiceError::Database(e.to_string()),
        }
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Sends a request to a service and waits for its answer. `build` receives
/// the reply sender to embed in the request.
pub async fn dispatch<R, T, F>(
    channel: &mpsc::Sender<R>,
    service: &str,
    build: F,
) -> Result<T, ServiceError>
where
    F: FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
{
    let (response_tx, response_rx) = oneshot::channel();

    channel
        .send(build(response_tx))
        .await
        .map_err(|e| ServiceError::Communication(service.to_string(), e.to_string()))?;

    response_rx
        .await
        .map_err(|e| ServiceError::Communication(service.to_string(), e.to_string()))?
}

/// Senders for every running service.
#[derive(Clone)]
pub struct ServiceChannels {
    pub users: mpsc::Sender<users::UserRequest>,
    pub campaigns: mpsc::Sender<campaigns::CampaignRequest>,
    pub verification: mpsc::Sender<verification::VerificationRequest>,
}

/// Spawns the user, campaign and verification services on the current
/// runtime and returns the HTTP state wired to them.
pub fn spawn_services(
    repositories: &Repositories,
    settings: &Settings,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn verification::CodeNotifier>,
) -> Result<http::AppState, ServiceError> {
    let (user_tx, mut user_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (campaign_tx, mut campaign_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (verification_tx, mut verification_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let tokens = Arc::new(auth::TokenSigner::new(
        &settings.auth.jwt_secret,
        settings.auth.token_ttl_secs,
        clock.clone(),
    ));
    let passwords =
        auth::Passwords::new(settings.auth.hash_memory_kib, settings.auth.hash_iterations)?;

    log::info!("Starting user service.");
    let mut user_service = users::UserService::new();
    let user_handler =
        users::UserRequestHandler::new(repositories.users.clone(), passwords, tokens.clone());
    tokio::spawn(async move {
        user_service.run(user_handler, &mut user_rx).await;
    });

    log::info!("Starting campaign service.");
    let mut campaign_service = campaigns::CampaignService::new();
    let campaign_handler = campaigns::CampaignRequestHandler::new(
        repositories.campaigns.clone(),
        settings.campaigns.allow_resubmission,
        settings.campaigns.default_rejection_reason.clone(),
    );
    tokio::spawn(async move {
        campaign_service.run(campaign_handler, &mut campaign_rx).await;
    });

    log::info!("Starting verification service.");
    let mut verification_service = verification::VerificationService::new();
    let verification_handler = verification::VerificationRequestHandler::new(
        repositories.codes.clone(),
        notifier,
        clock,
        settings.verification.code_ttl_secs,
        user_tx.clone(),
    );
    tokio::spawn(async move {
        verification_service
            .run(verification_handler, &mut verification_rx)
            .await;
    });

    let channels = ServiceChannels {
        users: user_tx,
        campaigns: campaign_tx,
        verification: verification_tx,
    };

    Ok(http::AppState::new(channels, tokens, repositories.backend))
}

pub async fn start_services(repositories: Repositories, settings: Settings) -> Result<(), anyhow::Error> {
    let state = spawn_services(
        &repositories,
        &settings,
        Arc::new(SystemClock),
        Arc::new(verification::LogNotifier),
    )?;

    log::info!("Starting HTTP server.");
    http::start_http_server(&settings.listen_address(), state).await?;

    log::info!("Services stopped.");
    Ok(())
}
