use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;

use crate::models::{
    campaigns::{Campaign, CampaignDraft, CampaignStatus},
    users::{User, UserRecord, UserUpdate},
    verification::VerificationCode,
};

pub mod campaigns;
pub mod users;
pub mod verification;

/// Slack for float comparisons on campaign amounts.
pub const FUNDING_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Record not found")]
    NotFound,
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Campaign cannot leave the {from} state this way")]
    InvalidTransition { from: CampaignStatus },
    #[error("Donation exceeds the remaining target of {remaining}")]
    ExceedsRemaining { remaining: f64 },
    #[error("Campaign is already fully funded")]
    AlreadyFunded,
    #[error("A {status} campaign cannot take donations")]
    ClosedToDonations { status: CampaignStatus },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone, Debug)]
pub enum DonationOutcome {
    /// The donation was recorded and the campaign is still open.
    Applied(Campaign),
    /// The donation reached the goal; the returned campaign no longer exists.
    Completed(Campaign),
}

#[async_trait]
pub trait CampaignRepository: Send + Sync + 'static {
    async fn insert(
        &self,
        draft: CampaignDraft,
        creator_id: &str,
        creator_name: &str,
    ) -> Result<Campaign, RepositoryError>;

    /// Newest first. `None` returns every campaign.
    async fn list(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>, RepositoryError>;

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Campaign>, RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<Campaign>, RepositoryError>;

    /// Moves a campaign from `from` to `to` and stores `rejection_reason`.
    /// Fails with `InvalidTransition` when the campaign is not in `from`.
    async fn transition(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
        rejection_reason: Option<String>,
    ) -> Result<Campaign, RepositoryError>;

    /// Adds `amount` to `raised` and deletes the campaign once the goal is
    /// met, as one atomic step.
    async fn apply_donation(&self, id: &str, amount: f64)
        -> Result<DonationOutcome, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    async fn insert(&self, record: UserRecord) -> Result<User, RepositoryError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError>;

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;

    async fn update_profile(
        &self,
        id: &str,
        update: UserUpdate,
    ) -> Result<Option<User>, RepositoryError>;

    async fn set_password_hash(&self, id: &str, password_hash: &str)
        -> Result<(), RepositoryError>;
}

/// Short-lived verification codes keyed by email.
#[async_trait]
pub trait CodeStore: Send + Sync + 'static {
    /// Stores `code` for `email`, replacing whatever was there.
    async fn put(&self, email: &str, code: VerificationCode);

    /// Stores `code` only when `email` has no entry. Returns whether it was stored.
    async fn put_if_absent(&self, email: &str, code: VerificationCode) -> bool;

    async fn get(&self, email: &str) -> Option<VerificationCode>;

    /// Removes and returns the entry only if it accepts `code` at `now`.
    async fn take(&self, email: &str, code: &str, now: DateTime<Utc>) -> Option<VerificationCode>;
}

/// Computes the `raised` value after a donation of `amount`, or the reason
/// the donation cannot be taken.
pub fn next_raised(campaign: &Campaign, amount: f64) -> Result<f64, RepositoryError> {
    if campaign.status == CampaignStatus::Rejected {
        return Err(RepositoryError::ClosedToDonations {
            status: campaign.status,
        });
    }

    let remaining = campaign.remaining();
    if remaining <= FUNDING_EPSILON {
        return Err(RepositoryError::AlreadyFunded);
    }
    if amount > remaining + FUNDING_EPSILON {
        return Err(RepositoryError::ExceedsRemaining { remaining });
    }

    let raised = campaign.raised + amount;
    if campaign.goal - raised <= FUNDING_EPSILON {
        Ok(campaign.goal)
    } else {
        Ok(raised)
    }
}

#[derive(Clone)]
pub struct Repositories {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub users: Arc<dyn UserRepository>,
    pub codes: Arc<dyn CodeStore>,
    pub backend: &'static str,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            campaigns: Arc::new(campaigns::InMemoryCampaignRepository::new()),
            users: Arc::new(users::InMemoryUserRepository::new()),
            codes: Arc::new(verification::InMemoryCodeStore::new()),
            backend: "memory",
        }
    }

    pub async fn postgres(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let conn = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&conn).await?;
        log::info!("Database migrations applied.");

        Ok(Self {
            campaigns: Arc::new(campaigns::CampaignRepositoryPg::new(conn.clone())),
            users: Arc::new(users::UserRepositoryPg::new(conn)),
            codes: Arc::new(verification::InMemoryCodeStore::new()),
            backend: "postgres",
        })
    }
}
