//! Client for the Funderr API that keeps donations made while the server is
//! unreachable and replays them once it is back.

pub mod api;
pub mod donations;
pub mod models;
pub mod overrides;

pub use api::{CampaignApi, ClientError, HttpClient};
pub use donations::{CampaignFeed, DonationError, DonationOutcome, DonationReconciler};
pub use overrides::{CacheError, CampaignOverride, OverrideCache, PendingDonation};
