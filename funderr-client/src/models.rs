use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slack for float comparisons on campaign amounts.
pub const FUNDING_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub description: String,
    pub goal: f64,
    pub raised: f64,
    pub category: String,
    pub creator_id: String,
    pub creator_name: String,
    #[serde(rename = "dateCreated")]
    pub created_at: DateTime<Utc>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_key: Option<String>,
}

impl Campaign {
    pub fn remaining(&self) -> f64 {
        (self.goal - self.raised).max(0.0)
    }

    pub fn is_funded(&self) -> bool {
        self.goal - self.raised <= FUNDING_EPSILON
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DonationReceipt {
    pub campaign: Campaign,
    pub completed: bool,
}
