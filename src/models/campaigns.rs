use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "campaign_status", rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Approved,
    Rejected,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "pending",
            CampaignStatus::Approved => "approved",
            CampaignStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CampaignStatus::Pending),
            "approved" => Ok(CampaignStatus::Approved),
            "rejected" => Ok(CampaignStatus::Rejected),
            other => Err(format!("Unknown campaign status: {}", other)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
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
    pub status: CampaignStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_key: Option<String>,
}

impl Campaign {
    /// Amount still needed to reach the goal, never negative.
    pub fn remaining(&self) -> f64 {
        (self.goal - self.raised).max(0.0)
    }

    pub fn is_funded(&self) -> bool {
        self.raised >= self.goal
    }
}

/// Body of `POST /api/campaigns`, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub title: Option<String>,
    pub description: Option<String>,
    pub goal: Option<Value>,
    pub category: Option<String>,
    pub image_key: Option<String>,
}

/// A campaign submission that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct CampaignDraft {
    pub title: String,
    pub description: String,
    pub goal: f64,
    pub category: String,
    pub image_key: Option<String>,
}

impl NewCampaign {
    pub fn validate(self) -> Result<CampaignDraft, String> {
        let title = required_text(self.title, "title")?;
        let description = required_text(self.description, "description")?;
        let category = required_text(self.category, "category")?;

        let goal = match self.goal.as_ref().and_then(numeric) {
            Some(goal) if goal > 0.0 => goal,
            _ => return Err("Goal must be a positive number".to_string()),
        };

        let image_key = self
            .image_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Ok(CampaignDraft {
            title,
            description,
            goal,
            category,
            image_key,
        })
    }
}

fn required_text(value: Option<String>, field: &str) -> Result<String, String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("Field '{}' is required", field)),
    }
}

/// Reads a finite number out of a JSON value. Numeric strings are accepted
/// since form inputs usually arrive as text.
pub fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;

    number.is_finite().then_some(number)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CampaignQuery {
    pub status: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RejectCampaign {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewDonation {
    pub amount: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DonationReceipt {
    pub campaign: Campaign,
    pub completed: bool,
}
