//! Local view of donations the server has not confirmed yet.
//!
//! The cache is one JSON document holding per-campaign overrides and the queue
//! of donations waiting to be replayed. Every change is written through to disk
//! so a restart picks up where the previous run stopped.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::{Campaign, FUNDING_EPSILON};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CampaignOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raised: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl CampaignOverride {
    pub fn raised(raised: f64) -> Self {
        CampaignOverride {
            raised: Some(raised),
            deleted: false,
        }
    }

    pub fn deleted() -> Self {
        CampaignOverride {
            raised: None,
            deleted: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingDonation {
    /// The signed-in user who made the donation.
    #[serde(default)]
    pub user_id: String,
    pub campaign_id: String,
    pub amount: f64,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CacheState {
    #[serde(default)]
    overrides: BTreeMap<String, CampaignOverride>,
    #[serde(default)]
    pending: Vec<PendingDonation>,
    /// Confirmed donations, campaign ids keyed by user id.
    #[serde(default)]
    donated_by: BTreeMap<String, BTreeSet<String>>,
}

impl CacheState {
    fn has_pending(&self, campaign_id: &str) -> bool {
        self.pending.iter().any(|p| p.campaign_id == campaign_id)
    }
}

pub struct OverrideCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl OverrideCache {
    /// Loads the cache at `path`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("Discarding corrupt override cache {}: {}", path.display(), e);
                CacheState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(OverrideCache {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &CacheState) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn get(&self, campaign_id: &str) -> Option<CampaignOverride> {
        self.state.lock().await.overrides.get(campaign_id).cloned()
    }

    pub async fn set(&self, campaign_id: &str, entry: CampaignOverride) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.overrides.insert(campaign_id.to_string(), entry);
        self.persist(&state).await
    }

    pub async fn remove(&self, campaign_id: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if state.overrides.remove(campaign_id).is_some() {
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// Applies `entry` and queues `donation` in one write.
    pub async fn record_offline(
        &self,
        entry: CampaignOverride,
        donation: PendingDonation,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state
            .overrides
            .insert(donation.campaign_id.clone(), entry);
        state.pending.push(donation);
        self.persist(&state).await
    }

    pub async fn pending(&self) -> Vec<PendingDonation> {
        self.state.lock().await.pending.clone()
    }

    pub async fn next_pending(&self) -> Option<PendingDonation> {
        self.state.lock().await.pending.first().cloned()
    }

    pub async fn has_pending(&self, campaign_id: &str) -> bool {
        self.state.lock().await.has_pending(campaign_id)
    }

    /// Removes the head of the queue once the server accepted it. The
    /// campaign's override goes too when nothing else is queued for it.
    pub async fn confirm_next(&self) -> Result<Option<PendingDonation>, CacheError> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(None);
        }

        let done = state.pending.remove(0);
        if !state.has_pending(&done.campaign_id) {
            state.overrides.remove(&done.campaign_id);
        }
        state
            .donated_by
            .entry(done.user_id.clone())
            .or_default()
            .insert(done.campaign_id.clone());

        self.persist(&state).await?;
        Ok(Some(done))
    }

    /// Drops the head of the queue after the server refused it, along with
    /// the campaign's override.
    pub async fn discard_next(&self) -> Result<Option<PendingDonation>, CacheError> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(None);
        }

        let dropped = state.pending.remove(0);
        state.overrides.remove(&dropped.campaign_id);

        self.persist(&state).await?;
        Ok(Some(dropped))
    }

    pub async fn mark_donated(&self, user_id: &str, campaign_id: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let added = state
            .donated_by
            .entry(user_id.to_string())
            .or_default()
            .insert(campaign_id.to_string());
        if added {
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// Campaigns `user_id` has donated to from this device, confirmed or not.
    pub async fn donated(&self, user_id: &str) -> BTreeSet<String> {
        let state = self.state.lock().await;
        let mut donated = state.donated_by.get(user_id).cloned().unwrap_or_default();
        donated.extend(
            state
                .pending
                .iter()
                .filter(|p| p.user_id == user_id)
                .map(|p| p.campaign_id.clone()),
        );
        donated
    }

    /// Drops overrides the server has caught up with. `complete` says whether
    /// `fetched` is the unfiltered list, so absence means the campaign is gone
    /// and any override for it is moot.
    pub async fn reconcile(&self, fetched: &[Campaign], complete: bool) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;

        let settled: Vec<String> = state
            .overrides
            .iter()
            .filter(|(id, _)| !state.has_pending(id))
            .filter(|(id, entry)| match fetched.iter().find(|c| &c.id == *id) {
                None => complete,
                Some(_) if entry.deleted => false,
                Some(server) => entry
                    .raised
                    .is_some_and(|raised| server.raised + FUNDING_EPSILON >= raised),
            })
            .map(|(id, _)| id.clone())
            .collect();

        if settled.is_empty() {
            return Ok(());
        }

        for id in &settled {
            log::debug!("Override for campaign {} settled by server.", id);
            state.overrides.remove(id);
        }
        self.persist(&state).await
    }

    /// Overlays local state on a fetched list: deleted campaigns disappear and
    /// overridden totals replace the server's.
    pub async fn merge(&self, campaigns: Vec<Campaign>) -> Vec<Campaign> {
        let state = self.state.lock().await;

        campaigns
            .into_iter()
            .filter_map(|mut campaign| match state.overrides.get(&campaign.id) {
                Some(entry) if entry.deleted => None,
                Some(CampaignOverride {
                    raised: Some(raised),
                    ..
                }) => {
                    campaign.raised = *raised;
                    Some(campaign)
                }
                _ => Some(campaign),
            })
            .collect()
    }
}
