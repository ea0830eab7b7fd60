use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use sqlx::PgPool;
use uuid::Uuid;

use super::{next_raised, CampaignRepository, DonationOutcome, RepositoryError};
use crate::models::campaigns::{Campaign, CampaignDraft, CampaignStatus};

#[derive(Clone)]
pub struct CampaignRepositoryPg {
    conn: PgPool,
}

impl CampaignRepositoryPg {
    pub fn new(conn: PgPool) -> Self {
        CampaignRepositoryPg { conn }
    }
}

#[async_trait]
impl CampaignRepository for CampaignRepositoryPg {
    async fn insert(
        &self,
        draft: CampaignDraft,
        creator_id: &str,
        creator_name: &str,
    ) -> Result<Campaign, RepositoryError> {
        let campaign_id = Uuid::new_v4().hyphenated().to_string();

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
                INSERT INTO campaigns
                (id, title, description, goal, raised, category, creator_id, creator_name, status, image_key)
                VALUES ($1, $2, $3, $4, 0, $5, $6, $7, 'pending', $8)
                RETURNING *
            "#,
        )
        .bind(&campaign_id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(draft.goal)
        .bind(&draft.category)
        .bind(creator_id)
        .bind(creator_name)
        .bind(&draft.image_key)
        .fetch_one(&self.conn)
        .await?;

        Ok(campaign)
    }

    async fn list(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>, RepositoryError> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            r#"SELECT * FROM campaigns
            WHERE ($1::campaign_status IS NULL OR status = $1)
            ORDER BY created_at DESC"#,
        )
        .bind(status)
        .fetch_all(&self.conn)
        .await?;

        Ok(campaigns)
    }

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Campaign>, RepositoryError> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE creator_id = $1 ORDER BY created_at DESC",
        )
        .bind(creator_id)
        .fetch_all(&self.conn)
        .await?;

        Ok(campaigns)
    }

    async fn get(&self, id: &str) -> Result<Option<Campaign>, RepositoryError> {
        let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?;

        Ok(campaign)
    }

    async fn transition(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
        rejection_reason: Option<String>,
    ) -> Result<Campaign, RepositoryError> {
        let updated = sqlx::query_as::<_, Campaign>(
            r#"UPDATE campaigns SET status = $3, rejection_reason = $4
            WHERE id = $1 AND status = $2
            RETURNING *"#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(rejection_reason)
        .fetch_optional(&self.conn)
        .await?;

        match updated {
            Some(campaign) => Ok(campaign),
            None => match self.get(id).await? {
                Some(current) => Err(RepositoryError::InvalidTransition {
                    from: current.status,
                }),
                None => Err(RepositoryError::NotFound),
            },
        }
    }

    async fn apply_donation(
        &self,
        id: &str,
        amount: f64,
    ) -> Result<DonationOutcome, RepositoryError> {
        let mut tx = self.conn.begin().await?;

        let campaign =
            sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(RepositoryError::NotFound)?;

        let raised = next_raised(&campaign, amount)?;

        let updated = sqlx::query_as::<_, Campaign>(
            "UPDATE campaigns SET raised = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(raised)
        .fetch_one(&mut *tx)
        .await?;

        if updated.is_funded() {
            sqlx::query("DELETE FROM campaigns WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            return Ok(DonationOutcome::Completed(updated));
        }

        tx.commit().await?;
        Ok(DonationOutcome::Applied(updated))
    }
}

struct StoredCampaign {
    seq: u64,
    campaign: Campaign,
}

/// Campaign store backed by a `DashMap`. Insertion order breaks ties between
/// campaigns created in the same instant.
pub struct InMemoryCampaignRepository {
    campaigns: DashMap<String, StoredCampaign>,
    next_seq: AtomicU64,
}

impl InMemoryCampaignRepository {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn collect<F>(&self, keep: F) -> Vec<Campaign>
    where
        F: Fn(&Campaign) -> bool,
    {
        let mut matching: Vec<(u64, Campaign)> = self
            .campaigns
            .iter()
            .filter(|entry| keep(&entry.campaign))
            .map(|entry| (entry.seq, entry.campaign.clone()))
            .collect();

        matching.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });

        matching.into_iter().map(|(_, campaign)| campaign).collect()
    }
}

impl Default for InMemoryCampaignRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignRepository for InMemoryCampaignRepository {
    async fn insert(
        &self,
        draft: CampaignDraft,
        creator_id: &str,
        creator_name: &str,
    ) -> Result<Campaign, RepositoryError> {
        let campaign = Campaign {
            id: Uuid::new_v4().hyphenated().to_string(),
            title: draft.title,
            description: draft.description,
            goal: draft.goal,
            raised: 0.0,
            category: draft.category,
            creator_id: creator_id.to_string(),
            creator_name: creator_name.to_string(),
            created_at: Utc::now(),
            status: CampaignStatus::Pending,
            rejection_reason: None,
            image_key: draft.image_key,
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.campaigns.insert(
            campaign.id.clone(),
            StoredCampaign {
                seq,
                campaign: campaign.clone(),
            },
        );

        Ok(campaign)
    }

    async fn list(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>, RepositoryError> {
        Ok(self.collect(|campaign| status.map_or(true, |status| campaign.status == status)))
    }

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Campaign>, RepositoryError> {
        Ok(self.collect(|campaign| campaign.creator_id == creator_id))
    }

    async fn get(&self, id: &str) -> Result<Option<Campaign>, RepositoryError> {
        Ok(self.campaigns.get(id).map(|entry| entry.campaign.clone()))
    }

    async fn transition(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
        rejection_reason: Option<String>,
    ) -> Result<Campaign, RepositoryError> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;

        if entry.campaign.status != from {
            return Err(RepositoryError::InvalidTransition {
                from: entry.campaign.status,
            });
        }

        entry.campaign.status = to;
        entry.campaign.rejection_reason = rejection_reason;

        Ok(entry.campaign.clone())
    }

    async fn apply_donation(
        &self,
        id: &str,
        amount: f64,
    ) -> Result<DonationOutcome, RepositoryError> {
        match self.campaigns.entry(id.to_string()) {
            Entry::Vacant(_) => Err(RepositoryError::NotFound),
            Entry::Occupied(mut entry) => {
                let raised = next_raised(&entry.get().campaign, amount)?;
                entry.get_mut().campaign.raised = raised;

                if entry.get().campaign.is_funded() {
                    let stored = entry.remove();
                    Ok(DonationOutcome::Completed(stored.campaign))
                } else {
                    Ok(DonationOutcome::Applied(entry.get().campaign.clone()))
                }
            }
        }
    }
}
