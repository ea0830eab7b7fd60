use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    api::{CampaignApi, ClientError},
    models::{Campaign, FUNDING_EPSILON},
    overrides::{CacheError, CampaignOverride, OverrideCache, PendingDonation},
};

#[derive(Debug, thiserror::Error)]
pub enum DonationError {
    #[error("Please enter a valid donation amount")]
    InvalidAmount,
    #[error("You can only donate up to {remaining} to this campaign")]
    ExceedsRemaining { remaining: f64 },
    #[error("Campaign {0} is not in the feed")]
    UnknownCampaign(String),
    #[error(transparent)]
    Api(#[from] ClientError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DonationOutcome {
    /// The server recorded the donation.
    Confirmed { campaign: Campaign, completed: bool },
    /// The server was unreachable; the donation is applied locally and queued.
    Queued { campaign: Campaign, completed: bool },
}

impl DonationOutcome {
    pub fn campaign(&self) -> &Campaign {
        match self {
            DonationOutcome::Confirmed { campaign, .. } | DonationOutcome::Queued { campaign, .. } => {
                campaign
            }
        }
    }

    pub fn completed(&self) -> bool {
        match self {
            DonationOutcome::Confirmed { completed, .. } | DonationOutcome::Queued { completed, .. } => {
                *completed
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub discarded: usize,
    pub remaining: usize,
}

/// Sends donations to the server and keeps the local override cache in step
/// with what the server has accepted. Donations are attributed to `user_id`,
/// the account signed in on this client.
pub struct DonationReconciler {
    api: Arc<dyn CampaignApi>,
    cache: Arc<OverrideCache>,
    user_id: String,
    replay_lock: Mutex<()>,
}

impl DonationReconciler {
    pub fn new(api: Arc<dyn CampaignApi>, cache: Arc<OverrideCache>, user_id: &str) -> Self {
        DonationReconciler {
            api,
            cache,
            user_id: user_id.to_string(),
            replay_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &OverrideCache {
        &self.cache
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Campaigns the signed-in user has donated to from this client.
    pub async fn donated(&self) -> BTreeSet<String> {
        self.cache.donated(&self.user_id).await
    }

    /// Fetches campaigns, settles overrides the server has caught up with and
    /// returns the list with the remaining overrides applied.
    pub async fn fetch_campaigns(&self, status: Option<&str>) -> Result<Vec<Campaign>, DonationError> {
        let fetched = self.api.list_campaigns(status).await?;
        self.cache.reconcile(&fetched, status.is_none()).await?;

        Ok(self.cache.merge(fetched).await)
    }

    /// Fetches the campaigns `user_id` created. The list is partial, so it can
    /// settle raised totals but never deletions.
    pub async fn fetch_user_campaigns(&self, user_id: &str) -> Result<Vec<Campaign>, DonationError> {
        let fetched = self.api.list_user_campaigns(user_id).await?;
        self.cache.reconcile(&fetched, false).await?;

        Ok(self.cache.merge(fetched).await)
    }

    pub async fn donate(&self, campaign: &Campaign, amount: f64) -> Result<DonationOutcome, DonationError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(DonationError::InvalidAmount);
        }

        let mut local = campaign.clone();
        if let Some(CampaignOverride {
            raised: Some(raised),
            ..
        }) = self.cache.get(&campaign.id).await
        {
            local.raised = raised;
        }

        let remaining = local.remaining();
        if amount > remaining + FUNDING_EPSILON {
            return Err(DonationError::ExceedsRemaining { remaining });
        }

        match self.api.donate(&campaign.id, amount).await {
            Ok(receipt) => {
                if !self.cache.has_pending(&campaign.id).await {
                    self.cache.remove(&campaign.id).await?;
                }
                self.cache.mark_donated(&self.user_id, &campaign.id).await?;

                Ok(DonationOutcome::Confirmed {
                    campaign: receipt.campaign,
                    completed: receipt.completed,
                })
            }
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "Donation to campaign {} queued for replay: {}",
                    campaign.id,
                    e
                );

                local.raised = (local.raised + amount).min(local.goal);
                let completed = local.is_funded();
                let entry = if completed {
                    CampaignOverride::deleted()
                } else {
                    CampaignOverride::raised(local.raised)
                };

                self.cache
                    .record_offline(
                        entry,
                        PendingDonation {
                            user_id: self.user_id.clone(),
                            campaign_id: campaign.id.clone(),
                            amount,
                            queued_at: Utc::now(),
                        },
                    )
                    .await?;

                Ok(DonationOutcome::Queued {
                    campaign: local,
                    completed,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resends queued donations oldest first. Stops at the first failure that
    /// may succeed later; refused donations are dropped with their override.
    pub async fn replay_pending(&self) -> Result<ReplaySummary, DonationError> {
        let _guard = self.replay_lock.lock().await;
        let mut summary = ReplaySummary::default();

        while let Some(next) = self.cache.next_pending().await {
            match self.api.donate(&next.campaign_id, next.amount).await {
                Ok(_) => {
                    self.cache.confirm_next().await?;
                    summary.replayed += 1;
                }
                Err(e) if e.is_retryable() => {
                    log::info!("Replay paused, server still unavailable: {}", e);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "Server refused queued donation to campaign {}: {}",
                        next.campaign_id,
                        e
                    );
                    self.cache.discard_next().await?;
                    summary.discarded += 1;
                }
            }
        }

        summary.remaining = self.cache.pending().await.len();
        Ok(summary)
    }

    /// Runs `replay_pending` every `every` until the handle is aborted.
    pub fn spawn_replay(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match reconciler.replay_pending().await {
                    Ok(summary) if summary.replayed + summary.discarded > 0 => {
                        log::info!(
                            "Replayed {} donations, discarded {}, {} left.",
                            summary.replayed,
                            summary.discarded,
                            summary.remaining
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Donation replay failed: {}", e),
                }
            }
        })
    }
}

/// The campaign list a screen shows, kept current as donations go through.
pub struct CampaignFeed {
    reconciler: Arc<DonationReconciler>,
    status: Option<String>,
    campaigns: Vec<Campaign>,
}

impl CampaignFeed {
    pub fn new(reconciler: Arc<DonationReconciler>, status: Option<&str>) -> Self {
        CampaignFeed {
            reconciler,
            status: status.map(str::to_string),
            campaigns: Vec::new(),
        }
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    pub async fn refresh(&mut self) -> Result<&[Campaign], DonationError> {
        self.campaigns = self
            .reconciler
            .fetch_campaigns(self.status.as_deref())
            .await?;

        Ok(&self.campaigns)
    }

    /// Donates to a listed campaign. A campaign that reaches its goal leaves
    /// the feed.
    pub async fn donate(&mut self, campaign_id: &str, amount: f64) -> Result<DonationOutcome, DonationError> {
        let index = self
            .campaigns
            .iter()
            .position(|c| c.id == campaign_id)
            .ok_or_else(|| DonationError::UnknownCampaign(campaign_id.to_string()))?;

        let outcome = self
            .reconciler
            .donate(&self.campaigns[index], amount)
            .await?;

        if outcome.completed() {
            self.campaigns.remove(index);
        } else {
            self.campaigns[index].raised = outcome.campaign().raised;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex as StdMutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{models::DonationReceipt, overrides::tests::campaign};

    /// Answers donations from a script and lists a fixed set of campaigns.
    #[derive(Default)]
    struct ScriptedApi {
        listed: StdMutex<Vec<Campaign>>,
        answers: StdMutex<VecDeque<Result<bool, ClientError>>>,
        calls: StdMutex<Vec<(String, f64)>>,
    }

    impl ScriptedApi {
        fn answer(&self, answer: Result<bool, ClientError>) {
            self.answers.lock().unwrap().push_back(answer);
        }

        fn list(&self, campaigns: Vec<Campaign>) {
            *self.listed.lock().unwrap() = campaigns;
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    fn offline() -> ClientError {
        ClientError::Transport("connection refused".to_string())
    }

    fn refused() -> ClientError {
        ClientError::Rejected {
            status: 404,
            message: "Campaign not found".to_string(),
        }
    }

    #[async_trait]
    impl CampaignApi for ScriptedApi {
        async fn list_campaigns(&self, _: Option<&str>) -> Result<Vec<Campaign>, ClientError> {
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn list_user_campaigns(&self, user_id: &str) -> Result<Vec<Campaign>, ClientError> {
            Ok(self
                .listed
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.creator_id == user_id)
                .cloned()
                .collect())
        }

        async fn donate(&self, campaign_id: &str, amount: f64) -> Result<DonationReceipt, ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push((campaign_id.to_string(), amount));

            let completed = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(false))?;
            let mut campaign = campaign(campaign_id, 100.0, 0.0);
            campaign.raised = if completed { 100.0 } else { amount };

            Ok(DonationReceipt {
                campaign,
                completed,
            })
        }
    }

    struct Fixture {
        api: Arc<ScriptedApi>,
        reconciler: Arc<DonationReconciler>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = OverrideCache::open(dir.path().join("overrides.json"))
            .await
            .unwrap();
        let api = Arc::new(ScriptedApi::default());
        let reconciler = Arc::new(DonationReconciler::new(api.clone(), Arc::new(cache), "donor"));

        Fixture {
            api,
            reconciler,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn amount_is_checked_before_calling_the_server() {
        let f = fixture().await;
        let target = campaign("c1", 100.0, 80.0);

        for amount in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let result = f.reconciler.donate(&target, amount).await;
            assert!(matches!(result, Err(DonationError::InvalidAmount)));
        }

        let result = f.reconciler.donate(&target, 30.0).await;
        assert!(matches!(result, Err(DonationError::ExceedsRemaining { remaining }) if remaining == 20.0));
        assert_eq!(f.api.calls(), 0);
    }

    #[tokio::test]
    async fn confirmed_donation_clears_override() {
        let f = fixture().await;
        f.reconciler
            .cache()
            .set("c1", CampaignOverride::raised(10.0))
            .await
            .unwrap();

        let outcome = f
            .reconciler
            .donate(&campaign("c1", 100.0, 0.0), 15.0)
            .await
            .unwrap();

        assert!(matches!(outcome, DonationOutcome::Confirmed { completed: false, .. }));
        assert!(f.reconciler.cache().get("c1").await.is_none());
        assert!(f.reconciler.donated().await.contains("c1"));
        assert!(f.reconciler.cache().donated("someone-else").await.is_empty());
    }

    #[tokio::test]
    async fn refused_donation_changes_nothing_locally() {
        let f = fixture().await;
        f.api.answer(Err(refused()));

        let result = f.reconciler.donate(&campaign("c1", 100.0, 0.0), 15.0).await;

        assert!(matches!(result, Err(DonationError::Api(ClientError::Rejected { .. }))));
        assert!(f.reconciler.cache().get("c1").await.is_none());
        assert!(f.reconciler.cache().pending().await.is_empty());
    }

    #[tokio::test]
    async fn offline_donation_is_kept_until_replayed() {
        let f = fixture().await;
        f.api.answer(Err(offline()));

        let outcome = f
            .reconciler
            .donate(&campaign("c1", 100.0, 40.0), 20.0)
            .await
            .unwrap();
        assert!(matches!(outcome, DonationOutcome::Queued { completed: false, .. }));
        assert_eq!(outcome.campaign().raised, 60.0);

        let cache = f.reconciler.cache();
        assert_eq!(cache.get("c1").await, Some(CampaignOverride::raised(60.0)));
        assert_eq!(cache.pending().await.len(), 1);

        // The server still reports the old total while the donation is queued.
        f.api.list(vec![campaign("c1", 100.0, 40.0)]);
        let listed = f.reconciler.fetch_campaigns(None).await.unwrap();
        assert_eq!(listed[0].raised, 60.0);

        let summary = f.reconciler.replay_pending().await.unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                replayed: 1,
                discarded: 0,
                remaining: 0
            }
        );
        assert!(cache.get("c1").await.is_none());
        assert!(cache.pending().await.is_empty());
    }

    #[tokio::test]
    async fn offline_donation_reaching_goal_hides_campaign() {
        let f = fixture().await;
        f.api.answer(Err(offline()));

        let outcome = f
            .reconciler
            .donate(&campaign("c1", 100.0, 90.0), 10.0)
            .await
            .unwrap();
        assert!(outcome.completed());
        assert_eq!(
            f.reconciler.cache().get("c1").await,
            Some(CampaignOverride::deleted())
        );

        f.api.list(vec![campaign("c1", 100.0, 90.0), campaign("c2", 50.0, 0.0)]);
        let listed = f.reconciler.fetch_campaigns(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c2");
    }

    #[tokio::test]
    async fn replay_stops_when_server_is_still_down() {
        let f = fixture().await;
        f.api.answer(Err(offline()));
        f.api.answer(Err(offline()));
        f.reconciler
            .donate(&campaign("c1", 100.0, 0.0), 10.0)
            .await
            .unwrap();
        f.reconciler
            .donate(&campaign("c2", 100.0, 0.0), 10.0)
            .await
            .unwrap();

        f.api.answer(Err(ClientError::Server {
            status: 503,
            message: "Server error".to_string(),
        }));
        let summary = f.reconciler.replay_pending().await.unwrap();

        assert_eq!(summary.replayed, 0);
        assert_eq!(summary.remaining, 2);
        assert!(f.reconciler.cache().get("c1").await.is_some());
    }

    #[tokio::test]
    async fn refused_replay_drops_entry_and_override() {
        let f = fixture().await;
        f.api.answer(Err(offline()));
        f.api.answer(Err(offline()));
        f.reconciler
            .donate(&campaign("c1", 100.0, 0.0), 10.0)
            .await
            .unwrap();
        f.reconciler
            .donate(&campaign("c2", 100.0, 0.0), 10.0)
            .await
            .unwrap();

        f.api.answer(Err(refused()));
        f.api.answer(Ok(false));
        let summary = f.reconciler.replay_pending().await.unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                replayed: 1,
                discarded: 1,
                remaining: 0
            }
        );
        let cache = f.reconciler.cache();
        assert!(cache.get("c1").await.is_none());
        assert!(cache.get("c2").await.is_none());
    }

    #[tokio::test]
    async fn deleted_override_settles_once_server_drops_campaign() {
        let f = fixture().await;
        f.reconciler
            .cache()
            .set("c1", CampaignOverride::deleted())
            .await
            .unwrap();

        f.api.list(vec![campaign("c2", 50.0, 0.0)]);
        f.reconciler.fetch_campaigns(Some("approved")).await.unwrap();
        assert!(f.reconciler.cache().get("c1").await.is_some());

        f.reconciler.fetch_campaigns(None).await.unwrap();
        assert!(f.reconciler.cache().get("c1").await.is_none());
    }

    #[tokio::test]
    async fn feed_drops_campaign_completed_by_donation() {
        let f = fixture().await;
        f.api.list(vec![campaign("c1", 100.0, 80.0), campaign("c2", 50.0, 0.0)]);

        let mut feed = CampaignFeed::new(f.reconciler.clone(), None);
        assert_eq!(feed.refresh().await.unwrap().len(), 2);

        f.api.answer(Ok(true));
        let outcome = feed.donate("c1", 20.0).await.unwrap();
        assert!(outcome.completed());
        assert_eq!(feed.campaigns().len(), 1);
        assert_eq!(feed.campaigns()[0].id, "c2");

        let unknown = feed.donate("c1", 1.0).await;
        assert!(matches!(unknown, Err(DonationError::UnknownCampaign(_))));
    }

    #[tokio::test]
    async fn background_replay_drains_queue() {
        let f = fixture().await;
        f.api.answer(Err(offline()));
        f.reconciler
            .donate(&campaign("c1", 100.0, 0.0), 10.0)
            .await
            .unwrap();

        let handle = f.reconciler.spawn_replay(Duration::from_millis(10));
        for _ in 0..100 {
            if f.reconciler.cache().pending().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(f.reconciler.cache().pending().await.is_empty());
        assert_eq!(f.api.calls(), 2);
    }

    #[tokio::test]
    async fn user_campaigns_settle_totals_but_not_deletions() {
        let f = fixture().await;
        let cache = f.reconciler.cache();
        cache.set("mine", CampaignOverride::raised(30.0)).await.unwrap();
        cache.set("mine-behind", CampaignOverride::raised(90.0)).await.unwrap();
        cache.set("elsewhere", CampaignOverride::deleted()).await.unwrap();

        let mut mine = campaign("mine", 100.0, 30.0);
        mine.creator_id = "ada".to_string();
        let mut behind = campaign("mine-behind", 100.0, 40.0);
        behind.creator_id = "ada".to_string();
        f.api.list(vec![mine, behind, campaign("c9", 100.0, 0.0)]);

        let listed = f.reconciler.fetch_user_campaigns("ada").await.unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].raised, 90.0);
        assert!(cache.get("mine").await.is_none());
        assert!(cache.get("mine-behind").await.is_some());
        assert!(cache.get("elsewhere").await.is_some());
    }

    #[tokio::test]
    async fn donations_are_attributed_to_the_signed_in_user() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            OverrideCache::open(dir.path().join("overrides.json"))
                .await
                .unwrap(),
        );
        let api = Arc::new(ScriptedApi::default());
        let ada = DonationReconciler::new(api.clone(), cache.clone(), "ada");
        let bob = DonationReconciler::new(api.clone(), cache.clone(), "bob");

        ada.donate(&campaign("c1", 100.0, 0.0), 10.0).await.unwrap();
        api.answer(Err(offline()));
        bob.donate(&campaign("c2", 100.0, 0.0), 10.0).await.unwrap();

        assert!(ada.donated().await.contains("c1"));
        assert!(!ada.donated().await.contains("c2"));
        assert!(bob.donated().await.contains("c2"));
        assert!(!bob.donated().await.contains("c1"));

        // Whoever drains the queue, the confirmed donation stays with bob.
        ada.replay_pending().await.unwrap();
        assert!(!ada.donated().await.contains("c2"));
        assert!(bob.donated().await.contains("c2"));
    }
}
