use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::{
    models::{
        campaigns::{numeric, Campaign, CampaignStatus, DonationReceipt, NewCampaign},
        users::User,
    },
    repositories::{CampaignRepository, DonationOutcome, RepositoryError},
};

pub enum CampaignRequest {
    Create {
        creator: User,
        campaign: NewCampaign,
        response: oneshot::Sender<Result<Campaign, ServiceError>>,
    },
    List {
        status: Option<String>,
        response: oneshot::Sender<Result<Vec<Campaign>, ServiceError>>,
    },
    ListByCreator {
        creator_id: String,
        response: oneshot::Sender<Result<Vec<Campaign>, ServiceError>>,
    },
    Approve {
        actor: User,
        id: String,
        response: oneshot::Sender<Result<Campaign, ServiceError>>,
    },
    Reject {
        actor: User,
        id: String,
        reason: Option<String>,
        response: oneshot::Sender<Result<Campaign, ServiceError>>,
    },
    Resubmit {
        actor: User,
        id: String,
        response: oneshot::Sender<Result<Campaign, ServiceError>>,
    },
    Donate {
        id: String,
        amount: Option<Value>,
        response: oneshot::Sender<Result<DonationReceipt, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct CampaignRequestHandler {
    repository: Arc<dyn CampaignRepository>,
    allow_resubmission: bool,
    default_rejection_reason: String,
}

fn not_found() -> ServiceError {
    ServiceError::NotFound("Campaign not found".to_string())
}

fn require_admin(actor: &User) -> Result<(), ServiceError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Admin access required".to_string()))
    }
}

impl CampaignRequestHandler {
    pub fn new(
        repository: Arc<dyn CampaignRepository>,
        allow_resubmission: bool,
        default_rejection_reason: String,
    ) -> Self {
        CampaignRequestHandler {
            repository,
            allow_resubmission,
            default_rejection_reason,
        }
    }

    async fn create(&self, creator: &User, campaign: NewCampaign) -> Result<Campaign, ServiceError> {
        let draft = campaign.validate().map_err(ServiceError::Validation)?;

        let campaign = self
            .repository
            .insert(draft, &creator.id, &creator.name)
            .await?;

        log::info!("Campaign {} submitted by {}.", campaign.id, creator.id);
        Ok(campaign)
    }

    async fn list(&self, status: Option<String>) -> Result<Vec<Campaign>, ServiceError> {
        let status = status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<CampaignStatus>())
            .transpose()
            .map_err(ServiceError::Validation)?;

        Ok(self.repository.list(status).await?)
    }

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Campaign>, ServiceError> {
        Ok(self.repository.list_by_creator(creator_id).await?)
    }

    async fn moderate(
        &self,
        id: &str,
        from: CampaignStatus,
        to: CampaignStatus,
        rejection_reason: Option<String>,
    ) -> Result<Campaign, ServiceError> {
        match self.repository.transition(id, from, to, rejection_reason).await {
            Ok(campaign) => {
                log::info!("Campaign {} moved from {} to {}.", id, from, to);
                Ok(campaign)
            }
            Err(RepositoryError::NotFound) => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn approve(&self, actor: &User, id: &str) -> Result<Campaign, ServiceError> {
        require_admin(actor)?;
        self.moderate(id, CampaignStatus::Pending, CampaignStatus::Approved, None)
            .await
    }

    async fn reject(
        &self,
        actor: &User,
        id: &str,
        reason: Option<String>,
    ) -> Result<Campaign, ServiceError> {
        require_admin(actor)?;

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.default_rejection_reason.clone());

        self.moderate(
            id,
            CampaignStatus::Pending,
            CampaignStatus::Rejected,
            Some(reason),
        )
        .await
    }

    async fn resubmit(&self, actor: &User, id: &str) -> Result<Campaign, ServiceError> {
        let campaign = self.repository.get(id).await?.ok_or_else(not_found)?;

        if campaign.creator_id != actor.id {
            return Err(ServiceError::Forbidden(
                "Only the campaign creator can resubmit it".to_string(),
            ));
        }
        if !self.allow_resubmission {
            return Err(ServiceError::Conflict(
                "Rejected campaigns cannot be resubmitted".to_string(),
            ));
        }

        self.moderate(id, CampaignStatus::Rejected, CampaignStatus::Pending, None)
            .await
    }

    async fn donate(&self, id: &str, amount: Option<Value>) -> Result<DonationReceipt, ServiceError> {
        let amount = match amount.as_ref().and_then(numeric) {
            Some(amount) if amount > 0.0 => amount,
            _ => {
                return Err(ServiceError::Validation(
                    "Donation amount must be a positive number".to_string(),
                ))
            }
        };

        match self.repository.apply_donation(id, amount).await {
            Ok(DonationOutcome::Applied(campaign)) => {
                log::info!("Donation of {} recorded for campaign {}.", amount, id);
                Ok(DonationReceipt {
                    campaign,
                    completed: false,
                })
            }
            Ok(DonationOutcome::Completed(campaign)) => {
                log::info!("Campaign {} reached its goal and was retired.", id);
                Ok(DonationReceipt {
                    campaign,
                    completed: true,
                })
            }
            Err(RepositoryError::NotFound) => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RequestHandler<CampaignRequest> for CampaignRequestHandler {
    async fn handle_request(&self, request: CampaignRequest) {
        match request {
            CampaignRequest::Create {
                creator,
                campaign,
                response,
            } => {
                let result = self.create(&creator, campaign).await;
                let _ = response.send(result);
            }
            CampaignRequest::List { status, response } => {
                let result = self.list(status).await;
                let _ = response.send(result);
            }
            CampaignRequest::ListByCreator {
                creator_id,
                response,
            } => {
                let result = self.list_by_creator(&creator_id).await;
                let _ = response.send(result);
            }
            CampaignRequest::Approve {
                actor,
                id,
                response,
            } => {
                let result = self.approve(&actor, &id).await;
                let _ = response.send(result);
            }
            CampaignRequest::Reject {
                actor,
                id,
                reason,
                response,
            } => {
                let result = self.reject(&actor, &id, reason).await;
                let _ = response.send(result);
            }
            CampaignRequest::Resubmit {
                actor,
                id,
                response,
            } => {
                let result = self.resubmit(&actor, &id).await;
                let _ = response.send(result);
            }
            CampaignRequest::Donate {
                id,
                amount,
                response,
            } => {
                let result = self.donate(&id, amount).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct CampaignService;

impl CampaignService {
    pub fn new() -> Self {
        CampaignService {}
    }
}

impl Default for CampaignService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service<CampaignRequest, CampaignRequestHandler> for CampaignService {}
