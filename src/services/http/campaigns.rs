use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};

use super::{body, AppState, AuthUser};
use crate::{
    models::campaigns::{
        Campaign, CampaignQuery, DonationReceipt, NewCampaign, NewDonation, RejectCampaign,
    },
    services::{campaigns::CampaignRequest, dispatch, ServiceError},
};

pub async fn create_campaign(
    State(state): State<AppState>,
    AuthUser(creator): AuthUser,
    payload: Result<Json<NewCampaign>, JsonRejection>,
) -> Result<(StatusCode, Json<Campaign>), ServiceError> {
    let campaign = body(payload)?;
    let campaign = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::Create {
            creator,
            campaign,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn list_campaigns(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<CampaignQuery>,
) -> Result<Json<Vec<Campaign>>, ServiceError> {
    let status = query.status;
    let campaigns = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::List { status, response }
    })
    .await?;

    Ok(Json(campaigns))
}

pub async fn list_user_campaigns(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(creator_id): Path<String>,
) -> Result<Json<Vec<Campaign>>, ServiceError> {
    let campaigns = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::ListByCreator {
            creator_id,
            response,
        }
    })
    .await?;

    Ok(Json(campaigns))
}

pub async fn approve_campaign(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ServiceError> {
    let campaign = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::Approve {
            actor,
            id,
            response,
        }
    })
    .await?;

    Ok(Json(campaign))
}

/// The body is optional; without one the configured default reason is used.
pub async fn reject_campaign(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<RejectCampaign>, JsonRejection>,
) -> Result<Json<Campaign>, ServiceError> {
    let reason = payload.ok().and_then(|Json(body)| body.reason);
    let campaign = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::Reject {
            actor,
            id,
            reason,
            response,
        }
    })
    .await?;

    Ok(Json(campaign))
}

pub async fn resubmit_campaign(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ServiceError> {
    let campaign = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::Resubmit {
            actor,
            id,
            response,
        }
    })
    .await?;

    Ok(Json(campaign))
}

pub async fn donate(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<NewDonation>, JsonRejection>,
) -> Result<Json<DonationReceipt>, ServiceError> {
    let amount = body(payload)?.amount;
    let receipt = dispatch(&state.channels.campaigns, "campaigns", |response| {
        CampaignRequest::Donate {
            id,
            amount,
            response,
        }
    })
    .await?;

    Ok(Json(receipt))
}
