use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::models::{Campaign, DonationReceipt};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Unreadable response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Network failures and 5xx answers may succeed later; anything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Server { .. })
    }
}

/// The slice of the Funderr API the donation flow needs.
#[async_trait]
pub trait CampaignApi: Send + Sync + 'static {
    async fn list_campaigns(&self, status: Option<&str>) -> Result<Vec<Campaign>, ClientError>;

    /// Every campaign `user_id` created, whatever its status.
    async fn list_user_campaigns(&self, user_id: &str) -> Result<Vec<Campaign>, ClientError>;

    async fn donate(&self, campaign_id: &str, amount: f64) -> Result<DonationReceipt, ClientError>;
}

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        HttpClient {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()));
        }

        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        if status.is_server_error() {
            Err(ClientError::Server {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl CampaignApi for HttpClient {
    async fn list_campaigns(&self, status: Option<&str>) -> Result<Vec<Campaign>, ClientError> {
        let mut request = self.request(Method::GET, "/api/campaigns");
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Self::read(response).await
    }

    async fn list_user_campaigns(&self, user_id: &str) -> Result<Vec<Campaign>, ClientError> {
        let response = self
            .request(Method::GET, &format!("/api/campaigns/user/{}", user_id))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Self::read(response).await
    }

    async fn donate(&self, campaign_id: &str, amount: f64) -> Result<DonationReceipt, ClientError> {
        let response = self
            .request(
                Method::POST,
                &format!("/api/campaigns/{}/donate", campaign_id),
            )
            .json(&json!({ "amount": amount }))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Self::read(response).await
    }
}
