use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use super::{dispatch, users::UserRequest, RequestHandler, Service, ServiceError};
use crate::{
    models::{users::normalize_email, users::User, verification::VerificationCode},
    repositories::CodeStore,
    utils::Clock,
};

pub enum VerificationRequest {
    SendSignupCode {
        email: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
    RequestPasswordReset {
        email: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
    VerifySignupCode {
        email: Option<String>,
        code: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
    VerifyResetCode {
        email: Option<String>,
        code: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
    ResetPassword {
        email: Option<String>,
        code: Option<String>,
        new_password: Option<String>,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodePurpose {
    Signup,
    PasswordReset,
}

/// Delivers freshly issued codes to their owner.
#[async_trait]
pub trait CodeNotifier: Send + Sync + 'static {
    async fn deliver(&self, email: &str, code: &str, purpose: CodePurpose) -> Result<(), ServiceError>;
}

/// Writes codes to the log. There is no mail transport.
pub struct LogNotifier;

#[async_trait]
impl CodeNotifier for LogNotifier {
    async fn deliver(&self, email: &str, code: &str, purpose: CodePurpose) -> Result<(), ServiceError> {
        log::info!("Verification code for {} ({:?}): {}", email, purpose, code);
        Ok(())
    }
}

fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

fn required_email(email: Option<String>) -> Result<String, ServiceError> {
    email
        .map(|e| normalize_email(&e))
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ServiceError::Validation("Email is required".to_string()))
}

#[derive(Clone)]
pub struct VerificationRequestHandler {
    codes: Arc<dyn CodeStore>,
    notifier: Arc<dyn CodeNotifier>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    users: mpsc::Sender<UserRequest>,
}

impl VerificationRequestHandler {
    pub fn new(
        codes: Arc<dyn CodeStore>,
        notifier: Arc<dyn CodeNotifier>,
        clock: Arc<dyn Clock>,
        ttl_secs: u64,
        users: mpsc::Sender<UserRequest>,
    ) -> Self {
        VerificationRequestHandler {
            codes,
            notifier,
            clock,
            ttl: chrono::Duration::seconds(
                i64::try_from(ttl_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000),
            ),
            users,
        }
    }

    async fn find_user(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let email = email.to_string();
        dispatch(&self.users, "users", |response| UserRequest::FindByEmail {
            email,
            response,
        })
        .await
    }

    async fn issue_code(&self, email: &str, purpose: CodePurpose) -> Result<(), ServiceError> {
        let code = generate_code();
        let entry = VerificationCode {
            code: code.clone(),
            expires_at: self.clock.now() + self.ttl,
        };

        self.codes.put(email, entry).await;
        self.notifier.deliver(email, &code, purpose).await
    }

    async fn check_code(&self, email: &str, code: Option<String>) -> Result<(), ServiceError> {
        let code = code.unwrap_or_default();
        match self.codes.get(email).await {
            Some(stored) if stored.accepts(&code, self.clock.now()) => Ok(()),
            _ => Err(ServiceError::InvalidCode),
        }
    }

    async fn send_signup_code(&self, email: Option<String>) -> Result<(), ServiceError> {
        let email = required_email(email)?;
        if self.find_user(&email).await?.is_some() {
            return Err(ServiceError::Validation("Email already in use".to_string()));
        }

        self.issue_code(&email, CodePurpose::Signup).await
    }

    async fn request_password_reset(&self, email: Option<String>) -> Result<(), ServiceError> {
        let email = required_email(email)?;
        if self.find_user(&email).await?.is_none() {
            return Err(ServiceError::NotFound("Email not found".to_string()));
        }

        self.issue_code(&email, CodePurpose::PasswordReset).await
    }

    async fn verify_signup_code(
        &self,
        email: Option<String>,
        code: Option<String>,
    ) -> Result<(), ServiceError> {
        let email = required_email(email)?;
        self.check_code(&email, code).await
    }

    async fn verify_reset_code(
        &self,
        email: Option<String>,
        code: Option<String>,
    ) -> Result<(), ServiceError> {
        let email = required_email(email)?;
        if self.find_user(&email).await?.is_none() {
            return Err(ServiceError::NotFound("User not found".to_string()));
        }

        self.check_code(&email, code).await
    }

    async fn reset_password(
        &self,
        email: Option<String>,
        code: Option<String>,
        new_password: Option<String>,
    ) -> Result<(), ServiceError> {
        let email = required_email(email)?;
        let Some(new_password) = new_password.filter(|p| !p.trim().is_empty()) else {
            return Err(ServiceError::Validation(
                "New password is required".to_string(),
            ));
        };
        let code = code.unwrap_or_default();

        self.check_code(&email, Some(code.clone())).await?;
        let Some(user) = self.find_user(&email).await? else {
            return Err(ServiceError::NotFound("User not found".to_string()));
        };

        // Claim the code before writing so a concurrent reset with the same code loses.
        let Some(claimed) = self.codes.take(&email, &code, self.clock.now()).await else {
            return Err(ServiceError::InvalidCode);
        };

        let id = user.id.clone();
        let result = dispatch(&self.users, "users", |response| UserRequest::ResetPassword {
            id,
            new_password,
            response,
        })
        .await;

        if let Err(e) = result {
            log::warn!("Password reset for user {} failed: {}", user.id, e);
            // A code issued while the write was in flight wins over the claimed one.
            if !self.codes.put_if_absent(&email, claimed).await {
                log::debug!("Newer code exists for {}, claimed code dropped.", email);
            }
            return Err(e);
        }

        log::info!("Password reset for user {}.", user.id);
        Ok(())
    }
}

#[async_trait]
impl RequestHandler<VerificationRequest> for VerificationRequestHandler {
    async fn handle_request(&self, request: VerificationRequest) {
        match request {
            VerificationRequest::SendSignupCode { email, response } => {
                let result = self.send_signup_code(email).await;
                let _ = response.send(result);
            }
            VerificationRequest::RequestPasswordReset { email, response } => {
                let result = self.request_password_reset(email).await;
                let _ = response.send(result);
            }
            VerificationRequest::VerifySignupCode {
                email,
                code,
                response,
            } => {
                let result = self.verify_signup_code(email, code).await;
                let _ = response.send(result);
            }
            VerificationRequest::VerifyResetCode {
                email,
                code,
                response,
            } => {
                let result = self.verify_reset_code(email, code).await;
                let _ = response.send(result);
            }
            VerificationRequest::ResetPassword {
                email,
                code,
                new_password,
                response,
            } => {
                let result = self.reset_password(email, code, new_password).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct VerificationService;

impl VerificationService {
    pub fn new() -> Self {
        VerificationService {}
    }
}

impl Default for VerificationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service<VerificationRequest, VerificationRequestHandler> for VerificationService {}
