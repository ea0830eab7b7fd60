use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{
    auth::{Passwords, TokenSigner},
    RequestHandler, Service, ServiceError,
};
use crate::{
    models::users::{self, normalize_email, AuthResponse, Credentials, NewUser, UserRecord, UserUpdate},
    repositories::{RepositoryError, UserRepository},
};

pub enum UserRequest {
    Register {
        user: NewUser,
        response: oneshot::Sender<Result<AuthResponse, ServiceError>>,
    },
    Login {
        credentials: Credentials,
        response: oneshot::Sender<Result<AuthResponse, ServiceError>>,
    },
    GetUser {
        id: String,
        response: oneshot::Sender<Result<Option<users::User>, ServiceError>>,
    },
    FindByEmail {
        email: String,
        response: oneshot::Sender<Result<Option<users::User>, ServiceError>>,
    },
    UpdateProfile {
        id: String,
        update: UserUpdate,
        response: oneshot::Sender<Result<Option<users::User>, ServiceError>>,
    },
    ResetPassword {
        id: String,
        new_password: String,
        response: oneshot::Sender<Result<(), ServiceError>>,
    },
}

#[derive(Clone)]
pub struct UserRequestHandler {
    repository: Arc<dyn UserRepository>,
    passwords: Passwords,
    tokens: Arc<TokenSigner>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl UserRequestHandler {
    pub fn new(
        repository: Arc<dyn UserRepository>,
        passwords: Passwords,
        tokens: Arc<TokenSigner>,
    ) -> Self {
        UserRequestHandler {
            repository,
            passwords,
            tokens,
        }
    }

    fn auth_response(&self, user: &users::User) -> Result<AuthResponse, ServiceError> {
        let token = self
            .tokens
            .issue(&user.id)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        Ok(AuthResponse {
            token,
            user_id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
        })
    }

    async fn register(&self, new_user: NewUser) -> Result<AuthResponse, ServiceError> {
        let (Some(name), Some(email), Some(password)) = (
            present(new_user.name),
            present(new_user.email),
            present(new_user.password),
        ) else {
            return Err(ServiceError::Validation(
                "Name, email and password are required".to_string(),
            ));
        };
        let email = normalize_email(&email);

        if self.repository.get_by_email(&email).await?.is_some() {
            return Err(ServiceError::Validation("Email already in use".to_string()));
        }

        let password_hash = self.passwords.hash(password).await?;
        let record = UserRecord {
            name: name.trim().to_string(),
            email,
            password_hash,
            role: new_user.role,
        };

        let user = match self.repository.insert(record).await {
            Ok(user) => user,
            Err(RepositoryError::Duplicate(_)) => {
                return Err(ServiceError::Validation("Email already in use".to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        log::info!("Registered user {}.", user.id);
        self.auth_response(&user)
    }

    async fn login(&self, credentials: Credentials) -> Result<AuthResponse, ServiceError> {
        let (Some(email), Some(password)) =
            (present(credentials.email), present(credentials.password))
        else {
            return Err(ServiceError::Validation(
                "Email and password are required".to_string(),
            ));
        };

        let invalid = || ServiceError::Unauthorized("Invalid email or password".to_string());

        let Some(user) = self.repository.get_by_email(&normalize_email(&email)).await? else {
            log::info!("Login attempt for unknown email.");
            return Err(invalid());
        };

        if !self
            .passwords
            .verify(password, user.password_hash.clone())
            .await?
        {
            log::info!("Password mismatch for user {}.", user.id);
            return Err(invalid());
        }

        log::info!("User {} logged in.", user.id);
        self.auth_response(&user)
    }

    async fn get_user(&self, id: &str) -> Result<Option<users::User>, ServiceError> {
        Ok(self.repository.get_by_id(id).await?)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<users::User>, ServiceError> {
        Ok(self.repository.get_by_email(&normalize_email(email)).await?)
    }

    async fn update_profile(
        &self,
        id: &str,
        mut update: UserUpdate,
    ) -> Result<Option<users::User>, ServiceError> {
        update.name = update.name.map(|name| name.trim().to_string());
        if update.name.as_deref() == Some("") {
            return Err(ServiceError::Validation("Name cannot be empty".to_string()));
        }

        Ok(self.repository.update_profile(id, update).await?)
    }

    async fn reset_password(&self, id: &str, new_password: String) -> Result<(), ServiceError> {
        if new_password.trim().is_empty() {
            return Err(ServiceError::Validation(
                "New password is required".to_string(),
            ));
        }

        let password_hash = self.passwords.hash(new_password).await?;
        match self.repository.set_password_hash(id, &password_hash).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::NotFound) => {
                Err(ServiceError::NotFound("User not found".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::Register { user, response } => {
                let result = self.register(user).await;
                let _ = response.send(result);
            }
            UserRequest::Login {
                credentials,
                response,
            } => {
                let result = self.login(credentials).await;
                let _ = response.send(result);
            }
            UserRequest::GetUser { id, response } => {
                let user = self.get_user(&id).await;
                let _ = response.send(user);
            }
            UserRequest::FindByEmail { email, response } => {
                let user = self.find_by_email(&email).await;
                let _ = response.send(user);
            }
            UserRequest::UpdateProfile {
                id,
                update,
                response,
            } => {
                let user = self.update_profile(&id, update).await;
                let _ = response.send(user);
            }
            UserRequest::ResetPassword {
                id,
                new_password,
                response,
            } => {
                let result = self.reset_password(&id, new_password).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

impl Default for UserService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}
