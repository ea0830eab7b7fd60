use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepositoryError, UserRepository};
use crate::models::users::{User, UserRecord, UserUpdate};

#[derive(Clone)]
pub struct UserRepositoryPg {
    conn: PgPool,
}

impl UserRepositoryPg {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }
}

fn map_insert_error(error: sqlx::Error, email: &str) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Duplicate(email.to_string())
        }
        _ => RepositoryError::Database(error),
    }
}

#[async_trait]
impl UserRepository for UserRepositoryPg {
    async fn insert(&self, record: UserRecord) -> Result<User, RepositoryError> {
        let user_id = Uuid::new_v4().hyphenated().to_string();

        sqlx::query_as::<_, User>(
            r#"
                INSERT INTO users (id, name, email, password_hash, role)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
            "#,
        )
        .bind(&user_id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.password_hash)
        .bind(record.role)
        .fetch_one(&self.conn)
        .await
        .map_err(|e| map_insert_error(e, &record.email))
    }

    async fn get_by_id(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.conn)
            .await?;

        Ok(user)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.conn)
            .await?;

        Ok(user)
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: UserUpdate,
    ) -> Result<Option<User>, RepositoryError> {
        let user = sqlx::query_as::<_, User>(
            r#"UPDATE users SET
                name = COALESCE($2, name),
                role = COALESCE($3, role),
                phone = COALESCE($4, phone),
                address = COALESCE($5, address),
                organization = COALESCE($6, organization),
                description = COALESCE($7, description),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            RETURNING *"#,
        )
        .bind(user_id)
        .bind(update.name)
        .bind(update.role)
        .bind(update.phone)
        .bind(update.address)
        .bind(update.organization)
        .bind(update.description)
        .fetch_optional(&self.conn)
        .await?;

        Ok(user)
    }

    async fn set_password_hash(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        Ok(())
    }
}

/// Accounts kept in process memory, with a secondary email index that
/// enforces uniqueness.
pub struct InMemoryUserRepository {
    users: DashMap<String, User>,
    emails: DashMap<String, String>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            emails: DashMap::new(),
        }
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn insert(&self, record: UserRecord) -> Result<User, RepositoryError> {
        let user_id = Uuid::new_v4().hyphenated().to_string();

        match self.emails.entry(record.email.clone()) {
            Entry::Occupied(_) => return Err(RepositoryError::Duplicate(record.email)),
            Entry::Vacant(slot) => {
                slot.insert(user_id.clone());
            }
        }

        let now = Utc::now();
        let user = User {
            id: user_id.clone(),
            name: record.name,
            email: record.email,
            password_hash: record.password_hash,
            role: record.role,
            phone: None,
            address: None,
            organization: None,
            description: None,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(user_id, user.clone());

        Ok(user)
    }

    async fn get_by_id(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.users.get(user_id).map(|user| user.value().clone()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let Some(user_id) = self.emails.get(email).map(|id| id.value().clone()) else {
            return Ok(None);
        };

        self.get_by_id(&user_id).await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: UserUpdate,
    ) -> Result<Option<User>, RepositoryError> {
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(None);
        };

        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(role) = update.role {
            user.role = Some(role);
        }
        if let Some(phone) = update.phone {
            user.phone = Some(phone);
        }
        if let Some(address) = update.address {
            user.address = Some(address);
        }
        if let Some(organization) = update.organization {
            user.organization = Some(organization);
        }
        if let Some(description) = update.description {
            user.description = Some(description);
        }
        user.updated_at = Utc::now();

        Ok(Some(user.value().clone()))
    }

    async fn set_password_hash(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or(RepositoryError::NotFound)?;

        user.password_hash = password_hash.to_string();
        user.updated_at = Utc::now();

        Ok(())
    }
}
