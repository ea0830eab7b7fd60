use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};

use super::CodeStore;
use crate::models::verification::VerificationCode;

/// Codes live only as long as the process. Expired entries are never swept;
/// they are ignored on read and replaced on the next request for the email.
pub struct InMemoryCodeStore {
    codes: DashMap<String, VerificationCode>,
}

impl InMemoryCodeStore {
    pub fn new() -> Self {
        Self {
            codes: DashMap::new(),
        }
    }
}

impl Default for InMemoryCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn put(&self, email: &str, code: VerificationCode) {
        self.codes.insert(email.to_string(), code);
    }

    async fn put_if_absent(&self, email: &str, code: VerificationCode) -> bool {
        match self.codes.entry(email.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(code);
                true
            }
        }
    }

    async fn get(&self, email: &str) -> Option<VerificationCode> {
        self.codes.get(email).map(|entry| entry.value().clone())
    }

    async fn take(&self, email: &str, code: &str, now: DateTime<Utc>) -> Option<VerificationCode> {
        self.codes
            .remove_if(email, |_, stored| stored.accepts(code, now))
            .map(|(_, stored)| stored)
    }
}
