use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl VerificationCode {
    /// A code is accepted only on an exact match strictly before its expiry.
    pub fn accepts(&self, code: &str, now: DateTime<Utc>) -> bool {
        self.code == code.trim() && now < self.expires_at
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CodeRequest {
    pub email: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CodeCheck {
    pub email: Option<String>,
    pub code: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReset {
    pub email: Option<String>,
    pub code: Option<String>,
    pub new_password: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenCheck {
    pub token: Option<String>,
}
