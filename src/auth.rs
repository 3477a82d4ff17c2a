//! Credentials: password hashes, mailed verification codes and session tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{MailError, TokenError};
use crate::model::Account;

pub fn hash_password(pw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pw.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}

/// Which stored secret a login attempt matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Secret {
    Password,
    /// A mailed code; single use, so the caller clears it after login.
    Code,
}

/// Accepts the account password, or a verification code that is still
/// inside its validity window.
pub fn verify_secret(
    account: &Account,
    supplied: &str,
    code_ttl: Duration,
    now: DateTime<Utc>,
) -> Option<Secret> {
    if !account.password_hash.is_empty() && account.password_hash == hash_password(supplied) {
        return Some(Secret::Password);
    }
    match (&account.verification_code, account.code_issued_at) {
        (Some(code), Some(issued)) if code == supplied && now - issued <= code_ttl => {
            Some(Secret::Code)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks HS256 session tokens handed out on login.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn parse(&self, token: &str) -> Result<Claims, TokenError> {
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

/// Delivers verification codes to account holders.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_code(&self, account: &Account, code: &str) -> Result<(), MailError>;
}

/// Mailer that records the delivery in the log instead of talking SMTP.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_code(&self, account: &Account, code: &str) -> Result<(), MailError> {
        let to = account
            .email
            .as_deref()
            .ok_or_else(|| MailError::NoAddress(account.user_id.clone()))?;
        info!(user_id = %account.user_id, %to, code_len = code.len(), "verification code sent");
        Ok(())
    }
}
