use anyhow::Result;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

/// Hash a password using argon2id.
pub fn hash_password(pass: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(pass.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e))?
        .to_string();
    Ok(hash)
}

/// Verify a password against an encoded hash.
pub fn verify_password(pass: &str, hash: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Claims stored within issued JWTs. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Issue a JWT for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user_id: i64, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return the user id it was issued for.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<i64> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    let user_id = data.claims.sub.parse::<i64>()?;
    Ok(user_id)
}

/// Load the signing secret from the database, generating and persisting one
/// on first startup.
pub fn load_or_create_secret(conn: &Connection) -> Result<Vec<u8>> {
    let existing: Option<String> = conn
        .query_row("SELECT jwt_secret FROM server_config WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(encoded) = existing {
        return Ok(STANDARD.decode(encoded)?);
    }
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    conn.execute(
        "INSERT INTO server_config (id, jwt_secret, created_at) VALUES (1, ?1, ?2)",
        params![
            STANDARD.encode(&secret),
            OffsetDateTime::now_utc().unix_timestamp()
        ],
    )?;
    Ok(secret)
}

/// Simple in-memory login rate limiter.
#[derive(Clone)]
pub struct LoginRateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max: usize,
    window: StdDuration,
}

impl LoginRateLimiter {
    pub fn new(max: usize, window: StdDuration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Returns true if the attempt is allowed, false if rate limited.
    pub async fn check(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}
