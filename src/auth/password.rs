use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use std::sync::OnceLock;
use tracing::error;

/// Argon2 hash of a throwaway secret, checked when no stored hash exists.
static DECOY_HASH: OnceLock<String> = OnceLock::new();

/// Hash a password with Argon2id (default parameters, random salt).
///
/// Hashing is CPU-bound, so it runs on the blocking pool.
pub async fn hash_password(plain: &str) -> anyhow::Result<String> {
    let plain = plain.to_owned();
    tokio::task::spawn_blocking(move || hash_password_sync(&plain))
        .await
        .context("hash_password task join")?
}

/// Check `plain` against a stored PHC hash. A malformed hash is an error, not a mismatch.
pub async fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let plain = plain.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || verify_password_sync(&plain, &hash))
        .await
        .context("verify_password task join")?
}

/// Spend the same Argon2 work as `verify_password` when there is no user to
/// check against, so response time does not reveal whether an email exists.
pub async fn verify_decoy(plain: &str) -> anyhow::Result<()> {
    let plain = plain.to_owned();
    tokio::task::spawn_blocking(move || {
        let hash = decoy_hash()?;
        verify_password_sync(&plain, hash).map(|_| ())
    })
    .await
    .context("verify_decoy task join")?
}

fn decoy_hash() -> anyhow::Result<&'static str> {
    if let Some(hash) = DECOY_HASH.get() {
        return Ok(hash.as_str());
    }
    let hash = hash_password_sync("decoy-password-never-issued")?;
    Ok(DECOY_HASH.get_or_init(|| hash).as_str())
}

#[cfg(test)]
pub(crate) fn decoy_hash_ready() -> bool {
    DECOY_HASH.get().is_some()
}

fn hash_password_sync(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

fn verify_password_sync(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}
