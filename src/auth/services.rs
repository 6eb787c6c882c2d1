use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::auth::{
    dto::{LoginRequest, RegisterRequest},
    error::AuthError,
    jwt::JwtKeys,
    password::{hash_password, verify_decoy, verify_password},
    repo::{normalize_email, UserStore},
    repo_types::{NewUser, Role, User},
};

const NAME_MIN_CHARS: usize = 3;
const NAME_MAX_CHARS: usize = 20;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn validate_registration(name: &str, email: &str, password: &str) -> Result<(), AuthError> {
    let name_len = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&name_len) {
        return Err(AuthError::Validation(format!(
            "Name must be between {NAME_MIN_CHARS} and {NAME_MAX_CHARS} characters"
        )));
    }
    if !is_valid_email(email) {
        return Err(AuthError::Validation("Invalid email".into()));
    }
    if password.is_empty() {
        return Err(AuthError::Validation("Password is required".into()));
    }
    Ok(())
}

/// Create an account and mint its first session token.
pub async fn register(
    users: &dyn UserStore,
    keys: &JwtKeys,
    req: RegisterRequest,
) -> Result<(User, String), AuthError> {
    let name = req.name.trim().to_string();
    let email = normalize_email(&req.email);
    validate_registration(&name, &email, &req.password)?;

    // Fast path only; the store's uniqueness check decides races.
    if users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AuthError::UserExists);
    }

    let password_hash = hash_password(&req.password).await?;
    let user = users
        .create(NewUser {
            name,
            email,
            password_hash,
            role: Role::User,
        })
        .await
        .map_err(|e| {
            let e = AuthError::from(e);
            if matches!(e, AuthError::UserExists) {
                warn!("email registered concurrently");
            }
            e
        })?;

    let token = keys.sign(user.id)?;
    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((user, token))
}

/// Check credentials and mint a session token.
///
/// Unknown email and wrong password both yield `InvalidCredentials`.
pub async fn login(
    users: &dyn UserStore,
    keys: &JwtKeys,
    req: LoginRequest,
) -> Result<(User, String), AuthError> {
    let email = normalize_email(&req.email);

    let Some(user) = users.find_by_email(&email).await? else {
        verify_decoy(&req.password).await?;
        warn!(email = %email, "login unknown email");
        return Err(AuthError::InvalidCredentials);
    };

    if !verify_password(&req.password, &user.password_hash).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AuthError::InvalidCredentials);
    }

    let token = keys.sign(user.id)?;
    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok((user, token))
}
