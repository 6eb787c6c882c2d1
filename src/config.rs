use anyhow::Context;
use serde::Deserialize;

const DEFAULT_TTL_MINUTES: i64 = 60 * 24;
/// One year.
const MAX_TTL_MINUTES: i64 = 525_600;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `None` selects the in-memory user store.
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub cookie_secure: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "userauth".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "userauth-users".into()),
            ttl_minutes: parse_ttl_minutes(std::env::var("JWT_TTL_MINUTES").ok().as_deref())
                .context("invalid JWT_TTL_MINUTES")?,
        };
        let cookie_secure = std::env::var("COOKIE_SECURE")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);
        Ok(Self {
            database_url,
            jwt,
            cookie_secure,
        })
    }

    /// Token lifetime in seconds; the cookie Max-Age uses the same value.
    pub fn token_ttl_secs(&self) -> i64 {
        self.jwt.ttl_minutes.saturating_mul(60)
    }
}

fn parse_ttl_minutes(raw: Option<&str>) -> anyhow::Result<i64> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(DEFAULT_TTL_MINUTES);
    };
    let minutes: i64 = raw
        .parse()
        .with_context(|| format!("{raw:?} is not a whole number of minutes"))?;
    anyhow::ensure!(
        (1..=MAX_TTL_MINUTES).contains(&minutes),
        "{minutes} is outside 1..={MAX_TTL_MINUTES} minutes"
    );
    Ok(minutes)
}

fn parse_flag(v: &str) -> bool {
    !matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
