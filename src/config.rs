use std::env;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 15 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub refresh_cookie_secure: bool,
    pub refresh_cookie_domain: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
    pub download_url_expiry_seconds: u64,
    pub max_upload_bytes: usize,
    pub storage_quota_bytes: u64,
    pub listing_cache_ttl_seconds: u64,
    pub listing_cache_capacity: u64,
    pub trash_retention_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "cloudvault".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "cloudvault-clients".to_string());
        let jwt_expiry_minutes = env::var("JWT_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("JWT_EXPIRY_MINUTES must be an integer")?;
        let refresh_token_expiry_days = env::var("REFRESH_TOKEN_EXPIRY_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("REFRESH_TOKEN_EXPIRY_DAYS must be an integer")?;
        let refresh_cookie_secure = env::var("REFRESH_COOKIE_SECURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let refresh_cookie_domain = env::var("REFRESH_COOKIE_DOMAIN").ok();
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok();
        let aws_access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
        let aws_secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET").context("S3_BUCKET must be set")?;
        let download_url_expiry_seconds = env::var("DOWNLOAD_URL_EXPIRY_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("DOWNLOAD_URL_EXPIRY_SECONDS must be an integer")?;
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .map(|value| value.parse())
            .unwrap_or(Ok(DEFAULT_MAX_UPLOAD_BYTES))
            .context("MAX_UPLOAD_BYTES must be an integer")?;
        let storage_quota_bytes = env::var("STORAGE_QUOTA_BYTES")
            .map(|value| value.parse())
            .unwrap_or(Ok(DEFAULT_STORAGE_QUOTA_BYTES))
            .context("STORAGE_QUOTA_BYTES must be an integer")?;
        let listing_cache_ttl_seconds = env::var("LISTING_CACHE_TTL_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("LISTING_CACHE_TTL_SECONDS must be an integer")?;
        let listing_cache_capacity = env::var("LISTING_CACHE_CAPACITY")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .context("LISTING_CACHE_CAPACITY must be an integer")?;
        let trash_retention_days = parse_retention_days(
            &env::var("TRASH_RETENTION_DAYS").unwrap_or_else(|_| "30".to_string()),
        )?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            refresh_token_expiry_days,
            refresh_cookie_secure,
            refresh_cookie_domain,
            cors_allowed_origin,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            download_url_expiry_seconds,
            max_upload_bytes,
            storage_quota_bytes,
            listing_cache_ttl_seconds,
            listing_cache_capacity,
            trash_retention_days,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// Whole days, non-negative and small enough to subtract from a timestamp.
pub fn parse_retention_days(raw: &str) -> Result<i64> {
    let days: i64 = raw
        .trim()
        .parse()
        .context("TRASH_RETENTION_DAYS must be an integer")?;
    if days < 0 {
        bail!("TRASH_RETENTION_DAYS must not be negative");
    }
    if ChronoDuration::try_days(days).is_none() {
        bail!("TRASH_RETENTION_DAYS of {days} is out of range");
    }
    Ok(days)
}
