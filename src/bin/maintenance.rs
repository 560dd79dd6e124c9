use std::env;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use cloudvault::{
    auth::{accounts, jwt::JwtService},
    config::AppConfig,
    db,
    registry::purge,
    s3,
    state::AppState,
    storage::S3Storage,
};

const USAGE: &str = "Usage:\n  maintenance purge-trash [days]\n  maintenance create-user <email> <password>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-trash") => {
            let days = args
                .next()
                .map(|raw| raw.parse::<i64>().context("days must be a whole number"))
                .transpose()?;
            purge_trash(days).await?
        }
        Some("create-user") => {
            let (Some(email), Some(password)) = (args.next(), args.next()) else {
                eprintln!("{USAGE}");
                std::process::exit(1);
            };
            create_user(&email, &password)?
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn purge_trash(days: Option<i64>) -> Result<()> {
    let config = AppConfig::from_env()?;
    let days = days.unwrap_or(config.trash_retention_days);
    let cutoff = purge::retention_cutoff(Utc::now().naive_utc(), days)
        .map_err(|err| anyhow!("invalid retention period: {err}"))?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        s3_bucket = %config.s3_bucket,
        retention_days = days,
        "purging expired trash"
    );

    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let s3_client = s3::build_client(&config).await?;
    let storage = Arc::new(S3Storage::new(s3_client, config.s3_bucket.clone()));
    let jwt = JwtService::from_config(&config)?;
    let state = AppState::new(pool, config, storage, jwt);

    let reports = purge::purge_expired(&state, cutoff)
        .await
        .map_err(|err| anyhow!("failed to purge trash: {err}"))?;

    if reports.is_empty() {
        println!("Nothing to purge.");
        return Ok(());
    }

    let mut failures = 0;
    for (owner_id, report) in &reports {
        println!("{owner_id}: purged {} entries", report.purged.len());
        if let Some(failure) = &report.failed {
            failures += 1;
            eprintln!(
                "{owner_id}: stopped at entry {}: {} ({} entries left)",
                failure.id,
                failure.error,
                report.remaining.len()
            );
        }
    }

    if failures > 0 {
        bail!("purge stopped early for {failures} owner(s)");
    }
    Ok(())
}

fn create_user(email: &str, password: &str) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    db::run_migrations(&pool)?;

    let mut conn = pool.get().context("failed to get database connection")?;
    let user = accounts::create_user(&mut conn, email, password)
        .map_err(|err| anyhow!("failed to create user: {err}"))?;

    println!("Created user {} ({})", user.email, user.id);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
