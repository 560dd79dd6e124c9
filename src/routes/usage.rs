use axum::extract::{Json, State};
use serde::Serialize;

use crate::{auth::AuthenticatedUser, error::AppResult, registry, state::AppState};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UsageResponse {
    pub used_bytes: u64,
    pub file_count: u64,
    pub quota_bytes: u64,
    pub free_bytes: u64,
}

impl UsageResponse {
    fn new(usage: registry::Usage, quota_bytes: u64) -> Self {
        Self {
            used_bytes: usage.used_bytes,
            file_count: usage.file_count,
            quota_bytes,
            free_bytes: quota_bytes.saturating_sub(usage.used_bytes),
        }
    }
}

pub async fn storage_usage(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UsageResponse>> {
    let mut conn = state.db()?;
    let usage = registry::usage(&mut conn, user.user_id)?;
    Ok(Json(UsageResponse::new(
        usage,
        state.config.storage_quota_bytes,
    )))
}
