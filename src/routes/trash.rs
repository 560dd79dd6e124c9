use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
};

use crate::{
    auth::AuthenticatedUser,
    error::AppResult,
    registry::{
        self,
        cache::{Mutation, QueryKey},
        purge::{self, PurgeReport},
        sort::SortParams,
    },
    state::AppState,
};

use super::entries::{to_responses, EntryResponse};

pub async fn list_trash(
    State(state): State<AppState>,
    Query(sort): Query<SortParams>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<EntryResponse>>> {
    let owner = user.user_id;
    let mut trashed = state
        .listings
        .get_or_load(QueryKey::Trash { owner }, || {
            let mut conn = state.db()?;
            registry::list_trash(&mut conn, owner)
        })
        .await?;
    sort.apply(&mut trashed);

    Ok(Json(to_responses(trashed)))
}

/// 200 when everything was purged, otherwise the failing entry's status
/// with the report as body.
pub async fn empty_trash(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<(StatusCode, Json<PurgeReport>)> {
    let report = purge::empty_trash(&state, user.user_id).await?;

    if !report.purged.is_empty() {
        state
            .listings
            .apply(&Mutation::Purged {
                owner: user.user_id,
            })
            .await;
    }

    Ok((report.status(), Json(report)))
}
