use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    registry::{
        self,
        breadcrumb::Crumb,
        cache::{Mutation, QueryKey},
        sort::SortParams,
    },
    state::AppState,
};

use super::entries::{to_responses, EntryResponse};

#[derive(Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct FolderContentsResponse {
    pub folder: Option<EntryResponse>,
    pub entries: Vec<EntryResponse>,
}

fn parse_folder_identifier(raw: &str) -> AppResult<Option<Uuid>> {
    if raw.eq_ignore_ascii_case("root") {
        return Ok(None);
    }
    Uuid::parse_str(raw)
        .map(Some)
        .map_err(|_| AppError::bad_request("folder identifier must be 'root' or a UUID"))
}

pub async fn create_folder(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateFolderRequest>,
) -> AppResult<(StatusCode, Json<EntryResponse>)> {
    let folder = {
        let mut conn = state.db()?;
        registry::create_folder(&mut conn, user.user_id, &payload.name, payload.parent_id)?
    };

    state
        .listings
        .apply(&Mutation::Created {
            owner: user.user_id,
            parent: folder.parent_id,
        })
        .await;

    Ok((StatusCode::CREATED, Json(folder.into())))
}

pub async fn list_folder_contents(
    State(state): State<AppState>,
    Path(folder_identifier): Path<String>,
    Query(sort): Query<SortParams>,
    user: AuthenticatedUser,
) -> AppResult<Json<FolderContentsResponse>> {
    let owner = user.user_id;
    let folder_id = parse_folder_identifier(&folder_identifier)?;

    let folder = {
        let mut conn = state.db()?;
        registry::find_listable_folder(&mut conn, owner, folder_id)?
    };

    let key = QueryKey::Children {
        owner,
        parent: folder_id,
    };
    let mut children = state
        .listings
        .get_or_load(key, || {
            let mut conn = state.db()?;
            registry::list_children(&mut conn, owner, folder_id)
        })
        .await?;
    sort.apply(&mut children);

    Ok(Json(FolderContentsResponse {
        folder: folder.map(EntryResponse::from),
        entries: to_responses(children),
    }))
}

pub async fn folder_breadcrumbs(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<Crumb>>> {
    let mut conn = state.db()?;
    let path = registry::breadcrumb(&mut conn, user.user_id, entry_id)?;
    Ok(Json(path))
}
