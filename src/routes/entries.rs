use std::time::Duration;

use axum::extract::{Json, Multipart, Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult, ErrorKind},
    models::Entry,
    registry::{
        self,
        cache::{Mutation, QueryKey},
        purge::{self, PurgeReport},
        sort::SortParams,
        upload::{self, UploadRequest},
        EntryChanges,
    },
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub id: Uuid,
    pub name: String,
    pub is_folder: bool,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl From<Entry> for EntryResponse {
    fn from(entry: Entry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            is_folder: entry.is_folder,
            size_bytes: entry.size_bytes,
            mime_type: entry.mime_type,
            parent_id: entry.parent_id,
            created_at: to_iso(entry.created_at),
            updated_at: to_iso(entry.updated_at),
            deleted_at: entry.deleted_at.map(to_iso),
        }
    }
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

pub(crate) fn to_responses(entries: Vec<Entry>) -> Vec<EntryResponse> {
    entries.into_iter().map(EntryResponse::from).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Image,
    Video,
    Audio,
    Pdf,
    None,
}

impl PreviewKind {
    pub fn from_mime(mime_type: Option<&str>) -> Self {
        let Some(mime_type) = mime_type else {
            return PreviewKind::None;
        };
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "application/pdf" {
            PreviewKind::Pdf
        } else if essence.starts_with("image/") {
            PreviewKind::Image
        } else if essence.starts_with("video/") {
            PreviewKind::Video
        } else if essence.starts_with("audio/") {
            PreviewKind::Audio
        } else {
            PreviewKind::None
        }
    }
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub preview_kind: PreviewKind,
}

#[derive(Serialize)]
pub struct UploadFailure {
    pub file_name: String,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub uploaded: Vec<EntryResponse>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntryRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub parent_id: Option<Option<Uuid>>,
}

/// Tells an explicit `null` (move to root) apart from an absent field.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(flatten)]
    pub sort: SortParams,
}

struct PendingFile {
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

pub async fn upload_entries(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    let mut files: Vec<PendingFile> = Vec::new();
    let mut parent_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().map(|n| n.to_string()).ok_or_else(|| {
                    error!("upload rejected: missing file name");
                    AppError::bad_request("every file needs a file name")
                })?;
                let content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                files.push(PendingFile {
                    file_name,
                    content_type,
                    bytes: data.to_vec(),
                });
            }
            Some("parent_id") => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid parent_id: {err}"))
                })?;
                let value = value.trim();
                if !value.is_empty() && !value.eq_ignore_ascii_case("root") {
                    let parsed = Uuid::parse_str(value)
                        .map_err(|_| AppError::bad_request("parent_id must be a valid UUID"))?;
                    parent_id = Some(parsed);
                }
            }
            _ => {}
        }
    }

    if files.is_empty() {
        error!("upload rejected: missing file field");
        return Err(AppError::bad_request("file field is required"));
    }

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();
    let mut last_error: Option<AppError> = None;

    for file in files {
        let request = UploadRequest {
            owner_id: user.user_id,
            parent_id,
            file_name: file.file_name.clone(),
            content_type: file.content_type,
            bytes: file.bytes,
        };

        match upload::upload_file(&state, request).await {
            Ok(entry) => uploaded.push(EntryResponse::from(entry)),
            Err(err) => {
                error!(file_name = %file.file_name, error = %err, "upload failed");
                failed.push(UploadFailure {
                    file_name: file.file_name,
                    kind: err.kind(),
                    error: err.to_string(),
                });
                last_error = Some(err);
            }
        }
    }

    if !uploaded.is_empty() {
        state
            .listings
            .apply(&Mutation::Created {
                owner: user.user_id,
                parent: parent_id,
            })
            .await;
    }

    // A single failing file surfaces as that file's error.
    if uploaded.is_empty() && failed.len() == 1 {
        if let Some(err) = last_error {
            return Err(err);
        }
    }

    let status = match (uploaded.is_empty(), failed.is_empty()) {
        (false, true) => StatusCode::CREATED,
        (false, false) => StatusCode::MULTI_STATUS,
        (true, _) => last_error
            .as_ref()
            .map(AppError::status)
            .unwrap_or(StatusCode::BAD_REQUEST),
    };

    Ok((status, Json(UploadResponse { uploaded, failed })))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<EntryResponse>> {
    let mut conn = state.db()?;
    let entry = registry::find_live_entry(&mut conn, user.user_id, entry_id)?;
    Ok(Json(entry.into()))
}

pub async fn update_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateEntryRequest>,
) -> AppResult<Json<EntryResponse>> {
    let outcome = {
        let mut conn = state.db()?;
        registry::update_entry(
            &mut conn,
            user.user_id,
            entry_id,
            EntryChanges {
                name: payload.name,
                parent_id: payload.parent_id,
            },
        )?
    };

    let owner = user.user_id;
    if outcome.moved {
        state
            .listings
            .apply(&Mutation::Moved {
                owner,
                from: outcome.previous_parent,
                to: outcome.entry.parent_id,
            })
            .await;
    } else if outcome.renamed {
        state
            .listings
            .apply(&Mutation::Renamed {
                owner,
                parent: outcome.entry.parent_id,
            })
            .await;
    }

    Ok(Json(outcome.entry.into()))
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<EntryResponse>> {
    let entry = {
        let mut conn = state.db()?;
        registry::soft_delete(&mut conn, user.user_id, entry_id)?
    };

    state
        .listings
        .apply(&Mutation::Trashed {
            owner: user.user_id,
            parent: entry.parent_id,
        })
        .await;
    info!(entry_id = %entry.id, "moved entry to trash");

    Ok(Json(entry.into()))
}

pub async fn restore_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<EntryResponse>> {
    let entry = {
        let mut conn = state.db()?;
        registry::restore(&mut conn, user.user_id, entry_id)?
    };

    state
        .listings
        .apply(&Mutation::Restored {
            owner: user.user_id,
            parent: entry.parent_id,
        })
        .await;

    Ok(Json(entry.into()))
}

pub async fn purge_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<(StatusCode, Json<PurgeReport>)> {
    let report = purge::purge_entry(&state, user.user_id, entry_id).await?;

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

pub async fn download_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DownloadResponse>> {
    let entry = {
        let mut conn = state.db()?;
        registry::find_live_entry(&mut conn, user.user_id, entry_id)?
    };

    if entry.is_folder {
        return Err(AppError::bad_request("folders cannot be downloaded"));
    }

    let expires_in = state.config.download_url_expiry_seconds;
    let url = state
        .storage
        .presign_get_object(&entry.storage_key, Duration::from_secs(expires_in))
        .await
        .map_err(|err| AppError::storage(format!("failed to generate download URL: {err:#}")))?;

    Ok(Json(DownloadResponse {
        url,
        expires_in,
        preview_kind: PreviewKind::from_mime(entry.mime_type.as_deref()),
        filename: entry.name,
        content_type: entry.mime_type,
        size_bytes: entry.size_bytes,
    }))
}

pub async fn search_entries(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<EntryResponse>>> {
    let term = query.q.trim().to_string();
    if term.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let owner = user.user_id;
    let key = QueryKey::Search {
        owner,
        term: term.clone(),
    };
    let mut found = state
        .listings
        .get_or_load(key, || {
            let mut conn = state.db()?;
            registry::search(&mut conn, owner, &term)
        })
        .await?;

    query.sort.apply(&mut found);
    Ok(Json(to_responses(found)))
}
