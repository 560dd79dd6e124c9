use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Entry, NewEntry};
use crate::state::AppState;
use crate::storage::{file_key, inline_content_disposition, resolve_content_type};

use super::{ensure_parent_folder, insert_entry, normalize_name};

#[derive(Debug)]
pub struct UploadRequest {
    pub owner_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Stores the blob first and records the entry second. If the row cannot be
/// written the blob is removed again; when that removal fails too the error
/// names the orphaned key.
pub async fn upload_file(state: &AppState, request: UploadRequest) -> AppResult<Entry> {
    let UploadRequest {
        owner_id,
        parent_id,
        file_name,
        content_type,
        bytes,
    } = request;

    if bytes.is_empty() {
        return Err(AppError::bad_request("uploaded file is empty"));
    }
    if bytes.len() > state.config.max_upload_bytes {
        return Err(AppError::bad_request(format!(
            "file exceeds the maximum upload size of {} bytes",
            state.config.max_upload_bytes
        )));
    }

    let name = normalize_name(&file_name)?;
    {
        let mut conn = state.db()?;
        ensure_parent_folder(&mut conn, owner_id, parent_id)?;
    }

    let entry_id = Uuid::new_v4();
    let storage_key = file_key(owner_id, entry_id);
    let mime_type = resolve_content_type(content_type.as_deref(), &name);
    let size_bytes = i64::try_from(bytes.len())
        .map_err(|_| AppError::bad_request("file is too large"))?;

    state
        .storage
        .put_object(
            &storage_key,
            bytes,
            Some(mime_type.clone()),
            inline_content_disposition(&name),
        )
        .await
        .map_err(|err| {
            error!(
                owner_id = %owner_id,
                storage_key = %storage_key,
                error = %err,
                "failed to store upload"
            );
            AppError::storage(format!("failed to store file: {err:#}"))
        })?;

    let new_entry = NewEntry {
        id: entry_id,
        owner_id,
        name,
        is_folder: false,
        size_bytes,
        mime_type: Some(mime_type),
        storage_key: storage_key.clone(),
        parent_id,
    };

    let inserted = state
        .db()
        .and_then(|mut conn| insert_entry(&mut conn, &new_entry));

    match inserted {
        Ok(entry) => {
            info!(
                owner_id = %owner_id,
                entry_id = %entry.id,
                size_bytes = entry.size_bytes,
                "stored upload"
            );
            Ok(entry)
        }
        Err(err) => {
            warn!(
                storage_key = %storage_key,
                error = %err,
                "recording upload failed, removing stored object"
            );
            match state.storage.delete_object(&storage_key).await {
                Ok(()) => Err(err),
                Err(cleanup) => {
                    error!(
                        storage_key = %storage_key,
                        error = %cleanup,
                        "stored object is orphaned"
                    );
                    Err(AppError::partial_failure(format!(
                        "failed to record upload ({err}); stored object {storage_key} could not be removed: {cleanup:#}"
                    )))
                }
            }
        }
    }
}
