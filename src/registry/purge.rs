//! Permanent deletion. Each entry loses its blob before its row, and a run
//! stops at the first failure so nothing is ever half-accounted for.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ErrorKind};
use crate::models::Entry;
use crate::schema::entries;
use crate::state::AppState;

use super::lifecycle::{self, EntryState, Transition};
use super::{find_entry, list_trash, load_subtree_deepest_first};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeFailure {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub purged: Vec<Uuid>,
    pub failed: Option<PurgeFailure>,
    /// Entries still present after the run, the failed one first.
    pub remaining: Vec<Uuid>,
}

impl PurgeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }

    pub fn status(&self) -> StatusCode {
        match &self.failed {
            None => StatusCode::OK,
            Some(failure) => failure.kind.status(),
        }
    }
}

/// Runs `purge_one` over `plan` in order, stopping at the first error.
pub async fn purge_in_order<F, Fut>(plan: Vec<Entry>, mut purge_one: F) -> PurgeReport
where
    F: FnMut(Entry) -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut report = PurgeReport::default();
    let mut pending = plan.into_iter();

    while let Some(entry) = pending.next() {
        let id = entry.id;
        match purge_one(entry).await {
            Ok(()) => report.purged.push(id),
            Err(err) => {
                report.failed = Some(PurgeFailure {
                    id,
                    kind: err.kind(),
                    error: err.to_string(),
                });
                report.remaining.push(id);
                report.remaining.extend(pending.map(|entry| entry.id));
                break;
            }
        }
    }

    report
}

/// Deletes the blob (files only) and then the row of a single entry. Only
/// trashed entries may be destroyed.
pub async fn destroy(state: &AppState, entry: Entry) -> AppResult<()> {
    lifecycle::apply(
        EntryState::of(&entry),
        Transition::Purge,
        Utc::now().naive_utc(),
    )?;

    if !entry.is_folder {
        state
            .storage
            .delete_object(&entry.storage_key)
            .await
            .map_err(|err| {
                warn!(
                    entry_id = %entry.id,
                    storage_key = %entry.storage_key,
                    error = %err,
                    "failed to delete stored object"
                );
                AppError::storage(format!(
                    "failed to delete stored object for entry {}: {err:#}",
                    entry.id
                ))
            })?;
    }

    let mut conn = state.db()?;
    diesel::delete(
        entries::table
            .filter(entries::id.eq(entry.id))
            .filter(entries::owner_id.eq(entry.owner_id)),
    )
    .execute(&mut conn)?;
    Ok(())
}

/// Expands each root into its subtree and concatenates the results,
/// skipping entries already covered by an earlier root.
fn expand_roots(
    conn: &mut PgConnection,
    owner_id: Uuid,
    roots: Vec<Entry>,
) -> AppResult<Vec<Entry>> {
    let mut seen = HashSet::new();
    let mut plan = Vec::new();

    for root in roots {
        if seen.contains(&root.id) {
            continue;
        }
        for entry in load_subtree_deepest_first(conn, owner_id, root)? {
            if seen.insert(entry.id) {
                plan.push(entry);
            }
        }
    }

    Ok(plan)
}

/// Permanently deletes a trashed entry. Folders take their whole subtree
/// with them.
pub async fn purge_entry(state: &AppState, owner_id: Uuid, entry_id: Uuid) -> AppResult<PurgeReport> {
    let plan = {
        let mut conn = state.db()?;
        let entry = find_entry(&mut conn, owner_id, entry_id)?;
        lifecycle::apply(
            EntryState::of(&entry),
            Transition::Purge,
            Utc::now().naive_utc(),
        )?;
        load_subtree_deepest_first(&mut conn, owner_id, entry)?
    };

    let report = purge_in_order(plan, |entry| destroy(state, entry)).await;
    log_report(owner_id, "purge entry", &report);
    Ok(report)
}

/// Permanently deletes everything in the owner's trash, most recently
/// trashed first.
pub async fn empty_trash(state: &AppState, owner_id: Uuid) -> AppResult<PurgeReport> {
    let plan = {
        let mut conn = state.db()?;
        let trashed = list_trash(&mut conn, owner_id)?;
        expand_roots(&mut conn, owner_id, trashed)?
    };

    let report = purge_in_order(plan, |entry| destroy(state, entry)).await;
    log_report(owner_id, "empty trash", &report);
    Ok(report)
}

/// The instant before which trashed entries count as expired after `days`
/// of retention.
pub fn retention_cutoff(now: NaiveDateTime, days: i64) -> AppResult<NaiveDateTime> {
    if days < 0 {
        return Err(AppError::bad_request("retention days must not be negative"));
    }
    ChronoDuration::try_days(days)
        .and_then(|retention| now.checked_sub_signed(retention))
        .ok_or_else(|| {
            AppError::bad_request(format!("retention of {days} days is out of range"))
        })
}

/// Purges entries of every owner that have sat in the trash since before
/// `cutoff`. A failure only stops the run for that owner.
pub async fn purge_expired(
    state: &AppState,
    cutoff: NaiveDateTime,
) -> AppResult<Vec<(Uuid, PurgeReport)>> {
    let plans = {
        let mut conn = state.db()?;
        let expired: Vec<Entry> = entries::table
            .filter(entries::deleted_at.lt(cutoff))
            .order((entries::owner_id.asc(), entries::deleted_at.asc()))
            .load(&mut conn)?;

        let mut owners: Vec<Uuid> = Vec::new();
        let mut roots: HashMap<Uuid, Vec<Entry>> = HashMap::new();
        for entry in expired {
            if !roots.contains_key(&entry.owner_id) {
                owners.push(entry.owner_id);
            }
            roots.entry(entry.owner_id).or_default().push(entry);
        }

        let mut plans = Vec::with_capacity(owners.len());
        for owner_id in owners {
            let owner_roots = roots.remove(&owner_id).unwrap_or_default();
            plans.push((owner_id, expand_roots(&mut conn, owner_id, owner_roots)?));
        }
        plans
    };

    let mut reports = Vec::with_capacity(plans.len());
    for (owner_id, plan) in plans {
        let report = purge_in_order(plan, |entry| destroy(state, entry)).await;
        log_report(owner_id, "purge expired trash", &report);
        reports.push((owner_id, report));
    }
    Ok(reports)
}

fn log_report(owner_id: Uuid, operation: &str, report: &PurgeReport) {
    match &report.failed {
        None => info!(
            owner_id = %owner_id,
            purged = report.purged.len(),
            "{operation} completed"
        ),
        Some(failure) => warn!(
            owner_id = %owner_id,
            purged = report.purged.len(),
            remaining = report.remaining.len(),
            failed_entry = %failure.id,
            error = %failure.error,
            "{operation} stopped early"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::NaiveDate;

    use super::*;

    fn file(name: &str) -> Entry {
        let at = NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Entry {
            id: Uuid::new_v4(),
            owner_id: Uuid::nil(),
            name: name.to_string(),
            is_folder: false,
            size_bytes: 1,
            mime_type: None,
            storage_key: format!("blobs/{name}"),
            parent_id: None,
            created_at: at,
            updated_at: at,
            deleted_at: Some(at),
        }
    }

    #[tokio::test]
    async fn purges_everything_when_nothing_fails() {
        let plan = vec![file("a"), file("b")];
        let ids: Vec<Uuid> = plan.iter().map(|e| e.id).collect();

        let report = purge_in_order(plan, |_| async { Ok(()) }).await;

        assert!(report.is_complete());
        assert_eq!(report.purged, ids);
        assert!(report.remaining.is_empty());
        assert_eq!(report.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stops_at_first_failure_and_reports_the_rest() {
        let plan = vec![file("one"), file("two"), file("three")];
        let ids: Vec<Uuid> = plan.iter().map(|e| e.id).collect();
        let attempted = RefCell::new(Vec::new());

        let report = purge_in_order(plan, |entry| {
            attempted.borrow_mut().push(entry.id);
            async move {
                if entry.name == "two" {
                    Err(AppError::storage("bucket unavailable"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(report.purged, vec![ids[0]]);
        assert_eq!(report.remaining, vec![ids[1], ids[2]]);
        let failure = report.failed.clone().unwrap();
        assert_eq!(failure.id, ids[1]);
        assert_eq!(failure.kind, ErrorKind::StorageBackend);
        assert!(failure.error.contains("bucket unavailable"));
        assert_eq!(report.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(*attempted.borrow(), vec![ids[0], ids[1]]);
    }

    #[test]
    fn retention_cutoff_counts_back_whole_days() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 31)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let cutoff = retention_cutoff(now, 30).unwrap();
        assert_eq!(cutoff.to_string(), "2025-03-01 12:00:00");
        assert_eq!(retention_cutoff(now, 0).unwrap(), now);
    }

    #[test]
    fn retention_cutoff_rejects_unrepresentable_spans() {
        let now = Utc::now().naive_utc();
        for days in [-1, 999_999_999_999_999, i64::MAX] {
            let err = retention_cutoff(now, days).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn empty_plan_is_complete() {
        let report = purge_in_order(Vec::new(), |_| async { Ok(()) }).await;
        assert!(report.is_complete());
        assert!(report.purged.is_empty());
    }
}
