//! The file/folder registry: every query and mutation over `entries`, always
//! scoped to a single owner.

pub mod breadcrumb;
pub mod cache;
pub mod lifecycle;
pub mod purge;
pub mod sort;
pub mod upload;

use std::collections::HashSet;

use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ErrorKind};
use crate::models::{Entry, NewEntry};
use crate::schema::entries;
use crate::storage::folder_key;

use self::breadcrumb::{Crumb, PathNode};
use self::lifecycle::{EntryState, Outcome, Transition};
use self::sort::{SortField, SortOrder};

pub const MAX_NAME_LENGTH: usize = 255;

pub fn normalize_name(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::bad_request(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Escapes LIKE metacharacters so user input only ever matches literally.
pub fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Loads an entry in any lifecycle state. Entries of other owners are
/// reported as missing.
pub fn find_entry(conn: &mut PgConnection, owner_id: Uuid, entry_id: Uuid) -> AppResult<Entry> {
    let entry = entries::table
        .filter(entries::id.eq(entry_id))
        .filter(entries::owner_id.eq(owner_id))
        .first::<Entry>(conn)?;
    Ok(entry)
}

pub fn find_live_entry(
    conn: &mut PgConnection,
    owner_id: Uuid,
    entry_id: Uuid,
) -> AppResult<Entry> {
    let entry = find_entry(conn, owner_id, entry_id)?;
    if entry.is_trashed() {
        return Err(AppError::not_found());
    }
    Ok(entry)
}

/// Checks that `parent_id` names a live folder of the owner.
pub fn ensure_parent_folder(
    conn: &mut PgConnection,
    owner_id: Uuid,
    parent_id: Option<Uuid>,
) -> AppResult<()> {
    let Some(parent_id) = parent_id else {
        return Ok(());
    };

    let parent = entries::table
        .filter(entries::id.eq(parent_id))
        .filter(entries::owner_id.eq(owner_id))
        .first::<Entry>(conn)
        .optional()?
        .ok_or_else(|| AppError::bad_request("parent folder does not exist"))?;

    if !parent.is_folder {
        return Err(AppError::bad_request("parent must be a folder"));
    }
    if parent.is_trashed() {
        return Err(AppError::bad_request("parent folder is in trash"));
    }
    Ok(())
}

/// Live children of `parent_id` (root when `None`), folders first, then by
/// name. Names are ordered in Rust so the result does not depend on the
/// database collation.
pub fn list_children(
    conn: &mut PgConnection,
    owner_id: Uuid,
    parent_id: Option<Uuid>,
) -> AppResult<Vec<Entry>> {
    let mut query = entries::table
        .filter(entries::owner_id.eq(owner_id))
        .filter(entries::deleted_at.is_null())
        .order((entries::is_folder.desc(), entries::name.asc()))
        .into_boxed();

    query = match parent_id {
        Some(parent_id) => query.filter(entries::parent_id.eq(parent_id)),
        None => query.filter(entries::parent_id.is_null()),
    };

    let mut children = query.load(conn)?;
    sort::sort_entries(&mut children, SortField::Name, SortOrder::Asc);
    Ok(children)
}

/// Resolves the folder a listing is requested for; `None` is the root.
pub fn find_listable_folder(
    conn: &mut PgConnection,
    owner_id: Uuid,
    folder_id: Option<Uuid>,
) -> AppResult<Option<Entry>> {
    let Some(folder_id) = folder_id else {
        return Ok(None);
    };

    let folder = find_live_entry(conn, owner_id, folder_id)?;
    if !folder.is_folder {
        return Err(AppError::bad_request("entry is not a folder"));
    }
    Ok(Some(folder))
}

/// Case-insensitive substring search over live entry names.
pub fn search(conn: &mut PgConnection, owner_id: Uuid, term: &str) -> AppResult<Vec<Entry>> {
    let term = term.trim();
    if term.is_empty() {
        return Ok(Vec::new());
    }

    let pattern = format!("%{}%", escape_like(term));
    let mut found: Vec<Entry> = entries::table
        .filter(entries::owner_id.eq(owner_id))
        .filter(entries::deleted_at.is_null())
        .filter(entries::name.ilike(pattern))
        .order(entries::name.asc())
        .load(conn)?;
    found.sort_by(|a, b| sort::compare_names(&a.name, &b.name));
    Ok(found)
}

/// Trashed entries, most recently deleted first.
pub fn list_trash(conn: &mut PgConnection, owner_id: Uuid) -> AppResult<Vec<Entry>> {
    let trashed = entries::table
        .filter(entries::owner_id.eq(owner_id))
        .filter(entries::deleted_at.is_not_null())
        .order((entries::deleted_at.desc(), entries::id.asc()))
        .load(conn)?;
    Ok(trashed)
}

pub fn breadcrumb(conn: &mut PgConnection, owner_id: Uuid, entry_id: Uuid) -> AppResult<Vec<Crumb>> {
    breadcrumb::walk(entry_id, |current| {
        let row = entries::table
            .filter(entries::id.eq(current))
            .filter(entries::owner_id.eq(owner_id))
            .select((
                entries::id,
                entries::name,
                entries::parent_id,
                entries::deleted_at,
            ))
            .first::<(Uuid, String, Option<Uuid>, Option<NaiveDateTime>)>(conn)
            .optional()?;

        Ok(row.map(|(id, name, parent_id, deleted_at)| PathNode {
            id,
            name,
            parent_id,
            trashed: deleted_at.is_some(),
        }))
    })
}

pub fn insert_entry(conn: &mut PgConnection, new_entry: &NewEntry) -> AppResult<Entry> {
    diesel::insert_into(entries::table)
        .values(new_entry)
        .execute(conn)?;
    let entry = entries::table.find(new_entry.id).first(conn)?;
    Ok(entry)
}

pub fn create_folder(
    conn: &mut PgConnection,
    owner_id: Uuid,
    name: &str,
    parent_id: Option<Uuid>,
) -> AppResult<Entry> {
    let name = normalize_name(name)?;

    conn.transaction::<Entry, AppError, _>(|conn| {
        ensure_parent_folder(conn, owner_id, parent_id)?;

        let id = Uuid::new_v4();
        let new_folder = NewEntry {
            id,
            owner_id,
            name,
            is_folder: true,
            size_bytes: 0,
            mime_type: None,
            storage_key: folder_key(owner_id, id),
            parent_id,
        };
        insert_entry(conn, &new_folder)
    })
}

#[derive(Debug, Default)]
pub struct EntryChanges {
    pub name: Option<String>,
    /// `Some(None)` moves the entry to the root.
    pub parent_id: Option<Option<Uuid>>,
}

#[derive(Debug)]
pub struct UpdateOutcome {
    pub entry: Entry,
    pub previous_parent: Option<Uuid>,
    pub renamed: bool,
    pub moved: bool,
}

/// Renames and/or moves a live entry. Moves keep the folder graph acyclic.
pub fn update_entry(
    conn: &mut PgConnection,
    owner_id: Uuid,
    entry_id: Uuid,
    changes: EntryChanges,
) -> AppResult<UpdateOutcome> {
    let new_name = changes.name.as_deref().map(normalize_name).transpose()?;

    if new_name.is_none() && changes.parent_id.is_none() {
        return Err(AppError::bad_request("no changes provided"));
    }

    conn.transaction::<UpdateOutcome, AppError, _>(|conn| {
        let entry = find_live_entry(conn, owner_id, entry_id)?;
        let previous_parent = entry.parent_id;

        let mut next_parent = entry.parent_id;
        if let Some(target) = changes.parent_id {
            if target == Some(entry_id) {
                return Err(AppError::bad_request("entry cannot be its own parent"));
            }
            ensure_parent_folder(conn, owner_id, target)?;

            if let (true, Some(target_id)) = (entry.is_folder, target) {
                let descendants = gather_descendant_ids(conn, owner_id, entry_id)?;
                if descendants.contains(&target_id) {
                    return Err(AppError::bad_request(
                        "cannot move folder into itself or a descendant",
                    ));
                }
            }
            next_parent = target;
        }

        let next_name = new_name.unwrap_or_else(|| entry.name.clone());
        let renamed = next_name != entry.name;
        let moved = next_parent != entry.parent_id;

        if !renamed && !moved {
            return Ok(UpdateOutcome {
                entry,
                previous_parent,
                renamed,
                moved,
            });
        }

        let now = Utc::now().naive_utc();
        diesel::update(entries::table.find(entry_id))
            .set((
                entries::name.eq(&next_name),
                entries::parent_id.eq(next_parent),
                entries::updated_at.eq(now),
            ))
            .execute(conn)?;

        let entry = entries::table.find(entry_id).first(conn)?;
        Ok(UpdateOutcome {
            entry,
            previous_parent,
            renamed,
            moved,
        })
    })
}

/// Moves an entry to the trash. A folder takes every live entry below it
/// along, stamped with the same `deleted_at`. Trashing an entry twice is a
/// no-op.
pub fn soft_delete(conn: &mut PgConnection, owner_id: Uuid, entry_id: Uuid) -> AppResult<Entry> {
    conn.transaction::<Entry, AppError, _>(|conn| {
        let entry = find_entry(conn, owner_id, entry_id)?;
        let now = Utc::now().naive_utc();

        let state = match lifecycle::apply(EntryState::of(&entry), Transition::SoftDelete, now)? {
            Outcome::Changed(state) => state,
            Outcome::Unchanged | Outcome::Purged => return Ok(entry),
        };

        let subtree = if entry.is_folder {
            gather_descendant_ids(conn, owner_id, entry_id)?
        } else {
            vec![entry_id]
        };

        diesel::update(
            entries::table
                .filter(entries::owner_id.eq(owner_id))
                .filter(entries::id.eq_any(subtree))
                .filter(entries::deleted_at.is_null()),
        )
        .set((
            entries::deleted_at.eq(state.deleted_at()),
            entries::updated_at.eq(now),
        ))
        .execute(conn)?;

        Ok(entries::table.find(entry_id).first(conn)?)
    })
}

/// Brings an entry back from the trash without moving it. A folder brings
/// back the entries that were trashed together with it; anything trashed on
/// its own before that stays in the trash. Entries whose folder is still in
/// the trash cannot be restored.
pub fn restore(conn: &mut PgConnection, owner_id: Uuid, entry_id: Uuid) -> AppResult<Entry> {
    conn.transaction::<Entry, AppError, _>(|conn| {
        let entry = find_entry(conn, owner_id, entry_id)?;
        let now = Utc::now().naive_utc();

        let (trashed_at, state) = match (
            entry.deleted_at,
            lifecycle::apply(EntryState::of(&entry), Transition::Restore, now)?,
        ) {
            (Some(trashed_at), Outcome::Changed(state)) => (trashed_at, state),
            _ => return Ok(entry),
        };

        if let Some(parent_id) = entry.parent_id {
            let parent = find_entry(conn, owner_id, parent_id).map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    AppError::internal(format!(
                        "parent {parent_id} of entry {entry_id} does not exist"
                    ))
                } else {
                    err
                }
            })?;
            if parent.is_trashed() {
                return Err(AppError::bad_request(
                    "parent folder is in trash; restore the parent folder first",
                ));
            }
        }

        let subtree = if entry.is_folder {
            gather_descendant_ids(conn, owner_id, entry_id)?
        } else {
            vec![entry_id]
        };

        diesel::update(
            entries::table
                .filter(entries::owner_id.eq(owner_id))
                .filter(entries::id.eq_any(subtree))
                .filter(entries::deleted_at.eq(trashed_at)),
        )
        .set((
            entries::deleted_at.eq(state.deleted_at()),
            entries::updated_at.eq(now),
        ))
        .execute(conn)?;

        Ok(entries::table.find(entry_id).first(conn)?)
    })
}

/// Ids of `folder_id` and every entry below it, in any lifecycle state.
pub fn gather_descendant_ids(
    conn: &mut PgConnection,
    owner_id: Uuid,
    folder_id: Uuid,
) -> AppResult<Vec<Uuid>> {
    let mut ids = vec![folder_id];
    let mut seen: HashSet<Uuid> = HashSet::from([folder_id]);
    let mut queue = vec![folder_id];

    while let Some(current) = queue.pop() {
        let child_ids: Vec<Uuid> = entries::table
            .filter(entries::owner_id.eq(owner_id))
            .filter(entries::parent_id.eq(Some(current)))
            .select(entries::id)
            .load(conn)?;
        for child in child_ids {
            if seen.insert(child) {
                queue.push(child);
                ids.push(child);
            }
        }
    }

    Ok(ids)
}

/// `root` and everything below it, ordered so that every entry comes before
/// its parent folder.
pub fn load_subtree_deepest_first(
    conn: &mut PgConnection,
    owner_id: Uuid,
    root: Entry,
) -> AppResult<Vec<Entry>> {
    let mut seen: HashSet<Uuid> = HashSet::from([root.id]);
    let mut frontier = if root.is_folder { vec![root.id] } else { Vec::new() };
    let mut ordered = vec![root];

    while !frontier.is_empty() {
        let parents = std::mem::take(&mut frontier);
        let children: Vec<Entry> = entries::table
            .filter(entries::owner_id.eq(owner_id))
            .filter(entries::parent_id.eq_any(parents))
            .order(entries::id.asc())
            .load(conn)?;

        for child in children {
            if !seen.insert(child.id) {
                continue;
            }
            if child.is_folder {
                frontier.push(child.id);
            }
            ordered.push(child);
        }
    }

    ordered.reverse();
    Ok(ordered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used_bytes: u64,
    pub file_count: u64,
}

/// Bytes held in object storage for the owner. Trashed files still count:
/// their blobs exist until purged.
pub fn usage(conn: &mut PgConnection, owner_id: Uuid) -> AppResult<Usage> {
    let sizes: Vec<i64> = entries::table
        .filter(entries::owner_id.eq(owner_id))
        .filter(entries::is_folder.eq(false))
        .select(entries::size_bytes)
        .load(conn)?;

    Ok(Usage {
        used_bytes: sizes.iter().map(|size| (*size).max(0) as u64).sum(),
        file_count: sizes.len() as u64,
    })
}
