//! Live / Trashed / Purged state machine for registry entries.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::error::AppError;
use crate::models::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Live,
    Trashed { since: NaiveDateTime },
}

impl EntryState {
    pub fn of(entry: &Entry) -> Self {
        match entry.deleted_at {
            Some(since) => EntryState::Trashed { since },
            None => EntryState::Live,
        }
    }

    pub fn deleted_at(self) -> Option<NaiveDateTime> {
        match self {
            EntryState::Live => None,
            EntryState::Trashed { since } => Some(since),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SoftDelete,
    Restore,
    Purge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The row must be written with the new state.
    Changed(EntryState),
    /// Already in the requested state.
    Unchanged,
    /// The row and its blob must be destroyed.
    Purged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("entry must be moved to trash before it can be permanently deleted")]
    PurgeLiveEntry,
}

impl From<LifecycleError> for AppError {
    fn from(value: LifecycleError) -> Self {
        AppError::bad_request(value.to_string())
    }
}

pub fn apply(
    state: EntryState,
    transition: Transition,
    now: NaiveDateTime,
) -> Result<Outcome, LifecycleError> {
    match (state, transition) {
        (EntryState::Live, Transition::SoftDelete) => {
            Ok(Outcome::Changed(EntryState::Trashed { since: now }))
        }
        (EntryState::Trashed { .. }, Transition::SoftDelete) => Ok(Outcome::Unchanged),
        (EntryState::Trashed { .. }, Transition::Restore) => {
            Ok(Outcome::Changed(EntryState::Live))
        }
        (EntryState::Live, Transition::Restore) => Ok(Outcome::Unchanged),
        (EntryState::Trashed { .. }, Transition::Purge) => Ok(Outcome::Purged),
        (EntryState::Live, Transition::Purge) => Err(LifecycleError::PurgeLiveEntry),
    }
}
