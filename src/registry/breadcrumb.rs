use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Crumb {
    pub id: Uuid,
    pub name: String,
}

/// The slice of an entry row the walk needs.
#[derive(Debug, Clone)]
pub struct PathNode {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub trashed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("entry {0} not found")]
    Missing(Uuid),
    #[error("entry {0} is in trash")]
    Trashed(Uuid),
    #[error("data integrity error: parent {parent} of entry {child} does not exist")]
    BrokenLink { child: Uuid, parent: Uuid },
    #[error("data integrity error: folder cycle through entry {0}")]
    Cycle(Uuid),
}

impl From<PathError> for AppError {
    fn from(value: PathError) -> Self {
        match value {
            PathError::Missing(_) | PathError::Trashed(_) => AppError::not_found(),
            PathError::BrokenLink { .. } | PathError::Cycle(_) => AppError::internal(value),
        }
    }
}

/// Walks parent links from `start` up to the root and returns the path
/// root-first, `start` included. The root itself has no entry and is not
/// part of the result.
pub fn walk<F>(start: Uuid, mut lookup: F) -> AppResult<Vec<Crumb>>
where
    F: FnMut(Uuid) -> AppResult<Option<PathNode>>,
{
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut current = start;
    let mut child: Option<Uuid> = None;

    loop {
        if !seen.insert(current) {
            return Err(PathError::Cycle(current).into());
        }

        let node = match lookup(current)? {
            Some(node) => node,
            None => {
                return Err(match child {
                    None => PathError::Missing(current),
                    Some(child) => PathError::BrokenLink {
                        child,
                        parent: current,
                    },
                }
                .into())
            }
        };

        if node.trashed {
            return Err(PathError::Trashed(node.id).into());
        }

        path.push(Crumb {
            id: node.id,
            name: node.name,
        });

        match node.parent_id {
            Some(parent) => {
                child = Some(current);
                current = parent;
            }
            None => break,
        }
    }

    path.reverse();
    Ok(path)
}
