use std::cmp::Ordering;

use serde::Deserialize;

use crate::models::Entry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Name,
    Size,
    CreatedAt,
    MimeType,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Optional `?sort=&order=` query parameters shared by listing endpoints.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct SortParams {
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
}

impl SortParams {
    pub fn apply(&self, entries: &mut [Entry]) {
        if self.sort.is_none() && self.order.is_none() {
            return;
        }
        sort_entries(
            entries,
            self.sort.unwrap_or_default(),
            self.order.unwrap_or_default(),
        );
    }
}

/// Stable sort: folders first whatever the direction, then by `field`.
pub fn sort_entries(entries: &mut [Entry], field: SortField, order: SortOrder) {
    entries.sort_by(|a, b| compare(a, b, field, order));
}

pub fn compare(a: &Entry, b: &Entry, field: SortField, order: SortOrder) -> Ordering {
    match (a.is_folder, b.is_folder) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let ordering = match field {
        SortField::Name => compare_names(&a.name, &b.name),
        SortField::Size => a.size_bytes.cmp(&b.size_bytes),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::MimeType => a
            .mime_type
            .as_deref()
            .unwrap_or("")
            .cmp(b.mime_type.as_deref().unwrap_or("")),
    };

    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

/// Case-insensitive, with a bytewise tiebreak so the order is total.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
