//! Typed listing filters.
//!
//! Every constraint is pushed as SQL text with a bound parameter, user input
//! never becomes part of the statement itself.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{AppError, Result};

/// Listing query parameters as sent by the client
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub search: Option<String>,
    pub mime_type: Option<String>,
    /// KiB
    pub min_size: Option<i64>,
    /// KiB
    pub max_size: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub uploader: Option<String>,
    /// Records holding exactly this content
    pub digest: Option<String>,
    /// Only masters (`true`) or only duplicates (`false`)
    pub master: Option<bool>,
}

/// Composable constraints over file records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilter {
    pub owner: Option<String>,
    pub search: Option<String>,
    pub mime_type: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub uploaded_from: Option<String>,
    /// Exclusive upper bound
    pub uploaded_before: Option<String>,
    pub uploader: Option<String>,
    pub digest: Option<String>,
    pub is_master: Option<bool>,
    pub is_public: Option<bool>,
}

impl FileFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, user_id: impl Into<String>) -> Self {
        self.owner = Some(user_id.into());
        self
    }

    pub fn digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn master(mut self, is_master: bool) -> Self {
        self.is_master = Some(is_master);
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = Some(is_public);
        self
    }

    /// Build a filter from client query parameters
    pub fn from_query(query: FileQuery) -> Result<Self> {
        let uploaded_from = match non_empty(query.start_date) {
            Some(s) => Some(parse_bound(&s, false)?),
            None => None,
        };
        let uploaded_before = match non_empty(query.end_date) {
            Some(s) => Some(parse_bound(&s, true)?),
            None => None,
        };

        let mut filter = Self {
            search: non_empty(query.search),
            mime_type: non_empty(query.mime_type),
            min_size: query.min_size.map(|kb| kb.saturating_mul(1024)),
            max_size: query.max_size.map(|kb| kb.saturating_mul(1024)),
            uploaded_from,
            uploaded_before,
            uploader: non_empty(query.uploader),
            ..Self::default()
        };

        if let Some(digest) = non_empty(query.digest) {
            filter = filter.digest(digest.to_lowercase());
        }
        if let Some(is_master) = query.master {
            filter = filter.master(is_master);
        }
        Ok(filter)
    }

    /// Append the `AND ...` clauses for this filter; `f` is files, `u` is users
    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(owner) = &self.owner {
            qb.push(" AND f.user_id = ").push_bind(owner.clone());
        }
        if let Some(search) = &self.search {
            qb.push(" AND f.filename LIKE ")
                .push_bind(like_pattern(search))
                .push(" ESCAPE '\\'");
        }
        if let Some(mime_type) = &self.mime_type {
            qb.push(" AND f.mime_type = ").push_bind(mime_type.clone());
        }
        if let Some(min) = self.min_size {
            qb.push(" AND f.size >= ").push_bind(min);
        }
        if let Some(max) = self.max_size {
            qb.push(" AND f.size <= ").push_bind(max);
        }
        if let Some(from) = &self.uploaded_from {
            qb.push(" AND f.uploaded_at >= ").push_bind(from.clone());
        }
        if let Some(before) = &self.uploaded_before {
            qb.push(" AND f.uploaded_at < ").push_bind(before.clone());
        }
        if let Some(uploader) = &self.uploader {
            qb.push(" AND u.username LIKE ")
                .push_bind(like_pattern(uploader))
                .push(" ESCAPE '\\'");
        }
        if let Some(digest) = &self.digest {
            qb.push(" AND f.hash = ").push_bind(digest.clone());
        }
        if let Some(is_master) = self.is_master {
            qb.push(" AND f.is_master = ").push_bind(is_master);
        }
        if let Some(is_public) = self.is_public {
            qb.push(" AND f.is_public = ").push_bind(is_public);
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// `%term%` with LIKE wildcards escaped
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Normalize a date or RFC 3339 timestamp to the stored timestamp format.
/// A bare end date covers that whole day.
fn parse_bound(value: &str, end: bool) -> Result<String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc).to_rfc3339());
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid date: {}", value)))?;
    let date = if end {
        date.succ_opt()
            .ok_or_else(|| AppError::BadRequest(format!("Invalid date: {}", value)))?
    } else {
        date
    };
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid date: {}", value)))?;
    Ok(midnight.and_utc().to_rfc3339())
}
