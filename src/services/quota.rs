use sqlx::{Executor, Sqlite};

use crate::error::{AppError, Result};

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny { would_use: i64, limit: i64 },
}

impl QuotaDecision {
    /// Convert a denial into `AppError::QuotaExceeded`
    pub fn into_result(self) -> Result<()> {
        match self {
            QuotaDecision::Allow => Ok(()),
            QuotaDecision::Deny { would_use, limit } => Err(AppError::QuotaExceeded {
                limit,
                attempted: would_use,
            }),
        }
    }
}

/// Storage quota enforcement.
///
/// Usage is the sum of `size` over every record a user owns, duplicates
/// included: each owner is billed for their logical copy even though the
/// physical blob is shared.
pub struct QuotaService;

impl QuotaService {
    /// Bytes attributed to `user_id`
    pub async fn usage<'e, E>(executor: E, user_id: &str) -> Result<i64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let used: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM files WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(executor)
                .await?;
        Ok(used)
    }

    /// Allow iff `usage + incoming <= limit`. Never mutates.
    pub async fn check<'e, E>(
        executor: E,
        user_id: &str,
        incoming: i64,
        limit: i64,
    ) -> Result<QuotaDecision>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let used = Self::usage(executor, user_id).await?;
        Ok(Self::decide(used, incoming, limit))
    }

    pub fn decide(used: i64, incoming: i64, limit: i64) -> QuotaDecision {
        let would_use = used.saturating_add(incoming);
        if would_use <= limit {
            QuotaDecision::Allow
        } else {
            QuotaDecision::Deny { would_use, limit }
        }
    }
}
