use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::types::{Schedule, ScheduleStatus};

/// A due schedule joined with the device fields the dispatcher needs.
#[derive(Debug, Clone)]
pub struct DueCall {
    pub schedule_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub device_token: Option<String>,
    pub device_token_valid: bool,
}

/// An in-progress schedule that outlived the answer window.
#[derive(Debug, Clone)]
pub struct MissedCall {
    pub schedule_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
}

fn schedule_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Schedule> {
    let status_raw: String = row.get("status");
    let status = ScheduleStatus::parse(&status_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown schedule status '{}'", status_raw))?;
    let scheduled_at: String = row.get("scheduled_at");
    let last_attempt_at: Option<String> = row.get("last_attempt_at");
    Ok(Schedule {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        kind: row.get("kind"),
        scheduled_at: DateTime::parse_from_rfc3339(&scheduled_at)?.with_timezone(&Utc),
        status,
        retries: row.get("retries"),
        last_attempt_at: last_attempt_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

impl Store {
    pub async fn get_schedule(&self, id: i64) -> anyhow::Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    /// Pending schedules whose time has come, oldest first. A schedule at
    /// exactly `now` is due.
    pub async fn due_pending_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<DueCall>> {
        let rows = sqlx::query(
            "SELECT s.id AS schedule_id, s.subject_id, i.name,
                    i.device_token, i.device_token_valid
             FROM schedules s
             JOIN subjects i ON i.id = s.subject_id
             WHERE s.status = 'pending'
               AND datetime(s.scheduled_at) <= datetime(?)
               AND i.active = 1
             ORDER BY s.scheduled_at ASC
             LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DueCall {
                schedule_id: row.get("schedule_id"),
                subject_id: row.get("subject_id"),
                subject_name: row.get("name"),
                device_token: row.get("device_token"),
                device_token_valid: row.get::<i64, _>("device_token_valid") != 0,
            })
            .collect())
    }

    /// In-progress schedules older than `cutoff` (the invite went out and
    /// nobody answered). The caller excludes subjects with a live session.
    pub async fn stalled_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MissedCall>> {
        let rows = sqlx::query(
            "SELECT s.id AS schedule_id, s.subject_id, i.name
             FROM schedules s
             JOIN subjects i ON i.id = s.subject_id
             WHERE s.status = 'in_progress'
               AND datetime(s.scheduled_at) < datetime(?)",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MissedCall {
                schedule_id: row.get("schedule_id"),
                subject_id: row.get("subject_id"),
                subject_name: row.get("name"),
            })
            .collect())
    }

    /// Guarded single-row transition. Returns false (and changes nothing)
    /// when the row is not in a state from which `to` is reachable; this is
    /// what keeps terminal states from regressing under concurrent ticks.
    pub async fn transition_schedule(
        &self,
        id: i64,
        to: ScheduleStatus,
        touch_attempt: bool,
    ) -> anyhow::Result<bool> {
        let sources = ScheduleStatus::allowed_sources(to);
        if sources.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; sources.len()].join(", ");
        let now = Utc::now().to_rfc3339();

        let sql = if touch_attempt {
            format!(
                "UPDATE schedules
                 SET status = ?, last_attempt_at = ?, updated_at = ?
                 WHERE id = ? AND status IN ({})",
                placeholders
            )
        } else {
            format!(
                "UPDATE schedules
                 SET status = ?, updated_at = ?
                 WHERE id = ? AND status IN ({})",
                placeholders
            )
        };

        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(&now);
        if touch_attempt {
            query = query.bind(&now);
        }
        query = query.bind(id);
        for source in sources {
            query = query.bind(*source);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Missed-call bookkeeping: unanswered + one more retry on the counter.
    pub async fn mark_schedule_unanswered(&self, id: i64) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE schedules
             SET status = 'unanswered', retries = retries + 1,
                 last_attempt_at = ?, updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Medication confirmed during a call: close out the day's in-progress
    /// schedule for the subject.
    pub async fn complete_in_progress_for_day(&self, subject_id: i64) -> anyhow::Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE schedules
             SET status = 'completed', updated_at = ?
             WHERE subject_id = ?
               AND status = 'in_progress'
               AND date(scheduled_at) = date('now')",
        )
        .bind(&now)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Orderly teardown of an answered call: the most recent in-progress
    /// schedule moves to completed so the missed-call sweep never sees it.
    pub async fn complete_answered_schedule(&self, subject_id: i64) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE schedules
             SET status = 'completed', updated_at = ?
             WHERE id = (
                 SELECT id FROM schedules
                 WHERE subject_id = ? AND status = 'in_progress'
                 ORDER BY scheduled_at DESC
                 LIMIT 1
             )",
        )
        .bind(&now)
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
