use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::types::CallRecord;

/// Transcript lines carry their own clock so ordering survives a
/// restart-recovered record: `[HH:MM:SS] ROLE: content`.
pub fn format_transcript_segment(role_label: &str, content: &str) -> String {
    format!(
        "[{}] {}: {}",
        chrono::Local::now().format("%H:%M:%S"),
        role_label,
        content
    )
}

fn call_record_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<CallRecord> {
    let started_at: String = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");
    let analysis: Option<String> = row.get("analysis");
    Ok(CallRecord {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        schedule_id: row.get("schedule_id"),
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        ended_at: ended_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        duration_secs: row.get("duration_secs"),
        completed: row.get::<i64, _>("completed") != 0,
        failure_reason: row.get("failure_reason"),
        transcript: row.get("transcript"),
        analysis: analysis.and_then(|raw| serde_json::from_str(&raw).ok()),
        urgency: row.get("urgency"),
        mood: row.get("mood"),
        summary: row.get("summary"),
    })
}

impl Store {
    pub async fn get_call_record(&self, id: i64) -> anyhow::Result<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM call_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_record_from_row).transpose()
    }

    /// Append a transcript segment to the subject's active call record.
    ///
    /// Appends to the newest record whose end is unset and whose start is
    /// within the last 5 minutes; otherwise starts a new record attached to
    /// the subject's most recent pending/in-progress schedule. The window
    /// keeps two widely-separated sessions from being glued together.
    /// Returns the record id.
    pub async fn append_transcript(&self, subject_id: i64, segment: &str) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "UPDATE call_records
             SET transcript = COALESCE(transcript || char(10), '') || ?2
             WHERE id = (
                 SELECT id FROM call_records
                 WHERE subject_id = ?1
                   AND ended_at IS NULL
                   AND datetime(started_at) > datetime('now', '-5 minutes')
                 ORDER BY started_at DESC
                 LIMIT 1
             )
             RETURNING id",
        )
        .bind(subject_id)
        .bind(segment)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = result {
            return Ok(row.get("id"));
        }

        let row = sqlx::query(
            "INSERT INTO call_records (subject_id, schedule_id, started_at, transcript, created_at)
             VALUES (
                 ?1,
                 (SELECT id FROM schedules
                  WHERE subject_id = ?1 AND status IN ('pending', 'in_progress')
                  ORDER BY scheduled_at DESC
                  LIMIT 1),
                 ?2, ?3, ?2
             )
             RETURNING id",
        )
        .bind(subject_id)
        .bind(Utc::now().to_rfc3339())
        .bind(segment)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    /// The watchdog's synthetic record for a call nobody answered.
    pub async fn insert_missed_call_record(
        &self,
        subject_id: i64,
        schedule_id: i64,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: &str,
        detail: &str,
    ) -> anyhow::Result<i64> {
        let duration = (ended_at - started_at).num_seconds();
        let row = sqlx::query(
            "INSERT INTO call_records
                (subject_id, schedule_id, started_at, ended_at, duration_secs,
                 completed, failure_reason, transcript, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
             RETURNING id",
        )
        .bind(subject_id)
        .bind(schedule_id)
        .bind(started_at.to_rfc3339())
        .bind(ended_at.to_rfc3339())
        .bind(duration)
        .bind(reason)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Newest record still missing its end, with enough transcript to be
    /// worth analyzing.
    pub async fn latest_open_transcript(
        &self,
        subject_id: i64,
        min_len: i64,
    ) -> anyhow::Result<Option<(i64, String)>> {
        let row = sqlx::query(
            "SELECT id, transcript FROM call_records
             WHERE subject_id = ?
               AND ended_at IS NULL
               AND transcript IS NOT NULL
               AND LENGTH(transcript) > ?
             ORDER BY started_at DESC
             LIMIT 1",
        )
        .bind(subject_id)
        .bind(min_len)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("id"), r.get("transcript"))))
    }

    /// Set-once finalization: every terminal field is written through
    /// COALESCE, so applying the same finalize twice is a no-op and a later
    /// finalize never overwrites an earlier one. Duration is derived from
    /// the stored start.
    pub async fn finalize_call_record(
        &self,
        id: i64,
        ended_at: DateTime<Utc>,
        analysis: &serde_json::Value,
        urgency: &str,
        mood: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE call_records
             SET ended_at = COALESCE(ended_at, ?2),
                 duration_secs = COALESCE(
                     duration_secs,
                     CAST(ROUND((julianday(?2) - julianday(started_at)) * 86400) AS INTEGER)
                 ),
                 analysis = COALESCE(analysis, ?3),
                 urgency = COALESCE(urgency, ?4),
                 mood = COALESCE(mood, ?5),
                 summary = COALESCE(summary, ?6)
             WHERE id = ?1",
        )
        .bind(id)
        .bind(ended_at.to_rfc3339())
        .bind(analysis.to_string())
        .bind(urgency)
        .bind(mood)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Medication adherence row.
    pub async fn log_medication(&self, subject_id: i64, medication: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO medication_log (subject_id, medication, taken_at) VALUES (?, ?, ?)")
            .bind(subject_id)
            .bind(medication)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
