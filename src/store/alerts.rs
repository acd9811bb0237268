use chrono::{DateTime, Utc};
use sqlx::Row;

use super::Store;
use crate::types::{Alert, AlertKind, AlertSeverity};

/// Parameters for a new alert row. Alerts are born unsent and
/// unacknowledged; delivery bookkeeping happens through the update ops.
pub struct NewAlert<'a> {
    pub subject_id: i64,
    pub call_record_id: Option<i64>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: &'a str,
    pub recipients: &'a [String],
}

/// An unacknowledged alert due for escalation, joined with the subject name
/// the notification templates need.
#[derive(Debug, Clone)]
pub struct StaleAlert {
    pub alert_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub attempts: i64,
}

fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Alert> {
    let severity_raw: String = row.get("severity");
    let severity = AlertSeverity::parse(&severity_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown alert severity '{}'", severity_raw))?;
    let recipients_raw: String = row.get("recipients");
    let created_at: String = row.get("created_at");
    let parse_ts = |value: Option<String>| {
        value
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Ok(Alert {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        call_record_id: row.get("call_record_id"),
        kind: row.get("kind"),
        severity,
        message: row.get("message"),
        recipients: serde_json::from_str(&recipients_raw).unwrap_or_default(),
        sent: row.get::<i64, _>("sent") != 0,
        acknowledged: row.get::<i64, _>("acknowledged") != 0,
        needs_escalation: row.get::<i64, _>("needs_escalation") != 0,
        escalation_at: parse_ts(row.get("escalation_at")),
        attempts: row.get("attempts"),
        sent_at: parse_ts(row.get("sent_at")),
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

impl Store {
    pub async fn insert_alert(&self, alert: &NewAlert<'_>) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "INSERT INTO alerts
                (subject_id, call_record_id, kind, severity, message, recipients, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(alert.subject_id)
        .bind(alert.call_record_id)
        .bind(alert.kind.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.message)
        .bind(serde_json::to_string(alert.recipients)?)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn get_alert(&self, id: i64) -> anyhow::Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    pub async fn mark_alert_sent(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE alerts SET sent = 1, sent_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delivery failed (or the alert must be revisited): queue it for the
    /// escalator. `bump_attempts` distinguishes a failed send from a
    /// deliberate revisit of a successfully-sent critical alert.
    pub async fn flag_alert_for_escalation(
        &self,
        id: i64,
        escalation_at: DateTime<Utc>,
        bump_attempts: bool,
    ) -> anyhow::Result<()> {
        let sql = if bump_attempts {
            "UPDATE alerts
             SET needs_escalation = 1, escalation_at = ?,
                 attempts = attempts + 1, last_attempt_at = ?
             WHERE id = ?"
        } else {
            "UPDATE alerts
             SET needs_escalation = 1, escalation_at = ?, last_attempt_at = ?
             WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(escalation_at.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One escalation tier was attempted: count it and schedule the next
    /// revisit.
    pub async fn record_escalation_attempt(
        &self,
        id: i64,
        next_escalation_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE alerts
             SET attempts = attempts + 1, last_attempt_at = ?, escalation_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(next_escalation_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// External acknowledgement signal (caregiver opened the alert).
    pub async fn acknowledge_alert(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE alerts SET acknowledged = 1, needs_escalation = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unacknowledged critical/high alerts whose escalation time has come.
    pub async fn stale_unacknowledged_alerts(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<StaleAlert>> {
        let rows = sqlx::query(
            "SELECT a.id, a.subject_id, a.severity, a.message, a.attempts, i.name
             FROM alerts a
             JOIN subjects i ON i.id = a.subject_id
             WHERE a.acknowledged = 0
               AND a.needs_escalation = 1
               AND a.escalation_at IS NOT NULL
               AND datetime(a.escalation_at) <= datetime(?)
               AND a.severity IN ('critical', 'high')",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let severity_raw: String = row.get("severity");
                let severity = AlertSeverity::parse(&severity_raw)
                    .ok_or_else(|| anyhow::anyhow!("unknown severity '{}'", severity_raw))?;
                Ok(StaleAlert {
                    alert_id: row.get("id"),
                    subject_id: row.get("subject_id"),
                    subject_name: row.get("name"),
                    severity,
                    message: row.get("message"),
                    attempts: row.get("attempts"),
                })
            })
            .collect()
    }
}
