//! Store gateway.
//!
//! All persistence goes through typed, intent-named operations on
//! [`Store`]; SQL never leaks into the session, scheduler, or tool layers.
//! Timestamps are stored as RFC 3339 TEXT and compared with `datetime()`
//! in queries. Rows for subjects and caregivers are created by the operator
//! dashboard; the relay only reads them and mutates its own state fields.

pub mod alerts;
pub mod calls;
mod migrations;
pub mod schedules;
mod subjects;
mod timeline;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        migrations::migrate(&pool).await?;
        info!("Store initialized ({})", database_url);

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_for_tests() -> Self {
        // A single never-reclaimed connection keeps the in-memory database
        // alive for the whole test.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory store");
        migrations::migrate(&pool).await.expect("migrations");
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Used by `/health`: true when the store answers a trivial query.
    pub async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Store;
    use chrono::{DateTime, Utc};

    pub async fn insert_subject(store: &Store, name: &str, cpf: &str, token: Option<&str>) -> i64 {
        sqlx::query(
            "INSERT INTO subjects
                (name, cpf, birth_date, device_token, device_token_valid, active,
                 cognitive_level, hearing_impaired, uses_hearing_aid, voice_tone)
             VALUES (?, ?, '1948-03-10', ?, 1, 1, 'normal', 0, 0, 'calmo')",
        )
        .bind(name)
        .bind(cpf)
        .bind(token)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    pub async fn insert_caregiver(
        store: &Store,
        subject_id: i64,
        name: &str,
        priority: i64,
        token: Option<&str>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO caregivers
                (subject_id, name, device_token, phone, email, priority, active)
             VALUES (?, ?, ?, '+5511999990000', 'cg@example.com', ?, 1)",
        )
        .bind(subject_id)
        .bind(name)
        .bind(token)
        .bind(priority)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    pub async fn insert_schedule(
        store: &Store,
        subject_id: i64,
        scheduled_at: DateTime<Utc>,
        status: &str,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO schedules (subject_id, kind, scheduled_at, status, retries)
             VALUES (?, 'call', ?, ?, 0)",
        )
        .bind(subject_id)
        .bind(scheduled_at.to_rfc3339())
        .bind(status)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }
}
