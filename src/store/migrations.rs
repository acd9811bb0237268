use sqlx::SqlitePool;
use tracing::info;

/// Schema migrations. Each statement is idempotent (`IF NOT EXISTS`), so the
/// whole set can run on every startup.
pub(crate) async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subjects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            cpf TEXT NOT NULL,
            birth_date TEXT,
            device_token TEXT,
            device_token_valid INTEGER NOT NULL DEFAULT 1,
            device_token_updated_at TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            cognitive_level TEXT NOT NULL DEFAULT 'normal',
            hearing_impaired INTEGER NOT NULL DEFAULT 0,
            uses_hearing_aid INTEGER NOT NULL DEFAULT 0,
            voice_tone TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS caregivers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            device_token TEXT,
            phone TEXT,
            email TEXT,
            priority INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (subject_id) REFERENCES subjects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_caregivers_subject
         ON caregivers(subject_id, priority) WHERE active = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            kind TEXT NOT NULL DEFAULT 'call',
            scheduled_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retries INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            updated_at TEXT,
            FOREIGN KEY (subject_id) REFERENCES subjects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_schedules_due
         ON schedules(scheduled_at) WHERE status IN ('pending', 'in_progress')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            schedule_id INTEGER,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_secs INTEGER,
            completed INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            transcript TEXT,
            analysis TEXT,
            urgency TEXT,
            mood TEXT,
            summary TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (subject_id) REFERENCES subjects(id),
            FOREIGN KEY (schedule_id) REFERENCES schedules(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_call_records_open
         ON call_records(subject_id, started_at DESC) WHERE ended_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            call_record_id INTEGER,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            recipients TEXT NOT NULL DEFAULT '[]',
            sent INTEGER NOT NULL DEFAULT 0,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            needs_escalation INTEGER NOT NULL DEFAULT 0,
            escalation_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            sent_at TEXT,
            last_attempt_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (subject_id) REFERENCES subjects(id),
            FOREIGN KEY (call_record_id) REFERENCES call_records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alerts_escalation
         ON alerts(escalation_at)
         WHERE acknowledged = 0 AND needs_escalation = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS timeline_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            subkind TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (subject_id) REFERENCES subjects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS medication_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            medication TEXT NOT NULL,
            taken_at TEXT NOT NULL,
            FOREIGN KEY (subject_id) REFERENCES subjects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_templates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            template TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Store migrations complete");
    Ok(())
}
