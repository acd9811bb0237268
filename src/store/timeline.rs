use chrono::Utc;
use sqlx::Row;

use super::Store;
use crate::types::TimelineEntry;

impl Store {
    pub async fn insert_timeline_entry(&self, entry: &TimelineEntry) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "INSERT INTO timeline_entries
                (subject_id, kind, subkind, title, description, occurred_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(entry.subject_id)
        .bind(&entry.kind)
        .bind(&entry.subkind)
        .bind(&entry.title)
        .bind(&entry.description)
        .bind(entry.occurred_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    #[cfg(test)]
    pub async fn count_timeline_entries(&self, subject_id: i64, subkind: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM timeline_entries WHERE subject_id = ? AND subkind = ?")
            .bind(subject_id)
            .bind(subkind)
            .fetch_one(&self.pool)
            .await
            .map(|row| row.get("n"))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::insert_subject;

    #[tokio::test]
    async fn timeline_entries_append() {
        let store = Store::connect_for_tests().await;
        let subject_id = insert_subject(&store, "Maria", "1", None).await;

        let entry = TimelineEntry {
            subject_id,
            kind: "call".into(),
            subkind: "missed".into(),
            title: "Chamada Não Atendida".into(),
            description: "EVA tentou contato com Maria mas a chamada não foi atendida.".into(),
            occurred_at: Utc::now(),
        };
        store.insert_timeline_entry(&entry).await.unwrap();
        store.insert_timeline_entry(&entry).await.unwrap();

        assert_eq!(store.count_timeline_entries(subject_id, "missed").await, 2);
    }
}
