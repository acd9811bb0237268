use chrono::{NaiveDate, Utc};
use sqlx::Row;

use super::Store;
use crate::types::{normalize_auth_key, Caregiver, Subject};

fn subject_from_row(row: &sqlx::sqlite::SqliteRow) -> Subject {
    let birth_date: Option<String> = row.get("birth_date");
    Subject {
        id: row.get("id"),
        name: row.get("name"),
        cpf: row.get("cpf"),
        birth_date: birth_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        device_token: row.get("device_token"),
        device_token_valid: row.get::<i64, _>("device_token_valid") != 0,
        active: row.get::<i64, _>("active") != 0,
        cognitive_level: row.get("cognitive_level"),
        hearing_impaired: row.get::<i64, _>("hearing_impaired") != 0,
        uses_hearing_aid: row.get::<i64, _>("uses_hearing_aid") != 0,
        voice_tone: row.get("voice_tone"),
    }
}

impl Store {
    /// Resolve a subject by its auth key (national id). Both sides are
    /// digit-normalized, so `123.456.789-00` and `12345678900` match the
    /// same row. Only active subjects authenticate.
    pub async fn find_subject_by_auth_key(&self, key: &str) -> anyhow::Result<Option<Subject>> {
        let wanted = normalize_auth_key(key);
        if wanted.is_empty() {
            return Ok(None);
        }

        // The store engine has no digit-extraction builtin, so normalization
        // happens here over the (small) active set.
        let rows = sqlx::query("SELECT * FROM subjects WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            let cpf: String = row.get("cpf");
            if normalize_auth_key(&cpf) == wanted {
                return Ok(Some(subject_from_row(row)));
            }
        }
        Ok(None)
    }

    pub async fn get_subject(&self, id: i64) -> anyhow::Result<Option<Subject>> {
        let row = sqlx::query("SELECT * FROM subjects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(subject_from_row))
    }

    /// Flag the subject's device token as invalid so the scheduler stops
    /// pushing against it until the device re-registers.
    pub async fn mark_subject_token_invalid(&self, subject_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE subjects
             SET device_token_valid = 0, device_token_updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active caregivers ordered by priority (1 = primary first).
    pub async fn list_active_caregivers(&self, subject_id: i64) -> anyhow::Result<Vec<Caregiver>> {
        let rows = sqlx::query(
            "SELECT id, subject_id, name, device_token, phone, email, priority, active
             FROM caregivers
             WHERE subject_id = ? AND active = 1
             ORDER BY priority ASC",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Caregiver {
                id: row.get("id"),
                subject_id: row.get("subject_id"),
                name: row.get("name"),
                device_token: row.get("device_token"),
                phone: row.get("phone"),
                email: row.get("email"),
                priority: row.get("priority"),
                active: row.get::<i64, _>("active") != 0,
            })
            .collect())
    }

    pub async fn primary_caregiver(&self, subject_id: i64) -> anyhow::Result<Option<Caregiver>> {
        Ok(self
            .list_active_caregivers(subject_id)
            .await?
            .into_iter()
            .next())
    }

    /// Newest active template row for a name, highest version wins.
    pub async fn load_prompt_template(&self, name: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(
            "SELECT template FROM prompt_templates
             WHERE name = ? AND active = 1
             ORDER BY version DESC
             LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("template")))
    }
}

#[cfg(test)]
mod tests {
    use crate::store::test_fixtures::{insert_caregiver, insert_subject};
    use crate::store::Store;

    #[tokio::test]
    async fn auth_key_matches_across_formats() {
        let store = Store::connect_for_tests().await;
        insert_subject(&store, "Maria", "123.456.789-00", None).await;

        let found = store
            .find_subject_by_auth_key("12345678900")
            .await
            .unwrap()
            .expect("normalized key should match");
        assert_eq!(found.name, "Maria");

        let found = store
            .find_subject_by_auth_key("123 456 789 00")
            .await
            .unwrap();
        assert!(found.is_some());

        assert!(store
            .find_subject_by_auth_key("00000000000")
            .await
            .unwrap()
            .is_none());
        assert!(store.find_subject_by_auth_key("").await.unwrap().is_none());
        assert!(store
            .find_subject_by_auth_key("---")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inactive_subjects_do_not_authenticate() {
        let store = Store::connect_for_tests().await;
        let id = insert_subject(&store, "Inativo", "99988877766", None).await;
        sqlx::query("UPDATE subjects SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store
            .find_subject_by_auth_key("99988877766")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn caregivers_ordered_by_priority_and_filtered_by_active() {
        let store = Store::connect_for_tests().await;
        let subject_id = insert_subject(&store, "Maria", "1", None).await;
        insert_caregiver(&store, subject_id, "Secundário", 2, Some("t2")).await;
        insert_caregiver(&store, subject_id, "Primário", 1, Some("t1")).await;
        let inactive = insert_caregiver(&store, subject_id, "Antigo", 3, None).await;
        sqlx::query("UPDATE caregivers SET active = 0 WHERE id = ?")
            .bind(inactive)
            .execute(store.pool())
            .await
            .unwrap();

        let caregivers = store.list_active_caregivers(subject_id).await.unwrap();
        assert_eq!(caregivers.len(), 2);
        assert_eq!(caregivers[0].name, "Primário");
        assert_eq!(caregivers[1].name, "Secundário");

        let primary = store.primary_caregiver(subject_id).await.unwrap().unwrap();
        assert_eq!(primary.priority, 1);
    }

    #[tokio::test]
    async fn token_invalidation_persists() {
        let store = Store::connect_for_tests().await;
        let id = insert_subject(&store, "Maria", "1", Some("tok")).await;
        store.mark_subject_token_invalid(id).await.unwrap();
        let subject = store.get_subject(id).await.unwrap().unwrap();
        assert!(!subject.device_token_valid);
    }

    #[tokio::test]
    async fn prompt_template_highest_active_version_wins() {
        let store = Store::connect_for_tests().await;
        for (version, body, active) in [(1, "v1", 1), (2, "v2", 1), (3, "v3", 0)] {
            sqlx::query(
                "INSERT INTO prompt_templates (name, version, template, active)
                 VALUES ('eva_base', ?, ?, ?)",
            )
            .bind(version)
            .bind(body)
            .bind(active)
            .execute(store.pool())
            .await
            .unwrap();
        }

        let template = store.load_prompt_template("eva_base").await.unwrap();
        assert_eq!(template.as_deref(), Some("v2"));
        assert!(store.load_prompt_template("missing").await.unwrap().is_none());
    }
}
