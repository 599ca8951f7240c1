use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{run_pending, MIGRATOR};
    use crate::{connect_with_settings, DbPool};

    const CONVERSATION_TABLES: &[&str] =
        &["sessions", "messages", "handler_states", "quotations", "policies"];

    async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn table_exists(pool: &DbPool, name: &str) -> bool {
        sqlx::query("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .expect("check table")
            .get::<i64, _>("count")
            == 1
    }

    async fn insert_session(pool: &DbPool, id: &str, control_mode: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (id, participant_kind, control_mode, created_at, updated_at)
             VALUES (?, 'client', ?, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .bind(id)
        .bind(control_mode)
        .execute(pool)
        .await
        .map(|_| ())
    }

    #[tokio::test]
    async fn migrations_create_conversation_tables() {
        let pool = migrated_pool().await;

        for table in CONVERSATION_TABLES {
            assert!(table_exists(&pool, table).await, "table `{table}` should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_reversible_and_reapplicable() {
        let pool = migrated_pool().await;

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        for table in CONVERSATION_TABLES {
            assert!(!table_exists(&pool, table).await, "table `{table}` should be dropped");
        }

        run_pending(&pool).await.expect("re-run migrations");
        for table in CONVERSATION_TABLES {
            assert!(table_exists(&pool, table).await, "table `{table}` should be recreated");
        }
    }

    #[tokio::test]
    async fn control_mode_column_rejects_unknown_modes() {
        let pool = migrated_pool().await;

        insert_session(&pool, "S-ok", "transferred").await.expect("known mode");
        let rejected = insert_session(&pool, "S-bad", "paused").await;

        assert!(rejected.is_err(), "CHECK constraint should reject `paused`");
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_to_its_records() {
        let pool = migrated_pool().await;
        insert_session(&pool, "S-1", "automated").await.expect("session");
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, producing_handler, created_at)
             VALUES ('M-1', 'S-1', 'user', 'hola', 'user', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("message");
        sqlx::query(
            "INSERT INTO handler_states (session_id, handler, state_json, updated_at)
             VALUES ('S-1', 'quotation', '{}', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("handler state");

        sqlx::query("DELETE FROM sessions WHERE id = 'S-1'").execute(&pool).await.expect("delete");

        let (messages,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages").fetch_one(&pool).await.expect("count");
        let (states,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM handler_states")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!((messages, states), (0, 0));
    }
}
