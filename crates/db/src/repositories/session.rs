use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};

use autopoliza_core::domain::policy::{Policy, PolicyNumber, Policyholder};
use autopoliza_core::domain::quotation::{PlanOffer, Quotation, QuotationId};
use autopoliza_core::domain::session::{
    ControlMode, HandlerKind, Message, MessageId, MessageRole, ParticipantKind, Session, SessionId,
};
use autopoliza_core::domain::vehicle::VehicleDetails;

use super::{RepositoryError, SessionStore, TurnCommit};
use crate::DbPool;

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn decode<T: FromStr>(column: &str, raw: &str) -> Result<T, RepositoryError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn encode_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn get<'r, T>(row: &'r sqlx::sqlite::SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session, RepositoryError> {
    let id: String = get(row, "id")?;
    let participant_kind: String = get(row, "participant_kind")?;
    let control_mode: String = get(row, "control_mode")?;
    let current_handler: Option<String> = get(row, "current_handler")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;

    Ok(Session {
        id: SessionId(id),
        participant_kind: decode::<ParticipantKind>("participant_kind", &participant_kind)?,
        control_mode: decode::<ControlMode>("control_mode", &control_mode)?,
        current_handler: current_handler
            .as_deref()
            .map(|raw| decode::<HandlerKind>("current_handler", raw))
            .transpose()?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, RepositoryError> {
    let id: String = get(row, "id")?;
    let session_id: String = get(row, "session_id")?;
    let role: String = get(row, "role")?;
    let content: String = get(row, "content")?;
    let producing_handler: String = get(row, "producing_handler")?;
    let metadata_json: String = get(row, "metadata_json")?;
    let created_at: String = get(row, "created_at")?;

    Ok(Message {
        id: MessageId(id),
        session_id: SessionId(session_id),
        role: decode::<MessageRole>("role", &role)?,
        content,
        producing_handler,
        timestamp: parse_timestamp("created_at", &created_at)?,
        metadata: decode_json::<BTreeMap<String, Value>>("metadata_json", &metadata_json)?,
    })
}

fn row_to_quotation(row: &sqlx::sqlite::SqliteRow) -> Result<Quotation, RepositoryError> {
    let id: String = get(row, "id")?;
    let session_id: String = get(row, "session_id")?;
    let vehicle_json: String = get(row, "vehicle_json")?;
    let plans_json: String = get(row, "plans_json")?;
    let estimated: i64 = get(row, "estimated")?;
    let generated_at: String = get(row, "generated_at")?;

    Ok(Quotation {
        id: QuotationId(id),
        session_id: SessionId(session_id),
        vehicle: decode_json::<VehicleDetails>("vehicle_json", &vehicle_json)?,
        plans: decode_json::<Vec<PlanOffer>>("plans_json", &plans_json)?,
        estimated: estimated != 0,
        generated_at: parse_timestamp("generated_at", &generated_at)?,
    })
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<Policy, RepositoryError> {
    let policy_number: String = get(row, "policy_number")?;
    let session_id: String = get(row, "session_id")?;
    let quotation_id: String = get(row, "quotation_id")?;
    let client_json: String = get(row, "client_json")?;
    let plan_name: String = get(row, "plan_name")?;
    let annual_premium: String = get(row, "annual_premium")?;
    let monthly_premium: String = get(row, "monthly_premium")?;
    let issued_at: String = get(row, "issued_at")?;

    Ok(Policy {
        policy_number: PolicyNumber(policy_number),
        session_id: SessionId(session_id),
        client: decode_json::<Policyholder>("client_json", &client_json)?,
        quotation_ref: QuotationId(quotation_id),
        plan_name,
        annual_premium: decode::<Decimal>("annual_premium", &annual_premium)?,
        monthly_premium: decode::<Decimal>("monthly_premium", &monthly_premium)?,
        issued_at: parse_timestamp("issued_at", &issued_at)?,
    })
}

async fn upsert_session(conn: &mut SqliteConnection, session: &Session) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO sessions (id, participant_kind, control_mode, current_handler, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             control_mode = excluded.control_mode,
             current_handler = excluded.current_handler,
             updated_at = excluded.updated_at",
    )
    .bind(&session.id.0)
    .bind(session.participant_kind.as_str())
    .bind(session.control_mode.as_str())
    .bind(session.current_handler.map(HandlerKind::as_str))
    .bind(timestamp(&session.created_at))
    .bind(timestamp(&session.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_message(conn: &mut SqliteConnection, message: &Message) -> Result<(), RepositoryError> {
    let metadata_json = encode_json("metadata_json", &message.metadata)?;
    sqlx::query(
        "INSERT INTO messages (id, session_id, role, content, producing_handler, metadata_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id.0)
    .bind(&message.session_id.0)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(&message.producing_handler)
    .bind(metadata_json)
    .bind(timestamp(&message.timestamp))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_handler_state(
    conn: &mut SqliteConnection,
    id: &SessionId,
    handler: &str,
    blob: &Value,
) -> Result<(), RepositoryError> {
    let state_json = encode_json("state_json", blob)?;
    sqlx::query(
        "INSERT INTO handler_states (session_id, handler, state_json, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(session_id, handler) DO UPDATE SET
             state_json = excluded.state_json,
             updated_at = excluded.updated_at",
    )
    .bind(&id.0)
    .bind(handler)
    .bind(state_json)
    .bind(timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_quotation(
    conn: &mut SqliteConnection,
    quotation: &Quotation,
) -> Result<(), RepositoryError> {
    let vehicle_json = encode_json("vehicle_json", &quotation.vehicle)?;
    let plans_json = encode_json("plans_json", &quotation.plans)?;
    sqlx::query(
        "INSERT INTO quotations (id, session_id, vehicle_json, plans_json, estimated, generated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&quotation.id.0)
    .bind(&quotation.session_id.0)
    .bind(vehicle_json)
    .bind(plans_json)
    .bind(i64::from(quotation.estimated))
    .bind(timestamp(&quotation.generated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_policy(conn: &mut SqliteConnection, policy: &Policy) -> Result<(), RepositoryError> {
    let client_json = encode_json("client_json", &policy.client)?;
    sqlx::query(
        "INSERT INTO policies (policy_number, session_id, quotation_id, client_json, plan_name,
                               annual_premium, monthly_premium, issued_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&policy.policy_number.0)
    .bind(&policy.session_id.0)
    .bind(&policy.quotation_ref.0)
    .bind(client_json)
    .bind(&policy.plan_name)
    .bind(policy.annual_premium.to_string())
    .bind(policy.monthly_premium.to_string())
    .bind(timestamp(&policy.issued_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn create_session(&self, session: Session) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO sessions (id, participant_kind, control_mode, current_handler, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&session.id.0)
        .bind(session.participant_kind.as_str())
        .bind(session.control_mode.as_str())
        .bind(session.current_handler.map(HandlerKind::as_str))
        .bind(timestamp(&session.created_at))
        .bind(timestamp(&session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, participant_kind, control_mode, current_handler, created_at, updated_at
             FROM sessions WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_sessions(
        &self,
        control_mode: Option<ControlMode>,
    ) -> Result<Vec<Session>, RepositoryError> {
        let rows = match control_mode {
            Some(mode) => {
                sqlx::query(
                    "SELECT id, participant_kind, control_mode, current_handler, created_at, updated_at
                     FROM sessions
                     WHERE control_mode = ?
                     ORDER BY updated_at DESC",
                )
                .bind(mode.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, participant_kind, control_mode, current_handler, created_at, updated_at
                     FROM sessions
                     ORDER BY updated_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_session).collect::<Result<Vec<_>, _>>()
    }

    async fn set_control_mode(
        &self,
        id: &SessionId,
        mode: ControlMode,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE sessions SET control_mode = ?, updated_at = ? WHERE id = ?")
            .bind(mode.as_str())
            .bind(timestamp(&Utc::now()))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn set_current_handler(
        &self,
        id: &SessionId,
        handler: Option<HandlerKind>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE sessions SET current_handler = ?, updated_at = ? WHERE id = ?")
                .bind(handler.map(HandlerKind::as_str))
                .bind(timestamp(&Utc::now()))
                .bind(&id.0)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_message(&mut conn, &message).await
    }

    async fn get_history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, RepositoryError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, producing_handler, metadata_json, created_at
             FROM (
                 SELECT seq, id, session_id, role, content, producing_handler, metadata_json, created_at
                 FROM messages
                 WHERE session_id = ?
                 ORDER BY seq DESC
                 LIMIT ?
             )
             ORDER BY seq ASC",
        )
        .bind(&id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()
    }

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages WHERE session_id = ?")
            .bind(&id.0)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = get(&row, "count")?;
        Ok(count.max(0) as usize)
    }

    async fn save_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
        blob: Value,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        upsert_handler_state(&mut conn, id, handler, &blob).await
    }

    async fn get_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query(
            "SELECT state_json FROM handler_states WHERE session_id = ? AND handler = ?",
        )
        .bind(&id.0)
        .bind(handler)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => {
                let raw: String = get(r, "state_json")?;
                Ok(Some(decode_json::<Value>("state_json", &raw)?))
            }
            None => Ok(None),
        }
    }

    async fn get_handler_states(
        &self,
        id: &SessionId,
    ) -> Result<Vec<(String, Value)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT handler, state_json FROM handler_states WHERE session_id = ? ORDER BY handler",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let handler: String = get(row, "handler")?;
                let raw: String = get(row, "state_json")?;
                Ok((handler, decode_json::<Value>("state_json", &raw)?))
            })
            .collect::<Result<Vec<_>, RepositoryError>>()
    }

    async fn save_quotation(&self, quotation: Quotation) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_quotation(&mut conn, &quotation).await
    }

    async fn latest_quotation(
        &self,
        id: &SessionId,
    ) -> Result<Option<Quotation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, session_id, vehicle_json, plans_json, estimated, generated_at
             FROM quotations
             WHERE session_id = ?
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_quotation).transpose()
    }

    async fn save_policy(&self, policy: Policy) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_policy(&mut conn, &policy).await
    }

    async fn find_policy(&self, number: &PolicyNumber) -> Result<Option<Policy>, RepositoryError> {
        let row = sqlx::query(
            "SELECT policy_number, session_id, quotation_id, client_json, plan_name,
                    annual_premium, monthly_premium, issued_at
             FROM policies WHERE policy_number = ?",
        )
        .bind(&number.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_policy).transpose()
    }

    async fn commit_turn(&self, commit: TurnCommit) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        upsert_session(&mut tx, &commit.session).await?;
        for message in &commit.messages {
            insert_message(&mut tx, message).await?;
        }
        for (handler, blob) in &commit.handler_states {
            upsert_handler_state(&mut tx, &commit.session.id, handler, blob).await?;
        }
        for quotation in &commit.quotations {
            insert_quotation(&mut tx, quotation).await?;
        }
        for policy in &commit.policies {
            insert_policy(&mut tx, policy).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
