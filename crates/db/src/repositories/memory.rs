use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use autopoliza_core::domain::policy::{Policy, PolicyNumber};
use autopoliza_core::domain::quotation::Quotation;
use autopoliza_core::domain::session::{ControlMode, HandlerKind, Message, Session, SessionId};

use super::{RepositoryError, SessionStore, TurnCommit};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    message_ids: HashSet<String>,
    handler_states: HashMap<String, BTreeMap<String, Value>>,
    quotations: HashMap<String, Vec<Quotation>>,
    policies: HashMap<String, Policy>,
}

impl MemoryState {
    fn require_session(&mut self, id: &SessionId) -> Result<&mut Session, RepositoryError> {
        self.sessions.get_mut(&id.0).ok_or_else(|| RepositoryError::NotFound(format!("session {id}")))
    }

    fn push_message(&mut self, message: Message) {
        self.message_ids.insert(message.id.0.clone());
        self.messages.entry(message.session_id.0.clone()).or_default().push(message);
    }

    fn push_quotation(&mut self, quotation: Quotation) {
        let entries = self.quotations.entry(quotation.session_id.0.clone()).or_default();
        if !entries.iter().any(|existing| existing.id == quotation.id) {
            entries.push(quotation);
        }
    }
}

/// Session store kept in process memory. Used by tests and the `chat` command.
#[derive(Default)]
pub struct InMemorySessionStore {
    state: RwLock<MemoryState>,
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: Session) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.sessions.entry(session.id.0.clone()).or_insert(session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.sessions.get(&id.0).cloned())
    }

    async fn list_sessions(
        &self,
        control_mode: Option<ControlMode>,
    ) -> Result<Vec<Session>, RepositoryError> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|session| control_mode.map(|mode| session.control_mode == mode).unwrap_or(true))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn set_control_mode(
        &self,
        id: &SessionId,
        mode: ControlMode,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let session = state.require_session(id)?;
        session.control_mode = mode;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_current_handler(
        &self,
        id: &SessionId,
        handler: Option<HandlerKind>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let session = state.require_session(id)?;
        session.current_handler = handler;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.require_session(&message.session_id)?;
        if state.message_ids.contains(&message.id.0) {
            return Err(RepositoryError::Decode(format!("duplicate message id {}", message.id.0)));
        }
        state.push_message(message);
        Ok(())
    }

    async fn get_history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let state = self.state.read().await;
        let messages = state.messages.get(&id.0).map(Vec::as_slice).unwrap_or_default();
        let start = limit.map(|limit| messages.len().saturating_sub(limit)).unwrap_or(0);
        Ok(messages[start..].to_vec())
    }

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id.0).map(Vec::len).unwrap_or(0))
    }

    async fn save_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
        blob: Value,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.require_session(id)?;
        state.handler_states.entry(id.0.clone()).or_default().insert(handler.to_string(), blob);
        Ok(())
    }

    async fn get_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.handler_states.get(&id.0).and_then(|blobs| blobs.get(handler)).cloned())
    }

    async fn get_handler_states(
        &self,
        id: &SessionId,
    ) -> Result<Vec<(String, Value)>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .handler_states
            .get(&id.0)
            .map(|blobs| blobs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn save_quotation(&self, quotation: Quotation) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.require_session(&quotation.session_id)?;
        state.push_quotation(quotation);
        Ok(())
    }

    async fn latest_quotation(
        &self,
        id: &SessionId,
    ) -> Result<Option<Quotation>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.quotations.get(&id.0).and_then(|entries| entries.last()).cloned())
    }

    async fn save_policy(&self, policy: Policy) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.require_session(&policy.session_id)?;
        if state.policies.contains_key(&policy.policy_number.0) {
            return Err(RepositoryError::Decode(format!(
                "duplicate policy number {}",
                policy.policy_number.0
            )));
        }
        state.policies.insert(policy.policy_number.0.clone(), policy);
        Ok(())
    }

    async fn find_policy(&self, number: &PolicyNumber) -> Result<Option<Policy>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.policies.get(&number.0).cloned())
    }

    async fn commit_turn(&self, commit: TurnCommit) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;

        {
            let mut seen = HashSet::new();
            for message in &commit.messages {
                if state.message_ids.contains(&message.id.0) || !seen.insert(message.id.0.as_str())
                {
                    return Err(RepositoryError::Decode(format!(
                        "duplicate message id {}",
                        message.id.0
                    )));
                }
            }
        }
        for policy in &commit.policies {
            if state.policies.contains_key(&policy.policy_number.0) {
                return Err(RepositoryError::Decode(format!(
                    "duplicate policy number {}",
                    policy.policy_number.0
                )));
            }
        }

        let TurnCommit { session, messages, handler_states, quotations, policies } = commit;
        let session_key = session.id.0.clone();
        match state.sessions.get_mut(&session_key) {
            Some(existing) => {
                existing.control_mode = session.control_mode;
                existing.current_handler = session.current_handler;
                existing.updated_at = session.updated_at;
            }
            None => {
                state.sessions.insert(session_key.clone(), session);
            }
        }
        for message in messages {
            state.push_message(message);
        }
        let blobs = state.handler_states.entry(session_key).or_default();
        for (handler, blob) in handler_states {
            blobs.insert(handler, blob);
        }
        for quotation in quotations {
            state.push_quotation(quotation);
        }
        for policy in policies {
            state.policies.insert(policy.policy_number.0.clone(), policy);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use autopoliza_core::domain::session::{
        ControlMode, Message, ParticipantKind, Session, SessionId,
    };

    use crate::repositories::{InMemorySessionStore, RepositoryError, SessionStore, TurnCommit};

    fn session(id: &str) -> Session {
        Session::new(SessionId(id.to_string()), ParticipantKind::Client)
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemorySessionStore::default();
        let s = session("S-1");
        store.create_session(s.clone()).await.expect("create");
        store.append_message(Message::user(s.id.clone(), "hola")).await.expect("append");
        store
            .save_handler_state(&s.id, "router", json!({ "flags": {} }))
            .await
            .expect("save state");

        assert_eq!(store.get_session(&s.id).await.expect("get"), Some(s.clone()));
        assert_eq!(store.get_history(&s.id, None).await.expect("history").len(), 1);
        assert_eq!(
            store.get_handler_state(&s.id, "router").await.expect("state"),
            Some(json!({ "flags": {} }))
        );
    }

    #[tokio::test]
    async fn append_requires_existing_session() {
        let store = InMemorySessionStore::default();
        let error = store
            .append_message(Message::user(SessionId("ghost".to_string()), "hola"))
            .await
            .expect_err("unknown session");
        assert!(matches!(error, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn history_limit_keeps_latest_messages() {
        let store = InMemorySessionStore::default();
        let s = session("S-2");
        store.create_session(s.clone()).await.expect("create");
        for content in ["a", "b", "c"] {
            store.append_message(Message::user(s.id.clone(), content)).await.expect("append");
        }

        let latest = store.get_history(&s.id, Some(2)).await.expect("history");
        let contents: Vec<&str> = latest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
        assert_eq!(store.get_history(&s.id, Some(10)).await.expect("history").len(), 3);
    }

    #[tokio::test]
    async fn rejected_commit_changes_nothing() {
        let store = InMemorySessionStore::default();
        let s = session("S-3");
        let message = Message::user(s.id.clone(), "hola");

        let mut commit = TurnCommit::new(s.clone());
        commit.messages.push(message.clone());
        commit.messages.push(message);
        store.commit_turn(commit).await.expect_err("duplicate ids");

        assert!(store.get_session(&s.id).await.expect("get").is_none());
        assert_eq!(store.count_messages(&s.id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn list_sessions_filters_by_control_mode() {
        let store = InMemorySessionStore::default();
        store.create_session(session("S-4")).await.expect("create");
        let mut transferred = session("S-5");
        transferred.control_mode = ControlMode::Transferred;
        store.commit_turn(TurnCommit::new(transferred)).await.expect("commit");

        assert_eq!(store.list_sessions(None).await.expect("all").len(), 2);
        let cases = store.list_sessions(Some(ControlMode::Transferred)).await.expect("cases");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].id.0, "S-5");
    }
}
