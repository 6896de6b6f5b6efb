//! Conversation state for sessions entering through a gateway
//!
//! A session is opened by its first turn and kept alive by every later turn
//! or answer. Sessions idle for longer than the configured TTL are forgotten:
//! reads skip them and writes sweep them out.

use crate::config::SessionSection;
use crate::protocol::RoutedTo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A turn is in flight
    Active,
    /// The last turn was answered by the mesh
    Answered,
    /// The last turn went to a human agent
    HandedOff,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Answered => "answered",
            SessionStatus::HandedOff => "handed_off",
        }
    }
}

impl From<RoutedTo> for SessionStatus {
    fn from(routed_to: RoutedTo) -> Self {
        match routed_to {
            RoutedTo::HumanHandoff => SessionStatus::HandedOff,
            RoutedTo::Pipeline | RoutedTo::Fallback => SessionStatus::Answered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Free-form conversation context
    pub context: Value,
    pub message_count: u64,
    pub status: SessionStatus,
}

impl SessionState {
    fn open(session_id: &str, customer_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            customer_id: customer_id.map(str::to_string),
            created_at: now,
            last_activity: now,
            context: Value::Object(Default::default()),
            message_count: 0,
            status: SessionStatus::Active,
        }
    }

    fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // A clock step backwards counts as fresh
        (now - self.last_activity)
            .to_std()
            .map(|idle| idle >= ttl)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Count a customer turn, opening the session on its first turn
    async fn record_turn(
        &self,
        session_id: &str,
        customer_id: Option<&str>,
    ) -> Result<SessionState, SessionError>;

    /// Note the outcome of the latest turn; `None` when the session is gone
    async fn record_answer(
        &self,
        session_id: &str,
        routed_to: RoutedTo,
    ) -> Result<Option<SessionState>, SessionError>;

    /// Merge fields into the session context
    async fn update_context(
        &self,
        session_id: &str,
        updates: Value,
    ) -> Result<Option<SessionState>, SessionError>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, SessionError>;

    async fn delete(&self, session_id: &str) -> Result<bool, SessionError>;

    /// Live sessions of one customer, oldest first
    async fn sessions_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<SessionState>, SessionError>;
}

/// In-process session store
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_config(config: &SessionSection) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs))
    }

    /// Sessions held, expired ones included until the next write
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Apply `change` to a live session, sweeping expired ones first
    async fn modify<F>(&self, session_id: &str, change: F) -> Option<SessionState>
    where
        F: FnOnce(&mut SessionState),
    {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, state| !state.expired(now, self.ttl));
        let state = sessions.get_mut(session_id)?;
        change(state);
        state.last_activity = now;
        Some(state.clone())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record_turn(
        &self,
        session_id: &str,
        customer_id: Option<&str>,
    ) -> Result<SessionState, SessionError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, state| !state.expired(now, self.ttl));

        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "Session opened");
                SessionState::open(session_id, customer_id, now)
            });
        if state.customer_id.is_none() {
            state.customer_id = customer_id.map(str::to_string);
        }
        state.message_count += 1;
        state.status = SessionStatus::Active;
        state.last_activity = now;
        Ok(state.clone())
    }

    async fn record_answer(
        &self,
        session_id: &str,
        routed_to: RoutedTo,
    ) -> Result<Option<SessionState>, SessionError> {
        Ok(self
            .modify(session_id, |state| state.status = routed_to.into())
            .await)
    }

    async fn update_context(
        &self,
        session_id: &str,
        updates: Value,
    ) -> Result<Option<SessionState>, SessionError> {
        Ok(self
            .modify(session_id, |state| match (&mut state.context, updates) {
                (Value::Object(existing), Value::Object(updates)) => existing.extend(updates),
                (context, updates) => *context = updates,
            })
            .await)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, SessionError> {
        let now = Utc::now();
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .filter(|state| !state.expired(now, self.ttl))
            .cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn sessions_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<SessionState>, SessionError> {
        let now = Utc::now();
        let mut found: Vec<SessionState> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|state| state.customer_id.as_deref() == Some(customer_id))
            .filter(|state| !state.expired(now, self.ttl))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (a.created_at, &a.session_id).cmp(&(b.created_at, &b.session_id))
        });
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_first_turn_opens_session() {
        let store = store();
        let state = store.record_turn("s-1", Some("c-1")).await.unwrap();

        assert_eq!(state.session_id, "s-1");
        assert_eq!(state.customer_id.as_deref(), Some("c-1"));
        assert_eq!(state.message_count, 1);
        assert_eq!(state.status, SessionStatus::Active);
        assert_eq!(store.get("s-1").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_later_turns_count_and_keep_customer() {
        let store = store();
        let first = store.record_turn("s-1", Some("c-1")).await.unwrap();
        let second = store.record_turn("s-1", None).await.unwrap();

        assert_eq!(second.message_count, 2);
        assert_eq!(second.customer_id.as_deref(), Some("c-1"));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_activity >= first.last_activity);
    }

    #[tokio::test]
    async fn test_answer_sets_status() {
        let store = store();
        store.record_turn("s-1", None).await.unwrap();

        let state = store
            .record_answer("s-1", RoutedTo::HumanHandoff)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SessionStatus::HandedOff);

        // A new turn makes it active again
        let state = store.record_turn("s-1", None).await.unwrap();
        assert_eq!(state.status, SessionStatus::Active);

        assert!(store
            .record_answer("unknown", RoutedTo::Pipeline)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_context_updates_merge() {
        let store = store();
        store.record_turn("s-1", None).await.unwrap();
        store
            .update_context("s-1", json!({"order": "123"}))
            .await
            .unwrap();
        let state = store
            .update_context("s-1", json!({"channel": "chat"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.context, json!({"order": "123", "channel": "chat"}));
    }

    #[tokio::test]
    async fn test_idle_sessions_expire_and_are_swept() {
        let store = MemorySessionStore::new(Duration::from_millis(10));
        store.record_turn("old-1", Some("c-1")).await.unwrap();
        store.record_turn("old-2", Some("c-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get("old-1").await.unwrap(), None);
        assert!(store.sessions_for_customer("c-1").await.unwrap().is_empty());

        store.record_turn("new", None).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_for_customer_and_delete() {
        let store = store();
        store.record_turn("s-1", Some("c-1")).await.unwrap();
        store.record_turn("s-2", Some("c-2")).await.unwrap();
        store.record_turn("s-3", Some("c-1")).await.unwrap();

        let ids: Vec<String> = store
            .sessions_for_customer("c-1")
            .await
            .unwrap()
            .into_iter()
            .map(|state| state.session_id)
            .collect();
        assert_eq!(ids, vec!["s-1", "s-3"]);

        assert!(store.delete("s-1").await.unwrap());
        assert!(!store.delete("s-1").await.unwrap());
        assert_eq!(store.sessions_for_customer("c-1").await.unwrap().len(), 1);
    }
}
