//! # Continuous Worker State
//!
//! Conversation history and memory kept by the persistent runner for each
//! long-lived worker, checkpointed through the
//! [`StateStore`](crate::state::StateStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::events::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
}

impl fmt::Display for HistoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

/// Per-worker state; the history is append-only apart from retention trims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousState {
    pub worker_id: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub memory: Payload,
    pub last_event_time: DateTime<Utc>,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl ContinuousState {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            conversation_history: Vec::new(),
            memory: Payload::new(),
            last_event_time: Utc::now(),
            event_count: 0,
            last_saved_at: None,
        }
    }

    pub fn append_user(&mut self, content: impl Into<String>, event_data: Option<Value>) {
        self.conversation_history.push(HistoryEntry {
            role: HistoryRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            event_data,
        });
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.conversation_history.push(HistoryEntry {
            role: HistoryRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            event_data: None,
        });
    }

    /// The last `count` history entries, oldest first
    pub fn recent_history(&self, count: usize) -> &[HistoryEntry] {
        let start = self.conversation_history.len().saturating_sub(count);
        &self.conversation_history[start..]
    }

    /// Keep only the last `keep` entries; returns how many were dropped
    pub fn trim_history(&mut self, keep: usize) -> usize {
        let excess = self.conversation_history.len().saturating_sub(keep);
        if excess > 0 {
            self.conversation_history.drain(..excess);
        }
        excess
    }

    pub fn merge_memory(&mut self, updates: Payload) {
        self.memory.extend(updates);
    }

    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "continuous state serialized to non-object: {other}"
            ))),
        }
    }

    pub fn from_payload(payload: Payload) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload))
    }
}
