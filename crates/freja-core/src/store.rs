// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::session::Session;

/// What a persisted session looks like; the storage backend is pluggable
/// and the runtime never assumes more than this record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub working_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<freja_model::Message>,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            title: session.title.clone(),
            working_dir: session.working_dir.clone(),
            created_at: session.created_at,
            messages: session.messages.clone(),
        }
    }
}

/// CRUD over session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, record: SessionRecord) -> anyhow::Result<()>;
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<SessionRecord>>;
    async fn delete(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Default store: keeps records for the lifetime of the process.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, record: SessionRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.records.lock().await.get(session_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let mut all: Vec<SessionRecord> = self.records.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        self.records.lock().await.remove(session_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use freja_model::Message;

    use super::*;

    #[tokio::test]
    async fn save_load_round_trip() {
        let store = InMemorySessionStore::default();
        let mut session = Session::new(Some("/work".into()));
        session.push(Message::user("hello"));

        store.save(SessionRecord::from_session(&session)).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap().expect("record");
        assert_eq!(loaded.title, "hello");
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.working_dir.as_deref(), Some(std::path::Path::new("/work")));
    }

    #[tokio::test]
    async fn load_unknown_is_none() {
        let store = InMemorySessionStore::default();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemorySessionStore::default();
        let session = Session::new(None);
        store.save(SessionRecord::from_session(&session)).await.unwrap();
        store.delete(&session.id).await.unwrap();
        assert!(store.load(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_creation_time() {
        let store = InMemorySessionStore::default();
        let a = Session::new(None);
        let b = Session::new(None);
        store.save(SessionRecord::from_session(&b)).await.unwrap();
        store.save(SessionRecord::from_session(&a)).await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].created_at <= all[1].created_at);
    }
}
