// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deduplicating upload manager for providers that accept file references
//! instead of inline data.
//!
//! Identical content+mime pairs upload once; concurrent requests for the
//! same key coalesce behind the in-flight upload and share its outcome.
//! Uploads run on a detached task, so a caller that gives up mid-flight
//! cannot lose a completed upload — the cache still gets it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// A file as known to the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub uri: String,
}

/// Remote file storage operations, implemented per provider.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, content: &[u8], mime: &str) -> anyhow::Result<RemoteFile>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

/// Dedup key: `sha256(content ‖ 0x00 ‖ mime)`, hex-encoded.
///
/// The zero byte separates content from mime so the same bytes under two
/// mime types never collide.
pub fn cache_key(content: &[u8], mime: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update([0u8]);
    hasher.update(mime.as_bytes());
    hex::encode(hasher.finalize())
}

// Errors must be clonable to fan out to every coalesced waiter.
type UploadOutcome = Result<RemoteFile, String>;

struct CachedUpload {
    file: RemoteFile,
    uploaded_at: Instant,
}

#[derive(Default)]
struct State {
    cached: HashMap<String, CachedUpload>,
    inflight: HashMap<String, watch::Receiver<Option<UploadOutcome>>>,
}

#[derive(Clone)]
pub struct FileManager {
    store: Arc<dyn FileStore>,
    ttl: Duration,
    state: Arc<RwLock<State>>,
}

impl FileManager {
    /// Default remote retention before the sweeper reclaims a file.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(store: Arc<dyn FileStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            ttl: ttl.unwrap_or(Self::DEFAULT_TTL),
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Upload `content`, deduplicating by content+mime.  Returns the cached
    /// or freshly uploaded remote file.
    pub async fn upload(&self, content: Vec<u8>, mime: &str) -> anyhow::Result<RemoteFile> {
        let key = cache_key(&content, mime);

        let mut rx = {
            let mut st = self.state.write().await;
            if let Some(hit) = st.cached.get(&key) {
                return Ok(hit.file.clone());
            }
            if let Some(rx) = st.inflight.get(&key) {
                debug!(%key, "joining in-flight upload");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                st.inflight.insert(key.clone(), rx.clone());

                // Detached: the upload outlives the requesting call, so a
                // caller cancelled after completion still leaves the result
                // cached for the next request.
                let mgr = self.clone();
                let mime = mime.to_string();
                let task_key = key.clone();
                tokio::spawn(async move {
                    let outcome = mgr
                        .store
                        .upload(&content, &mime)
                        .await
                        .map_err(|e| e.to_string());
                    let mut st = mgr.state.write().await;
                    if let Ok(file) = &outcome {
                        st.cached.insert(
                            task_key.clone(),
                            CachedUpload { file: file.clone(), uploaded_at: Instant::now() },
                        );
                    }
                    st.inflight.remove(&task_key);
                    // Completion is published while the lock is held, so no
                    // new waiter can register against a dead in-flight entry.
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(|e| anyhow!("upload failed: {e}"));
            }
            rx.changed()
                .await
                .map_err(|_| anyhow!("upload task dropped before completing"))?;
        }
    }

    /// Delete remote files older than the TTL and drop their cache entries.
    /// Returns how many entries were reclaimed.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<(String, String)> = {
            let st = self.state.read().await;
            st.cached
                .iter()
                .filter(|(_, c)| c.uploaded_at.elapsed() >= self.ttl)
                .map(|(k, c)| (k.clone(), c.file.id.clone()))
                .collect()
        };

        let mut reclaimed = 0;
        for (key, id) in expired {
            if let Err(e) = self.store.delete(&id).await {
                warn!(file_id = %id, "sweep: remote delete failed: {e}");
                continue;
            }
            self.state.write().await.cached.remove(&key);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the handle is
    /// dropped or aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let n = mgr.sweep().await;
                if n > 0 {
                    debug!(reclaimed = n, "file sweep");
                }
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
