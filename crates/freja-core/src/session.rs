// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use freja_model::{Message, Role};

/// In-memory conversation session.  Append is the only mutator; compaction
/// is an explicit operation that substitutes a prefix with a synthetic
/// summary while preserving the order of everything it keeps.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub working_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            working_dir,
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        if self.title.is_empty() && msg.role == Role::User && !msg.content.is_empty() {
            self.title = derive_title(&msg.content);
        }
        self.messages.push(msg);
    }

    /// Replace everything except the most recent `keep_recent` messages with
    /// one synthetic summary message.  The split never lands inside a tool
    /// group: orphaned tool results would make the next request undispatchable.
    pub fn compact(&mut self, summary: impl Into<String>, keep_recent: usize) {
        if self.messages.len() <= keep_recent {
            return;
        }
        let mut split = self.messages.len() - keep_recent;
        while split > 0 && self.messages[split].role == Role::Tool {
            split -= 1;
        }
        // Step past the assistant message that owns the tool group boundary.
        while split > 0 && !self.messages[split - 1].tool_calls.is_empty() {
            split -= 1;
        }
        if split == 0 {
            return;
        }
        let tail = self.messages.split_off(split);
        self.messages.clear();
        self.messages.push(Message::assistant(format!(
            "Summary of the conversation so far:\n{}",
            summary.into()
        )));
        self.messages.extend(tail);
    }

    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }
}

/// First line of the first user message, clipped to a displayable length.
fn derive_title(content: &str) -> String {
    const MAX: usize = 64;
    let line = content.lines().next().unwrap_or("").trim();
    if line.chars().count() <= MAX {
        return line.to_string();
    }
    let clipped: String = line.chars().take(MAX).collect();
    format!("{}…", clipped.trim_end())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
