// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Filesystem tools scoped to the session working directory, routed through
//! the client's filesystem RPC instead of local I/O.  Every path is resolved
//! lexically against the working directory and rejected unless it stays at
//! or under it.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use freja_tools::{Tool, ToolAnnotations, ToolCall, ToolDef, ToolHandler, ToolOutput, ToolSet};

/// Whether path containment compares case-insensitively.  A runtime choice:
/// the filesystem a session works on is not necessarily the one this binary
/// was compiled for (containers mount foreign volumes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    /// The conventional default for the host platform.
    pub fn platform_default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            Self::Insensitive
        } else {
            Self::Sensitive
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path escapes the session directory: {0}")]
    Traversal(String),
    #[error("path is outside the session directory: {0}")]
    Outside(String),
    #[error("session directory must be absolute: {0}")]
    RelativeRoot(String),
}

/// Resolve `path` against `cwd` and verify the result is `cwd` itself or a
/// proper descendant.  Resolution is lexical; the files live behind the
/// client RPC, so nothing here may touch the local filesystem.
pub fn resolve_within(
    cwd: &Path,
    path: &str,
    case: CaseSensitivity,
) -> Result<PathBuf, PathError> {
    if !cwd.is_absolute() {
        return Err(PathError::RelativeRoot(cwd.display().to_string()));
    }
    let joined = {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            cwd.join(p)
        }
    };

    let normalized = normalize(&joined).ok_or_else(|| PathError::Traversal(path.to_string()))?;
    let root = normalize(cwd).ok_or_else(|| PathError::RelativeRoot(cwd.display().to_string()))?;

    if !is_prefix(&root, &normalized, case) {
        return Err(PathError::Outside(path.to_string()));
    }
    Ok(normalized)
}

/// Lexical normalization: resolve `.` and `..` without touching the disk.
/// Returns `None` when `..` would climb past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ => return None,
            },
            other => parts.push(other),
        }
    }
    Some(parts.iter().collect())
}

fn is_prefix(root: &Path, candidate: &Path, case: CaseSensitivity) -> bool {
    let root_parts: Vec<String> = fold_components(root, case);
    let cand_parts: Vec<String> = fold_components(candidate, case);
    cand_parts.len() >= root_parts.len() && cand_parts[..root_parts.len()] == root_parts[..]
}

fn fold_components(path: &Path, case: CaseSensitivity) -> Vec<String> {
    path.components()
        .map(|c| {
            let s = c.as_os_str().to_string_lossy();
            match case {
                CaseSensitivity::Sensitive => s.into_owned(),
                CaseSensitivity::Insensitive => s.to_lowercase(),
            }
        })
        .collect()
}

/// Client-side filesystem operations, implemented by the protocol bridge.
#[async_trait]
pub trait ClientFs: Send + Sync {
    async fn read_text_file(&self, session_id: &str, path: &Path) -> anyhow::Result<String>;
    async fn write_text_file(
        &self,
        session_id: &str,
        path: &Path,
        content: &str,
    ) -> anyhow::Result<()>;
}

/// The scoped filesystem toolset: read_file / write_file / edit_file over
/// the client RPC.
pub struct AcpFsToolSet {
    session_id: String,
    cwd: PathBuf,
    case: CaseSensitivity,
    fs: Arc<dyn ClientFs>,
}

impl AcpFsToolSet {
    pub fn new(
        session_id: impl Into<String>,
        cwd: PathBuf,
        case: CaseSensitivity,
        fs: Arc<dyn ClientFs>,
    ) -> Self {
        Self { session_id: session_id.into(), cwd, case, fs }
    }

    fn ctx(&self) -> FsCtx {
        FsCtx {
            session_id: self.session_id.clone(),
            cwd: self.cwd.clone(),
            case: self.case,
            fs: self.fs.clone(),
        }
    }
}

#[derive(Clone)]
struct FsCtx {
    session_id: String,
    cwd: PathBuf,
    case: CaseSensitivity,
    fs: Arc<dyn ClientFs>,
}

impl FsCtx {
    fn resolve(&self, call: &ToolCall) -> Result<PathBuf, ToolOutput> {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Err(ToolOutput::err(&call.id, "missing 'path'")),
        };
        resolve_within(&self.cwd, path, self.case)
            .map_err(|e| ToolOutput::err(&call.id, e.to_string()))
    }
}

#[async_trait]
impl ToolSet for AcpFsToolSet {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(vec![
            Tool::new(
                ToolDef::new(
                    "read_file",
                    "Read a text file from the session directory.",
                    json!({
                        "type": "object",
                        "properties": {
                            "path": { "type": "string", "description": "File path, relative to the session directory" }
                        },
                        "required": ["path"]
                    }),
                )
                .with_annotations(ToolAnnotations::read_only()),
                Arc::new(ReadFileHandler { ctx: self.ctx() }),
            ),
            Tool::new(
                ToolDef::new(
                    "write_file",
                    "Create or overwrite a text file in the session directory.",
                    json!({
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["path", "content"]
                    }),
                ),
                Arc::new(WriteFileHandler { ctx: self.ctx() }),
            ),
            Tool::new(
                ToolDef::new(
                    "edit_file",
                    "Apply text replacements to a file in the session directory. \
                     Each edit replaces the first occurrence of oldText with newText; \
                     oldText must match the file exactly.",
                    json!({
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "edits": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "oldText": { "type": "string" },
                                        "newText": { "type": "string" }
                                    },
                                    "required": ["oldText", "newText"]
                                }
                            }
                        },
                        "required": ["path", "edits"]
                    }),
                ),
                Arc::new(EditFileHandler { ctx: self.ctx() }),
            ),
        ])
    }
}

struct ReadFileHandler {
    ctx: FsCtx,
}

#[async_trait]
impl ToolHandler for ReadFileHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let path = match self.ctx.resolve(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        match self.ctx.fs.read_text_file(&self.ctx.session_id, &path).await {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("read failed: {e:#}")),
        }
    }
}

struct WriteFileHandler {
    ctx: FsCtx,
}

#[async_trait]
impl ToolHandler for WriteFileHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let path = match self.ctx.resolve(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolOutput::err(&call.id, "missing 'content'"),
        };
        match self
            .ctx
            .fs
            .write_text_file(&self.ctx.session_id, &path, content)
            .await
        {
            Ok(()) => ToolOutput::ok(&call.id, format!("wrote {}", path.display())),
            Err(e) => ToolOutput::err(&call.id, format!("write failed: {e:#}")),
        }
    }
}

struct EditFileHandler {
    ctx: FsCtx,
}

#[async_trait]
impl ToolHandler for EditFileHandler {
    async fn call(&self, call: &ToolCall) -> ToolOutput {
        let path = match self.ctx.resolve(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        let edits = match call.args.get("edits").and_then(|v| v.as_array()) {
            Some(e) if !e.is_empty() => e.clone(),
            _ => return ToolOutput::err(&call.id, "missing 'edits'"),
        };

        let mut content = match self.ctx.fs.read_text_file(&self.ctx.session_id, &path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read failed: {e:#}")),
        };

        for (i, edit) in edits.iter().enumerate() {
            let old = edit.get("oldText").and_then(|v| v.as_str()).unwrap_or("");
            let new = edit.get("newText").and_then(|v| v.as_str()).unwrap_or("");
            if old.is_empty() {
                return ToolOutput::err(&call.id, format!("edit {}: empty oldText", i + 1));
            }
            match content.find(old) {
                Some(pos) => content.replace_range(pos..pos + old.len(), new),
                None => {
                    return ToolOutput::err(
                        &call.id,
                        format!("edit {}: oldText not found in {}", i + 1, path.display()),
                    );
                }
            }
        }

        match self
            .ctx
            .fs
            .write_text_file(&self.ctx.session_id, &path, &content)
            .await
        {
            Ok(()) => ToolOutput::ok(&call.id, format!("applied {} edits", edits.len())),
            Err(e) => ToolOutput::err(&call.id, format!("write failed: {e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
