// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Presentation metadata for tool calls: a coarse kind for icons, file
//! locations for editor highlighting, and a diff payload for the two
//! writing tools clients render specially.

use serde::Serialize;
use serde_json::Value;

use freja_tools::ToolAnnotations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Delete,
    Search,
    Think,
    Fetch,
    Execute,
    SwitchMode,
    Other,
}

/// Classify a tool for display.  Explicit annotations win; otherwise the
/// name prefix decides.
pub fn infer_tool_kind(name: &str, annotations: &ToolAnnotations) -> ToolKind {
    if annotations.destructive_hint == Some(true) {
        return ToolKind::Delete;
    }
    if annotations.read_only_hint == Some(true) {
        return ToolKind::Read;
    }
    kind_from_name(name)
}

fn kind_from_name(name: &str) -> ToolKind {
    // Exact matches first.
    match name {
        "think" => return ToolKind::Think,
        "directory_tree" => return ToolKind::Read,
        "fetch" => return ToolKind::Fetch,
        "shell" => return ToolKind::Execute,
        "transfer_task" | "handoff" => return ToolKind::SwitchMode,
        _ => {}
    }
    for (prefix, kind) in [
        ("read_", ToolKind::Read),
        ("get_", ToolKind::Read),
        ("list_", ToolKind::Read),
        ("edit_", ToolKind::Edit),
        ("write_", ToolKind::Edit),
        ("update_", ToolKind::Edit),
        ("create_", ToolKind::Edit),
        ("add_", ToolKind::Edit),
        ("delete_", ToolKind::Delete),
        ("remove_", ToolKind::Delete),
        ("stop_", ToolKind::Delete),
        ("search_", ToolKind::Search),
        ("find_", ToolKind::Search),
        ("http_", ToolKind::Fetch),
        ("run_", ToolKind::Execute),
        ("exec_", ToolKind::Execute),
    ] {
        if name.starts_with(prefix) {
            return kind;
        }
    }
    ToolKind::Other
}

/// A file the tool call touches, for editor highlighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolLocation {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Pull file locations out of tool arguments: the first of the usual path
/// keys, every entry of a `paths` array, and an optional `line` number.
pub fn extract_locations(args: &Value) -> Vec<ToolLocation> {
    let mut locations = Vec::new();
    let line = args.get("line").and_then(|v| v.as_u64());

    for key in ["path", "file", "filepath", "filename", "file_path"] {
        if let Some(path) = args.get(key).and_then(|v| v.as_str()) {
            locations.push(ToolLocation { path: path.to_string(), line });
            break;
        }
    }

    if let Some(paths) = args.get("paths").and_then(|v| v.as_array()) {
        for p in paths {
            if let Some(path) = p.as_str() {
                locations.push(ToolLocation { path: path.to_string(), line: None });
            }
        }
    }

    locations
}

/// Diff rendered for the writing tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffPayload {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_text: Option<String>,
    pub new_text: String,
}

/// Synthesize a diff payload for `edit_file` / `write_file` calls.
/// `edit_file` concatenates the old/new sides of every edit in order;
/// `write_file` shows the whole content as new.
pub fn render_diff(name: &str, args: &Value) -> Option<DiffPayload> {
    let path = args.get("path").and_then(|v| v.as_str())?.to_string();
    match name {
        "edit_file" => {
            let edits = args.get("edits")?.as_array()?;
            let mut old_text = String::new();
            let mut new_text = String::new();
            for edit in edits {
                if let Some(t) = edit.get("oldText").and_then(|v| v.as_str()) {
                    old_text.push_str(t);
                }
                if let Some(t) = edit.get("newText").and_then(|v| v.as_str()) {
                    new_text.push_str(t);
                }
            }
            Some(DiffPayload { path, old_text: Some(old_text), new_text })
        }
        "write_file" => {
            let content = args.get("content").and_then(|v| v.as_str())?.to_string();
            Some(DiffPayload { path, old_text: None, new_text: content })
        }
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn no_hints() -> ToolAnnotations {
        ToolAnnotations::default()
    }

    #[test]
    fn name_prefixes_classify() {
        for (name, kind) in [
            ("read_file", ToolKind::Read),
            ("get_issue", ToolKind::Read),
            ("list_dir", ToolKind::Read),
            ("directory_tree", ToolKind::Read),
            ("edit_file", ToolKind::Edit),
            ("write_file", ToolKind::Edit),
            ("update_row", ToolKind::Edit),
            ("create_branch", ToolKind::Edit),
            ("add_comment", ToolKind::Edit),
            ("delete_file", ToolKind::Delete),
            ("remove_label", ToolKind::Delete),
            ("stop_server", ToolKind::Delete),
            ("search_code", ToolKind::Search),
            ("find_file", ToolKind::Search),
            ("think", ToolKind::Think),
            ("fetch", ToolKind::Fetch),
            ("http_get", ToolKind::Fetch),
            ("shell", ToolKind::Execute),
            ("run_tests", ToolKind::Execute),
            ("exec_command", ToolKind::Execute),
            ("transfer_task", ToolKind::SwitchMode),
            ("handoff", ToolKind::SwitchMode),
            ("mystery", ToolKind::Other),
        ] {
            assert_eq!(infer_tool_kind(name, &no_hints()), kind, "{name}");
        }
    }

    #[test]
    fn annotations_override_name() {
        let read_only = ToolAnnotations::read_only();
        assert_eq!(infer_tool_kind("delete_file", &read_only), ToolKind::Read);

        let destructive = ToolAnnotations::destructive();
        assert_eq!(infer_tool_kind("read_file", &destructive), ToolKind::Delete);
    }

    #[test]
    fn bare_think_only_matches_exactly() {
        assert_eq!(infer_tool_kind("think_harder", &no_hints()), ToolKind::Other);
    }

    // ── locations ─────────────────────────────────────────────────────────────

    #[test]
    fn first_path_key_wins() {
        let args = json!({ "file": "b.txt", "path": "a.txt" });
        let locs = extract_locations(&args);
        assert_eq!(locs.len(), 1);
        // "path" is checked before "file".
        assert_eq!(locs[0].path, "a.txt");
    }

    #[test]
    fn alternate_path_keys_are_recognized() {
        for key in ["file", "filepath", "filename", "file_path"] {
            let args = json!({ key: "x.rs" });
            assert_eq!(extract_locations(&args)[0].path, "x.rs", "{key}");
        }
    }

    #[test]
    fn line_number_attaches_to_single_path() {
        let args = json!({ "path": "src/main.rs", "line": 42 });
        let locs = extract_locations(&args);
        assert_eq!(locs[0].line, Some(42));
    }

    #[test]
    fn paths_array_expands() {
        let args = json!({ "paths": ["a.rs", "b.rs"] });
        let locs = extract_locations(&args);
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[1].path, "b.rs");
        assert_eq!(locs[1].line, None);
    }

    #[test]
    fn single_key_and_paths_both_report() {
        let args = json!({ "path": "main.rs", "paths": ["x.rs"] });
        assert_eq!(extract_locations(&args).len(), 2);
    }

    #[test]
    fn no_path_keys_is_empty() {
        assert!(extract_locations(&json!({ "query": "foo" })).is_empty());
    }

    // ── diff rendering ────────────────────────────────────────────────────────

    #[test]
    fn edit_file_concatenates_edit_sides_in_order() {
        let args = json!({
            "path": "src/lib.rs",
            "edits": [
                { "oldText": "fn a() {}", "newText": "fn a() { log(); }" },
                { "oldText": "fn b() {}", "newText": "fn b() { log(); }" }
            ]
        });
        let diff = render_diff("edit_file", &args).unwrap();
        assert_eq!(diff.old_text.as_deref(), Some("fn a() {}fn b() {}"));
        assert_eq!(diff.new_text, "fn a() { log(); }fn b() { log(); }");
    }

    #[test]
    fn write_file_is_new_side_only() {
        let args = json!({ "path": "notes.md", "content": "hello" });
        let diff = render_diff("write_file", &args).unwrap();
        assert!(diff.old_text.is_none());
        assert_eq!(diff.new_text, "hello");
    }

    #[test]
    fn other_tools_render_no_diff() {
        assert!(render_diff("read_file", &json!({ "path": "a" })).is_none());
    }

    #[test]
    fn edit_file_without_edits_renders_nothing() {
        assert!(render_diff("edit_file", &json!({ "path": "a" })).is_none());
    }
}
