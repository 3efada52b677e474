// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};

use freja_config::AgentConfig;

/// Expand `{{key}}` placeholders from the given pairs.  Unknown placeholders
/// are left untouched so instructions can contain literal braces.
pub fn expand_template(text: &str, vars: &[(&str, String)]) -> String {
    let mut out = text.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Build the system prompt for one agent turn: the agent instruction
/// (date-stamped when the agent opts in) followed by the usage guidance of
/// its toolsets.
pub fn system_prompt(
    config: &AgentConfig,
    toolset_instructions: &[String],
    now: DateTime<Utc>,
) -> String {
    let date = now.format("%Y-%m-%d").to_string();
    let mut prompt = if config.add_date {
        let expanded = expand_template(&config.instruction, &[("date", date.clone())]);
        if expanded.contains(&date) {
            expanded
        } else {
            format!("{expanded}\n\nToday's date is {date}.")
        }
    } else {
        config.instruction.clone()
    };

    for section in toolset_instructions {
        prompt.push_str("\n\n");
        prompt.push_str(section);
    }
    prompt.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use freja_config::ApprovalMode;

    use super::*;

    fn agent(instruction: &str, add_date: bool) -> AgentConfig {
        AgentConfig {
            model: "m".into(),
            instruction: instruction.into(),
            description: String::new(),
            add_date,
            max_iterations: 20,
            approval: ApprovalMode::Ask,
            sub_agents: vec![],
            toolsets: vec![],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    #[test]
    fn expand_replaces_known_placeholder() {
        let out = expand_template("today is {{date}}", &[("date", "2026-03-14".into())]);
        assert_eq!(out, "today is 2026-03-14");
    }

    #[test]
    fn expand_leaves_unknown_placeholder() {
        let out = expand_template("keep {{this}}", &[("date", "x".into())]);
        assert_eq!(out, "keep {{this}}");
    }

    #[test]
    fn date_appended_when_opted_in() {
        let p = system_prompt(&agent("be helpful", true), &[], now());
        assert!(p.contains("Today's date is 2026-03-14"));
    }

    #[test]
    fn date_placeholder_suppresses_appended_line() {
        let p = system_prompt(&agent("as of {{date}}, be helpful", true), &[], now());
        assert!(p.contains("as of 2026-03-14"));
        assert!(!p.contains("Today's date is"));
    }

    #[test]
    fn no_date_without_opt_in() {
        let p = system_prompt(&agent("be helpful", false), &[], now());
        assert!(!p.contains("2026"));
    }

    #[test]
    fn toolset_instructions_are_appended() {
        let p = system_prompt(
            &agent("base", false),
            &["use the todo list".into(), "memory is persistent".into()],
            now(),
        );
        let base = p.find("base").unwrap();
        let todo = p.find("use the todo list").unwrap();
        let memory = p.find("memory is persistent").unwrap();
        assert!(base < todo && todo < memory);
    }
}
