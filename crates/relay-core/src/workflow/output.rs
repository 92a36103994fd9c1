//! Decoding of free-text worker output into context keys.
//!
//! Workers report results as `KEY: value` lines (`KEY` is upper case,
//! `[A-Z][A-Z0-9_]*`). Everything else is prose and ignored. Later
//! occurrences of a key overwrite earlier ones. A JSON array or object may
//! span several lines, either starting after the colon or on the line right
//! below an empty `KEY:`.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::run::RunContext;
use crate::models::story::{validate_backlog, StorySeed};

/// Output key that carries a story backlog produced by a planning step.
pub const STORIES_KEY: &str = "stories_json";

fn key_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Z][A-Z0-9_]*):(.*)$").expect("valid key line pattern"))
}

fn starts_json(value: &str) -> bool {
    value.starts_with('[') || value.starts_with('{')
}

/// Grow `acc` line by line from `start` until it parses as JSON.
/// Returns the JSON text and the index of the first unconsumed line.
fn absorb_json(lines: &[&str], start: usize, mut acc: String) -> Option<(String, usize)> {
    for (offset, line) in lines[start..].iter().enumerate() {
        if !acc.is_empty() {
            acc.push('\n');
        }
        acc.push_str(line.trim_end_matches('\r'));
        if serde_json::from_str::<serde_json::Value>(&acc).is_ok() {
            return Some((acc.trim().to_string(), start + offset + 1));
        }
    }
    None
}

/// Decode worker output into an ordered key/value mapping (keys lowercased).
pub fn parse_output(raw: &str) -> RunContext {
    let lines: Vec<&str> = raw.lines().collect();
    let mut parsed = RunContext::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = key_line_re().captures(lines[i].trim_end_matches('\r')) else {
            i += 1;
            continue;
        };
        let key = caps[1].to_string();
        let inline = caps[2].trim().to_string();
        i += 1;

        if inline.is_empty() {
            let next_is_json = lines
                .get(i)
                .map(|line| starts_json(line.trim()))
                .unwrap_or(false);
            if next_is_json {
                if let Some((value, after)) = absorb_json(&lines, i, String::new()) {
                    parsed.insert(&key, value);
                    i = after;
                }
            }
            continue;
        }

        if starts_json(&inline) && serde_json::from_str::<serde_json::Value>(&inline).is_err() {
            if let Some((value, after)) = absorb_json(&lines, i, inline.clone()) {
                parsed.insert(&key, value);
                i = after;
                continue;
            }
        }

        parsed.insert(&key, inline);
    }

    parsed
}

/// Expected keys (as written in the workflow) absent from `parsed`.
pub fn missing_keys(parsed: &RunContext, expects: &[String]) -> Vec<String> {
    expects
        .iter()
        .filter(|key| !parsed.contains_key(key))
        .cloned()
        .collect()
}

/// Decode and validate a `STORIES_JSON` payload.
pub fn parse_story_seeds(raw: &str) -> Result<Vec<StorySeed>, String> {
    let seeds: Vec<StorySeed> =
        serde_json::from_str(raw).map_err(|e| format!("invalid {}: {}", STORIES_KEY, e))?;
    validate_backlog(&seeds)?;
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_key_lines_and_ignore_prose() {
        let raw = "I looked at the repo.\nSTATUS: done\nBRANCH: feat/login\nsome more notes: lower case\n";
        let parsed = parse_output(raw);
        assert_eq!(parsed.get("status"), Some("done"));
        assert_eq!(parsed.get("branch"), Some("feat/login"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_later_key_overwrites_earlier() {
        let parsed = parse_output("STATUS: retry\nSTATUS: done\r\n");
        assert_eq!(parsed.get("status"), Some("done"));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_empty_value_is_not_reported() {
        let parsed = parse_output("STATUS:\nNOTES: fine");
        assert!(!parsed.contains_key("status"));
        assert_eq!(parsed.get("notes"), Some("fine"));
    }

    #[test]
    fn test_multiline_json_after_colon() {
        let raw = "STATUS: done\nSTORIES_JSON: [\n  {\"id\": \"S-1\", \"title\": \"Login\"},\n  {\"id\": \"S-2\", \"title\": \"Logout\"}\n]\nNOTE: after";
        let parsed = parse_output(raw);
        let seeds = parse_story_seeds(parsed.get(STORIES_KEY).unwrap()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].id, "S-2");
        assert_eq!(parsed.get("note"), Some("after"));
    }

    #[test]
    fn test_multiline_json_below_empty_key() {
        let raw = "STORIES_JSON:\n[{\"id\": \"S-1\",\n \"title\": \"Only\"}]\nSTATUS: done";
        let parsed = parse_output(raw);
        assert_eq!(parse_story_seeds(parsed.get(STORIES_KEY).unwrap()).unwrap().len(), 1);
        assert_eq!(parsed.get("status"), Some("done"));
    }

    #[test]
    fn test_unterminated_json_falls_back_to_single_line() {
        let parsed = parse_output("DATA: [not json\nSTATUS: done");
        assert_eq!(parsed.get("data"), Some("[not json"));
        assert_eq!(parsed.get("status"), Some("done"));
    }

    #[test]
    fn test_missing_keys_case_insensitive() {
        let parsed = parse_output("STATUS: done");
        let expects = vec!["STATUS".to_string(), "Verdict".to_string()];
        assert_eq!(missing_keys(&parsed, &expects), vec!["Verdict"]);
    }

    #[test]
    fn test_story_seeds_rejects_duplicates() {
        let err = parse_story_seeds(r#"[{"id":"a","title":"x"},{"id":"a","title":"y"}]"#).unwrap_err();
        assert!(err.contains("duplicate"));
        assert!(parse_story_seeds("{not json").is_err());
    }

    proptest! {
        #[test]
        fn prop_last_write_wins(values in proptest::collection::vec("[a-z0-9 ]{1,12}", 1..6)) {
            let raw: String = values
                .iter()
                .map(|v| format!("RESULT: {}\n", v))
                .collect();
            let parsed = parse_output(&raw);
            let last = values.last().unwrap().trim();
            if last.is_empty() {
                prop_assert!(parsed.len() <= 1);
            } else {
                prop_assert_eq!(parsed.get("result"), Some(last));
            }
        }
    }
}
