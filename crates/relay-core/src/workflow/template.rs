//! `{{ key }}` interpolation of step input templates.
//!
//! Keys are case-insensitive and may contain letters, digits, `_`, `-` and
//! `.` (story-scoped keys look like `s-1.status`). Every unresolved
//! placeholder is reported at once; nothing is silently left blank.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::RelayError;
use crate::models::run::RunContext;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid placeholder pattern")
    })
}

/// Placeholder keys referenced by a template, lowercased, in first-use order.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in placeholder_re().captures_iter(template) {
        let key = caps[1].to_lowercase();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Substitute every placeholder with its context value.
pub fn interpolate(template: &str, context: &RunContext) -> Result<String, RelayError> {
    let missing: Vec<String> = placeholders(template)
        .into_iter()
        .filter(|key| !context.contains_key(key))
        .collect();
    if !missing.is_empty() {
        return Err(RelayError::MissingContextKeys(missing));
    }

    let rendered = placeholder_re().replace_all(template, |caps: &Captures| {
        context.get(&caps[1]).unwrap_or_default().to_string()
    });
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx(pairs: &[(&str, &str)]) -> RunContext {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_interpolate_replaces_all_occurrences() {
        let context = ctx(&[("task", "add login"), ("repo", "acme/web")]);
        let out = interpolate("Do {{task}} in {{ repo }}; again: {{TASK}}", &context).unwrap();
        assert_eq!(out, "Do add login in acme/web; again: add login");
    }

    #[test]
    fn test_missing_keys_are_all_reported() {
        let context = ctx(&[("task", "x")]);
        let err = interpolate("{{task}} {{repo}} {{branch}} {{repo}}", &context).unwrap_err();
        match err {
            RelayError::MissingContextKeys(keys) => assert_eq!(keys, vec!["repo", "branch"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dotted_story_keys() {
        let context = ctx(&[("s-1.status", "done")]);
        assert_eq!(interpolate("{{S-1.status}}", &context).unwrap(), "done");
    }

    #[test]
    fn test_template_without_placeholders_is_unchanged() {
        let context = RunContext::new();
        assert_eq!(interpolate("plain { text }", &context).unwrap(), "plain { text }");
    }

    #[test]
    fn test_values_are_not_reinterpolated() {
        let context = ctx(&[("a", "{{b}}")]);
        assert_eq!(interpolate("{{a}}", &context).unwrap(), "{{b}}");
    }

    proptest! {
        #[test]
        fn prop_interpolation_round_trips_values(value in "\\PC*") {
            let context = ctx(&[("summary", value.as_str())]);
            let out = interpolate("{{summary}}", &context).unwrap();
            prop_assert_eq!(out, value);
        }
    }
}
