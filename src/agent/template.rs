//! Prompt template substitution.
//!
//! Templates use `$KEY` placeholders. Substitution is a pure function over
//! an explicitly ordered list of `(key, value)` pairs; the output for a
//! fixed input slice is deterministic and independent of caller ordering,
//! because keys are applied longest-first (so `$FEATURE` can never clobber
//! `$FEATURE_NAME`).

use regex::Regex;
use std::sync::OnceLock;

/// Replace every literal occurrence of `$KEY` in `template` for each pair.
pub fn render_template(template: &str, vars: &[(String, String)]) -> String {
    let mut ordered: Vec<&(String, String)> = vars.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    let mut rendered = template.to_string();
    for (key, value) in ordered {
        rendered = rendered.replace(&format!("${}", key), value);
    }
    rendered
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$[A-Z][A-Z0-9_]*").expect("valid regex"))
}

/// Placeholder tokens still present in a rendered prompt. A non-empty result
/// is a caller error: every variable must be supplied before dispatch.
pub fn unresolved_placeholders(rendered: &str) -> Vec<String> {
    let mut found: Vec<String> = placeholder_re()
        .find_iter(rendered)
        .map(|m| m.as_str().to_string())
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Convenience for building a variable list from `&str` pairs.
pub fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
