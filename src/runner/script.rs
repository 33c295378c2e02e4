use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::runner::AssertionEvaluated;

/// A `pm.test(...)` block. Only status checks are understood, any other
/// test body passes without a check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptTest {
    pub name: String,
    pub expected_status: Option<u16>,
}

impl ScriptTest {
    pub fn evaluate(&self, http_status: u16) -> AssertionEvaluated {
        match self.expected_status {
            Some(expected) if expected != http_status => AssertionEvaluated {
                name: self.name.clone(),
                passed: false,
                error: Some(format!(
                    "expected response to have status code {expected} but got {http_status}"
                )),
            },
            _ => AssertionEvaluated {
                name: self.name.clone(),
                passed: true,
                error: None,
            },
        }
    }
}

/// Replaces `{{name}}` with its value. Unknown names are left as they are.
pub fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(template, |captures: &regex::Captures| {
            variables
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}

pub fn extract_tests(lines: &[String]) -> Vec<ScriptTest> {
    let source = lines.join("\n");
    let starts: Vec<regex::Captures> = test_pattern().captures_iter(&source).collect();
    starts
        .iter()
        .enumerate()
        .map(|(position, captures)| {
            let name = (1..=3)
                .find_map(|group| captures.get(group))
                .map_or(String::new(), |name| name.as_str().to_string());
            let body_start = captures.get(0).map_or(0, |whole| whole.end());
            let body_end = starts
                .get(position + 1)
                .and_then(|next| next.get(0))
                .map_or(source.len(), |next| next.start());
            let expected_status = status_pattern()
                .captures(&source[body_start..body_end])
                .and_then(|status| status[1].parse().ok());
            ScriptTest {
                name,
                expected_status,
            }
        })
        .collect()
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("valid variable pattern"))
}

fn test_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"pm\.test\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)"#).expect("valid test pattern")
    })
}

fn status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"pm\.response\.to\.have\.status\(\s*(\d{3})\s*\)").expect("valid status pattern")
    })
}
