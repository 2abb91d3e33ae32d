use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-wide memo of compiled route patterns.
///
/// Routing rules, quota routes and bind patterns are all matched
/// case-insensitively and anchored at the start of the path, so every
/// pattern is compiled once as `(?i)^(?:…)` and reused.
static COMPILED: Lazy<Mutex<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn compiled(pattern: &str) -> Option<Regex> {
    let mut memo = COMPILED.lock().unwrap();
    memo.entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(&format!("(?i)^(?:{pattern})")) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern, error = %err, "invalid route pattern");
                None
            }
        })
        .clone()
}

/// True when the pattern is a syntactically valid regex.
pub fn is_valid(pattern: &str) -> bool {
    compiled(pattern).is_some()
}

/// Anchored, case-insensitive match of `pattern` against `path`.
/// Invalid patterns never match.
pub fn matches(pattern: &str, path: &str) -> bool {
    compiled(pattern).is_some_and(|re| re.is_match(path))
}

/// The matched prefix of `path`, when `pattern` matches at the start.
pub fn match_prefix(pattern: &str, path: &str) -> Option<String> {
    compiled(pattern).and_then(|re| re.find(path).map(|m| m.as_str().to_string()))
}
