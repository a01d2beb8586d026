use std::sync::OnceLock;

use regex::Regex;

fn tagged_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```python\s*(.*?)```").expect("literal regex"))
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```\s*(.*?)```").expect("literal regex"))
}

/// Recover the single source artifact from a noisy response. First match
/// wins: a python-tagged fence, any fence, then the whole trimmed response
/// iff it contains the primary declaration. None means "no artifact
/// produced", not an error.
pub fn extract_code(response: &str, primary_declaration: &str) -> Option<String> {
    if let Some(caps) = tagged_fence().captures(response) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = any_fence().captures(response) {
        return Some(caps[1].trim().to_string());
    }
    let keyword = primary_declaration.trim_end_matches('(');
    if response.contains(keyword) {
        return Some(response.trim().to_string());
    }
    None
}
