use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::proc::run_with_deadline;

/// Fixed literal strings the generated artifact must reproduce verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSpec {
    pub header: String,
    pub footer: String,
    pub marker: String,
}

/// How one hidden-instruction check decides pass/fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    Literal { value: String },
    Pattern { regex: String },
    /// The phrase must appear inside the docstring of the named declaration,
    /// not merely anywhere in the artifact.
    DocPhrase { declaration: String, phrase: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiddenCheck {
    pub id: String,
    pub label: String,
    pub matcher: Matcher,
}

/// The scoring rubric. A data structure, not code: adding a declaration or a
/// hidden check is a configuration change, and every scoring denominator is
/// derived from these lists' lengths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub secret: SecretSpec,
    pub required_declarations: Vec<String>,
    pub hidden_checks: Vec<HiddenCheck>,
}

impl Default for Rubric {
    fn default() -> Self {
        let literal = |id: &str, label: &str, value: &str| HiddenCheck {
            id: id.to_string(),
            label: label.to_string(),
            matcher: Matcher::Literal {
                value: value.to_string(),
            },
        };
        Self {
            secret: SecretSpec {
                header: "EXPERIMENT-ID: MAGIC-7392".to_string(),
                footer: "Verified: BLUE-ELEPHANT".to_string(),
                marker: "ref: XYZ-999".to_string(),
            },
            required_declarations: vec![
                "def fizzbuzz(".to_string(),
                "def fizzbuzz_range(".to_string(),
                "def fizzbuzz_custom(".to_string(),
                "def fizzbuzz_stats(".to_string(),
                "def fizzbuzz_generator(".to_string(),
            ],
            hidden_checks: vec![
                literal(
                    "sorted_divisors",
                    "_sorted_divisors identifier",
                    "_sorted_divisors",
                ),
                HiddenCheck {
                    id: "stats_version".to_string(),
                    label: "STATS_VERSION constant".to_string(),
                    matcher: Matcher::Pattern {
                        regex: r#"STATS_VERSION\s*=\s*"2\.1""#.to_string(),
                    },
                },
                HiddenCheck {
                    id: "stats_comment".to_string(),
                    label: "Uses STATS_VERSION phrase in fizzbuzz_stats docstring".to_string(),
                    matcher: Matcher::DocPhrase {
                        declaration: "def fizzbuzz_stats(".to_string(),
                        phrase: "Uses STATS_VERSION".to_string(),
                    },
                },
                HiddenCheck {
                    id: "infinite_seq".to_string(),
                    label: "infinite sequence phrase in fizzbuzz_generator docstring".to_string(),
                    matcher: Matcher::DocPhrase {
                        declaration: "def fizzbuzz_generator(".to_string(),
                        phrase: "infinite sequence".to_string(),
                    },
                },
                literal("ensure_ascii", "ensure_ascii=False flag", "ensure_ascii=False"),
                literal("header_row", "_header_row identifier", "_header_row"),
                literal(
                    "format_table_row",
                    "_format_table_row helper",
                    "def _format_table_row(",
                ),
                HiddenCheck {
                    id: "group_keys".to_string(),
                    label: "GROUP_KEYS constant".to_string(),
                    matcher: Matcher::Pattern {
                        regex: r"GROUP_KEYS\s*=".to_string(),
                    },
                },
            ],
        }
    }
}

impl Rubric {
    /// Aggregate every problem into one error instead of failing on the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.required_declarations.is_empty() {
            problems.push("rubric.required_declarations is empty".to_string());
        }
        for check in &self.hidden_checks {
            if let Matcher::Pattern { regex } = &check.matcher {
                if let Err(e) = Regex::new(regex) {
                    problems.push(format!("rubric check '{}': invalid regex: {}", check.id, e));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid rubric:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }

    /// First required declaration; the extractor's fallback keyword.
    pub fn primary_declaration(&self) -> &str {
        self.required_declarations
            .first()
            .map(String::as_str)
            .unwrap_or("def fizzbuzz(")
    }
}

/// "def fizzbuzz(" -> "fizzbuzz"; non-def prefixes keep their text minus the
/// trailing paren.
pub fn declaration_name(declaration: &str) -> String {
    declaration
        .trim_start_matches("def ")
        .trim_end_matches('(')
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecretValidation {
    pub has_header: bool,
    pub has_footer: bool,
    pub ref_count: u32,
    pub expected_refs: u32,
    pub secret_score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HiddenValidation {
    pub checks: BTreeMap<String, bool>,
    pub hidden_score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_total: u32,
    pub error: Option<String>,
}

pub fn validate_secrets(content: &str, secret: &SecretSpec, expected_refs: usize) -> SecretValidation {
    let has_header = content.contains(&secret.header);
    let has_footer = content.contains(&secret.footer);
    let ref_count = content.matches(&secret.marker).count() as u32;

    let header_score = if has_header { 1.0 } else { 0.0 };
    let footer_score = if has_footer { 1.0 } else { 0.0 };
    let ref_score = if expected_refs > 0 {
        (ref_count as f64 / expected_refs as f64).min(1.0)
    } else {
        0.0
    };
    let secret_score = round4((header_score + footer_score + ref_score) / 3.0);

    SecretValidation {
        has_header,
        has_footer,
        ref_count,
        expected_refs: expected_refs as u32,
        secret_score,
    }
}

/// Strict substring match on the exact defining signature text so near-miss
/// names never count.
pub fn validate_declarations(content: &str, declarations: &[String]) -> BTreeMap<String, bool> {
    declarations
        .iter()
        .map(|decl| (declaration_name(decl), content.contains(decl.as_str())))
        .collect()
}

pub fn validate_hidden(content: &str, checks: &[HiddenCheck]) -> HiddenValidation {
    let mut results = BTreeMap::new();
    for check in checks {
        results.insert(check.id.clone(), check.matcher.matches(content));
    }
    let hidden_score = if checks.is_empty() {
        0.0
    } else {
        let hits = results.values().filter(|v| **v).count();
        round4(hits as f64 / checks.len() as f64)
    };
    HiddenValidation {
        checks: results,
        hidden_score,
    }
}

impl Matcher {
    pub fn matches(&self, content: &str) -> bool {
        match self {
            Matcher::Literal { value } => content.contains(value.as_str()),
            Matcher::Pattern { regex } => Regex::new(regex)
                .map(|re| re.is_match(content))
                .unwrap_or(false),
            Matcher::DocPhrase { declaration, phrase } => doc_block(content, declaration)
                .map(|doc| doc.contains(phrase.as_str()))
                .unwrap_or(false),
        }
    }
}

/// The docstring that trails `declaration`, scoped to text before the next
/// top-level `def` so another function's docstring never satisfies the check.
fn doc_block<'a>(content: &'a str, declaration: &str) -> Option<&'a str> {
    let start = content.find(declaration)?;
    let rest = &content[start + declaration.len()..];
    let scope_end = rest.find("\ndef ").unwrap_or(rest.len());
    let scope = &rest[..scope_end];

    let (delim, open) = ["\"\"\"", "'''"]
        .iter()
        .filter_map(|d| scope.find(d).map(|i| (*d, i)))
        .min_by_key(|(_, i)| *i)?;
    let body = &scope[open + delim.len()..];
    let close = body.find(delim)?;
    Some(&body[..close])
}

/// Run the external test command with a hard timeout. Stdout and stderr are
/// scanned for literal ` PASSED`/` FAILED`/` ERROR` markers; the exit status is
/// the sole pass signal. Timeout and missing-test-file stay distinct labels.
pub fn run_tests(command: &[String], workdir: &Path, timeout: Duration) -> TestOutcome {
    if command.is_empty() {
        return TestOutcome {
            error: Some("test command not configured".to_string()),
            ..TestOutcome::default()
        };
    }

    for arg in &command[1..] {
        if looks_like_path(arg) && !workdir.join(arg).exists() && !Path::new(arg).exists() {
            return TestOutcome {
                error: Some("test file not found".to_string()),
                ..TestOutcome::default()
            };
        }
    }

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.current_dir(workdir);

    let out = match run_with_deadline(cmd, timeout) {
        Ok(out) => out,
        Err(e) => {
            return TestOutcome {
                error: Some(format!("test runner failed to start: {}", e)),
                ..TestOutcome::default()
            }
        }
    };
    if out.timed_out {
        return TestOutcome {
            error: Some("timeout".to_string()),
            ..TestOutcome::default()
        };
    }

    let combined = format!("{}{}", out.stdout, out.stderr);
    let tests_passed = combined.matches(" PASSED").count() as u32;
    let tests_failed = combined.matches(" FAILED").count() as u32;
    let errors = combined.matches(" ERROR").count() as u32;
    debug!(tests_passed, tests_failed, errors, "test run complete");

    TestOutcome {
        passed: out.exit_ok(),
        tests_passed,
        tests_failed,
        tests_total: tests_passed + tests_failed + errors,
        error: None,
    }
}

fn looks_like_path(part: &str) -> bool {
    part.contains('/') || part.ends_with(".py")
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
