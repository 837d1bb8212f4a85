//! Expectation matcher
//!
//! Pure functions from observations to verdicts. A mismatch is a failed
//! [`Verdict`], never an error: the only fallible step is compiling a
//! predicate, which happens during case validation.

use bytes::Bytes;
use netcheck_common::{describe, FramePattern, PortId};
use regex::Regex;

use crate::error::{HarnessError, HarnessResult};
use crate::probe::ProbeOutput;
use crate::spec::{CompareOp, Expectation, OutputPredicate};

/// Longest stdout excerpt carried in a failure message
const MAX_OUTPUT_EXCERPT: usize = 2048;
/// Unmatched frames listed in a MUST_ARRIVE failure
const MAX_FRAMES_LISTED: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub detail: String,
}

impl Verdict {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self { passed: true, detail: detail.into() }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self { passed: false, detail: detail.into() }
    }
}

/// Decide a traffic expectation from the frames observed on `port`
pub fn check_traffic(
    port: PortId,
    observed: &[&Bytes],
    pattern: &FramePattern,
    expectation: Expectation,
) -> Verdict {
    let hit = observed.iter().find(|f| pattern.matches(f));

    match (expectation, hit) {
        (Expectation::MustArrive, Some(_)) => Verdict::pass(format!("matching frame arrived on port {}", port)),
        (Expectation::MustArrive, None) => {
            let mut detail = format!(
                "no matching frame on port {} ({} frame(s) observed)",
                port,
                observed.len()
            );
            for frame in observed.iter().take(MAX_FRAMES_LISTED) {
                detail.push_str(&format!("; saw {}", describe(frame)));
            }
            Verdict::fail(detail)
        }
        (Expectation::MustNotArrive, None) => {
            Verdict::pass(format!("no matching frame on port {}", port))
        }
        (Expectation::MustNotArrive, Some(frame)) => {
            Verdict::fail(format!("unexpected frame on port {}: {}", port, describe(frame)))
        }
    }
}

/// Whether the observation already settles a MUST_ARRIVE expectation
pub fn arrived(observed: &[&Bytes], pattern: &FramePattern) -> bool {
    observed.iter().any(|f| pattern.matches(f))
}

#[derive(Debug, Clone)]
struct NumericCheck {
    op: CompareOp,
    value: i64,
    capture: Option<Regex>,
}

/// Validated form of [`OutputPredicate`]
#[derive(Debug, Clone)]
pub struct OutputMatcher {
    contains: Option<String>,
    not_contains: Option<String>,
    regex: Option<Regex>,
    numeric: Option<NumericCheck>,
    exit_code: Option<i32>,
}

fn compile_regex(pattern: &str) -> HarnessResult<Regex> {
    Regex::new(pattern).map_err(|e| HarnessError::InvalidCase(format!("bad regex {:?}: {}", pattern, e)))
}

impl OutputMatcher {
    pub fn compile(predicate: &OutputPredicate) -> HarnessResult<Self> {
        if predicate.is_empty() {
            return Err(HarnessError::InvalidCase(
                "probe has no expected-output predicate".to_string(),
            ));
        }

        let numeric = match &predicate.numeric {
            Some(n) => Some(NumericCheck {
                op: n.op,
                value: n.value,
                capture: n.capture.as_deref().map(compile_regex).transpose()?,
            }),
            None => None,
        };

        Ok(Self {
            contains: predicate.contains.clone(),
            not_contains: predicate.not_contains.clone(),
            regex: predicate.regex.as_deref().map(compile_regex).transpose()?,
            numeric,
            exit_code: predicate.exit_code,
        })
    }

    /// Apply every clause; all must hold
    pub fn check(&self, output: &ProbeOutput) -> Verdict {
        let mut problems = Vec::new();

        if let Some(code) = self.exit_code {
            if output.exit_code != code {
                problems.push(format!("exit code {} (expected {})", output.exit_code, code));
            }
        }
        if let Some(needle) = &self.contains {
            if !output.stdout.contains(needle.as_str()) {
                problems.push(format!("stdout lacks {:?}", needle));
            }
        }
        if let Some(needle) = &self.not_contains {
            if output.stdout.contains(needle.as_str()) {
                problems.push(format!("stdout contains forbidden {:?}", needle));
            }
        }
        if let Some(re) = &self.regex {
            if !re.is_match(&output.stdout) {
                problems.push(format!("stdout does not match /{}/", re.as_str()));
            }
        }
        if let Some(numeric) = &self.numeric {
            match extract_number(&output.stdout, numeric.capture.as_ref()) {
                Some(actual) if numeric.op.apply(actual, numeric.value) => {}
                Some(actual) => problems.push(format!(
                    "value {} is not {} {}",
                    actual,
                    numeric.op.symbol(),
                    numeric.value
                )),
                None => problems.push("could not parse a number from stdout".to_string()),
            }
        }

        if problems.is_empty() {
            Verdict::pass("output matched")
        } else {
            Verdict::fail(format!(
                "{}; stdout: {:?}; stderr: {:?}",
                problems.join(", "),
                excerpt(&output.stdout),
                excerpt(&output.stderr)
            ))
        }
    }
}

fn extract_number(stdout: &str, capture: Option<&Regex>) -> Option<i64> {
    let text = match capture {
        Some(re) => {
            let caps = re.captures(stdout)?;
            caps.get(1).or_else(|| caps.get(0))?.as_str()
        }
        None => stdout,
    };
    text.trim().parse().ok()
}

fn excerpt(text: &str) -> &str {
    if text.len() <= MAX_OUTPUT_EXCERPT {
        return text;
    }
    let mut end = MAX_OUTPUT_EXCERPT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// All endpoints must report the same integer
pub fn check_agreement(outputs: &[(String, ProbeOutput)]) -> Verdict {
    let mut values = Vec::with_capacity(outputs.len());
    for (label, output) in outputs {
        match output.stdout.trim().parse::<i64>() {
            Ok(v) => values.push((label.as_str(), v)),
            Err(_) => {
                return Verdict::fail(format!(
                    "could not parse a count from {}: {:?}",
                    label,
                    excerpt(&output.stdout)
                ))
            }
        }
    }

    let listing = values
        .iter()
        .map(|(label, v)| format!("{}={}", label, v))
        .collect::<Vec<_>>()
        .join(", ");

    match values.first() {
        Some((_, first)) if values.iter().all(|(_, v)| v == first) => {
            Verdict::pass(format!("all report {}", first))
        }
        Some(_) => Verdict::fail(format!("asymmetric: {}", listing)),
        None => Verdict::fail("no outputs to compare"),
    }
}
