//! Runs one program against a list of test cases and grades the output.

use crate::{
    limits::LimitOverrides,
    orchestrator::Orchestrator,
    result::{ExecutionResult, ExecutionStatus},
    submission::Submission,
    Result,
};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected: String,
    /// Hidden cases are graded but their data is left out of the report.
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    CompileError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    InternalError,
}

impl Verdict {
    fn of(result: &ExecutionResult, passed: bool) -> Self {
        match result.status() {
            ExecutionStatus::Completed if passed => Verdict::Accepted,
            ExecutionStatus::Completed => Verdict::WrongAnswer,
            ExecutionStatus::CompileFailed => Verdict::CompileError,
            ExecutionStatus::TimedOut => Verdict::TimeLimitExceeded,
            ExecutionStatus::MemoryExceeded => Verdict::MemoryLimitExceeded,
            ExecutionStatus::RuntimeError => Verdict::RuntimeError,
            ExecutionStatus::InfraFailure => Verdict::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseReport {
    pub index: usize,
    pub status: ExecutionStatus,
    pub passed: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeReport {
    pub verdict: Verdict,
    pub passed: usize,
    pub total: usize,
    /// Compiler diagnostics, present only when compilation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub cases: Vec<CaseReport>,
}

/// Runs every case in order, each in a fresh sandbox. A compile failure ends
/// the run early since no later case could pass either.
///
/// The verdict is taken from the first case that did not pass.
pub async fn judge(
    orchestrator: &Orchestrator,
    language: &str,
    source: &str,
    cases: &[TestCase],
    limits: Option<&LimitOverrides>,
) -> Result<JudgeReport> {
    let mut report = JudgeReport {
        verdict: Verdict::Accepted,
        passed: 0,
        total: cases.len(),
        compile_output: None,
        cases: Vec::with_capacity(cases.len()),
    };

    for (index, case) in cases.iter().enumerate() {
        let mut submission = Submission::new(language, source, case.input.as_str());
        if let Some(limits) = limits {
            submission = submission.with_limits(limits.clone());
        }

        let result = orchestrator.execute(submission).await?;
        let actual = result.stdout().text();
        let passed = result.status() == ExecutionStatus::Completed && outputs_match(&actual, &case.expected);
        log::debug!("Case {} finished with {:?} (passed: {})", index, result.status(), passed);

        if passed {
            report.passed += 1;
        } else if report.verdict == Verdict::Accepted {
            report.verdict = Verdict::of(&result, passed);
        }

        report.cases.push(CaseReport {
            index,
            status: result.status(),
            passed,
            elapsed_ms: result.elapsed_ms(),
            input: reveal(case, || case.input.clone()),
            expected: reveal(case, || case.expected.clone()),
            actual: reveal(case, || actual),
        });

        if result.status() == ExecutionStatus::CompileFailed {
            report.compile_output = Some(result.stderr().text());
            break;
        }
    }

    log::info!(
        "Judged {} submission: {:?}, {}/{} cases passed",
        language,
        report.verdict,
        report.passed,
        report.total
    );
    Ok(report)
}

fn reveal(case: &TestCase, value: impl FnOnce() -> String) -> Option<String> {
    if case.hidden {
        None
    } else {
        Some(value())
    }
}

/// Trimmed text equality, or, failing that, element-wise equality when both
/// sides read as flat JSON arrays. Single quotes count as double quotes so
/// Python's `['a', 'b']` matches `["a", "b"]`.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    let actual = actual.trim();
    let expected = expected.trim();
    if actual == expected {
        return true;
    }

    match (as_array(actual), as_array(expected)) {
        (Some(actual), Some(expected)) => {
            actual.len() == expected.len() && actual.iter().zip(&expected).all(|(a, b)| scalar_eq(a, b))
        }
        _ => false,
    }
}

fn as_array(text: &str) -> Option<Vec<Value>> {
    match serde_json::from_str(&text.replace('\'', "\"")) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Nested arrays and objects never compare equal.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Array(_), _) | (Value::Object(_), _) => false,
        (a, b) => a == b,
    }
}
