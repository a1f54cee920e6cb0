//! End-to-end runs against a real Docker daemon.
//!
//! These pull toolchain images and start containers, so they are ignored by
//! default: `cargo test -- --ignored`.

use code_runner::{ExecutionStatus, LimitOverrides, Orchestrator, RunnerConfig, Submission};
use lazy_static::lazy_static;
use tokio::sync::Mutex;

lazy_static! {
    static ref ONE_TEST_AT_A_TIME: Mutex<()> = Mutex::new(());
}

const SQUARE: &str = r#"
#include <iostream>

int main() {
    long long n;
    std::cin >> n;
    std::cout << n * n << std::endl;
    return 0;
}
"#;

fn orchestrator() -> Orchestrator {
    let config = RunnerConfig::from_env().expect("invalid configuration");
    Orchestrator::new(&config).expect("failed to create orchestrator")
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn cpp_square() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let result = orchestrator()
        .execute(Submission::new("cpp", SQUARE, "7"))
        .await
        .expect("submission was rejected");

    assert_eq!(result.status(), ExecutionStatus::Completed, "{:?}", result);
    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout().text(), "49\n");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn cpp_syntax_error() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let result = orchestrator()
        .execute(Submission::new("cpp", "int main() { return 0 }", ""))
        .await
        .expect("submission was rejected");

    assert_eq!(result.status(), ExecutionStatus::CompileFailed);
    assert!(result.stderr().text().contains("error"));
    assert!(result.stdout().is_empty());
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn cpp_infinite_loop_times_out() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let submission = Submission::new("cpp", "int main() { for (;;) {} }", "").with_limits(LimitOverrides {
        wall_time_ms: Some(500),
        ..Default::default()
    });
    let result = orchestrator()
        .execute(submission)
        .await
        .expect("submission was rejected");

    assert_eq!(result.status(), ExecutionStatus::TimedOut);
    assert_eq!(result.exit_code(), None);
    assert!(result.elapsed_ms() >= 500);
    assert!(result.elapsed_ms() < 2_000, "took {} ms", result.elapsed_ms());
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn python_reads_stdin() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let source = "import sys\nprint('hello ' + sys.stdin.read().strip())\n";
    let result = orchestrator()
        .execute(Submission::new("python", source, "world"))
        .await
        .expect("submission was rejected");

    assert_eq!(result.status(), ExecutionStatus::Completed, "{:?}", result);
    assert_eq!(result.stdout().text(), "hello world\n");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn runaway_output_is_truncated() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let submission = Submission::new("python", "while True:\n    print('x' * 1000)\n", "").with_limits(
        LimitOverrides {
            wall_time_ms: Some(1_000),
            max_output_bytes: Some(4_096),
            ..Default::default()
        },
    );
    let result = orchestrator()
        .execute(submission)
        .await
        .expect("submission was rejected");

    assert_eq!(result.status(), ExecutionStatus::TimedOut);
    assert!(result.stdout().truncated());
    assert_eq!(result.stdout().as_bytes().len(), 4_096);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn memory_hog_is_stopped() {
    let _guard = ONE_TEST_AT_A_TIME.lock().await;

    let submission = Submission::new("python", "x = bytearray(512 * 1024 * 1024)\n", "").with_limits(
        LimitOverrides {
            memory_bytes: Some(64 * 1024 * 1024),
            ..Default::default()
        },
    );
    let result = orchestrator()
        .execute(submission)
        .await
        .expect("submission was rejected");

    // Python may raise MemoryError itself before the kernel steps in.
    assert!(
        matches!(
            result.status(),
            ExecutionStatus::MemoryExceeded | ExecutionStatus::RuntimeError
        ),
        "{:?}",
        result
    );
}
