//! Stepwise CLI - runs declarative step tests.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use stepwise::{
    DefaultTestRunner, StepState, TestDefinition, TestLoader, TestResult, TestRunner, Value,
    Variables,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Stepwise - YAML/JSON step test runner.
#[derive(Parser, Debug)]
#[command(name = "stepwise", version, about)]
struct Cli {
    /// Test file or directory path.
    #[arg(short = 'p', long = "path", env = "STEPWISE_PATH")]
    test_path: Option<String>,

    /// Filter tests by name (partial match).
    #[arg(short = 'f', long = "filter")]
    test_filter: Option<String>,

    /// Only run tests carrying this tag.
    #[arg(short = 't', long = "tag")]
    tag: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Set a variable, overriding the test's own (repeatable).
    /// Values are parsed as YAML scalars: `--var n=3` is a number.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// Do not copy environment variables into the scope.
    #[arg(long = "no-env")]
    no_env: bool,

    /// Directory to save test report files.
    #[arg(short = 'r', long = "report-dir", env = "STEPWISE_REPORT_DIR")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        bail!("variable name is empty in '{raw}'");
    }
    let value = serde_yaml::from_str::<serde_json::Value>(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn state_label(state: StepState) -> &'static str {
    match state {
        StepState::Passed => "PASS",
        StepState::Failed => "FAIL",
        StepState::Ignored => "IGNORED",
        StepState::Skipped => "SKIP",
    }
}

fn print_test_result(result: &TestResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} test: {} ({} ms)", status, result.name, result.duration_ms);

    for step in &result.steps {
        let mark = match step.state {
            StepState::Passed => "\x1b[32m✓\x1b[0m",
            StepState::Failed => "\x1b[31m✗\x1b[0m",
            StepState::Ignored => "\x1b[33m!\x1b[0m",
            StepState::Skipped => "-",
        };
        info!(
            "  {} {} {} ({} ms)",
            step.step_number, mark, step.name, step.duration_ms
        );

        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }
        if verbose {
            debug!("     Type: {}", step.step_type);
            if let Some(reason) = &step.skip_reason {
                debug!("     Skipped: {}", reason);
            }
        }
    }

    for error in &result.errors {
        error!("  \x1b[31m{}\x1b[0m", error);
    }
}

fn save_test_report(result: &TestResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
        ReportFormat::Text => (format!("{sanitized_name}-{timestamp}.txt"), text_report(result)),
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn text_report(result: &TestResult) -> String {
    let mut content = String::new();
    content.push_str(&format!("Test result: {}\n", result.name));
    content.push_str(&format!(
        "Status: {}\n",
        if result.success { "PASS" } else { "FAIL" }
    ));
    for error in &result.errors {
        content.push_str(&format!("Error: {error}\n"));
    }
    content.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));
    content.push_str("Steps:\n");
    for step in &result.steps {
        content.push_str(&format!(
            "  {}. {} ({})\n",
            step.step_number,
            step.name,
            state_label(step.state)
        ));
        if let Some(error) = &step.error {
            content.push_str(&format!("     Error: {error}\n"));
        }
        if let Some(reason) = &step.skip_reason {
            content.push_str(&format!("     Skipped: {reason}\n"));
        }
        content.push_str(&format!("     Duration: {} ms\n", step.duration_ms));
    }
    content
}

fn load_tests(test_path: Option<String>) -> Result<Vec<TestDefinition>> {
    let tests = match test_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            let mut loader = TestLoader::new();
            loader.add_path(&path);
            loader
                .load_all_tests()
                .with_context(|| format!("Failed to load tests from {}", path.display()))?
        }
        None => TestLoader::discover().load_all_tests()?,
    };

    if tests.is_empty() {
        return Err(anyhow!("No tests found"));
    }
    Ok(tests)
}

fn select_tests(
    tests: Vec<TestDefinition>,
    filter: Option<&str>,
    tag: Option<&str>,
) -> Vec<TestDefinition> {
    let filter = filter.map(str::to_lowercase);
    tests
        .into_iter()
        .filter(|t| {
            filter
                .as_ref()
                .map_or(true, |f| t.name.to_lowercase().contains(f))
        })
        .filter(|t| tag.map_or(true, |tag| t.has_tag(tag)))
        .collect()
}

async fn run_all_tests(
    runner: &DefaultTestRunner,
    tests: Vec<TestDefinition>,
    verbose: bool,
    report_dir: Option<&Path>,
    report_format: ReportFormat,
) -> bool {
    let mut all_success = true;
    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;

    let total_tests = tests.len();
    info!("Running {} test(s)...", total_tests);

    for (idx, test) in tests.iter().enumerate() {
        info!("Test {}/{}: {}", idx + 1, total_tests, test.name);
        match runner.run(test).await {
            Ok(result) => {
                print_test_result(&result, verbose);

                if let Some(dir) = report_dir {
                    match save_test_report(&result, dir, report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }

                if result.success {
                    passed += 1;
                } else {
                    all_success = false;
                    failed += 1;
                }
            }
            Err(e) => {
                error!("\x1b[31mTest execution error: {} - {}\x1b[0m", test.name, e);
                all_success = false;
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    all_success
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let tests = select_tests(
        load_tests(args.test_path)?,
        args.test_filter.as_deref(),
        args.tag.as_deref(),
    );
    if tests.is_empty() {
        return Err(anyhow!("No tests matching the filter were found"));
    }

    let overrides: Variables = args.vars.into_iter().collect();
    let runner = DefaultTestRunner::new()
        .seed_environment(!args.no_env)
        .with_variables(overrides);

    let report_dir = args.report_dir.map(PathBuf::from);
    let success = run_all_tests(
        &runner,
        tests,
        args.verbose,
        report_dir.as_deref(),
        args.report_format,
    )
    .await;

    if !success {
        exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_reads_yaml_scalars() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".to_string(), Value::from(3i64)));
        assert_eq!(parse_var("on=true").unwrap().1, Value::from(true));
        assert_eq!(parse_var("s=hello world").unwrap().1, Value::from("hello world"));
        assert_eq!(parse_var("eq=a=b").unwrap().1, Value::from("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_select_tests_by_name_and_tag() {
        let tests = vec![
            TestDefinition::from_yaml("name: Login flow\ntags: [smoke]\nsteps: []\n").unwrap(),
            TestDefinition::from_yaml("name: Logout\nsteps: []\n").unwrap(),
        ];
        assert_eq!(select_tests(tests.clone(), Some("log"), None).len(), 2);
        assert_eq!(select_tests(tests.clone(), Some("LOGIN"), None).len(), 1);
        assert_eq!(select_tests(tests, None, Some("smoke"))[0].name, "Login flow");
    }

    #[test]
    fn test_text_report_lists_steps() {
        let result = TestResult {
            name: "demo".to_string(),
            success: false,
            errors: vec!["Step 1 (fail) failed: boom".to_string()],
            steps: vec![stepwise::StepRecord {
                step_number: "1".to_string(),
                name: "fail".to_string(),
                step_type: "fail".to_string(),
                state: StepState::Failed,
                error: Some("boom".to_string()),
                skip_reason: None,
                duration_ms: 0,
            }],
            duration_ms: 1,
        };
        let text = text_report(&result);
        assert!(text.contains("Status: FAIL"));
        assert!(text.contains("1. fail (FAIL)"));
        assert!(text.contains("Error: boom"));
    }
}
