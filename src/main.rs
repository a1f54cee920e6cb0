use clap::{Parser, Subcommand};
use code_runner::{
    judge::{judge, TestCase},
    CancellationToken, LimitOverrides, Orchestrator, RunnerConfig, Submission,
};
use serde::Serialize;
use std::{error::Error, fs, path::PathBuf};

#[derive(Parser)]
#[command(name = "code-runner", version, about = "Runs untrusted code in throwaway containers")]
struct Cli {
    /// JSON configuration file; built-in defaults are used when omitted
    #[arg(long, global = true, env = "CODE_RUNNER_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(clap::Args)]
struct Limits {
    #[arg(long)]
    wall_time_ms: Option<u64>,
    #[arg(long)]
    memory_bytes: Option<u64>,
    #[arg(long)]
    max_output_bytes: Option<usize>,
}

impl Limits {
    fn overrides(&self) -> Option<LimitOverrides> {
        if self.wall_time_ms.is_none() && self.memory_bytes.is_none() && self.max_output_bytes.is_none() {
            return None;
        }
        Some(LimitOverrides {
            wall_time_ms: self.wall_time_ms,
            memory_bytes: self.memory_bytes,
            max_output_bytes: self.max_output_bytes,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file and print the result as JSON
    Run {
        #[arg(long, short)]
        language: String,
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        /// File fed to the program on stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        #[command(flatten)]
        limits: Limits,
    },
    /// Run a submission described by a JSON file
    Submit {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Grade a source file against a JSON list of test cases
    Judge {
        #[arg(long, short)]
        language: String,
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        #[arg(long, value_name = "FILE")]
        cases: PathBuf,
        #[command(flatten)]
        limits: Limits,
    },
    /// List the supported languages
    Languages,
    /// Check the container runtime and pull every toolchain image
    Prepare,
    /// Remove sandboxes left behind by a previous process
    Reap,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::from_env()?,
    };
    let orchestrator = Orchestrator::new(&config)?;

    match cli.cmd {
        Commands::Run {
            language,
            source,
            stdin,
            limits,
        } => {
            let source = fs::read(&source)?;
            let stdin = match stdin {
                Some(path) => fs::read(&path)?,
                None => Vec::new(),
            };
            let mut submission = Submission::new(language, source, stdin);
            if let Some(overrides) = limits.overrides() {
                submission = submission.with_limits(overrides);
            }
            submit(&orchestrator, submission).await
        }
        Commands::Submit { file } => {
            let submission: Submission = serde_json::from_slice(&fs::read(&file)?)?;
            submit(&orchestrator, submission).await
        }
        Commands::Judge {
            language,
            source,
            cases,
            limits,
        } => {
            let source = fs::read_to_string(&source)?;
            let cases: Vec<TestCase> = serde_json::from_slice(&fs::read(&cases)?)?;
            let overrides = limits.overrides();
            let report = judge(&orchestrator, &language, &source, &cases, overrides.as_ref()).await?;
            print_json(&report)
        }
        Commands::Languages => {
            for language in orchestrator.languages() {
                println!("{}", language);
            }
            Ok(())
        }
        Commands::Prepare => Ok(orchestrator.prepare().await?),
        Commands::Reap => {
            let removed = orchestrator.reap_orphans().await?;
            println!("Removed {} orphaned sandboxes", removed);
            Ok(())
        }
    }
}

/// Ctrl-C cancels the running submission, which still reports a result.
async fn submit(orchestrator: &Orchestrator, submission: Submission) -> Result<(), Box<dyn Error>> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cancelling submission");
            trigger.cancel();
        }
    });

    let result = orchestrator.execute_with_cancel(submission, &cancel).await?;
    print_json(&result)
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
