//! CLI command definitions for interp-pool.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::pool::config::{
    locate_binary, ENV_ARGS, ENV_BIN, ENV_DIALECT, ENV_HANDSHAKE_TIMEOUT, ENV_PARALLELISM,
    ENV_WORKDIR,
};
use crate::pool::{DialectKind, JobOutput, PoolConfig, PoolStats, WorkerPool};

/// Pool of long-lived interpreter processes.
#[derive(Parser)]
#[command(name = "interp-pool")]
#[command(about = "Evaluate scripts on a pool of long-lived interpreter processes")]
#[command(version)]
#[command(
    long_about = "interp-pool keeps N interpreter processes alive and spreads scripts across them.\n\nExample usage:\n  interp-pool --bin R --parallel 4 run 'print(1+1)' 'print(2+2)'\n  interp-pool --bin /bin/sh --dialect sh broadcast 'echo hello'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Options shared by every subcommand that starts a pool.
#[derive(clap::Args, Debug, Clone)]
pub struct PoolArgs {
    /// Interpreter binary: a path, or a name looked up on PATH.
    #[arg(short, long, env = ENV_BIN, default_value = "R", global = true)]
    pub bin: String,

    /// Number of instances (default: number of CPU cores).
    #[arg(short, long, env = ENV_PARALLELISM, global = true)]
    pub parallel: Option<usize>,

    /// Interpreter dialect (r, sh).
    #[arg(short, long, env = ENV_DIALECT, default_value = "r", global = true)]
    pub dialect: DialectKind,

    /// Whitespace-separated launch arguments replacing the dialect's defaults.
    #[arg(long, env = ENV_ARGS, allow_hyphen_values = true, global = true)]
    pub interpreter_args: Option<String>,

    /// Working directory of the instances.
    #[arg(short, long, env = ENV_WORKDIR, global = true)]
    pub workdir: Option<PathBuf>,

    /// Seconds to wait for every instance to become ready.
    #[arg(long, env = ENV_HANDSHAKE_TIMEOUT, global = true)]
    pub handshake_timeout: Option<u64>,
}

impl PoolArgs {
    /// Builds the pool configuration these options describe.
    pub fn to_config(&self) -> PoolConfig {
        let binary = locate_binary(&self.bin).unwrap_or_else(|| PathBuf::from(&self.bin));
        let mut config = PoolConfig::new(binary)
            .with_parallelism(self.parallel.unwrap_or(0))
            .with_dialect(self.dialect);

        if let Some(args) = &self.interpreter_args {
            config = config.with_args(args.split_whitespace().map(String::from).collect());
        }
        if let Some(dir) = &self.workdir {
            config = config.with_working_dir(dir);
        }
        if let Some(secs) = self.handshake_timeout {
            config = config.with_handshake_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Evaluate scripts, spreading them over the pool.
    #[command(alias = "eval")]
    Run(RunArgs),

    /// Run one script on every instance.
    #[command(alias = "init")]
    Broadcast(BroadcastArgs),

    /// Start the pool, report readiness and stop it again.
    Status(StatusArgs),
}

/// Arguments for `interp-pool run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Scripts to evaluate, one job each.
    pub scripts: Vec<String>,

    /// File with one script per line. Blank lines and lines starting with
    /// `#` are skipped.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Output JSON to stdout instead of plain script output.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `interp-pool broadcast`.
#[derive(Parser, Debug)]
pub struct BroadcastArgs {
    /// Script to run on every instance.
    pub script: String,

    /// Output JSON to stdout instead of plain script output.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `interp-pool status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_scripts_command(&cli.pool, args).await,
        Commands::Broadcast(args) => run_broadcast_command(&cli.pool, args).await,
        Commands::Status(args) => run_status_command(&cli.pool, args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// One line of `run --json` output.
#[derive(Debug, Serialize)]
struct ScriptResult<'a> {
    script: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ScriptResult<'_> {
    fn failed(&self) -> bool {
        self.output.as_ref().map_or(true, |o| o.failed)
    }
}

async fn start_pool(args: &PoolArgs) -> anyhow::Result<WorkerPool> {
    let config = args.to_config();
    let mut pool = WorkerPool::with_config(config).context("Failed to create interpreter pool")?;
    pool.start().await.context("Failed to start interpreter pool")?;
    Ok(pool)
}

async fn run_scripts_command(pool_args: &PoolArgs, args: RunArgs) -> anyhow::Result<()> {
    let mut scripts = args.scripts;
    if let Some(path) = &args.file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read script file {}", path.display()))?;
        scripts.extend(read_script_lines(&content));
    }
    if scripts.is_empty() {
        anyhow::bail!("No scripts to run, pass them as arguments or with --file");
    }

    let mut pool = start_pool(pool_args).await?;
    info!(scripts = scripts.len(), instances = pool.parallelism(), "Running scripts");

    let outcomes = join_all(scripts.iter().map(|script| pool.eval(script.as_str()))).await;
    let results: Vec<ScriptResult<'_>> = scripts
        .iter()
        .zip(outcomes)
        .map(|(script, outcome)| match outcome {
            Ok(output) => ScriptResult {
                script,
                output: Some(output),
                error: None,
            },
            Err(e) => ScriptResult {
                script,
                output: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    pool.stop().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            print_result(result);
        }
    }

    let failed = results.iter().filter(|r| r.failed()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} scripts failed", failed, results.len());
    }
    Ok(())
}

async fn run_broadcast_command(pool_args: &PoolArgs, args: BroadcastArgs) -> anyhow::Result<()> {
    let mut pool = start_pool(pool_args).await?;
    let outcome = pool.broadcast(args.script.as_str()).await;
    pool.stop().await?;
    let outputs = outcome.context("Broadcast did not complete")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else {
        for output in &outputs {
            for line in output.log.lines() {
                println!("[{}] {}", output.instance, line);
            }
            for line in output.error.lines() {
                eprintln!("[{}] {}", output.instance, line);
            }
        }
    }

    let failed = outputs.iter().filter(|o| o.failed).count();
    if failed > 0 {
        anyhow::bail!("Script failed on {} of {} instances", failed, outputs.len());
    }
    Ok(())
}

async fn run_status_command(pool_args: &PoolArgs, args: StatusArgs) -> anyhow::Result<()> {
    let mut pool = start_pool(pool_args).await?;
    let stats: PoolStats = pool.stats();
    let binary = pool.binary().display().to_string();
    pool.stop().await?;

    if args.json {
        let status = serde_json::json!({
            "binary": binary,
            "dialect": pool_args.dialect,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Binary:    {}", binary);
        println!("Dialect:   {}", pool_args.dialect);
        println!("Instances: {}", stats.instances);
        println!("Ready:     {}", stats.ready);
    }

    if stats.ready < stats.instances {
        warn!(ready = stats.ready, instances = stats.instances, "Not every instance became ready");
    }
    Ok(())
}

fn print_result(result: &ScriptResult<'_>) {
    match (&result.output, &result.error) {
        (Some(output), _) => {
            print!("{}", output.log);
            if !output.error.is_empty() {
                eprint!("{}", output.error);
            }
        }
        (None, Some(error)) => eprintln!("{}: {}", result.script, error),
        (None, None) => {}
    }
}

/// Non-empty, non-comment lines of a script file.
fn read_script_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_pool_options() {
        let cli = Cli::try_parse_from([
            "interp-pool",
            "--bin",
            "/bin/sh",
            "--dialect",
            "sh",
            "--parallel",
            "3",
            "run",
            "echo 1",
            "echo 2",
            "--json",
        ])
        .expect("arguments should parse");

        assert_eq!(cli.pool.bin, "/bin/sh");
        assert_eq!(cli.pool.dialect, DialectKind::Sh);
        assert_eq!(cli.pool.parallel, Some(3));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.scripts, vec!["echo 1", "echo 2"]);
                assert!(args.json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_pool_args_to_config() {
        let cli = Cli::try_parse_from([
            "interp-pool",
            "broadcast",
            "echo hi",
            "--bin",
            "sh",
            "--dialect",
            "sh",
            "--interpreter-args",
            "-s -u",
            "--workdir",
            "/tmp",
            "--handshake-timeout",
            "5",
        ])
        .expect("arguments should parse");

        let config = cli.pool.to_config();
        assert!(config.binary.is_absolute());
        assert_eq!(config.launch_args(), vec!["-s", "-u"]);
        assert_eq!(config.working_dir, PathBuf::from("/tmp"));
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unknown_dialect_is_rejected() {
        let result = Cli::try_parse_from(["interp-pool", "--dialect", "cobol", "status"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_script_lines() {
        let content = "print(1)\n\n  # comment\n  print(2)  \n";
        let lines: Vec<String> = read_script_lines(content).collect();
        assert_eq!(lines, vec!["print(1)", "print(2)"]);
    }

    #[test]
    fn test_script_result_failed() {
        let err = ScriptResult {
            script: "x",
            output: None,
            error: Some("abandoned".to_string()),
        };
        assert!(err.failed());
    }
}
