mod config;
mod error;

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use policy::{Capability, Policy, all_capabilities, blocked_cause};
use runtime::Runtime;
use runtime::http;
use runtime::memory::Unsafe;
use runtime::naming::InitialContext;
use runtime::process::ProcessBuilder;
use runtime::registry::LocateRegistry;
use runtime::serial::ObjectOutputStream;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::{Config, POLICY_ENV, resolve_policy};
use error::Result;

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(name = "aegis")]
#[command(about = "Block dangerous runtime capabilities", long_about = None)]
#[command(version)]
struct Cli {
    /// Policy string, e.g. "unblock=serialization,process"
    #[arg(long, global = true)]
    policy: Option<String>,

    /// Config file (default: ./aegis.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which capabilities the policy blocks
    Policy,
    /// List guarded entry points
    Entries {
        /// Only this capability
        capability: Option<String>,
    },
    /// Install the agent and try one entry point per capability
    Probe,
    /// Install the agent and run a command through the guarded process surface
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let config = Config::discover(cli.config.as_deref(), &cwd)?;
    init_tracing(config.log.as_deref());

    let env = std::env::var(POLICY_ENV).ok();
    let policy = resolve_policy(cli.policy.as_deref(), env.as_deref(), &config);
    debug!(policy = %policy, "policy resolved");

    match cli.command {
        Commands::Policy => cmd_policy(&policy),
        Commands::Entries { capability } => cmd_entries(capability.as_deref()),
        Commands::Probe => cmd_probe(&policy),
        Commands::Exec { command } => cmd_exec(&policy, command),
    }
}

/// `AEGIS_LOG`, then `RUST_LOG`, then the config file, then `warn`.
fn init_tracing(config_filter: Option<&str>) {
    let filter = std::env::var("AEGIS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .or_else(|| config_filter.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn cmd_policy(config: &str) -> Result<ExitCode> {
    let policy = Policy::parse(config);
    let allowed: Vec<&str> = all_capabilities()
        .iter()
        .filter(|cap| !policy.is_blocked(**cap))
        .map(|cap| cap.as_str())
        .collect();
    println!("blocked: {}", policy.blocked());
    println!("allowed: [{}]", allowed.join(", "));
    Ok(ExitCode::SUCCESS)
}

fn cmd_entries(filter: Option<&str>) -> Result<ExitCode> {
    let capabilities: Vec<Capability> = match filter {
        Some(name) => vec![name.parse()?],
        None => all_capabilities().to_vec(),
    };

    println!("{:<14}  {:<16}  ENTRY POINT", "CAPABILITY", "ERROR");
    println!("{}", "-".repeat(72));
    for cap in capabilities {
        for entry in cap.entry_points() {
            println!("{:<14}  {:<16}  {entry}", cap.as_str(), cap.error_kind().to_string());
        }
    }
    Ok(ExitCode::SUCCESS)
}

enum Outcome {
    Allowed,
    Blocked(&'static str),
    Failed(String),
}

fn outcome<T, E: StdError + 'static>(result: std::result::Result<T, E>) -> Outcome {
    match result {
        Ok(_) => Outcome::Allowed,
        Err(e) => match blocked_cause(&e) {
            Some(blocked) => Outcome::Blocked(blocked.message()),
            None => Outcome::Failed(e.to_string()),
        },
    }
}

/// Exercise one entry point of `cap` without side effects.
fn probe(rt: &Runtime, cap: Capability) -> Outcome {
    match cap {
        Capability::Jndi => match InitialContext::new(rt) {
            Ok(ctx) => match outcome(ctx.lookup("aegis/probe")) {
                // The name is never bound; reaching the namespace is enough.
                Outcome::Failed(_) => Outcome::Allowed,
                other => other,
            },
            Err(e) => Outcome::Failed(e.to_string()),
        },
        Capability::Rmi => outcome(LocateRegistry::new(rt).and_then(|l| l.get_registry())),
        Capability::Process => outcome(ProcessBuilder::start_pipeline(rt, &[])),
        Capability::HttpServer => outcome(http::provider(rt)),
        Capability::Serialization => outcome(ObjectOutputStream::new(rt, io::sink())),
        Capability::Unsafe => outcome(Unsafe::get_unsafe(rt)),
    }
}

fn cmd_probe(config: &str) -> Result<ExitCode> {
    let agent = agent::install_global(config)?;
    let rt = Runtime::global();

    println!("{:<14}  {:<8}  DETAIL", "CAPABILITY", "STATUS");
    println!("{}", "-".repeat(72));
    let mut mismatches = 0;
    for cap in all_capabilities() {
        let (status, detail) = match probe(rt, *cap) {
            Outcome::Allowed => ("ALLOWED", String::new()),
            Outcome::Blocked(message) => ("BLOCKED", message.to_string()),
            Outcome::Failed(error) => ("ERROR", error),
        };
        let expected = if agent.policy().is_blocked(*cap) { "BLOCKED" } else { "ALLOWED" };
        if status != expected {
            mismatches += 1;
        }
        println!("{:<14}  {status:<8}  {detail}", cap.as_str());
    }

    if mismatches > 0 {
        eprintln!("{mismatches} capabilities did not match the policy");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_exec(config: &str, command: Vec<String>) -> Result<ExitCode> {
    agent::install_global(config)?;
    let rt = Runtime::global();

    let mut child = ProcessBuilder::new(rt, command)?.start()?;
    let status = child.wait()?;
    debug!(%status, "command finished");
    Ok(match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_all(config: &str) -> Vec<(Capability, bool)> {
        let rt = Runtime::new();
        agent::Agent::install(&rt, config).unwrap();
        all_capabilities()
            .iter()
            .map(|cap| {
                let blocked = matches!(probe(&rt, *cap), Outcome::Blocked(_));
                (*cap, blocked)
            })
            .collect()
    }

    #[test]
    fn test_probe_matches_policy() {
        for config in ["", "block=jndi", "unblock=serialization,process", "block="] {
            let policy = Policy::parse(config);
            for (cap, blocked) in probe_all(config) {
                assert_eq!(blocked, policy.is_blocked(cap), "{cap} under {config:?}");
            }
        }
    }

    #[test]
    fn test_cli_parses_exec_arguments() {
        let cli = Cli::try_parse_from(["aegis", "--policy", "block=jndi", "exec", "--", "ls", "-la"]).unwrap();
        assert_eq!(cli.policy.as_deref(), Some("block=jndi"));
        match cli.command {
            Commands::Exec { command } => assert_eq!(command, vec!["ls", "-la"]),
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_cli_requires_exec_command() {
        assert!(Cli::try_parse_from(["aegis", "exec"]).is_err());
    }

    #[test]
    fn test_entries_rejects_unknown_capability() {
        assert!(cmd_entries(Some("telnet")).is_err());
        assert!(cmd_entries(Some("RMI")).is_ok());
    }
}
