//! askpass-relay - Run a git command with terminal-free credential prompts.
//!
//! Runs the given command in its own process group with git and ssh pointed
//! at `askpass-client`, answers their prompts on this process's terminal
//! (or refuses them with `--deny`), and makes sure nothing of the command's
//! process tree outlives it.
//!
//! # Usage
//!
//! ```bash
//! # Fetch with prompts answered on the terminal
//! askpass-relay run -- git fetch origin
//!
//! # Never prompt, give up after 30 seconds
//! askpass-relay run --deny --timeout 30 -- git ls-remote https://example.com/repo.git
//!
//! # Show how a prompt would be classified
//! askpass-relay classify "Password for 'https://example.com':"
//! ```

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use askpass_relay::{DenyAll, InvocationOutput, LaunchRequest, Spawner, TtyCallback};
use askpass_relay_core::{classify, CredentialCallback, RelayConfig};

use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Terminal-free credential prompting for git subprocesses.
#[derive(Parser)]
#[command(name = "askpass-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/askpass-relay/config.toml]
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command with the credential relay attached
    Run {
        /// Kill the command after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Refuse a prompt after this many seconds without an answer
        #[arg(long, value_name = "SECS")]
        prompt_timeout: Option<u64>,

        /// Refuse every prompt instead of asking on the terminal
        #[arg(long)]
        deny: bool,

        /// Run the command in this directory
        #[arg(short = 'C', long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// The command and its arguments
        #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
        command: Vec<OsString>,
    },

    /// Show how a prompt would be classified
    Classify {
        /// The prompt text
        prompt: String,
    },
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Check if running under systemd (JOURNAL_STREAM is set when stdout/stderr go to journal)
    if std::env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer)
                .with(filter)
                .init();
            return;
        }
    }

    // stdout carries the command's output, keep logs on stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RelayConfig> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from specified path");
            RelayConfig::load_from(path).context("Failed to load configuration")
        }
        None => {
            let config = RelayConfig::load().context("Failed to load configuration")?;
            match RelayConfig::default_path() {
                Some(path) if path.exists() => {
                    debug!(path = %path.display(), "Loaded configuration")
                }
                _ => debug!("No config file found, using defaults"),
            }
            Ok(config)
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };
    setup_logging(log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(dispatch(cli.command, cli.config));
    // A terminal prompt abandoned after its timeout is still blocked reading
    // stdin on a blocking thread. Don't wait for it.
    runtime.shutdown_background();
    result
}

async fn dispatch(command: Commands, config: Option<PathBuf>) -> Result<ExitCode> {
    match command {
        Commands::Run {
            timeout,
            prompt_timeout,
            deny,
            dir,
            command,
        } => {
            let config = load_config(config.as_ref())?;

            let mut command = command.into_iter();
            let program = command.next().context("No command given")?;
            let mut request = LaunchRequest::new(program).args(command);
            if let Some(secs) = timeout {
                request = request.timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = prompt_timeout {
                request = request.prompt_timeout(Duration::from_secs(secs));
            }
            if let Some(dir) = dir {
                request = request.current_dir(dir);
            }

            let callback: Arc<dyn CredentialCallback> = if deny {
                Arc::new(DenyAll)
            } else {
                Arc::new(TtyCallback::new())
            };

            run(config, request, callback).await
        }
        Commands::Classify { prompt } => {
            let classification = classify(&prompt);
            println!("kind:       {}", classification.kind);
            println!(
                "target:     {}",
                classification.target.as_deref().unwrap_or("-")
            );
            println!("confidence: {:?}", classification.confidence);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run one invocation, mirroring its output and exit status.
async fn run(
    config: RelayConfig,
    request: LaunchRequest,
    callback: Arc<dyn CredentialCallback>,
) -> Result<ExitCode> {
    let spawner = Spawner::new(config).context("Failed to set up relay")?;
    let handle = spawner
        .launch(request, callback)
        .await
        .context("Failed to start command")?;

    // Ctrl-C cancels the invocation instead of killing us with the tree
    // still running.
    let registry = Arc::clone(spawner.registry());
    let id = handle.id().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling command");
            registry.cancel(&id);
        }
    });

    let result = handle.wait().await;
    interrupt.abort();

    if let Err(e) = spawner.registry().sweep().await {
        warn!(error = %e, "Failed to clean up leftover processes");
    }

    let output = result.context("Command failed")?;
    std::io::stdout().write_all(&output.stdout)?;
    std::io::stderr().write_all(&output.stderr)?;

    Ok(exit_code(&output))
}

/// Map the invocation's outcome to our own exit code, shell style.
fn exit_code(output: &InvocationOutput) -> ExitCode {
    if output.cancelled {
        return ExitCode::from(130);
    }
    if output.timed_out {
        eprintln!("askpass-relay: command timed out");
        return ExitCode::from(124);
    }
    if let Some(code) = output.code() {
        return ExitCode::from(code as u8);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = output.status.signal() {
            return ExitCode::from(128u8.wrapping_add(signal as u8));
        }
    }

    ExitCode::FAILURE
}
