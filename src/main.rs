//! codebox - code execution backend with HTTP API.
//!
//! Usage:
//!   codebox serve [--port 8700]                    # Start HTTP server
//!   codebox run --lang py script.py [-- args...]   # Run one file and print the result

use clap::{Parser, Subcommand};
use codebox::runner::{ExecRequest, Outcome};
use codebox::{http_server, AppState, Config};
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Session-scoped code execution backend")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "CODE_PORT", default_value = "8700")]
        port: u16,

        #[command(flatten)]
        config: Config,
    },
    /// Execute a local source file once and print its output
    Run {
        /// Language tag (py, js, c, ...)
        #[arg(long)]
        lang: String,

        /// Session to run in; a fresh one is created when omitted
        #[arg(long)]
        session: Option<String>,

        /// Source file, or `-` for stdin
        file: PathBuf,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,

        #[command(flatten)]
        config: Config,
    },
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Serve { port, config } => {
            init_tracing("info");
            if config.api_key == codebox::config::DEFAULT_API_KEY {
                warn!("Using the default API key; set CODE_API_KEY in production");
            }
            tracing::info!(
                api_key = %format!("{}...", config.api_key_hint()),
                sessions_dir = %config.sessions_dir.display(),
                uploads_dir = %config.uploads_dir.display(),
                timeout_ms = config.timeout_ms,
                languages = %codebox::language::supported_tags().collect::<Vec<_>>().join(","),
                "Code execution service starting"
            );
            let state = AppState::new(config);
            if let Err(e) = state.runner.workspaces().init().await {
                error!(error = %e, "Cannot create storage roots");
                exit(1);
            }
            if let Err(e) = http_server::run_server(port, state).await {
                error!(error = %e, "Server failed");
                exit(1);
            }
        }
        Commands::Run {
            lang,
            session,
            file,
            args,
            config,
        } => {
            init_tracing("warn");
            let code = match read_source(&file).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            let state = AppState::new(config);
            if let Err(e) = state.runner.workspaces().init().await {
                eprintln!("Error: {}", e);
                exit(1);
            }
            // Re-quote so the runner's word splitting yields the same argv.
            let args = shlex::try_join(args.iter().map(String::as_str)).ok();
            let request = ExecRequest {
                code,
                lang,
                args: args.filter(|a| !a.is_empty()),
                session_id: session,
                files: Vec::new(),
            };
            match state.runner.execute(request).await {
                Ok(exec) => {
                    let result = exec.result;
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                    if let Some(message) = &result.message {
                        eprintln!("[{}] {}", exec.session_id, message);
                    }
                    for name in &exec.artifacts {
                        eprintln!("[{}] artifact: {}", exec.session_id, name);
                    }
                    let code = match result.outcome {
                        Outcome::TimedOut => 124,
                        _ => result.exit_code.unwrap_or(1),
                    };
                    exit(code);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}

async fn read_source(file: &Path) -> std::io::Result<String> {
    if file.as_os_str() == "-" {
        use tokio::io::AsyncReadExt;
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        Ok(code)
    } else {
        tokio::fs::read_to_string(file).await
    }
}
