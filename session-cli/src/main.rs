mod cli;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use session_core::{
    ApiResponse, LoginRequest, SessionConfig, SessionError, SessionManager, SessionStatus,
};
use tracing::{debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "session_core=info,sessionctl=info";
const DEFAULT_STATE_FILE: &str = ".sessionctl/session.json";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(exit_code(&e));
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    debug!(base_url = %config.base_url, state_file = ?config.state_file, "Loaded configuration");

    let manager = SessionManager::builder(config)
        .build()
        .context("failed to set up session")?;

    match args.command {
        Commands::Login { username, password } => {
            let outcome = manager.login(LoginRequest::new(username, password)).await?;
            println!(
                "Logged in as {} (id {})",
                outcome.user.username, outcome.user.id
            );
            if let Some(message) = outcome.message {
                println!("{}", message);
            }
        }
        Commands::Logout => {
            manager.logout().await;
            println!("Logged out");
        }
        Commands::Status => match manager.initialize().await {
            SessionStatus::LoggedIn(user) => {
                println!("{}", serde_json::to_string_pretty(&user)?);
            }
            SessionStatus::LoggedOut => println!("Not logged in"),
        },
        Commands::Refresh => {
            if manager.credential().is_none() {
                anyhow::bail!("not logged in");
            }
            manager.refresh_now().await?;
            println!("Access token renewed");
        }
        Commands::Get { path } => {
            let response = manager.get(&path).await?;
            print_response(&response)?;
        }
        Commands::Post { path, data } => {
            let body: Value = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data is not valid JSON")?,
                None => Value::Object(Default::default()),
            };
            let response = manager.post(&path, &body).await?;
            print_response(&response)?;
        }
    }

    manager.shutdown();
    Ok(())
}

/// Environment first, then command-line overrides.
fn build_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::from_env().context("invalid SESSION_* environment")?;

    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(secs) = args.timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    config.state_file = Some(match (&args.state_file, config.state_file.take()) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => path,
        (None, None) => PathBuf::from(DEFAULT_STATE_FILE),
    });

    config.validate()?;
    Ok(config)
}

fn print_response(response: &ApiResponse) -> anyhow::Result<()> {
    match &response.body {
        Value::String(text) => println!("{}", text),
        Value::Null => println!("{}", response.status),
        body => println!("{}", serde_json::to_string_pretty(body)?),
    }
    Ok(())
}

/// 2 for anything that needs a fresh login, 1 otherwise.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<SessionError>() {
        Some(e) if e.requires_reauth() => 2,
        _ => 1,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("session_core=debug,sessionctl=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
