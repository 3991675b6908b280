use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sessionctl")]
#[command(about = "Log in to an API backend and make authenticated calls with automatic token refresh")]
#[command(version)]
pub struct Args {
    /// Backend base URL (defaults to SESSION_API_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// File holding the persisted session (defaults to SESSION_STATE_FILE, then ./.sessionctl/session.json)
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Request timeout in seconds (defaults to SESSION_REQUEST_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Exchange username and password for a session
    Login {
        #[arg(short, long)]
        username: String,

        /// Password; read from SESSIONCTL_PASSWORD when omitted
        #[arg(short, long, env = "SESSIONCTL_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// End the current session
    Logout,

    /// Verify the persisted session with the backend
    Status,

    /// Renew the access token now
    Refresh,

    /// Authenticated GET
    Get {
        /// Path relative to the base URL, e.g. /api/resume/list
        path: String,
    },

    /// Authenticated POST with an optional JSON body
    Post {
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },
}
