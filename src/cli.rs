use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local credential vault and OAuth session manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (defaults to ~/.kitvault.toml when present)
    #[arg(short, long, env = "KITVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in through the browser and store the session
    Login {
        /// Name the session is stored under
        username: String,

        /// Seconds to wait for the browser redirect
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the current user and session
    Status,

    /// Refresh the current user's access token now
    Refresh,

    /// Remove a user's session (defaults to the current user)
    Logout {
        username: Option<String>,
    },

    /// Store a named secret in the vault (read from stdin when --value is omitted)
    SetCredential {
        name: String,

        #[arg(long)]
        value: Option<String>,
    },

    /// Generate a new encryption key and re-encrypt the vault
    RotateKey,
}
