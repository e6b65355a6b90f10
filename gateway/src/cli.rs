use clap::{Parser, Subcommand};

/// GemLink — Gemini gateway over a pool of Code-Assist accounts
#[derive(Parser)]
#[command(name = "gemlink", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage enrolled accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// List enrolled accounts with status and counters
    List,
}
