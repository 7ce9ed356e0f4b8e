use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::Url;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ojc", version, about = "Online-judge hidden test-case extraction client")]
pub struct Cli {
    /// Judge base URL; overrides the config file.
    #[arg(long, env = "OJC_BASE_URL")]
    pub base_url: Option<Url>,

    /// Path of the JSON state store.
    #[arg(long, env = "OJC_STORE", default_value = "ojc-store.json")]
    pub store: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Extract the hidden test cases of a problem.
    ///
    /// Reuses the in-flight crawl task for the problem if one exists;
    /// CTRL+C requests a cooperative pause (press twice to exit immediately).
    Crawl {
        /// Problem display id.
        #[arg(long)]
        problem: String,
        /// Name of the probe template set to submit.
        #[arg(long)]
        source: String,
        /// File prepended to every rendered probe.
        #[arg(long)]
        header_file: Option<PathBuf>,
        /// File appended to every rendered probe.
        #[arg(long)]
        footer_file: Option<PathBuf>,
    },

    /// Register a batch of fresh judge accounts.
    CreateAccounts {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        quantity: u32,
    },

    /// Requeue a paused or failed task and run it again.
    Resume {
        task_id: Uuid,
        /// JSON checkpoint replacing the stored one.
        #[arg(long)]
        checkpoint_file: Option<PathBuf>,
    },

    /// Print a task row as JSON.
    Status { task_id: Uuid },

    /// Load problems and template sets from a JSON document.
    Import { file: PathBuf },

    /// Write a default config file if none exists and print its path.
    InitConfig,

    /// Account administration.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum AccountsCommand {
    /// List accounts with status and last use.
    List,
    /// Permanently disable an account.
    Disable { username: String },
}
