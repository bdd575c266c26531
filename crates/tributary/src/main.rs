//! # Tributary CLI (`trib`)
//!
//! ## Usage
//!
//! ```bash
//! trib --config ./config/trib.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trib init` | Create the SQLite database and run schema migrations |
//! | `trib account add <id>` | Store tokens for a connected account |
//! | `trib account list` | List connected accounts |
//! | `trib sync <account>` | Sync an account's providers |
//! | `trib sync --all` | Sync every account concurrently |
//! | `trib runs <account>` | Show the run ledger |
//! | `trib items <account>` | List canonical items |
//! | `trib completions <shell>` | Print shell completions |

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use tributary::accounts::{self, NewAccount};
use tributary::models::{OAuthProvider, ProviderKind};
use tributary::progress::ProgressMode;
use tributary::sync_cmd::{self, SyncRequest};
use tributary::{config, items, logging, migrate, runs};

/// Tributary: incremental sync of mail, calendar, files and chat into one store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "trib",
    about = "Tributary: incremental multi-source synchronization engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trib.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the accounts, items and
    /// sync_runs tables. Safe to run repeatedly.
    Init,

    /// Manage connected accounts.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Sync one account, or every account with `--all`.
    ///
    /// Each provider resumes from the cursor of its last completed run.
    /// Exits with status 2 when an account must be reconnected.
    Sync {
        /// Account id to sync.
        account: Option<String>,

        /// Sync every account concurrently.
        #[arg(long)]
        all: bool,

        /// Provider to sync (repeatable). Defaults to every provider the
        /// account's OAuth provider supports.
        #[arg(long = "provider", value_parser = parse_provider)]
        providers: Vec<ProviderKind>,

        /// Print results as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show recent sync runs for an account.
    Runs {
        account: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// List canonical items for an account.
    Items {
        account: String,

        #[arg(long, value_parser = parse_provider)]
        provider: Option<ProviderKind>,

        /// Include soft-deleted items.
        #[arg(long)]
        include_deleted: bool,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Store (or replace) an account and its OAuth tokens.
    Add {
        /// Account id used by every other command.
        id: String,

        /// OAuth provider that issued the tokens: `google` or `slack`.
        #[arg(long = "oauth", value_parser = parse_oauth_provider)]
        oauth_provider: OAuthProvider,

        #[arg(long)]
        label: String,

        /// Owning user.
        #[arg(long, default_value = "local")]
        user: String,

        #[arg(long)]
        access_token: String,

        #[arg(long)]
        refresh_token: Option<String>,

        /// Seconds until the access token expires.
        #[arg(long)]
        expires_in: Option<i64>,
    },

    /// List connected accounts.
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn parse_provider(s: &str) -> Result<ProviderKind, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_oauth_provider(s: &str) -> Result<OAuthProvider, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "trib", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Account { action } => match action {
            AccountAction::Add {
                id,
                oauth_provider,
                label,
                user,
                access_token,
                refresh_token,
                expires_in,
            } => {
                accounts::add_account(
                    &cfg,
                    NewAccount {
                        id,
                        user_id: user,
                        oauth_provider,
                        label,
                        access_token,
                        refresh_token,
                        expires_in,
                    },
                )
                .await?;
            }
            AccountAction::List => accounts::list_accounts(&cfg).await?,
        },
        Commands::Sync {
            account,
            all,
            providers,
            json,
            progress,
        } => {
            let progress = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let code = sync_cmd::run_sync(
                &cfg,
                SyncRequest {
                    account,
                    all,
                    providers,
                    json,
                    progress,
                },
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Runs {
            account,
            limit,
            json,
        } => runs::list_runs(&cfg, &account, limit, json).await?,
        Commands::Items {
            account,
            provider,
            include_deleted,
            limit,
            json,
        } => {
            let query = items::item_query(provider, include_deleted, limit);
            items::list_items(&cfg, &account, query, json).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}
