//! # Pagewise CLI (`pagewise`)
//!
//! The `pagewise` binary runs the HTTP API and exposes operator commands
//! for the database, the embedding cache, stored provider keys, and pages.
//!
//! ## Usage
//!
//! ```bash
//! pagewise --config ./config/pagewise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pagewise init` | Write a default config if missing and create the schema |
//! | `pagewise serve` | Start the HTTP API |
//! | `pagewise ask "<question>" --user <id>` | Ask a question from the terminal |
//! | `pagewise embed pending` | Backfill missing or stale page embeddings |
//! | `pagewise embed rebuild` | Drop and regenerate all page embeddings |
//! | `pagewise reconcile` | Fail requests stuck in `pending` |
//! | `pagewise keys set/list/prefer/check` | Manage a user's provider keys |
//! | `pagewise pages add/grant` | Import a page, share it with another user |
//! | `pagewise completions <shell>` | Print shell completions |
//!
//! Set `RUST_LOG` to change log verbosity (default `info`).

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pagewise::commands;
use pagewise::models::ProviderId;
use pagewise::server;
use pagewise::settings::LiveSettings;

/// Pagewise: answer questions from your own pages with your own AI key.
#[derive(Parser)]
#[command(
    name = "pagewise",
    about = "Pagewise: grounded question answering over your pages",
    version,
    long_about = "Pagewise answers questions from the pages a user can read. It picks pages \
    explicitly or by embedding similarity, builds an injection-resistant prompt, and calls the \
    user's preferred AI provider with the user's own key."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pagewise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config if none exists and create the database schema.
    ///
    /// Idempotent.
    Init,

    /// Start the HTTP API.
    Serve,

    /// Ask a question.
    Ask {
        /// The question.
        query: String,

        /// User asking the question.
        #[arg(long)]
        user: String,

        /// Ground the answer on these pages (external ids) instead of
        /// semantic retrieval. Repeatable.
        #[arg(long = "page")]
        pages: Vec<String>,
    },

    /// Manage the page embedding cache.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Fail ask requests left pending past `ask.pending_timeout_secs`.
    Reconcile,

    /// Manage per-user provider keys.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Manage pages.
    Pages {
        #[command(subcommand)]
        action: PagesAction,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed pages with no cached vector, or whose content or model changed.
    Pending {
        /// Maximum number of pages to embed.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete every cached vector and embed the whole corpus again.
    Rebuild,
}

#[derive(Subcommand)]
enum KeysAction {
    /// Store (or replace) a user's key for one provider.
    Set {
        #[arg(long)]
        user: String,
        #[arg(long, value_parser = parse_provider)]
        provider: ProviderId,
        #[arg(long)]
        secret: String,
    },
    /// List a user's keys and their validation state.
    List {
        #[arg(long)]
        user: String,
    },
    /// Set a user's provider preference order.
    Prefer {
        #[arg(long)]
        user: String,
        /// Providers, most preferred first.
        #[arg(required = true, value_parser = parse_provider)]
        providers: Vec<ProviderId>,
    },
    /// Validate every stored key against its vendor now.
    Check {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum PagesAction {
    /// Import a page from a text file.
    Add {
        /// Owner of the new page.
        #[arg(long)]
        user: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Give another user read access to a page.
    Grant {
        /// Page external id.
        #[arg(long)]
        page: String,
        /// Current owner (or a user who can already read the page).
        #[arg(long)]
        owner: String,
        /// User receiving access.
        #[arg(long)]
        user: String,
    },
}

fn parse_provider(s: &str) -> Result<ProviderId, String> {
    s.parse::<ProviderId>().map_err(|e| e.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,pagewise=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.config.as_path();
    match cli.command {
        Commands::Init => commands::run_init(config).await?,
        Commands::Serve => {
            let settings = Arc::new(LiveSettings::load(config)?);
            server::run_server(settings).await?;
        }
        Commands::Ask { query, user, pages } => {
            commands::run_ask(config, &user, &query, &pages).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => commands::run_embed_pending(config, limit).await?,
            EmbedAction::Rebuild => commands::run_embed_rebuild(config).await?,
        },
        Commands::Reconcile => commands::run_reconcile(config).await?,
        Commands::Keys { action } => match action {
            KeysAction::Set {
                user,
                provider,
                secret,
            } => commands::run_keys_set(config, &user, provider, &secret).await?,
            KeysAction::List { user } => commands::run_keys_list(config, &user).await?,
            KeysAction::Prefer { user, providers } => {
                commands::run_keys_prefer(config, &user, &providers).await?
            }
            KeysAction::Check { user } => commands::run_keys_check(config, &user).await?,
        },
        Commands::Pages { action } => match action {
            PagesAction::Add { user, title, file } => {
                commands::run_pages_add(config, &user, &title, &file).await?
            }
            PagesAction::Grant { page, owner, user } => {
                commands::run_pages_grant(config, &owner, &page, &user).await?
            }
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pagewise", &mut std::io::stdout());
        }
    }

    Ok(())
}
