//! CLI command implementations.
//!
//! Each `run_*` function backs one `pagewise` subcommand. Output goes to
//! stdout; logs go to stderr through `tracing`.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pagewise_core::models::{ProviderCredential, ProviderId};

use crate::app::Services;
use crate::config;
use crate::embed_worker::EmbedWorker;
use crate::import::{import_pages, ImportItem};
use crate::migrate;
use crate::providers;
use crate::reconcile;
use crate::settings::LiveSettings;

/// Written by `pagewise init` when no config file exists yet.
pub const DEFAULT_CONFIG: &str = r#"# Pagewise configuration. Every key is optional.

[db]
path = "./data/pagewise.sqlite"

[server]
bind = "127.0.0.1:7341"
reload_interval_secs = 5

[embedding]
provider = "local"   # local | openai | fastembed
dims = 1536
batch_size = 32
sweep_interval_secs = 300

[retrieval]
top_k = 5
max_pages = 8
min_similarity = 0.25

[providers]
timeout_secs = 60
max_output_tokens = 1024

[keys]
revalidate_after_secs = 86400

[ask]
pending_timeout_secs = 300
reconcile_interval_secs = 60
history_limit = 50

[throttle.ask]
rate = 30
window_secs = 60

[throttle.import]
rate = 10
window_secs = 3600
"#;

/// Write the default config if `config_path` is missing, then create the
/// schema. Safe to run repeatedly.
pub async fn run_init(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
    }

    let cfg = config::load_config(config_path)?;
    migrate::run_migrations(&cfg).await?;
    println!("Database initialized successfully.");
    Ok(())
}

async fn open(config_path: &Path) -> Result<Services> {
    let settings = Arc::new(LiveSettings::load(config_path)?);
    Services::open(settings).await
}

/// Ask a question as `user` and print the answer with its sources.
pub async fn run_ask(config_path: &Path, user: &str, query: &str, pages: &[String]) -> Result<()> {
    let services = open(config_path).await?;
    let outcome = services.asker.submit(user, query, pages).await?;

    if let Some(failure) = outcome.failure {
        bail!(
            "{} ({}; ask request {})",
            failure.message,
            failure.code,
            outcome.request.id
        );
    }

    println!("{}", outcome.request.answer.unwrap_or_default());
    if !outcome.pages.is_empty() {
        println!();
        println!("Sources:");
        for page in &outcome.pages {
            println!("  - {} [{}]", page.title, page.external_id);
        }
    }
    Ok(())
}

/// Embed pages whose cached vector is missing or stale.
pub async fn run_embed_pending(config_path: &Path, limit: Option<usize>) -> Result<()> {
    let services = open(config_path).await?;
    let worker = worker_for(&services);
    let stats = worker.embed_pending(limit).await?;
    println!(
        "Embedding pending: {} pending, {} embedded, {} failed",
        stats.pending, stats.embedded, stats.failed
    );
    Ok(())
}

/// Drop the embedding cache and recompute it.
pub async fn run_embed_rebuild(config_path: &Path) -> Result<()> {
    let services = open(config_path).await?;
    let worker = worker_for(&services);
    let stats = worker.rebuild().await?;
    println!(
        "Embedding rebuild: {} embedded, {} failed",
        stats.embedded, stats.failed
    );
    Ok(())
}

fn worker_for(services: &Services) -> EmbedWorker {
    let batch_size = services.settings.current().embedding.batch_size;
    EmbedWorker::new(services.store.clone(), services.embedder.clone(), batch_size)
}

/// Run one reconciliation sweep.
pub async fn run_reconcile(config_path: &Path) -> Result<()> {
    let services = open(config_path).await?;
    let timeout = services.settings.current().ask.pending_timeout_secs;
    let failed = reconcile::sweep_stale(services.store.as_ref(), Duration::from_secs(timeout)).await?;
    println!("Reconciled {} stale pending request(s).", failed);
    Ok(())
}

// ============ keys ============

pub async fn run_keys_set(
    config_path: &Path,
    user: &str,
    provider: ProviderId,
    secret: &str,
) -> Result<()> {
    if secret.trim().is_empty() {
        bail!("secret must not be empty");
    }
    let services = open(config_path).await?;
    services
        .secrets
        .put_credential(&ProviderCredential::new(user, provider, secret.trim()))
        .await?;
    println!("Stored {} key for {}.", providers::info(provider).display_name, user);
    Ok(())
}

/// List a user's credentials and their validation state. Secrets are never
/// printed.
pub async fn run_keys_list(config_path: &Path, user: &str) -> Result<()> {
    let services = open(config_path).await?;
    let mut credentials = services.secrets.list_credentials(user).await?;
    if credentials.is_empty() {
        println!("No AI provider configured for {}.", user);
        return Ok(());
    }

    let order = services.keys.provider_order(user).await?;
    credentials.sort_by_key(|c| order.iter().position(|p| *p == c.provider));

    println!("{:<10} {:<14} {:<10} LAST CHECKED", "PROVIDER", "NAME", "STATUS");
    for cred in credentials {
        let status = match cred.last_validation_ok {
            Some(true) => "valid",
            Some(false) => "invalid",
            None => "unchecked",
        };
        let checked = cred
            .last_validated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<14} {:<10} {}",
            cred.provider.as_str(),
            providers::info(cred.provider).display_name,
            status,
            checked
        );
    }
    Ok(())
}

pub async fn run_keys_prefer(config_path: &Path, user: &str, order: &[ProviderId]) -> Result<()> {
    let services = open(config_path).await?;
    services.secrets.set_provider_preference(user, order).await?;
    let effective = services.keys.provider_order(user).await?;
    let names: Vec<&str> = effective.iter().map(|p| p.as_str()).collect();
    println!("Provider order for {}: {}", user, names.join(", "));
    Ok(())
}

/// Validate every stored credential now, ignoring remembered failures.
pub async fn run_keys_check(config_path: &Path, user: &str) -> Result<()> {
    let services = open(config_path).await?;
    let checks = services.keys.check_all(user).await?;
    let mut failures = 0;
    for check in &checks {
        match &check.details {
            None => println!("{:<10} ok", check.provider.as_str()),
            Some(details) => {
                failures += 1;
                println!("{:<10} FAILED  {}", check.provider.as_str(), details);
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} credential(s) failed validation", failures, checks.len());
    }
    Ok(())
}

// ============ pages ============

/// Import one page from a file.
pub async fn run_pages_add(config_path: &Path, user: &str, title: &str, file: &Path) -> Result<()> {
    let body = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read page file: {}", file.display()))?;
    let services = open(config_path).await?;
    let item = ImportItem {
        title: title.to_string(),
        body,
    };
    let pages = import_pages(services.store.as_ref(), None, user, &[item]).await?;
    // No worker runs in the CLI; embed inline so the page is searchable.
    let worker = worker_for(&services);
    for page in &pages {
        if let Err(e) = worker.refresh_page(&page.id).await {
            tracing::warn!(page_id = %page.id, error = %e, "page stored without embedding; run `embed pending`");
        }
        println!("Added page {} ({})", page.external_id, page.title);
    }
    Ok(())
}

/// Share a page (by external id) with another user.
pub async fn run_pages_grant(config_path: &Path, owner: &str, page: &str, user: &str) -> Result<()> {
    let services = open(config_path).await?;
    let found = services
        .store
        .get_accessible_pages(owner, &[page.to_string()])
        .await?;
    let Some(found) = found.into_iter().next() else {
        bail!("page not found or not readable by {}: {}", owner, page);
    };
    services.store.grant_access(&found.id, user).await?;
    println!("Granted {} read access to {}.", user, page);
    Ok(())
}
