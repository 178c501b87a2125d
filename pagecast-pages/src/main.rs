//! pagecast-pages - Page linking tool for Pagecast
//!
//! Links pages to the publishing pipeline by recording the page and caching
//! its access token, and manages the cached tokens afterwards.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libpagecast::{Config, Database, Page, TokenStore};
use std::io::{IsTerminal, Read, Write};
use std::time::Duration;
use tracing::error;

#[derive(Parser)]
#[command(name = "pagecast-pages")]
#[command(about = "Link pages and manage their cached access tokens", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Link a page and cache its access token
    Link {
        /// Page id on the publishing surface
        page_id: String,

        /// Display name (default: the page id)
        #[arg(long)]
        name: Option<String>,

        /// Avatar image URL
        #[arg(long)]
        avatar_url: Option<String>,

        /// Access token (prefer --stdin, arguments are visible to other users)
        #[arg(long, conflicts_with = "stdin", required_unless_present = "stdin")]
        token: Option<String>,

        /// Read the access token from stdin (for automation/agents)
        #[arg(long)]
        stdin: bool,

        /// How long the token stays valid, e.g. "60days" or "1h 30m"
        #[arg(long, default_value = "60days", value_parser = humantime::parse_duration)]
        ttl: Duration,
    },

    /// Forget a page's cached access token
    Unlink {
        /// Page id on the publishing surface
        page_id: String,

        /// Also remove the page and its publish targets
        #[arg(long)]
        remove_page: bool,
    },

    /// List linked pages and token expiry (never the token itself)
    List,

    /// Drop every cached access token
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    libpagecast::logging::init_cli(cli.verbose);

    if let Err(e) = run_command(cli.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(command: Commands) -> Result<()> {
    let config = Config::load()?;

    match command {
        Commands::Link {
            page_id,
            name,
            avatar_url,
            token,
            stdin,
            ttl,
        } => {
            let token = match token {
                Some(token) => token,
                None => read_token_from_stdin(stdin)?,
            };
            let mut page = Page::new(page_id.clone(), name.unwrap_or(page_id));
            page.avatar_url = avatar_url;
            link_page(&config, page, token.trim(), ttl).await
        }
        Commands::Unlink {
            page_id,
            remove_page,
        } => unlink_page(&config, &page_id, remove_page).await,
        Commands::List => list_pages(&config).await,
        Commands::Clear { force } => clear_tokens(&config, force).await,
    }
}

fn read_token_from_stdin(use_stdin: bool) -> Result<String> {
    if !use_stdin {
        anyhow::bail!("Either --token or --stdin is required");
    }
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer)
}

/// Record the page and cache its token
async fn link_page(config: &Config, page: Page, token: &str, ttl: Duration) -> Result<()> {
    if page.id.trim().is_empty() {
        anyhow::bail!("Page id cannot be empty");
    }
    if token.is_empty() {
        anyhow::bail!("Access token cannot be empty");
    }
    if ttl.is_zero() {
        anyhow::bail!("Token lifetime must be greater than zero");
    }
    let ttl = chrono::Duration::from_std(ttl).context("Token lifetime is too large")?;

    let db = Database::new(&config.database.path).await?;
    db.upsert_page(&page).await?;

    let tokens = TokenStore::open(config.tokens.expand_path());
    let expires_at = tokens.set(&page.id, token, ttl).await?;

    println!(
        "✓ Linked page '{}' ({}), token valid until {}",
        page.id,
        page.name,
        format_expiry(expires_at)
    );

    Ok(())
}

async fn unlink_page(config: &Config, page_id: &str, remove_page: bool) -> Result<()> {
    let tokens = TokenStore::open(config.tokens.expand_path());
    let had_token = tokens.invalidate(page_id).await?;

    let removed = if remove_page {
        let db = Database::new(&config.database.path).await?;
        db.delete_page(page_id).await?
    } else {
        false
    };

    if !had_token && !removed {
        println!("Page '{}' is not linked", page_id);
        return Ok(());
    }

    if had_token {
        println!("✓ Removed cached token for page '{}'", page_id);
    }
    if removed {
        println!("✓ Removed page '{}' and its publish targets", page_id);
    }

    Ok(())
}

async fn list_pages(config: &Config) -> Result<()> {
    let db = Database::new(&config.database.path).await?;
    let pages = db.list_pages().await?;

    let tokens = TokenStore::open(config.tokens.expand_path());
    let mut cached = tokens.list().await;

    if pages.is_empty() && cached.is_empty() {
        println!("No pages linked.");
        println!();
        println!("Use 'pagecast-pages link <page-id> --stdin' to link a page.");
        return Ok(());
    }

    println!("Linked pages:");
    println!();

    for page in &pages {
        let expiry = match cached.iter().position(|(id, _)| id == &page.id) {
            Some(index) => {
                let (_, expires_at) = cached.remove(index);
                format!("token valid until {}", format_expiry(expires_at))
            }
            None => "no valid token".to_string(),
        };
        println!("  {} ({}): {}", page.id, page.name, expiry);
    }

    // Tokens cached for pages with no page row
    for (page_id, expires_at) in cached {
        println!(
            "  {} (not recorded): token valid until {}",
            page_id,
            format_expiry(expires_at)
        );
    }

    Ok(())
}

async fn clear_tokens(config: &Config, force: bool) -> Result<()> {
    if !force && std::io::stdin().is_terminal() {
        print!("Remove every cached access token? [y/N]: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let tokens = TokenStore::open(config.tokens.expand_path());
    tokens.clear().await?;
    println!("✓ Cleared all cached access tokens");

    Ok(())
}

fn format_expiry(expires_at: DateTime<Utc>) -> String {
    let remaining = (expires_at - Utc::now()).num_seconds().max(0) as u64;
    format!(
        "{} (in {})",
        expires_at.format("%Y-%m-%d %H:%M UTC"),
        humantime::format_duration(Duration::from_secs(remaining))
    )
}
