//! pagecast-send - Background daemon for scheduled page posts
//!
//! Polls the post queue and publishes each due post to its target pages
//! through a browser-driven publish session.

use clap::Parser;
use libpagecast::media::MediaFetcher;
use libpagecast::session::{BrowserSessionFactory, TwoFactorBroker};
use libpagecast::surface::chrome::ChromeDriver;
use libpagecast::surface::SurfaceDriver;
use libpagecast::{Config, Database, PublishExecutor, Result, RetryPolicy, Scheduler, TokenStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pagecast-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled page posts")]
#[command(long_about = "\
pagecast-send - Background daemon for scheduled page posts

DESCRIPTION:
    pagecast-send is a long-running daemon that watches the Pagecast queue
    and publishes scheduled posts to their target pages once they are due.

    Each tick picks up every due post that is not already being published,
    opens one browser session per target page (bounded by
    max_concurrent_publishes), and records the outcome. Pages that already
    published are skipped when a post is retried on a later tick.

USAGE:
    # Run in foreground (logs to stderr)
    pagecast-send

    # Run with custom poll interval
    pagecast-send --poll-interval 30

    # Enable verbose logging
    pagecast-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (waits for in-flight publishes)

CONFIGURATION:
    Configuration file: ~/.config/pagecast/config.toml (or $PAGECAST_CONFIG)
    Database location: ~/.local/share/pagecast/posts.db
    Token cache: ~/.local/share/pagecast/tokens.json

    [scheduling]
    poll_interval = 60              # seconds between polls
    max_concurrent_publishes = 4    # browser sessions at once
    grace_period = 3600             # seconds before retryable failures give up

    [retry]
    max_attempts = 3
    base_delay_ms = 2000

    The surface account password can be supplied through
    PAGECAST_SURFACE_PASSWORD instead of the config file.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime or configuration error
    2 - Authentication error
    3 - Invalid input
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    #[arg(help = "How often to check for scheduled posts (default: from config)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Process due posts once, wait for them to finish, and exit")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libpagecast::logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.database.path).await?);

    info!("pagecast-send daemon starting");

    let scheduler = build_scheduler(&config, db)?;

    if cli.once {
        let dispatched = scheduler.run_once().await?;
        info!(dispatched, "pagecast-send: processed due posts once, exiting");
        return Ok(());
    }

    let poll_interval = cli
        .poll_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.scheduling.poll_interval());
    info!("Poll interval: {}s", poll_interval.as_secs());

    scheduler.start(poll_interval);
    wait_for_shutdown().await?;

    info!("Shutdown requested, draining in-flight publishes");
    scheduler.stop().await;

    info!("pagecast-send daemon stopped");
    Ok(())
}

/// Wire the token cache, browser sessions and executor into a scheduler
fn build_scheduler(config: &Config, db: Arc<Database>) -> Result<Scheduler> {
    let tokens = Arc::new(TokenStore::open(config.tokens.expand_path()));
    let retry = RetryPolicy::from_config(&config.retry);

    let sessions = BrowserSessionFactory::new(
        config.surface.clone(),
        Arc::new(TwoFactorBroker::new()),
        retry,
        || Box::new(ChromeDriver::new()) as Box<dyn SurfaceDriver>,
    );

    let executor = PublishExecutor::new(
        tokens,
        Arc::new(sessions),
        MediaFetcher::new(&config.media)?,
        retry,
    );

    Ok(Scheduler::new(db, Arc::new(executor), &config.scheduling))
}

/// Resolve once SIGINT or SIGTERM arrives
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal, stopping gracefully...");
    }
    handle.close();

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, stopping gracefully...");
    Ok(())
}
