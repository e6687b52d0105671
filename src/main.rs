use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relwatch::config::LoggingConfig;
use relwatch::daemon::{self, Daemon};
use relwatch::monitor::CheckOutcome;
use relwatch::{Config, HealthCheck, Monitor, ReleaseStore, RepoId, StatsReporter};

#[derive(Parser)]
#[command(name = "relwatch")]
#[command(about = "GitHub release watcher with ntfy push notifications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Check watched repositories for new releases
    Check {
        /// Check a single repository, bypassing failure backoff
        #[arg(long)]
        repo: Option<String>,

        /// Also send the daily website stats report
        #[arg(long)]
        stats: bool,
    },

    /// Show recorded release state for watched repositories
    Status,

    /// Forget the recorded state for a repository
    Reset {
        /// Repository as "owner/name"
        repo: String,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Runs before configuration loading: loading auto-creates a missing
        // config file, and init wants to control that explicitly (and still
        // work when the existing file fails to parse)
        Some(Commands::Init { force }) => cmd_init(force),

        // Background start forks before any runtime thread exists; the
        // runtime is built afterwards, inside the child
        Some(Commands::Daemon {
            daemon_command: DaemonCommands::Start { foreground: false },
        }) => {
            let config = load_config(cli.config.as_deref())?;
            start_daemon_background(cli.verbose, config)
        }

        command => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.logging);
            info!("Starting relwatch v{}", env!("CARGO_PKG_VERSION"));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;

            runtime.block_on(dispatch(command, config))
        }
    }
}

/// Fork into the background, then bring up the runtime and daemon loop
fn start_daemon_background(verbose: bool, config: Config) -> Result<()> {
    if let Some(pid) = daemon::is_daemon_running(&config)? {
        println!("⚠️  Daemon is already running (PID {})", pid);
        println!("   Use 'relwatch daemon stop' to stop it first");
        return Ok(());
    }

    #[cfg(not(unix))]
    anyhow::bail!("Background mode is not supported on this platform; use --foreground");

    #[cfg(unix)]
    {
        println!("🚀 Starting relwatch daemon in background");
        println!("   PID file: {}", config.daemon.pid_file);
        println!("   Log file: {}", config.daemon.log_file);
        println!("   Check interval: {}", config.general.check_interval);

        daemon::daemonize(&config)?;
        // Only the forked child gets past this point; stdout and stderr now
        // go to the log file
    }

    init_logging(verbose, &config.logging);
    info!("Starting relwatch v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let mut daemon = Daemon::new(config)?;
        daemon.run().await
    })
}

/// Execute a CLI command inside the runtime
async fn dispatch(command: Option<Commands>, config: Config) -> Result<()> {
    match command {
        // Bare `relwatch` runs a full check cycle
        None => cmd_check(None, false, &config).await,
        // Already handled before the runtime started; kept for exhaustiveness
        Some(Commands::Init { force }) => cmd_init(force),
        Some(Commands::Check { repo, stats }) => cmd_check(repo, stats, &config).await,
        Some(Commands::Status) => cmd_status(&config).await,
        Some(Commands::Reset { repo }) => cmd_reset(repo, &config).await,
        Some(Commands::Daemon { daemon_command }) => cmd_daemon(daemon_command, &config).await,
        Some(Commands::Doctor) => cmd_doctor(&config).await,
    }
}

/// Initialize logging from the config, overridable with -v and RUST_LOG
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_directive = if verbose { "debug" } else { &logging.level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "full" {
        registry.with(fmt::layer().with_ansi(logging.color)).init();
    } else {
        registry
            .with(fmt::layer().compact().with_ansi(logging.color))
            .init();
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Write a fresh default configuration file
fn cmd_init(force: bool) -> Result<()> {
    let config_path = Config::default_config_path()?;

    if config_path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", config_path.display());
        println!("   Use --force to reset it to the defaults");
        return Ok(());
    }

    Config::default().save(&config_path)?;

    println!("✅ Configuration created: {}", config_path.display());
    println!("   Next steps:");
    println!("   1. Add repositories under github.repos (\"owner/name\")");
    println!("   2. Point github.ntfy_topic at your ntfy topic");
    println!("   3. Run 'relwatch check' to try it out");

    Ok(())
}

/// Check for new releases, either one repository or the whole watched set
async fn cmd_check(repo: Option<String>, stats: bool, config: &Config) -> Result<()> {
    let config = Arc::new(config.clone());
    let store = Arc::new(ReleaseStore::open_at(config.state_db_path()?)?);
    let monitor = Monitor::new(config.clone(), store.clone())?;

    match repo {
        Some(raw) => {
            let id: RepoId = raw.parse()?;
            println!("🔭 Checking {}...", id);

            let outcome = monitor.check_repo_now(&id).await;
            println!("   {} {}", outcome_icon(&outcome), outcome);
        }
        None => {
            let summary = monitor.run_cycle().await?;

            println!("\n🔭 Check complete!");
            println!("   📦 Repositories checked: {}", summary.total);
            println!("   🆕 New releases: {}", summary.new_releases());
            println!("   ✅ Up to date: {}", summary.up_to_date);
            if summary.first_seen > 0 {
                println!("   👀 Seen for the first time: {}", summary.first_seen);
            }
            if summary.no_releases > 0 {
                println!("   📭 No releases yet: {}", summary.no_releases);
            }
            if summary.rate_limited > 0 {
                println!("   ⏳ Rate limited: {}", summary.rate_limited);
            }
            if summary.failed > 0 {
                println!("   ❌ Failed: {}", summary.failed);
            }
            if summary.skipped > 0 {
                println!("   ⏭️  Skipped: {}", summary.skipped);
            }
            println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

            let fresh: Vec<_> = summary
                .results
                .iter()
                .filter(|(_, outcome)| {
                    matches!(
                        outcome,
                        CheckOutcome::Notified { .. }
                            | CheckOutcome::NotifyDropped { .. }
                            | CheckOutcome::FirstSeen { .. }
                    )
                })
                .collect();

            if !fresh.is_empty() {
                println!("\n🎉 New releases:");
                for (repo, outcome) in fresh {
                    println!("   {} {}: {}", outcome_icon(outcome), repo, outcome);
                }
            }

            if summary.has_problems() {
                println!("\n🔍 Problems:");
                for (repo, outcome) in &summary.results {
                    if matches!(
                        outcome,
                        CheckOutcome::Failed { .. } | CheckOutcome::Halted { .. }
                    ) {
                        println!("   ❌ {}: {}", repo, outcome);
                    }
                }
            }
        }
    }

    if stats {
        println!("\n📈 Sending stats report...");
        let reporter = StatsReporter::new(config, store)?;
        reporter.report_now().await?;
        println!("   ✅ Stats report sent");
    }

    Ok(())
}

/// Show the recorded release state plus daemon liveness
async fn cmd_status(config: &Config) -> Result<()> {
    let store = ReleaseStore::open_at(config.state_db_path()?)?;
    let states = store.all()?;

    match daemon::is_daemon_running(config)? {
        Some(pid) => println!("🟢 Daemon running (PID {})", pid),
        None => println!("🔴 Daemon not running"),
    }
    println!();

    println!("📊 Release state ({} repositories recorded):", states.len());
    for state in &states {
        println!("  📁 {}", state.repo);
        match &state.last_seen_published_at {
            Some(published) => println!(
                "     🏷️  {} (published {})",
                state.last_seen_tag,
                published.format("%Y-%m-%d")
            ),
            None => println!("     🏷️  {}", state.last_seen_tag),
        }
        println!(
            "     🕒 Last checked: {}",
            state.last_checked_at.format("%Y-%m-%d %H:%M UTC")
        );
        if state.consecutive_failures > 0 {
            println!(
                "     ⚠️  {} consecutive failed check(s)",
                state.consecutive_failures
            );
        }
    }

    // Watched repositories that have no recorded state yet
    let recorded: std::collections::HashSet<&str> =
        states.iter().map(|s| s.repo.as_str()).collect();
    let pending: Vec<_> = config
        .tracked_repos()?
        .into_iter()
        .filter(|repo| !recorded.contains(repo.as_str()))
        .collect();

    if !pending.is_empty() {
        println!("\n⏳ Not checked yet:");
        for repo in pending {
            println!("  📁 {}", repo);
        }
    }

    Ok(())
}

/// Forget the recorded release state for one repository
async fn cmd_reset(repo: String, config: &Config) -> Result<()> {
    let id: RepoId = repo.parse()?;
    let store = ReleaseStore::open_at(config.state_db_path()?)?;

    if store.reset(&id)? {
        println!("✅ Forgot recorded state for {}", id);
        println!("   The next check treats it as seen for the first time");
    } else {
        println!("⚠️  No recorded state for {}", id);
    }

    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: &Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { .. } => {
            // Background start forks before the runtime exists and is
            // handled in main; only foreground mode reaches this arm
            if let Some(pid) = daemon::is_daemon_running(config)? {
                println!("⚠️  Daemon is already running (PID {})", pid);
                println!("   Use 'relwatch daemon stop' to stop it first");
                return Ok(());
            }

            println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            let mut daemon = Daemon::new(config.clone())?;
            daemon.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping relwatch daemon...");

            if daemon::stop(config)? {
                println!("✅ Daemon stop signal sent");
            } else {
                println!("⚠️  No daemon appears to be running");
            }
        }

        DaemonCommands::Status => {
            println!("📊 relwatch Daemon Status");

            match daemon::is_daemon_running(config)? {
                Some(pid) => {
                    println!("   🟢 Status: Running (PID {})", pid);
                    println!("   🔄 Check interval: {}", config.general.check_interval);
                    if !config.daemon.log_file.is_empty() {
                        println!("   📄 Log file: {}", config.daemon.log_file);
                    }
                }
                None => {
                    println!("   🔴 Status: Not running");
                    println!("   💡 Use 'relwatch daemon start' to start the daemon");
                }
            }
        }
    }

    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    use relwatch::health::CheckResult;

    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 relwatch System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}

/// Icon summarizing a single-repository check outcome
fn outcome_icon(outcome: &CheckOutcome) -> &'static str {
    match outcome {
        CheckOutcome::UpToDate | CheckOutcome::NoReleases => "✅",
        CheckOutcome::FirstSeen { .. } => "👀",
        CheckOutcome::Notified { .. } => "🆕",
        CheckOutcome::NotifyDropped { .. } => "⚠️ ",
        CheckOutcome::RateLimited { .. } => "⏳",
        CheckOutcome::Failed { .. } | CheckOutcome::Halted { .. } => "❌",
        CheckOutcome::Skipped { .. } => "⏭️ ",
    }
}
