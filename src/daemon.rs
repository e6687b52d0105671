//! Background service for unattended release monitoring
//!
//! PID file management, signal handling, and the periodic poll loop. The
//! fork into the background happens in [`daemonize`] before the async
//! runtime starts; [`Daemon::run`] is the part that executes inside it.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::monitor::Monitor;
use crate::state::ReleaseStore;
use crate::stats::StatsReporter;

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    monitor: Arc<Monitor>,
    stats: StatsReporter,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(
            ReleaseStore::open_at(config.state_db_path()?)
                .context("Failed to open state database for daemon")?,
        );
        let monitor = Arc::new(
            Monitor::new(config.clone(), store.clone())
                .context("Failed to create monitor for daemon")?,
        );
        let stats = StatsReporter::new(config.clone(), store)
            .context("Failed to create stats reporter for daemon")?;

        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = pid_file_path(&config)?;

        Ok(Self {
            config,
            monitor,
            stats,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
        })
    }

    /// Run the poll loop until a shutdown signal arrives
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting relwatch daemon");

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.shutdown_sender.subscribe();

        // Signal handler: flag the monitor first so checks that have not
        // started yet resolve as skipped, then wake the loop
        let shutdown_sender = self.shutdown_sender.clone();
        let is_running = self.is_running.clone();
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            is_running.store(false, Ordering::SeqCst);
            monitor.begin_shutdown();
            let _ = shutdown_sender.send(());
        });

        let result = self.daemon_loop(shutdown_receiver).await;

        self.cleanup().context("Failed to clean up daemon")?;

        result
    }

    /// Main daemon loop: periodic poll cycles plus the daily stats report
    async fn daemon_loop(&self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let check_interval = self
            .config
            .check_interval()
            .context("Failed to parse check interval")?;
        let mut interval_timer = interval(check_interval);

        info!("Daemon loop started with interval: {:?}", check_interval);

        // The first tick fires immediately, so a freshly started daemon
        // checks right away instead of sleeping a full interval
        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = interval_timer.tick() => {
                    if !self.is_running.load(Ordering::SeqCst) {
                        break;
                    }

                    debug!("Starting scheduled poll cycle");
                    match self.monitor.run_cycle().await {
                        Ok(summary) if summary.has_problems() => {
                            warn!(
                                "Cycle finished with problems: {} dropped notification(s), {} failed check(s)",
                                summary.dropped, summary.failed
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("Poll cycle failed: {:?}", e);
                        }
                    }

                    if let Err(e) = self.stats.maybe_report().await {
                        warn!("Daily stats report failed: {:#}", e);
                    }
                }
            }
        }

        info!("Daemon loop exiting");
        Ok(())
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("SIGINT received"),
            _ = sigterm.recv() => debug!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
        debug!("Ctrl+C received");
    }
}

/// Fork into the background, redirecting stdout/stderr to the log file.
///
/// Must be called before the tokio runtime starts; worker threads do not
/// survive the fork. The PID file is written by [`Daemon::run`] inside the
/// child, so it always holds the child's PID.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new().working_directory("/");

    if !config.daemon.log_file.is_empty() {
        let expanded = shellexpand::full(&config.daemon.log_file)
            .context("Failed to expand log file path")?;
        let log_path = PathBuf::from(expanded.as_ref());

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }

        let stdout = fs::File::create(&log_path).context("Failed to create log file")?;
        let stderr = stdout
            .try_clone()
            .context("Failed to clone log file handle")?;

        daemonize = daemonize.stdout(stdout).stderr(stderr);
    }

    daemonize.start().context("Failed to daemonize process")?;

    Ok(())
}

/// Stop a running daemon. Returns false when no daemon is running.
pub fn stop(config: &Config) -> Result<bool> {
    let pid = match is_daemon_running(config)? {
        Some(pid) => pid,
        None => return Ok(false),
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;

        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(true)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Stopping the daemon is not supported on this platform")
    }
}

/// Check whether a daemon is running, returning its PID if so.
///
/// A PID file pointing at a dead process is treated as stale and removed.
pub fn is_daemon_running(config: &Config) -> Result<Option<u32>> {
    let pid_file = match pid_file_path(config)? {
        Some(path) => path,
        None => return Ok(None),
    };

    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                // Stale file left behind by an unclean shutdown
                let _ = fs::remove_file(&pid_file);
                Ok(None)
            }
            Err(_) => Ok(Some(pid)),
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}

/// Resolve the configured PID file path, expanding environment variables
fn pid_file_path(config: &Config) -> Result<Option<PathBuf>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }

    let expanded =
        shellexpand::full(&config.daemon.pid_file).context("Failed to expand PID file path")?;
    Ok(Some(PathBuf::from(expanded.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.general.state_path = Some(dir.join("state.db").to_string_lossy().to_string());
        config.daemon.pid_file = dir.join("test.pid").to_string_lossy().to_string();
        config.daemon.log_file = dir.join("daemon.log").to_string_lossy().to_string();
        config
    }

    #[test]
    fn test_daemon_creation() {
        let temp = tempdir().unwrap();
        let daemon = Daemon::new(test_config(temp.path())).unwrap();
        assert!(daemon.pid_file_path.is_some());
        assert!(!daemon.is_running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_empty_pid_file_setting_disables_pid_file() {
        let temp = tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.daemon.pid_file = String::new();

        let daemon = Daemon::new(config).unwrap();
        assert!(daemon.pid_file_path.is_none());
    }

    #[test]
    fn test_is_daemon_running_without_pid_file() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        assert!(is_daemon_running(&config).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_is_daemon_running_with_live_process() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());

        // Our own PID is as alive as it gets
        let own_pid = std::process::id();
        fs::write(temp.path().join("test.pid"), own_pid.to_string()).unwrap();

        assert_eq!(is_daemon_running(&config).unwrap(), Some(own_pid));
        assert!(temp.path().join("test.pid").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_pid_file_is_removed() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());

        // Way above any plausible pid_max
        fs::write(temp.path().join("test.pid"), "999999999").unwrap();

        assert!(is_daemon_running(&config).unwrap().is_none());
        assert!(!temp.path().join("test.pid").exists());
    }

    #[test]
    fn test_invalid_pid_file_content() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());

        fs::write(temp.path().join("test.pid"), "not-a-pid").unwrap();
        assert!(is_daemon_running(&config).is_err());
    }

    #[test]
    fn test_write_and_cleanup_pid_file() {
        let temp = tempdir().unwrap();
        let daemon = Daemon::new(test_config(temp.path())).unwrap();

        daemon.write_pid_file().unwrap();
        let written = fs::read_to_string(temp.path().join("test.pid")).unwrap();
        assert_eq!(written, std::process::id().to_string());

        daemon.cleanup().unwrap();
        assert!(!temp.path().join("test.pid").exists());
    }

    #[test]
    fn test_stop_when_not_running() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        assert!(!stop(&config).unwrap());
    }
}
