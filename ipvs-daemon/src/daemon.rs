//! Daemon assembly and lifecycle management.
//!
//! The [`Daemon`] loads configuration, installs the metrics recorder,
//! builds the load balancer on top of the host stack adapter, and runs
//! until a shutdown signal arrives.
//!
//! # Run sequence
//!
//! 1. Write the PID file (if configured)
//! 2. Start the engine (expiry sweeper and rate estimator tasks)
//! 3. Log aggregated health periodically until SIGTERM / SIGINT
//! 4. Stop the engine (flushes the connection table)
//! 5. Remove the PID file

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;

use ipvs_core::config::IpvsConfig;
use ipvs_core::pipeline::Pipeline;
use ipvs_engine::{LoadBalancer, LoadBalancerBuilder, NetStack};

use crate::health::{DaemonHealth, aggregate_status, service_health};
use crate::metrics_server;
use crate::stack::{HostStack, LogSink, LogSyncSink};

/// Interval between health reports in the main loop.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between uptime metric updates.
const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// The IPVS daemon.
pub struct Daemon {
    /// Loaded and validated configuration.
    config: IpvsConfig,
    engine: LoadBalancer,
    /// Shutdown broadcast sender (signals background tasks).
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Daemon {
    /// Load `ipvs.toml`, apply environment overrides and build the daemon.
    pub async fn build(config_path: &Path, local_addrs: &[Ipv4Addr]) -> Result<Self> {
        let config = IpvsConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config, local_addrs)
    }

    /// Build from an already-loaded configuration using the host stack adapter.
    pub fn build_from_config(config: IpvsConfig, local_addrs: &[Ipv4Addr]) -> Result<Self> {
        let stack = HostStack::from_config(&config, local_addrs, Arc::new(LogSink::new()));
        tracing::debug!(local_addrs = stack.local_count(), "host stack ready");
        Self::build_with_stack(config, Arc::new(stack))
    }

    /// Build on top of an arbitrary network stack.
    pub fn build_with_stack(config: IpvsConfig, stack: Arc<dyn NetStack>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before the engine registers services
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let mut builder = LoadBalancerBuilder::new().config(config.clone()).stack(stack);
        if config.engine.sync_master {
            builder = builder.sync_sink(Arc::new(LogSyncSink::new()));
        }
        let engine = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build load balancer: {}", e))?;

        let services = engine.state().services.len();
        tracing::info!(services = services, "daemon initialized");

        if config.metrics.enabled {
            record_daemon_metrics();
        }

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            config,
            engine,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Run until SIGTERM or SIGINT.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Start the engine and run until `shutdown` resolves.
    ///
    /// The engine is stopped and the PID file removed even when the
    /// shutdown future itself fails.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<&'static str>>,
    {
        let pid_path = self.pid_path();
        if let Some(path) = &pid_path {
            write_pid_file(path)?;
        }

        if let Err(e) = self.engine.start().await {
            tracing::error!(error = %e, "engine failed to start");
            if let Some(path) = &pid_path {
                remove_pid_file(path);
            }
            return Err(anyhow::anyhow!("failed to start engine: {}", e));
        }

        let uptime_task = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, self.shutdown_tx.subscribe()));

        tracing::info!("entering main loop");
        let mut health_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + HEALTH_LOG_INTERVAL,
            HEALTH_LOG_INTERVAL,
        );
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                result = &mut shutdown => break result,
                _ = health_tick.tick() => self.log_health().await,
            }
        };
        match &outcome {
            Ok(signal) => tracing::info!(signal = signal, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "shutdown signal handling failed"),
        }

        let _ = self.shutdown_tx.send(());
        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        let counters = self.engine.state().counters_snapshot();
        if let Err(e) = self.engine.stop().await {
            tracing::error!(error = %e, "failed to stop engine");
        }
        tracing::info!(counters = %counters, "engine stopped");

        if let Some(path) = &pid_path {
            remove_pid_file(path);
        }

        outcome.map(|_| ())
    }

    /// Current aggregated health.
    pub async fn health(&self) -> DaemonHealth {
        let engine_status = self.engine.health_check().await;
        let services = service_health(self.engine.state());
        let status = aggregate_status(&engine_status, &services);
        let uptime_secs = self.start_time.elapsed().as_secs();

        if self.config.metrics.enabled {
            use ipvs_core::metrics as m;
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status,
            uptime_secs,
            engine_state: self.engine.state_name().to_owned(),
            connections: self.engine.state().conns.len(),
            services,
        }
    }

    async fn log_health(&self) {
        let health = self.health().await;
        let report = serde_json::to_string(&health).unwrap_or_default();
        if health.status.is_healthy() {
            tracing::debug!(health = %report, "health check");
        } else {
            tracing::warn!(health = %report, "health check");
        }
    }

    pub fn engine(&self) -> &LoadBalancer {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut LoadBalancer {
        &mut self.engine
    }

    pub fn config(&self) -> &IpvsConfig {
        &self.config
    }

    fn pid_path(&self) -> Option<PathBuf> {
        let pid_file = &self.config.general.pid_file;
        (!pid_file.is_empty()).then(|| PathBuf::from(pid_file))
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("engine", &self.engine)
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create file (prevents TOCTOU races)
/// - Verifies the created file is a regular file (prevents symlink attacks)
/// - Creates parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the file already exists or cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file (possible symlink attack)",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on shutdown. Failures are logged, not returned.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Record daemon-level metrics once at startup.
fn record_daemon_metrics() {
    use ipvs_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Spawn a background task that periodically updates the uptime metric.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use ipvs_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
