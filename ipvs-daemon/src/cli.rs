//! CLI argument definitions for ipvs-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// IPVS load balancer daemon.
///
/// Loads virtual services from the configuration file, runs the
/// connection table maintenance tasks and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "ipvs-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to ipvs.toml configuration file.
    #[arg(short, long, default_value = "/etc/ipvs/ipvs.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Addresses owned by this host, in addition to the virtual addresses.
    ///
    /// Destinations on these addresses are served locally.
    #[arg(long = "local-addr", value_delimiter = ',')]
    pub local_addrs: Vec<std::net::Ipv4Addr>,
}

impl DaemonCli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut ipvs_core::IpvsConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.general.log_format.clone_from(format);
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file.clone_from(pid_file);
        }
    }
}
