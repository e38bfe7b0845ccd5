// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and setting up logging.

use crate::peer::{PeerProbe, PeerProbeParams};
use crate::probe::DirectProbe;
use crate::tracker::TrackerParams;
use ha_types::HypervisorKind;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use slog::{Drain, Level, Logger};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read \"{}\": {err}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("parse \"{}\": {err}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("open log file \"{}\": {err}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Configuration for a process embedding the HA core
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Process-wide logging configuration.
    pub log: ConfigLogging,
    #[serde(flatten)]
    pub core: CoreConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Read { path: path.to_path_buf(), err }
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }
}

/// Tunables of the HA core itself
///
/// Every section may be omitted, in which case its defaults apply.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub direct: DirectConfig,
    pub investigator: InvestigatorConfig,
    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
    pub waiter: WaiterConfig,
}

fn all_hypervisors() -> BTreeSet<HypervisorKind> {
    BTreeSet::from([
        HypervisorKind::XenServer,
        HypervisorKind::Kvm,
        HypervisorKind::VMware,
        HypervisorKind::Simulator,
    ])
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectConfig {
    /// deadline for one command to a host's own agent
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "command_timeout_ms")]
    pub command_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        DirectConfig { command_timeout: Duration::from_secs(10) }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvestigatorConfig {
    /// names of the probes to consult, most trusted first
    pub probe_order: Vec<String>,
    /// hypervisor kinds the direct probe checks
    pub direct_kinds: BTreeSet<HypervisorKind>,
    /// hypervisor kinds the peer probe checks
    pub peer_kinds: BTreeSet<HypervisorKind>,
}

impl Default for InvestigatorConfig {
    fn default() -> Self {
        InvestigatorConfig {
            probe_order: vec![
                DirectProbe::NAME.to_string(),
                PeerProbe::NAME.to_string(),
            ],
            direct_kinds: all_hypervisors(),
            peer_kinds: all_hypervisors(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "fanout_timeout_ms")]
    pub fanout_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "per_peer_timeout_ms")]
    pub per_peer_timeout: Duration,
    pub max_parallel_peers: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            fanout_timeout: Duration::from_secs(30),
            per_peer_timeout: Duration::from_secs(10),
            max_parallel_peers: 8,
        }
    }
}

impl PeerConfig {
    pub fn params(&self) -> PeerProbeParams {
        PeerProbeParams {
            fanout_timeout: self.fanout_timeout,
            per_peer_timeout: self.per_peer_timeout,
            max_parallel_peers: self.max_parallel_peers,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// suffix of the names of VMs this deployment manages
    pub instance_name: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "subscribe_wait_secs")]
    pub subscribe_wait: Duration,
    /// Discard the first batch of a fresh subscription instead of applying
    /// it. Off by default, so a fresh tracker rebuilds its map from the
    /// hypervisor's current state.
    pub skip_initial_history: bool,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_initial_ms")]
    pub retry_initial: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retry_max_secs")]
    pub retry_max: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            instance_name: "VM".to_string(),
            subscribe_wait: Duration::from_secs(30),
            skip_initial_history: false,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
        }
    }
}

impl TrackerConfig {
    /// `recheck_timeout` bounds the direct re-check of stopped VMs.
    pub fn params(&self, recheck_timeout: Duration) -> TrackerParams {
        TrackerParams {
            instance_name: self.instance_name.clone(),
            subscribe_wait: self.subscribe_wait,
            skip_initial_history: self.skip_initial_history,
            retry_initial: self.retry_initial,
            retry_max: self.retry_max,
            recheck_timeout,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WaiterConfig {
    /// consecutive empty notification cycles before warnings become errors
    pub empty_cycles_before_error: u32,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        WaiterConfig { empty_cycles_before_error: 10 }
    }
}

// Logging configuration

/// The "log" top-level object in the configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },

    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

impl ConfigLogging {
    /// Create the root logger based on the requested configuration.
    ///
    /// `name` is the bunyan `name` of every record in file mode.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, ConfigError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true);
                open_options.create(true);

                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let file = open_log_file(&open_options, path)?;
                let drain = slog_bunyan::with_name(name, file).build().fuse();
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

fn async_root_logger<T>(level: ConfigLoggingLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, slog::o!("pid" => pid))
}

fn open_log_file(
    open_options: &OpenOptions,
    path: &Path,
) -> Result<std::fs::File, ConfigError> {
    let log_file_error =
        |err| ConfigError::LogFile { path: path.to_path_buf(), err };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_file_error)?;
    }
    let file = open_options.open(path).map_err(log_file_error)?;

    // Tell whoever is watching stderr where the rest of the log went.
    eprintln!("note: configured to log to \"{}\"", path.display());
    Ok(file)
}
