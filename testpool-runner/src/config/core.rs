// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{MemoryThreshold, RetryPolicy, WorkerCount, deserialize_retry_policy};
use crate::{
    errors::{ConfigParseError, ProfileNotFound},
    list::StatusCacheStore,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::LazyLock, time::Duration};
use tracing::warn;

/// Gets the number of available CPUs.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for testpool.
///
/// Most settings live in [profiles](PoolProfile), obtained through the [`profile`](Self::profile)
/// method.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    workspace_root: Utf8PathBuf,
    store_dir: Utf8PathBuf,
    default_profile: DefaultProfileImpl,
    other_profiles: BTreeMap<String, CustomProfileImpl>,
}

impl PoolConfig {
    /// The default location of the config within the workspace root.
    pub const CONFIG_PATH: &'static str = ".config/testpool.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the config from the given file, or if not specified from `.config/testpool.toml` in
    /// the workspace root.
    ///
    /// If no config file is specified and the workspace root doesn't have one, the default config
    /// is used.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let deserialized = Self::make_default_config()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize::<PoolConfigDeserialize>())
            .map_err(|err| ConfigParseError::new(&config_file, err))?;

        Ok(Self::from_deserialized(workspace_root, deserialized))
    }

    /// Returns the default config, ignoring any config files.
    pub fn default_config(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        let deserialized = Self::make_default_config()
            .build()
            .and_then(|config| config.try_deserialize::<PoolConfigDeserialize>())
            .expect("default config is always valid");
        Self::from_deserialized(workspace_root.into(), deserialized)
    }

    /// Returns the workspace root this config was read relative to.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the names of all known profiles.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(Self::DEFAULT_PROFILE).chain(
            self.other_profiles
                .keys()
                .map(|name| name.as_str())
                .filter(|name| *name != Self::DEFAULT_PROFILE),
        )
    }

    /// Returns the profile with the given name, or an error if it isn't defined.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<PoolProfile, ProfileNotFound> {
        let name = name.as_ref();
        let custom = if name == Self::DEFAULT_PROFILE {
            None
        } else {
            Some(
                self.other_profiles
                    .get(name)
                    .ok_or_else(|| ProfileNotFound::new(name, self.profile_names()))?,
            )
        };

        let default = &self.default_profile;
        let startup_hook = custom
            .and_then(|profile| profile.startup_hook.clone())
            .or_else(|| default.startup_hook.clone());

        let store_dir = self.store_dir.join(name);
        let status_cache = match custom
            .and_then(|profile| profile.status_cache.as_ref())
            .or(default.status_cache.as_ref())
        {
            Some(path) => self.workspace_root.join(path),
            None => store_dir.join(StatusCacheStore::FILE_NAME),
        };

        Ok(PoolProfile {
            name: name.to_owned(),
            store_dir,
            status_cache,
            workers: custom
                .and_then(|profile| profile.workers)
                .unwrap_or(default.workers),
            worker_threads: custom
                .and_then(|profile| profile.worker_threads)
                .unwrap_or(default.worker_threads)
                .max(1),
            retries: custom
                .and_then(|profile| profile.retries)
                .unwrap_or(default.retries),
            timeout: custom
                .and_then(|profile| profile.timeout)
                .unwrap_or(default.timeout),
            memory_threshold: custom
                .and_then(|profile| profile.memory_threshold)
                .unwrap_or(default.memory_threshold),
            fail_fast: custom
                .and_then(|profile| profile.fail_fast)
                .unwrap_or(default.fail_fast),
            failures_first: custom
                .and_then(|profile| profile.failures_first)
                .unwrap_or(default.failures_first),
            connect_timeout: custom
                .and_then(|profile| profile.connect_timeout)
                .unwrap_or(default.connect_timeout),
            terminate_grace_period: custom
                .and_then(|profile| profile.terminate_grace_period)
                .unwrap_or(default.terminate_grace_period),
            diagnostics_on_timeout: custom
                .and_then(|profile| profile.diagnostics_on_timeout)
                .unwrap_or(default.diagnostics_on_timeout),
            startup_hook,
        })
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn from_deserialized(
        workspace_root: Utf8PathBuf,
        mut deserialized: PoolConfigDeserialize,
    ) -> Self {
        let default_profile = DefaultProfileImpl::new(
            deserialized
                .profiles
                .remove(Self::DEFAULT_PROFILE)
                .expect("default profile should exist"),
        );
        let store_dir = workspace_root.join(&deserialized.store.dir);
        Self {
            workspace_root,
            store_dir,
            default_profile,
            other_profiles: deserialized.profiles,
        }
    }
}

/// A fully resolved profile: the named profile with unset keys filled in from the default
/// profile.
#[derive(Clone, Debug)]
pub struct PoolProfile {
    name: String,
    store_dir: Utf8PathBuf,
    status_cache: Utf8PathBuf,
    workers: WorkerCount,
    worker_threads: usize,
    retries: RetryPolicy,
    timeout: Duration,
    memory_threshold: MemoryThreshold,
    fail_fast: bool,
    failures_first: bool,
    connect_timeout: Duration,
    terminate_grace_period: Duration,
    diagnostics_on_timeout: bool,
    startup_hook: Option<serde_json::Value>,
}

impl PoolProfile {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the directory profile-specific files are stored in.
    pub fn store_dir(&self) -> &Utf8Path {
        &self.store_dir
    }

    /// Returns the path of the status cache used for failures-first ordering.
    pub fn status_cache_path(&self) -> &Utf8Path {
        &self.status_cache
    }

    /// Returns the number of workers to start.
    pub fn workers(&self) -> WorkerCount {
        self.workers
    }

    /// Returns the concurrency hint passed to each worker.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Returns the retry policy.
    pub fn retries(&self) -> RetryPolicy {
        self.retries
    }

    /// Returns the per-item timeout used when an item doesn't set its own.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the memory threshold.
    pub fn memory_threshold(&self) -> MemoryThreshold {
        self.memory_threshold
    }

    /// Returns true if the run stops dispatching after the first non-passing item.
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Returns true if items that failed last time are dispatched first.
    pub fn failures_first(&self) -> bool {
        self.failures_first
    }

    /// Returns how long a worker may take to become ready.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns how long to wait between termination signals.
    pub fn terminate_grace_period(&self) -> Duration {
        self.terminate_grace_period
    }

    /// Returns true if timed-out workers are asked for diagnostics.
    pub fn diagnostics_on_timeout(&self) -> bool {
        self.diagnostics_on_timeout
    }

    /// Returns the payload of the startup hook run on each new worker, if any.
    pub fn startup_hook(&self) -> Option<&serde_json::Value> {
        self.startup_hook.as_ref()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PoolConfigDeserialize {
    store: StoreConfigImpl,
    #[serde(rename = "profile")]
    profiles: BTreeMap<String, CustomProfileImpl>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreConfigImpl {
    dir: Utf8PathBuf,
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    workers: WorkerCount,
    worker_threads: usize,
    retries: RetryPolicy,
    timeout: Duration,
    memory_threshold: MemoryThreshold,
    fail_fast: bool,
    failures_first: bool,
    connect_timeout: Duration,
    terminate_grace_period: Duration,
    diagnostics_on_timeout: bool,
    startup_hook: Option<serde_json::Value>,
    status_cache: Option<Utf8PathBuf>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            workers: p.workers.expect("workers present in default profile"),
            worker_threads: p
                .worker_threads
                .expect("worker-threads present in default profile"),
            retries: p.retries.expect("retries present in default profile"),
            timeout: p.timeout.expect("timeout present in default profile"),
            memory_threshold: p
                .memory_threshold
                .expect("memory-threshold present in default profile"),
            fail_fast: p.fail_fast.expect("fail-fast present in default profile"),
            failures_first: p
                .failures_first
                .expect("failures-first present in default profile"),
            connect_timeout: p
                .connect_timeout
                .expect("connect-timeout present in default profile"),
            terminate_grace_period: p
                .terminate_grace_period
                .expect("terminate-grace-period present in default profile"),
            diagnostics_on_timeout: p
                .diagnostics_on_timeout
                .expect("diagnostics-on-timeout present in default profile"),
            startup_hook: p.startup_hook,
            status_cache: p.status_cache,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    workers: Option<WorkerCount>,
    #[serde(default)]
    worker_threads: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    retries: Option<RetryPolicy>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    memory_threshold: Option<MemoryThreshold>,
    #[serde(default)]
    fail_fast: Option<bool>,
    #[serde(default)]
    failures_first: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    terminate_grace_period: Option<Duration>,
    #[serde(default)]
    diagnostics_on_timeout: Option<bool>,
    #[serde(default)]
    startup_hook: Option<serde_json::Value>,
    #[serde(default)]
    status_cache: Option<Utf8PathBuf>,
}
