// Copyright 2021 rexc project contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Invocation configuration, loaded once from the environment plus an
//! optional `rexc.conf`.
//!
//! Every key can be set as `REXC_<KEY>` in the environment or as `<key>` in
//! the config file; the environment wins. Files are looked up in the current
//! directory first, then the user config directory.

use directories::ProjectDirs;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::digest::DigestFunction;
use crate::errors::*;

pub const ENV_PREFIX: &str = "REXC_";
pub const CONFIG_FILE_NAME: &str = "rexc.conf";

const SUPPORTED_REAPI_VERSIONS: &[&str] = &["2.0", "2.1", "2.2"];

#[derive(Debug, Clone)]
pub struct Config {
    pub server: Option<String>,
    pub cas_server: Option<String>,
    pub action_cache_server: Option<String>,
    pub instance: String,
    pub project_root: PathBuf,
    pub no_path_rewrite: bool,
    pub prefix_map: Vec<(PathBuf, PathBuf)>,
    pub force_remote: bool,
    pub cache_only: bool,
    pub cache_upload_local_build: bool,
    pub cache_upload_failed_build: bool,
    pub action_uncacheable: bool,
    pub skip_cache: bool,
    pub dont_save_output: bool,
    pub deps_global_paths: bool,
    pub deps_override: Option<Vec<String>>,
    pub deps_directory_override: Option<PathBuf>,
    pub output_files_override: Option<Vec<String>>,
    pub output_directories_override: Option<Vec<String>>,
    pub deps_exclude_paths: Vec<PathBuf>,
    /// Extra environment for the local dependencies command.
    pub deps_env: BTreeMap<String, String>,
    /// Environment forced into the remote Command.
    pub remote_env: BTreeMap<String, String>,
    /// REAPI platform properties used for worker selection.
    pub remote_platform: BTreeMap<String, String>,
    pub env_to_read: Vec<String>,
    pub preserve_env: bool,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub request_timeout: Option<Duration>,
    pub keepalive_time: Option<Duration>,
    pub cas_digest_function: DigestFunction,
    pub working_dir_prefix: Option<PathBuf>,
    pub max_threads: i32,
    pub reapi_version: String,
    pub no_execute: bool,
    pub enable_metrics: bool,
    pub metrics_file: Option<PathBuf>,
    pub metrics_udp_server: Option<String>,
    pub log_level: String,
    pub log_directory: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: None,
            cas_server: None,
            action_cache_server: None,
            instance: String::new(),
            project_root: PathBuf::from("/"),
            no_path_rewrite: false,
            prefix_map: Vec::new(),
            force_remote: false,
            cache_only: false,
            cache_upload_local_build: false,
            cache_upload_failed_build: true,
            action_uncacheable: false,
            skip_cache: false,
            dont_save_output: false,
            deps_global_paths: false,
            deps_override: None,
            deps_directory_override: None,
            output_files_override: None,
            output_directories_override: None,
            deps_exclude_paths: Vec::new(),
            deps_env: BTreeMap::new(),
            remote_env: BTreeMap::new(),
            remote_platform: BTreeMap::new(),
            env_to_read: Vec::new(),
            preserve_env: false,
            retry_limit: 0,
            retry_delay: Duration::from_millis(1000),
            request_timeout: None,
            keepalive_time: None,
            cas_digest_function: DigestFunction::default(),
            working_dir_prefix: None,
            max_threads: 4,
            reapi_version: "2.2".to_string(),
            no_execute: false,
            enable_metrics: false,
            metrics_file: None,
            metrics_udp_server: None,
            log_level: "error".to_string(),
            log_directory: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Load from config files and the process environment, then validate.
    pub fn load() -> Result<Config> {
        let mut config = Config::default();
        config.project_root =
            env::current_dir().context("cannot determine current working directory")?;

        for path in Self::config_file_locations() {
            if path.is_file() {
                config.apply_file(&path)?;
                break;
            }
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn config_file_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dirs) = ProjectDirs::from("", "", "rexc") {
            locations.push(dirs.config_dir().join(CONFIG_FILE_NAME));
        }
        locations
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs_err::read_to_string(path)?;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ConfigError(format!(
                    "{}:{}: expected key=value",
                    path.display(),
                    lineno + 1
                ))
            })?;
            self.apply(&key.trim().to_ascii_uppercase(), value.trim())?;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                self.apply(stripped, &value)?;
            }
        }
        Ok(())
    }

    /// Apply one setting; `key` is uppercase with the `REXC_` prefix removed.
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix("DEPS_ENV_") {
            self.deps_env.insert(name.to_string(), value.to_string());
            return Ok(());
        }
        if let Some(name) = key.strip_prefix("REMOTE_ENV_") {
            self.remote_env.insert(name.to_string(), value.to_string());
            return Ok(());
        }
        if let Some(name) = key.strip_prefix("REMOTE_PLATFORM_") {
            self.remote_platform
                .insert(name.to_string(), value.to_string());
            return Ok(());
        }

        match key {
            "SERVER" => self.server = Some(value.to_string()),
            "CAS_SERVER" => self.cas_server = Some(value.to_string()),
            "ACTION_CACHE_SERVER" => self.action_cache_server = Some(value.to_string()),
            "INSTANCE" => self.instance = value.to_string(),
            "PROJECT_ROOT" => {
                let root = PathBuf::from(value);
                if !root.is_absolute() {
                    bail!(ConfigError(format!(
                        "PROJECT_ROOT must be absolute, got \"{}\"",
                        value
                    )));
                }
                self.project_root = root;
            }
            "NO_PATH_REWRITE" => self.no_path_rewrite = parse_bool(key, value)?,
            "PREFIX_MAP" => self.prefix_map = parse_prefix_map(value)?,
            "FORCE_REMOTE" => self.force_remote = parse_bool(key, value)?,
            "CACHE_ONLY" => self.cache_only = parse_bool(key, value)?,
            "CACHE_UPLOAD_LOCAL_BUILD" => self.cache_upload_local_build = parse_bool(key, value)?,
            "CACHE_UPLOAD_FAILED_BUILD" => self.cache_upload_failed_build = parse_bool(key, value)?,
            "ACTION_UNCACHEABLE" => self.action_uncacheable = parse_bool(key, value)?,
            "SKIP_CACHE" => self.skip_cache = parse_bool(key, value)?,
            "DONT_SAVE_OUTPUT" => self.dont_save_output = parse_bool(key, value)?,
            "DEPS_GLOBAL_PATHS" => self.deps_global_paths = parse_bool(key, value)?,
            "DEPS_OVERRIDE" => self.deps_override = Some(parse_list(value)),
            "DEPS_DIRECTORY_OVERRIDE" => self.deps_directory_override = Some(PathBuf::from(value)),
            "OUTPUT_FILES_OVERRIDE" => self.output_files_override = Some(parse_list(value)),
            "OUTPUT_DIRECTORIES_OVERRIDE" => {
                self.output_directories_override = Some(parse_list(value))
            }
            "DEPS_EXCLUDE_PATHS" => {
                self.deps_exclude_paths = parse_list(value).into_iter().map(PathBuf::from).collect()
            }
            "ENV_TO_READ" => self.env_to_read = parse_list(value),
            "PRESERVE_ENV" => self.preserve_env = parse_bool(key, value)?,
            "RETRY_LIMIT" => self.retry_limit = parse_number(key, value)?,
            "RETRY_DELAY" => self.retry_delay = Duration::from_millis(parse_number(key, value)?),
            "REQUEST_TIMEOUT" => {
                self.request_timeout = Some(Duration::from_secs(parse_number(key, value)?))
            }
            "KEEPALIVE_TIME" => {
                self.keepalive_time = Some(Duration::from_secs(parse_number(key, value)?))
            }
            "CAS_DIGEST_FUNCTION" => self.cas_digest_function = value.parse()?,
            "WORKING_DIR_PREFIX" => self.working_dir_prefix = Some(PathBuf::from(value)),
            "MAX_THREADS" => self.max_threads = parse_number(key, value)?,
            "REAPI_VERSION" => self.reapi_version = value.to_string(),
            "NO_EXECUTE" => self.no_execute = parse_bool(key, value)?,
            "ENABLE_METRICS" => self.enable_metrics = parse_bool(key, value)?,
            "METRICS_FILE" => self.metrics_file = Some(PathBuf::from(value)),
            "METRICS_UDP_SERVER" => self.metrics_udp_server = Some(value.to_string()),
            "LOG_LEVEL" => self.log_level = value.to_string(),
            "LOG_DIRECTORY" => self.log_directory = Some(PathBuf::from(value)),
            "VERBOSE" => self.verbose = parse_bool(key, value)?,
            _ => {
                // Unknown keys are ignored so configs can be shared across
                // versions, but they are worth a trace.
                trace!("ignoring unknown configuration key {}", key);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.metrics_file.is_some() && self.metrics_udp_server.is_some() {
            bail!(ConfigError(
                "METRICS_FILE and METRICS_UDP_SERVER are mutually exclusive".to_string()
            ));
        }
        if !SUPPORTED_REAPI_VERSIONS.contains(&self.reapi_version.as_str()) {
            bail!(ConfigError(format!(
                "unsupported REAPI_VERSION \"{}\" (supported: {})",
                self.reapi_version,
                SUPPORTED_REAPI_VERSIONS.join(", ")
            )));
        }
        if let Some(prefix) = &self.working_dir_prefix {
            if prefix.is_absolute() {
                bail!(ConfigError(
                    "WORKING_DIR_PREFIX must be relative to the project root".to_string()
                ));
            }
        }
        Ok(())
    }

    /// Endpoint for the Execution service.
    pub fn execution_endpoint(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Endpoint for the CAS, defaulting to the execution server.
    pub fn cas_endpoint(&self) -> Option<&str> {
        self.cas_server.as_deref().or(self.server.as_deref())
    }

    /// Endpoint for the Action Cache, defaulting to the CAS.
    pub fn action_cache_endpoint(&self) -> Option<&str> {
        self.action_cache_server.as_deref().or(self.cas_endpoint())
    }

    /// Bound for blob transfer fan-out; MAX_THREADS=-1 means all cores.
    pub fn worker_count(&self) -> usize {
        if self.max_threads <= 0 {
            num_cpus::get()
        } else {
            self.max_threads as usize
        }
    }

    /// The environment sent in the remote Command: the configured allow-list
    /// (PRESERVE_ENV / ENV_TO_READ) overlaid with REMOTE_ENV_* overrides,
    /// ready for sorted insertion.
    pub fn remote_environment(&self) -> BTreeMap<String, String> {
        let mut composed = BTreeMap::new();
        if self.preserve_env {
            for (key, value) in env::vars() {
                if !key.starts_with(ENV_PREFIX) {
                    composed.insert(key, value);
                }
            }
        }
        for key in &self.env_to_read {
            if let Ok(value) = env::var(key) {
                composed.insert(key.clone(), value);
            }
        }
        for (key, value) in &self.remote_env {
            composed.insert(key.clone(), value.clone());
        }
        composed
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        // Presence alone turns a flag on, matching `KEY=` in a shell.
        "" | "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => bail!(ConfigError(format!(
            "invalid boolean \"{}\" for {}",
            value, key
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ConfigError(format!("invalid number \"{}\" for {}", value, key)).into())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_prefix_map(value: &str) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut map = Vec::new();
    for rule in value.split(':').filter(|s| !s.is_empty()) {
        let (from, to) = rule
            .split_once('=')
            .ok_or_else(|| ConfigError(format!("PREFIX_MAP rule \"{}\" is not from=to", rule)))?;
        let (from, to) = (PathBuf::from(from), PathBuf::from(to));
        if !from.is_absolute() || !to.is_absolute() {
            bail!(ConfigError(format!(
                "PREFIX_MAP rule \"{}\": both sides must be absolute",
                rule
            )));
        }
        map.push((from, to));
    }
    Ok(map)
}
