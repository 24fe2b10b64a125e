//! Session/project configuration for `kiln`: persisted state layout and
//! scheduler tunables.
//!
//! This is *not* the YAML element/project loader — it's the ambient layer
//! every build tool needs regardless: cache directory location, scheduler
//! concurrency, on-error policy, artifact completeness, and the remote
//! cache list. Layering follows the familiar `config.rs` shape: defaults →
//! `.toml` file → environment overrides.
//!
//! # Example
//!
//! ```
//! use kiln_config::{SessionConfig, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! assert!(config.n_builders() >= 1);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "kiln.toml";

/// The cache-policy enum threaded through `kiln-cachekey`/`kiln-state`:
/// strict mode makes the strong key always equal the strict key; non-strict
/// allows it to diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    #[default]
    NonStrict,
    Strict,
}

/// What happens to in-flight jobs when a fatal error is encountered
/// elsewhere in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Let in-flight jobs finish; stop queueing new ones.
    #[default]
    Continue,
    /// Terminate in-flight jobs immediately.
    Quit,
}

/// How thoroughly `cached()` verifies an artifact's `files/` subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    DirectoriesOnly,
    #[default]
    FilesAndContents,
}

/// The config file path for a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    policy: PolicyConfig,
    #[serde(default)]
    remotes: Vec<RemoteEntry>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn cache_quota_bytes(&self) -> Option<u64> {
        self.cache.quota_bytes
    }

    pub fn completeness(&self) -> Completeness {
        self.cache.completeness
    }

    pub fn n_builders(&self) -> u32 {
        self.scheduler.n_builders
    }

    pub fn n_fetchers(&self) -> u32 {
        self.scheduler.n_fetchers
    }

    pub fn n_pushers(&self) -> u32 {
        self.scheduler.n_pushers
    }

    pub fn on_error(&self) -> OnError {
        self.scheduler.on_error
    }

    pub fn key_policy(&self) -> KeyPolicy {
        self.policy.key_policy
    }

    pub fn strict(&self) -> bool {
        self.policy.key_policy == KeyPolicy::Strict
    }

    /// Whether a cached build failure may be pushed to a remote cache.
    /// Disabled by default: pushing a failed build's artifact interacts
    /// poorly with `on-error=continue` (see DESIGN.md), so it requires an
    /// explicit opt-in.
    pub fn push_cached_failures(&self) -> bool {
        self.policy.push_cached_failures
    }

    pub fn remotes(&self) -> &[RemoteEntry] {
        &self.remotes
    }

    /// Merges this config with another, with `other`'s explicitly-set
    /// fields taking precedence. Used to layer CLI flags over a loaded
    /// file.
    pub fn merge(&self, other: &SessionConfig) -> SessionConfig {
        SessionConfig {
            cache: CacheConfig {
                dir: other.cache.dir.clone().or_else(|| self.cache.dir.clone()),
                quota_bytes: other.cache.quota_bytes.or(self.cache.quota_bytes),
                completeness: other.cache.completeness,
            },
            scheduler: SchedulerConfig {
                n_builders: pick_non_default(other.scheduler.n_builders, self.scheduler.n_builders, default_n_builders()),
                n_fetchers: pick_non_default(other.scheduler.n_fetchers, self.scheduler.n_fetchers, default_n_fetchers()),
                n_pushers: pick_non_default(other.scheduler.n_pushers, self.scheduler.n_pushers, default_n_pushers()),
                on_error: other.scheduler.on_error,
                terminate_grace: other.scheduler.terminate_grace,
            },
            policy: PolicyConfig {
                key_policy: other.policy.key_policy,
                push_cached_failures: other.policy.push_cached_failures || self.policy.push_cached_failures,
            },
            remotes: if other.remotes.is_empty() { self.remotes.clone() } else { other.remotes.clone() },
        }
    }

    /// Applies `KILN_*` environment variable overrides on top of a loaded
    /// config (layered defaults -> file -> environment).
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("KILN_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Ok(n) = std::env::var("KILN_BUILDERS").and_then(|v| v.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.scheduler.n_builders = n;
        }
        if let Ok(n) = std::env::var("KILN_FETCHERS").and_then(|v| v.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.scheduler.n_fetchers = n;
        }
        if let Ok(n) = std::env::var("KILN_PUSHERS").and_then(|v| v.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.scheduler.n_pushers = n;
        }
        if std::env::var("KILN_STRICT").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false) {
            self.policy.key_policy = KeyPolicy::Strict;
        }
        // `KILN_FORCE_BACKEND`/`KILN_FORCE_SANDBOX` are read by the (out of
        // scope) sandbox backend selector; kept here only as inert
        // passthrough so the env-var surface is stable for callers that set it.
    }

    pub fn terminate_grace(&self) -> Duration {
        self.scheduler.terminate_grace
    }
}

fn pick_non_default(candidate: u32, fallback: u32, default: u32) -> u32 {
    if candidate != default { candidate } else { fallback }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".kiln-cache")
}

fn default_n_builders() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4)
}

fn default_n_fetchers() -> u32 {
    4
}

fn default_n_pushers() -> u32 {
    4
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota_bytes: Option<u64>,
    #[serde(default)]
    completeness: Completeness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchedulerConfig {
    #[serde(default = "default_n_builders")]
    n_builders: u32,
    #[serde(default = "default_n_fetchers")]
    n_fetchers: u32,
    #[serde(default = "default_n_pushers")]
    n_pushers: u32,
    #[serde(default)]
    on_error: OnError,
    #[serde(default = "default_terminate_grace", with = "humantime_serde")]
    terminate_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            n_builders: default_n_builders(),
            n_fetchers: default_n_fetchers(),
            n_pushers: default_n_pushers(),
            on_error: OnError::default(),
            terminate_grace: default_terminate_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PolicyConfig {
    #[serde(default)]
    key_policy: KeyPolicy,
    #[serde(default)]
    push_cached_failures: bool,
}

/// One configured remote cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub push: bool,
}

impl RemoteEntry {
    /// A client cert and key must both be set or both be absent; exactly
    /// one configured is a load error.
    pub fn validate(&self) -> Result<()> {
        if self.client_cert.is_some() != self.client_key.is_some() {
            anyhow::bail!(
                "remote {:?}: client_cert and client_key must both be set or both be absent",
                self.url
            );
        }
        Ok(())
    }
}

/// Loads configuration from a directory, looking for `kiln.toml`, then
/// applying `KILN_*` environment overrides. A missing file yields defaults.
pub fn load_config(dir: &Path) -> Result<SessionConfig> {
    let path = config_path(dir);
    let mut config = if path.exists() { load_config_from_file(&path)? } else { SessionConfig::default() };
    config.apply_env();
    for remote in &config.remotes {
        remote.validate()?;
    }
    Ok(config)
}

/// Loads configuration from a specific file path, without environment
/// overrides.
pub fn load_config_from_file(path: &Path) -> Result<SessionConfig> {
    if !path.exists() {
        return Ok(SessionConfig::default());
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: SessionConfig =
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Saves configuration to `kiln.toml` in a directory.
pub fn save_config(dir: &Path, config: &SessionConfig) -> Result<()> {
    let path = config_path(dir);
    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;
    std::fs::write(&path, content).with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Finds a config file by walking up the directory tree from `start_dir`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_sane_scheduler_tunables() {
        let config = SessionConfig::new();
        assert!(config.n_builders() >= 1);
        assert_eq!(config.n_fetchers(), 4);
        assert_eq!(config.on_error(), OnError::Continue);
        assert_eq!(config.key_policy(), KeyPolicy::NonStrict);
        assert!(!config.push_cached_failures());
    }

    #[test]
    fn load_missing_config_returns_default() {
        let td = tempdir().expect("tempdir");
        let config = load_config(td.path()).expect("load");
        assert_eq!(config.n_fetchers(), 4);
    }

    #[test]
    fn save_and_load_config_roundtrips() {
        let td = tempdir().expect("tempdir");

        let mut config = SessionConfig::new();
        config.scheduler.n_builders = 8;
        config.policy.key_policy = KeyPolicy::Strict;

        save_config(td.path(), &config).expect("save");

        let loaded = load_config_from_file(&config_path(td.path())).expect("load");
        assert_eq!(loaded.n_builders(), 8);
        assert_eq!(loaded.key_policy(), KeyPolicy::Strict);
    }

    #[test]
    fn load_config_from_toml() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);

        let content = r#"
[cache]
dir = "/var/cache/kiln"
quota_bytes = 1000000

[scheduler]
n_builders = 16
n_fetchers = 2
on_error = "quit"

[policy]
key_policy = "strict"
push_cached_failures = true
"#;
        std::fs::write(&path, content).expect("write");

        let config = load_config_from_file(&path).expect("load");
        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.cache_quota_bytes(), Some(1_000_000));
        assert_eq!(config.n_builders(), 16);
        assert_eq!(config.n_fetchers(), 2);
        assert_eq!(config.on_error(), OnError::Quit);
        assert_eq!(config.key_policy(), KeyPolicy::Strict);
        assert!(config.push_cached_failures());
    }

    #[test]
    fn merge_prefers_explicit_overrides() {
        let mut base = SessionConfig::new();
        base.scheduler.n_builders = 4;

        let mut overrides = SessionConfig::new();
        overrides.scheduler.n_builders = 16;

        let merged = base.merge(&overrides);
        assert_eq!(merged.n_builders(), 16);
    }

    #[test]
    fn find_config_walks_up_directory_tree() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).expect("create dirs");

        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "[cache]\n").expect("write");

        assert_eq!(find_config(&nested), Some(path));
    }

    #[test]
    fn find_config_returns_none_if_not_found() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create dirs");
        assert!(find_config(&nested).is_none());
    }

    #[test]
    fn remote_entry_rejects_lopsided_client_cert_pair() {
        let remote = RemoteEntry {
            url: "https://cache.example".to_string(),
            client_cert: Some(PathBuf::from("cert.pem")),
            client_key: None,
            push: false,
        };
        assert!(remote.validate().is_err());
    }

    #[test]
    fn remote_entry_accepts_both_or_neither() {
        let neither = RemoteEntry { url: "u".into(), client_cert: None, client_key: None, push: false };
        assert!(neither.validate().is_ok());

        let both = RemoteEntry {
            url: "u".into(),
            client_cert: Some(PathBuf::from("c")),
            client_key: Some(PathBuf::from("k")),
            push: false,
        };
        assert!(both.validate().is_ok());
    }

    #[test]
    fn config_path_helper() {
        let dir = PathBuf::from("/project");
        assert_eq!(config_path(&dir), PathBuf::from("/project/kiln.toml"));
    }

    proptest! {
        #[test]
        fn scheduler_tunables_roundtrip_through_toml(
            n_builders in 1u32..64,
            n_fetchers in 1u32..64,
            strict in any::<bool>(),
        ) {
            let mut config = SessionConfig::new();
            config.scheduler.n_builders = n_builders;
            config.scheduler.n_fetchers = n_fetchers;
            config.policy.key_policy = if strict { KeyPolicy::Strict } else { KeyPolicy::NonStrict };

            let td = tempdir().expect("tempdir");
            save_config(td.path(), &config).expect("save");
            let loaded = load_config_from_file(&config_path(td.path())).expect("load");

            prop_assert_eq!(loaded.n_builders(), n_builders);
            prop_assert_eq!(loaded.n_fetchers(), n_fetchers);
            prop_assert_eq!(loaded.key_policy(), config.policy.key_policy);
        }
    }
}
