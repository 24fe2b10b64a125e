//! The worker-side half of the subprocess job protocol: payload shapes
//! carried across the parent/child boundary, and the `action` closure
//! `kiln_job::run_worker` drives once a re-exec'd binary is told
//! `--kiln-job-worker`.
//!
//! `Track` and `Fetch` are no-ops here: kind-specific source plugins are
//! out of scope, so those stages only need to exercise the state
//! transitions, not move real bytes. `Pull`, `Build`, and `Push` do real
//! work against [`kiln_artifact`] and [`kiln_remote`], since those are
//! exactly the modules this crate implements.
//!
//! The `commands` configuration key a "manual"-kind element carries
//! (`element.configuration["commands"]`, a JSON array of shell command
//! strings run in sequence) is this crate's own addition, giving `kiln
//! build` something concrete to run end to end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_artifact::{ArtifactStore, BuildResult, Completeness, FsRefStore, Keys};
use kiln_cas::FsStore;
use kiln_job::envelope::{ErrorEnvelope, LogLevel, LogRecord};
use kiln_job::JobSpec;
use kiln_remote::{ArtifactRef, ClientCertAuth, HttpRemoteCache, RemoteCache};
use serde::{Deserialize, Serialize};

/// One configured remote, as carried across the job boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub url: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub push: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullPayload {
    pub cache_dir: PathBuf,
    pub project: String,
    pub element_path: String,
    pub weak_key: String,
    pub remotes: Vec<RemoteSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepArtifact {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPayload {
    pub cache_dir: PathBuf,
    pub kind: String,
    pub commands: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub build_deps: Vec<DepArtifact>,
    pub weak_key: String,
    pub strict_key: Option<String>,
    pub strong_key: String,
    pub public_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub cache_dir: PathBuf,
    pub project: String,
    pub element_path: String,
    pub keys: Vec<String>,
    pub remotes: Vec<RemoteSpec>,
}

fn artifact_store(cache_dir: &Path) -> ArtifactStore<FsStore, FsRefStore> {
    ArtifactStore::new(FsStore::new(cache_dir), FsRefStore::new(cache_dir))
}

fn remote_client(spec: &RemoteSpec) -> Result<HttpRemoteCache, ErrorEnvelope> {
    let auth = ClientCertAuth { client_cert: spec.client_cert.clone(), client_key: spec.client_key.clone() };
    HttpRemoteCache::new(&spec.url, &auth).map_err(|e| ErrorEnvelope {
        domain: "remote".to_string(),
        reason: "client-setup-failed".to_string(),
        message: e.to_string(),
    })
}

fn err(domain: &str, reason: &str, message: impl Into<String>) -> ErrorEnvelope {
    ErrorEnvelope { domain: domain.to_string(), reason: reason.to_string(), message: message.into() }
}

/// Dispatches one [`JobSpec`] to the appropriate action. This is the
/// closure `kiln_job::run_worker` calls in a re-exec'd `kiln` process.
pub fn run_action(spec: JobSpec, log: &dyn Fn(LogRecord)) -> Result<serde_json::Value, ErrorEnvelope> {
    match spec.action_name.as_str() {
        "Track" => Ok(serde_json::json!({})),
        "Fetch" => Ok(serde_json::json!({})),
        "Pull" => run_pull(spec, log),
        "Build" => run_build(spec, log),
        "Push" => run_push(spec, log),
        other => Err(err("job", "unknown-action", format!("no worker action registered for {other:?}"))),
    }
}

fn run_pull(spec: JobSpec, log: &dyn Fn(LogRecord)) -> Result<serde_json::Value, ErrorEnvelope> {
    let payload: PullPayload = serde_json::from_value(spec.payload)
        .map_err(|e| err("job", "bad-payload", format!("malformed pull payload: {e}")))?;

    let artifact_ref = ArtifactRef { project: payload.project, element_path: payload.element_path, key: payload.weak_key };

    for remote in &payload.remotes {
        let client = remote_client(remote)?;
        match client.fetch_ref(&artifact_ref) {
            Ok(()) => {
                log(LogRecord { level: LogLevel::Info, message: format!("pulled {} from {}", artifact_ref, remote.url) });
                return Ok(serde_json::json!({"pulled": true, "remote": remote.url}));
            }
            Err(e) => {
                log(LogRecord { level: LogLevel::Warn, message: format!("{} does not have {}: {e}", remote.url, artifact_ref) });
            }
        }
    }

    Err(err("remote", "not-found", format!("no configured remote has {artifact_ref}")))
}

fn run_build(spec: JobSpec, log: &dyn Fn(LogRecord)) -> Result<serde_json::Value, ErrorEnvelope> {
    let payload: BuildPayload = serde_json::from_value(spec.payload)
        .map_err(|e| err("job", "bad-payload", format!("malformed build payload: {e}")))?;

    let workdir = tempfile::tempdir().map_err(|e| err("sandbox", "workdir-create-failed", e.to_string()))?;
    let staging = workdir.path().join("build");
    std::fs::create_dir_all(&staging).map_err(|e| err("sandbox", "workdir-create-failed", e.to_string()))?;

    let store = artifact_store(&payload.cache_dir);
    for dep in &payload.build_deps {
        let Ok(digest) = store.get_files(&dep.key) else { continue };
        let dest = staging.join("deps").join(&dep.name);
        store
            .store()
            .extract(&digest, &dest)
            .map_err(|e| err("sandbox", "stage-dependency-failed", format!("staging {}: {e}", dep.name)))?;
    }

    let mut log_text = String::new();
    let mut success = true;
    for command in &payload.commands {
        log(LogRecord { level: LogLevel::Info, message: command.clone() });
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&staging)
            .envs(&payload.environment)
            .output()
            .map_err(|e| err("sandbox", "spawn-failed", e.to_string()))?;
        log_text.push_str(&String::from_utf8_lossy(&output.stdout));
        log_text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            success = false;
            log(LogRecord { level: LogLevel::Fail, message: format!("command failed: {command}") });
            break;
        }
    }

    let build_result = BuildResult { success, description: payload.kind.clone(), detail: None };
    let keys = Keys {
        weak: payload.weak_key.clone(),
        strong: payload.strong_key.clone(),
    };
    let dependencies: BTreeMap<String, String> = payload.build_deps.iter().map(|d| (d.name.clone(), d.key.clone())).collect();

    let mut keys_to_commit: Vec<String> = vec![payload.weak_key.clone(), payload.strong_key.clone()];
    if let Some(strict) = &payload.strict_key {
        keys_to_commit.push(strict.clone());
    }
    keys_to_commit.sort();
    keys_to_commit.dedup();

    let collect_dir = if success { Some(staging.as_path()) } else { None };
    let bytes = store
        .cache(&payload.cache_dir.join(".artifact-staging").join(&payload.weak_key), None, collect_dir, Some(&log_text), &build_result, &keys, &dependencies, &payload.public_data, &keys_to_commit)
        .map_err(|e| err("sandbox", "commit-failed", e.to_string()))?;

    if success {
        Ok(serde_json::json!({"success": true, "bytes": bytes}))
    } else {
        Err(err("sandbox", "non-zero-exit", log_text))
    }
}

fn run_push(spec: JobSpec, log: &dyn Fn(LogRecord)) -> Result<serde_json::Value, ErrorEnvelope> {
    let payload: PushPayload = serde_json::from_value(spec.payload)
        .map_err(|e| err("job", "bad-payload", format!("malformed push payload: {e}")))?;

    let mut pushed = Vec::new();
    for remote in payload.remotes.iter().filter(|r| r.push) {
        let client = remote_client(remote)?;
        for key in &payload.keys {
            let artifact_ref =
                ArtifactRef { project: payload.project.clone(), element_path: payload.element_path.clone(), key: key.clone() };
            client
                .push_ref(&artifact_ref)
                .map_err(|e| err("remote", "push-failed", format!("pushing {artifact_ref} to {}: {e}", remote.url)))?;
            log(LogRecord { level: LogLevel::Info, message: format!("pushed {artifact_ref} to {}", remote.url) });
            pushed.push(artifact_ref.to_string());
        }
    }

    Ok(serde_json::json!({"pushed": pushed}))
}
