//! The remote cache push/pull contract.
//!
//! `kiln-remote` defines the abstract four-operation contract
//! (`has_ref`/`fetch_ref`/`push_ref`/`list`) that the pull and push queues
//! (`kiln-queue`) drive, plus one concrete HTTP-backed implementation: a
//! `reqwest::blocking::Client` hitting a base URL with status-code
//! branching and a fixed `User-Agent`, adapted to a content-addressed
//! artifact-ref surface instead of a package-registry API.
//!
//! # Example
//!
//! ```
//! use kiln_remote::ArtifactRef;
//!
//! let r: ArtifactRef = "myproject/libs/base.bst/abcd1234".parse().unwrap();
//! assert_eq!(r.project, "myproject");
//! assert_eq!(r.element_path, "libs/base.bst");
//! assert_eq!(r.to_string(), "myproject/libs/base.bst/abcd1234");
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Default timeout for remote-cache requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fixed user agent sent on every request, stamped with this crate's
/// own version.
pub const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

/// An artifact reference: `<project>/<element-path-no-.bst>/<cache-key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub project: String,
    pub element_path: String,
    pub key: String,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.element_path, self.key)
    }
}

impl FromStr for ArtifactRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (project, rest) = s.split_once('/').with_context(|| format!("malformed artifact ref: {s:?}"))?;
        let (element_path, key) = rest.rsplit_once('/').with_context(|| format!("malformed artifact ref: {s:?}"))?;
        if project.is_empty() || element_path.is_empty() || key.is_empty() {
            anyhow::bail!("malformed artifact ref: {s:?}");
        }
        if !kiln_types::is_key(key) {
            anyhow::bail!("artifact ref {s:?} does not end in a valid cache key");
        }
        Ok(ArtifactRef { project: project.to_string(), element_path: element_path.to_string(), key: key.to_string() })
    }
}

/// The abstract remote-cache contract: four operations every transport
/// must honor, regardless of wire format.
pub trait RemoteCache {
    fn has_ref(&self, r: &ArtifactRef) -> Result<bool>;
    /// Pulls the blobs composing the artifact referenced by `r`.
    fn fetch_ref(&self, r: &ArtifactRef) -> Result<()>;
    /// Uploads whatever blobs the remote is missing for `r`.
    fn push_ref(&self, r: &ArtifactRef) -> Result<()>;
    fn list(&self, glob: &str) -> Result<Vec<ArtifactRef>>;
}

/// Client-certificate configuration for an [`HttpRemoteCache`]. Both or
/// neither must be configured; exactly one is a load error.
#[derive(Debug, Clone, Default)]
pub struct ClientCertAuth {
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl ClientCertAuth {
    fn validate(&self) -> Result<()> {
        if self.client_cert.is_some() != self.client_key.is_some() {
            anyhow::bail!("client_cert and client_key must both be set or both be absent");
        }
        Ok(())
    }
}

/// An HTTP-backed remote cache: a `reqwest::blocking::Client` hitting a
/// base URL with status-code-driven branching (`200` = present, `404` =
/// absent, anything else is an error).
#[derive(Debug, Clone)]
pub struct HttpRemoteCache {
    base_url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl HttpRemoteCache {
    /// Builds a client for `base_url`. Fails if `auth` has exactly one of
    /// `client_cert`/`client_key` set.
    pub fn new(base_url: &str, auth: &ClientCertAuth) -> Result<Self> {
        auth.validate()?;

        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT);

        if let (Some(cert_path), Some(key_path)) = (&auth.client_cert, &auth.client_key) {
            let mut pem = std::fs::read(cert_path)
                .with_context(|| format!("failed to read client cert {}", cert_path.display()))?;
            let mut key_pem = std::fs::read(key_path)
                .with_context(|| format!("failed to read client key {}", key_path.display()))?;
            pem.append(&mut key_pem);
            let identity = reqwest::Identity::from_pem(&pem).context("failed to build client identity from cert/key pair")?;
            builder = builder.identity(identity);
        }

        let client = builder.build().context("failed to build HTTP client")?;

        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS), client })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.timeout = timeout;
        self.client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to rebuild HTTP client with new timeout")?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ref_url(&self, r: &ArtifactRef) -> String {
        format!("{}/artifacts/{}", self.base_url, r)
    }
}

impl RemoteCache for HttpRemoteCache {
    fn has_ref(&self, r: &ArtifactRef) -> Result<bool> {
        let response = self.client.head(self.ref_url(r)).send().context("has_ref request failed")?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(anyhow::anyhow!("unexpected status checking {r}: {status}")),
        }
    }

    fn fetch_ref(&self, r: &ArtifactRef) -> Result<()> {
        let response = self.client.get(self.ref_url(r)).send().context("fetch_ref request failed")?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(anyhow::anyhow!("remote has no artifact for {r}")),
            status => Err(anyhow::anyhow!("unexpected status fetching {r}: {status}")),
        }
    }

    fn push_ref(&self, r: &ArtifactRef) -> Result<()> {
        let response = self.client.put(self.ref_url(r)).send().context("push_ref request failed")?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("unexpected status pushing {r}: {}", response.status()))
        }
    }

    fn list(&self, glob: &str) -> Result<Vec<ArtifactRef>> {
        let url = format!("{}/artifacts?glob={}", self.base_url, glob);
        let response = self.client.get(url).send().context("list request failed")?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("unexpected status listing {glob:?}: {}", response.status()));
        }
        let body: Vec<String> = response.json().context("failed to parse list response")?;
        body.iter().map(|s| s.parse()).collect()
    }
}

/// An in-memory `RemoteCache` used in tests and as a stand-in when no real
/// transport is configured: mirrors the shape of a content-addressed
/// remote without any network dependency.
#[derive(Debug, Default)]
pub struct MemoryRemoteCache {
    refs: std::sync::Mutex<std::collections::BTreeSet<String>>,
}

impl MemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, r: &ArtifactRef) {
        self.refs.lock().expect("lock poisoned").insert(r.to_string());
    }
}

impl RemoteCache for MemoryRemoteCache {
    fn has_ref(&self, r: &ArtifactRef) -> Result<bool> {
        Ok(self.refs.lock().expect("lock poisoned").contains(&r.to_string()))
    }

    fn fetch_ref(&self, r: &ArtifactRef) -> Result<()> {
        if self.has_ref(r)? {
            Ok(())
        } else {
            Err(anyhow::anyhow!("remote has no artifact for {r}"))
        }
    }

    fn push_ref(&self, r: &ArtifactRef) -> Result<()> {
        self.seed(r);
        Ok(())
    }

    fn list(&self, glob: &str) -> Result<Vec<ArtifactRef>> {
        let prefix = glob.trim_end_matches('*');
        self.refs
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|s| s.starts_with(prefix))
            .map(|s| s.parse())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_ref() -> ArtifactRef {
        ArtifactRef { project: "myproject".to_string(), element_path: "libs/base.bst".to_string(), key: "a".repeat(64) }
    }

    #[test]
    fn artifact_ref_roundtrips_through_display_and_parse() {
        let r = sample_ref();
        let s = r.to_string();
        let parsed: ArtifactRef = s.parse().expect("parse");
        assert_eq!(parsed, r);
    }

    #[test]
    fn artifact_ref_rejects_missing_segments() {
        assert!("no-slashes-at-all".parse::<ArtifactRef>().is_err());
        assert!("project/onlytwo".parse::<ArtifactRef>().is_err());
    }

    #[test]
    fn artifact_ref_rejects_invalid_key_shape() {
        assert!("project/path/not-a-key".parse::<ArtifactRef>().is_err());
    }

    #[test]
    fn client_cert_auth_requires_both_or_neither() {
        let cert_only = ClientCertAuth { client_cert: Some(PathBuf::from("c.pem")), client_key: None };
        assert!(cert_only.validate().is_err());

        let neither = ClientCertAuth::default();
        assert!(neither.validate().is_ok());
    }

    #[test]
    fn http_remote_cache_rejects_lopsided_auth() {
        let auth = ClientCertAuth { client_cert: Some(PathBuf::from("c.pem")), client_key: None };
        assert!(HttpRemoteCache::new("https://cache.example", &auth).is_err());
    }

    #[test]
    fn http_remote_cache_base_url_trims_trailing_slash() {
        let client = HttpRemoteCache::new("https://cache.example/", &ClientCertAuth::default()).expect("build");
        assert_eq!(client.base_url(), "https://cache.example");
    }

    #[test]
    fn memory_remote_cache_push_then_has_and_fetch() {
        let cache = MemoryRemoteCache::new();
        let r = sample_ref();
        assert!(!cache.has_ref(&r).unwrap());
        cache.push_ref(&r).unwrap();
        assert!(cache.has_ref(&r).unwrap());
        assert!(cache.fetch_ref(&r).is_ok());
    }

    #[test]
    fn memory_remote_cache_fetch_of_absent_ref_errors() {
        let cache = MemoryRemoteCache::new();
        assert!(cache.fetch_ref(&sample_ref()).is_err());
    }

    #[test]
    fn memory_remote_cache_list_filters_by_prefix() {
        let cache = MemoryRemoteCache::new();
        cache.seed(&sample_ref());
        cache.seed(&ArtifactRef { project: "other".to_string(), element_path: "x.bst".to_string(), key: "b".repeat(64) });

        let found = cache.list("myproject*").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], sample_ref());
    }

    #[test]
    fn user_agent_includes_crate_version() {
        assert!(USER_AGENT.starts_with("kiln/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    proptest! {
        #[test]
        fn artifact_ref_roundtrips_for_arbitrary_segments(
            project in "[a-z][a-z0-9_-]{0,15}",
            element_path in "[a-z][a-z0-9_./-]{0,31}",
            key in "[0-9a-f]{64}",
        ) {
            let r = ArtifactRef { project, element_path, key };
            let s = r.to_string();
            let parsed: ArtifactRef = s.parse().expect("our own rendering always re-parses");
            prop_assert_eq!(parsed, r);
        }
    }

    /// A minimal in-process HTTP server standing in for a real remote cache,
    /// exercised over an actual socket rather than mocked at the `reqwest`
    /// layer.
    fn spawn_fake_remote() -> (tiny_http::Server, String) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake remote");
        let base_url = format!("http://{}", server.server_addr());
        (server, base_url)
    }

    #[test]
    fn http_remote_cache_has_ref_reflects_status_code() {
        let (server, base_url) = spawn_fake_remote();
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("receive request");
            let response = tiny_http::Response::from_string("").with_status_code(tiny_http::StatusCode(200));
            request.respond(response).expect("respond");
        });

        let cache = HttpRemoteCache::new(&base_url, &ClientCertAuth::default()).expect("build client");
        let found = cache.has_ref(&sample_ref()).expect("has_ref");
        assert!(found);

        handle.join().expect("server thread");
    }

    #[test]
    fn http_remote_cache_has_ref_false_on_404() {
        let (server, base_url) = spawn_fake_remote();
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("receive request");
            let response = tiny_http::Response::from_string("").with_status_code(tiny_http::StatusCode(404));
            request.respond(response).expect("respond");
        });

        let cache = HttpRemoteCache::new(&base_url, &ClientCertAuth::default()).expect("build client");
        let found = cache.has_ref(&sample_ref()).expect("has_ref");
        assert!(!found);

        handle.join().expect("server thread");
    }

    #[test]
    fn http_remote_cache_push_ref_succeeds_on_2xx() {
        let (server, base_url) = spawn_fake_remote();
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("receive request");
            let response = tiny_http::Response::from_string("").with_status_code(tiny_http::StatusCode(204));
            request.respond(response).expect("respond");
        });

        let cache = HttpRemoteCache::new(&base_url, &ClientCertAuth::default()).expect("build client");
        cache.push_ref(&sample_ref()).expect("push_ref");

        handle.join().expect("server thread");
    }
}
