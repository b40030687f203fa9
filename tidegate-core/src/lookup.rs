//! Fan-out lookup of mutable/immutable items across independent backends.
//!
//! The same keyed lookup goes to every backend at once. The first success is
//! returned straight away; the rest run to completion and are ignored. When
//! every backend fails, or there are none, the result is "not found".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::config::LookupConfig;

/// 20-byte lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target([u8; 20]);

impl Target {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// # Errors
    /// - `LookupError::InvalidTarget` - Not hex, or not 20 bytes
    pub fn from_hex(hex_str: &str) -> Result<Self, LookupError> {
        let bytes = hex::decode(hex_str).map_err(|e| LookupError::InvalidTarget {
            reason: e.to_string(),
        })?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| LookupError::InvalidTarget {
            reason: "target has bad length".to_string(),
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Invalid target: {reason}")]
    InvalidTarget { reason: String },

    #[error("Item not found")]
    NotFound,

    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One independent source of items.
#[async_trait]
pub trait ItemLookup: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> String;

    /// Bencoded item value for `target` under `salt`.
    ///
    /// # Errors
    /// Any error counts as a failure of this backend only.
    async fn get(&self, target: Target, salt: &[u8]) -> Result<Vec<u8>, LookupError>;
}

/// Queries all backends concurrently and keeps the first success.
#[derive(Clone)]
pub struct MultiSourceLookup {
    backends: Vec<Arc<dyn ItemLookup>>,
    timeout: Duration,
}

impl MultiSourceLookup {
    pub fn new(backends: Vec<Arc<dyn ItemLookup>>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    /// HTTP backends for every configured peer gateway.
    ///
    /// # Errors
    /// - `LookupError::Backend` - A backend URL is invalid
    /// - `LookupError::Http` - The HTTP client could not be built
    pub fn from_config(config: &LookupConfig) -> Result<Self, LookupError> {
        let backends = config
            .backends
            .iter()
            .map(|base| {
                HttpLookupBackend::new(base, config.timeout)
                    .map(|backend| Arc::new(backend) as Arc<dyn ItemLookup>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backends, config.timeout))
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// First successful value from any backend.
    ///
    /// Returns as soon as one backend succeeds. Otherwise waits for every
    /// backend to fail or time out.
    ///
    /// # Errors
    /// - `LookupError::NotFound` - Every backend failed, or there are none
    pub async fn get(&self, target: Target, salt: &[u8]) -> Result<Vec<u8>, LookupError> {
        if self.backends.is_empty() {
            return Err(LookupError::NotFound);
        }
        let (results, mut first) = mpsc::channel(self.backends.len());
        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let results = results.clone();
            let salt = salt.to_vec();
            let timeout = self.timeout;
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(timeout, backend.get(target, &salt)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(LookupError::Timeout(timeout)),
                };
                match outcome {
                    // Capacity covers every backend, so this never waits.
                    Ok(value) => {
                        let _ = results.send(value).await;
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Lookup of {} from {} failed: {}",
                            target,
                            backend.name(),
                            e
                        );
                    }
                }
            });
        }
        drop(results);
        first.recv().await.ok_or(LookupError::NotFound)
    }
}

impl fmt::Debug for MultiSourceLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSourceLookup")
            .field("backends", &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Asks a peer gateway's `/bep44` endpoint.
pub struct HttpLookupBackend {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpLookupBackend {
    /// # Errors
    /// - `LookupError::Backend` - `base_url` does not parse
    /// - `LookupError::Http` - The HTTP client could not be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let base_url = Url::parse(base_url).map_err(|e| LookupError::Backend {
            backend: base_url.to_string(),
            reason: format!("invalid URL: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tidegate/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self { base_url, client })
    }

    /// URL of the lookup request for `target` and `salt`.
    pub fn request_url(&self, target: Target, salt: &[u8]) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let mut url = format!("{base}/bep44?target={}", target.to_hex());
        if !salt.is_empty() {
            url.push_str("&salt=");
            url.push_str(&urlencoding::encode_binary(salt));
        }
        url
    }
}

#[async_trait]
impl ItemLookup for HttpLookupBackend {
    fn name(&self) -> String {
        self.base_url.to_string()
    }

    async fn get(&self, target: Target, salt: &[u8]) -> Result<Vec<u8>, LookupError> {
        let response = self
            .client
            .get(self.request_url(target, salt))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if !status.is_success() {
            return Err(LookupError::Backend {
                backend: self.name(),
                reason: format!("status {status}"),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    struct FakeBackend {
        name: &'static str,
        delay: Duration,
        value: Option<&'static [u8]>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ItemLookup for FakeBackend {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn get(&self, _target: Target, _salt: &[u8]) -> Result<Vec<u8>, LookupError> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            self.value.map(<[u8]>::to_vec).ok_or(LookupError::NotFound)
        }
    }

    fn backend(
        name: &'static str,
        delay_secs: u64,
        value: Option<&'static [u8]>,
        finished: &Arc<AtomicUsize>,
    ) -> Arc<dyn ItemLookup> {
        Arc::new(FakeBackend {
            name,
            delay: Duration::from_secs(delay_secs),
            value,
            finished: Arc::clone(finished),
        })
    }

    #[test]
    fn test_target_parsing() {
        let target = Target::from_hex(&"ab".repeat(20)).unwrap();
        assert_eq!(target.as_bytes(), &[0xab; 20]);

        let err = Target::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("target has bad length"));
        assert!(matches!(
            Target::from_hex("zz"),
            Err(LookupError::InvalidTarget { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_returns_without_waiting() {
        let finished = Arc::new(AtomicUsize::new(0));
        let lookup = MultiSourceLookup::new(
            vec![
                backend("slow-1", 10, None, &finished),
                backend("fast", 0, Some(b"3:abc"), &finished),
                backend("slow-3", 10, None, &finished),
            ],
            Duration::from_secs(60),
        );

        let start = Instant::now();
        let value = lookup.get(Target::new([1; 20]), b"").await.unwrap();
        assert_eq!(value, b"3:abc");
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_waits_for_every_backend() {
        let finished = Arc::new(AtomicUsize::new(0));
        let lookup = MultiSourceLookup::new(
            vec![
                backend("a", 1, None, &finished),
                backend("b", 2, None, &finished),
                backend("c", 3, None, &finished),
            ],
            Duration::from_secs(60),
        );

        let start = Instant::now();
        let result = lookup.get(Target::new([2; 20]), b"salt").await;
        assert!(matches!(result, Err(LookupError::NotFound)));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let finished = Arc::new(AtomicUsize::new(0));
        let lookup = MultiSourceLookup::new(
            vec![backend("hung", 3600, Some(b"late"), &finished)],
            Duration::from_secs(5),
        );

        let start = Instant::now();
        let result = lookup.get(Target::new([3; 20]), b"").await;
        assert!(matches!(result, Err(LookupError::NotFound)));
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_no_backends_is_not_found() {
        let lookup = MultiSourceLookup::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(
            lookup.get(Target::new([0; 20]), b"").await,
            Err(LookupError::NotFound)
        ));
    }

    #[test]
    fn test_http_backend_request_url() {
        let backend = HttpLookupBackend::new("http://peer:8080/", Duration::from_secs(1)).unwrap();
        let target = Target::new([0x0f; 20]);
        assert_eq!(
            backend.request_url(target, b""),
            format!("http://peer:8080/bep44?target={}", "0f".repeat(20))
        );
        assert_eq!(
            backend.request_url(target, b"a b"),
            format!("http://peer:8080/bep44?target={}&salt=a%20b", "0f".repeat(20))
        );
        assert!(HttpLookupBackend::new("not a url", Duration::from_secs(1)).is_err());
    }
}
