//! Request lifecycle: cache → lock → produce → store → release.
//!
//! The orchestrator is the only entry point the ingress layer calls. It owns
//! no provider logic; each [`MediaKind`] is served by a [`Producer`].
//!
//! 1. validate the request and derive its cache key;
//! 2. serve a stored artifact straight away (no lock, no network);
//! 3. take the dedup lock, applying [`LockPolicy`] when it is unavailable;
//! 4. look in the store again, since a previous holder may have finished;
//! 5. produce, store, release. The lease is released on every path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genmedia_types::{Artifact, CacheKey, GenerationRequest, MediaKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, LockPolicy};
use crate::error::{ErrorContext, MediaError};
use crate::fetcher::{ResultFetcher, no_redirect_client};
use crate::key;
use crate::lock::{AcquireOutcome, DedupLock, FileLockStore, LockLease};
use crate::poller::Poller;
use crate::provider::{GeminiProvider, GenerationProvider, JobSubmitter, Submission};
use crate::source::SourceLoader;
use crate::store::{ArtifactStore, FsArtifactStore};
use crate::transform::{ImageResizer, Transform};

/// Produces the artifact for one kind of request on a cache miss.
#[async_trait]
pub trait Producer: Send + Sync {
    /// How long the dedup lock must outlive the production.
    fn lock_ttl(&self) -> Duration;

    async fn produce(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact, MediaError>;
}

// ── producers ────────────────────────────────────────────────────────────────

/// Provider-backed generation: submit, poll, fetch.
pub struct GenerationPipeline {
    submitter: JobSubmitter,
    poller: Poller,
    poll_interval: Duration,
    poll_max_wait: Duration,
    lock_ttl: Duration,
}

impl GenerationPipeline {
    pub fn new(
        submitter: JobSubmitter,
        poller: Poller,
        poll_interval: Duration,
        poll_max_wait: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            submitter,
            poller,
            poll_interval,
            poll_max_wait,
            lock_ttl,
        }
    }
}

#[async_trait]
impl Producer for GenerationPipeline {
    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    async fn produce(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact, MediaError> {
        let submission = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MediaError::cancelled()),
            submitted = self.submitter.submit(request) => submitted?,
        };

        match submission {
            Submission::Pending(handle) => {
                self.poller
                    .poll(&handle, self.poll_max_wait, self.poll_interval, cancel)
                    .await
            }
            Submission::Completed(artifact_ref) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MediaError::cancelled()),
                    fetched = self.poller.fetcher().fetch(&artifact_ref) => fetched,
                }
            }
        }
    }
}

/// Local resize of the single source image.
pub struct TransformPipeline {
    sources: SourceLoader,
    transform: Arc<dyn Transform>,
    lock_ttl: Duration,
}

impl TransformPipeline {
    pub fn new(sources: SourceLoader, transform: Arc<dyn Transform>, lock_ttl: Duration) -> Self {
        Self {
            sources,
            transform,
            lock_ttl,
        }
    }
}

#[async_trait]
impl Producer for TransformPipeline {
    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    async fn produce(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<Artifact, MediaError> {
        let Some(source) = request.sources.first() else {
            return Err(MediaError::validation("resize needs a source image"));
        };
        let image = self.sources.load(source).await?;
        self.transform.apply(image.bytes, &request.shape).await
    }
}

// ── orchestrator ─────────────────────────────────────────────────────────────

/// A fulfilled request.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub key: CacheKey,
    pub artifact: Artifact,
    /// Served from the store without producing anything.
    pub cached: bool,
}

pub struct Orchestrator {
    store: Arc<dyn ArtifactStore>,
    lock: DedupLock,
    lock_policy: LockPolicy,
    lock_retries: u32,
    generation: Option<Arc<dyn Producer>>,
    transform: Option<Arc<dyn Producer>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ArtifactStore>, lock: DedupLock) -> Self {
        Self {
            store,
            lock,
            lock_policy: LockPolicy::default(),
            lock_retries: 3,
            generation: None,
            transform: None,
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy, retries: u32) -> Self {
        self.lock_policy = policy;
        self.lock_retries = retries;
        self
    }

    pub fn with_generation(mut self, producer: Arc<dyn Producer>) -> Self {
        self.generation = Some(producer);
        self
    }

    pub fn with_transform(mut self, producer: Arc<dyn Producer>) -> Self {
        self.transform = Some(producer);
        self
    }

    /// Wire every component from `config`. Generation is only enabled when
    /// an API key is configured; resize always is.
    pub fn from_config(config: &Config) -> Result<Self, MediaError> {
        let http = no_redirect_client()?;
        let sources_http = reqwest::Client::builder()
            .user_agent(concat!("genmedia/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MediaError::Internal {
                message: format!("failed to build HTTP client: {e}"),
                context: ErrorContext::default(),
            })?;
        let sources = SourceLoader::new(&config.media_root, sources_http, config.submit_timeout);

        let store = Arc::new(FsArtifactStore::new(&config.store_root));
        let lock = DedupLock::new(
            Arc::new(FileLockStore::new(&config.lock_dir)),
            config.lock_retry_interval,
        );
        let transform = Arc::new(TransformPipeline::new(
            sources.clone(),
            Arc::new(ImageResizer::new()),
            config.lock_ttl,
        ));

        let mut orchestrator = Self::new(store, lock)
            .with_lock_policy(config.lock_policy, config.lock_retries)
            .with_transform(transform);

        if let Some(api_key) = &config.api_key {
            let provider: Arc<dyn GenerationProvider> = Arc::new(GeminiProvider::new(
                http.clone(),
                &config.base_url,
                api_key,
                &config.video_model,
                &config.image_model,
                config.submit_timeout,
            ));
            let fetcher = ResultFetcher::new(http, &config.base_url, Some(api_key.clone()))
                .with_max_redirects(config.max_redirects)
                .with_credentials(config.redirect_credentials)
                .with_timeout(config.download_timeout)
                .with_signature_check(config.verify_signature);
            let pipeline = GenerationPipeline::new(
                JobSubmitter::new(provider.clone(), sources),
                Poller::new(provider, fetcher),
                config.poll_interval,
                config.poll_max_wait,
                config.generation_lock_ttl(),
            );
            orchestrator = orchestrator.with_generation(Arc::new(pipeline));
        }
        Ok(orchestrator)
    }

    pub async fn handle(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Delivered, MediaError> {
        request.validate()?;
        let key = key::derive(request);

        if let Some(artifact) = self.store.get(&key).await? {
            info!(key = %key.short(), kind = %request.kind, "cache hit");
            return Ok(Delivered {
                key,
                artifact,
                cached: true,
            });
        }
        info!(key = %key.short(), kind = %request.kind, "cache miss");

        let producer = self.producer_for(request.kind)?;
        let lease = self.lock(&key, producer.lock_ttl(), cancel).await?;

        let outcome = self.produce_and_store(&key, request, producer.as_ref(), cancel).await;

        if let Some(lease) = lease {
            self.lock.release(lease).await;
        }
        outcome
    }

    fn producer_for(&self, kind: MediaKind) -> Result<&Arc<dyn Producer>, MediaError> {
        let producer = match kind {
            MediaKind::Video | MediaKind::Image => self.generation.as_ref(),
            MediaKind::Resize => self.transform.as_ref(),
        };
        producer.ok_or_else(|| match kind {
            MediaKind::Video | MediaKind::Image => {
                MediaError::validation("generation is not configured (missing API key)")
            }
            MediaKind::Resize => MediaError::validation("resize is not configured"),
        })
    }

    /// Acquire the dedup lock. `None` means proceeding without exclusivity.
    async fn lock(
        &self,
        key: &CacheKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockLease>, MediaError> {
        let reason = match self.lock.acquire(key, self.lock_retries, ttl, cancel).await {
            AcquireOutcome::Acquired(lease) => return Ok(Some(lease)),
            AcquireOutcome::Cancelled => return Err(MediaError::cancelled()),
            AcquireOutcome::Contended => "still held by another caller".to_owned(),
            AcquireOutcome::StoreUnavailable(e) => e.to_string(),
        };

        match self.lock_policy {
            LockPolicy::FailOpen => {
                warn!(
                    key = %key.short(),
                    reason = %reason,
                    "proceeding without dedup lock (fail-open)"
                );
                Ok(None)
            }
            LockPolicy::FailClosed => Err(MediaError::LockUnavailable {
                key: key.to_string(),
                message: reason,
            }),
        }
    }

    async fn produce_and_store(
        &self,
        key: &CacheKey,
        request: &GenerationRequest,
        producer: &dyn Producer,
        cancel: &CancellationToken,
    ) -> Result<Delivered, MediaError> {
        // Another holder may have stored it while we waited for the lock.
        if let Some(artifact) = self.store.get(key).await? {
            debug!(key = %key.short(), "artifact appeared while waiting for lock");
            return Ok(Delivered {
                key: key.clone(),
                artifact,
                cached: true,
            });
        }

        let artifact = producer.produce(request, cancel).await?;
        self.store.put(key, &artifact).await?;
        Ok(Delivered {
            key: key.clone(),
            artifact,
            cached: false,
        })
    }
}
