//! Cache-keyed derived-media generation.
//!
//! A [`GenerationRequest`](genmedia_types::GenerationRequest) is mapped to a
//! content-addressed [`CacheKey`](genmedia_types::CacheKey). On a miss the
//! [`Orchestrator`] takes a best-effort [`DedupLock`], produces the artifact
//! (a provider job that is submitted, polled and downloaded, or a local
//! resize) and stores it atomically so later identical requests are served
//! from disk.

pub mod classify;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod lock;
pub mod orchestrator;
pub mod poller;
pub mod provider;
pub mod source;
pub mod store;
pub mod transform;

pub use config::{Config, LockPolicy, RedirectCredentials};
pub use error::{ErrorContext, MediaError};
pub use fetcher::ResultFetcher;
pub use lock::{AcquireOutcome, DedupLock, FileLockStore, LockStore, MemoryLockStore};
pub use orchestrator::{Delivered, GenerationPipeline, Orchestrator, Producer, TransformPipeline};
pub use poller::Poller;
pub use provider::{GeminiProvider, GenerationProvider, JobSubmitter};
pub use source::SourceLoader;
pub use store::{ArtifactStore, FsArtifactStore};
pub use transform::{ImageResizer, Transform};
