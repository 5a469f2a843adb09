//! Shared data model for genmedia.
//!
//! Everything here is plain data: requests as delivered by the ingress layer,
//! the cache key that addresses a stored artifact, the artifact itself and the
//! serialisable error record handed back to callers. No I/O happens in this
//! crate.

pub mod artifact;
pub mod key;
pub mod mime;
pub mod record;
pub mod request;

pub use artifact::Artifact;
pub use key::CacheKey;
pub use record::{ErrorKind, ErrorRecord};
pub use request::{GenerationRequest, MediaKind, RequestError, ShapeValue, SourceRef, shape};
