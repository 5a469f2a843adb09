//! Drives a provider job to a terminal state.
//!
//! ```text
//! Running --check--> Running | Completed | Failed | Blocked
//! ```
//!
//! Every wait is a timer suspension raced against the caller's
//! [`CancellationToken`], so a caller that goes away releases the task at
//! once instead of after the next interval. The sleep before the last check
//! is clamped to the deadline, so a job that never finishes fails with
//! `Timeout` at `max_wait`.

use std::sync::Arc;
use std::time::Duration;

use genmedia_types::{Artifact, ErrorKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify, safety_blocked};
use crate::error::{ErrorContext, MediaError};
use crate::fetcher::ResultFetcher;
use crate::provider::{GenerationProvider, JobHandle, JobState};

pub struct Poller {
    provider: Arc<dyn GenerationProvider>,
    fetcher: ResultFetcher,
}

impl Poller {
    pub fn new(provider: Arc<dyn GenerationProvider>, fetcher: ResultFetcher) -> Self {
        Self { provider, fetcher }
    }

    pub fn fetcher(&self) -> &ResultFetcher {
        &self.fetcher
    }

    /// Poll `handle` every `interval` until it is terminal, `max_wait` has
    /// elapsed, or `cancel` fires. A completed job's artifact is fetched
    /// before returning.
    pub async fn poll(
        &self,
        handle: &JobHandle,
        max_wait: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Artifact, MediaError> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let job = handle.as_str();
        let annotate = |e: MediaError| e.with_job(job).with_elapsed(started.elapsed());

        let mut check: u32 = 0;
        loop {
            check += 1;
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(annotate(MediaError::cancelled())),
                state = self.provider.status(handle) => state.map_err(annotate)?,
            };
            debug!(
                job,
                check,
                elapsed_ms = started.elapsed().as_millis() as u64,
                terminal = state.is_terminal(),
                "job status checked"
            );

            match state {
                JobState::Running => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(job, checks = check, max_wait_secs = max_wait.as_secs(), "job timed out");
                        return Err(annotate(MediaError::Timeout {
                            message: format!(
                                "job did not complete within {}s",
                                max_wait.as_secs_f64()
                            ),
                            context: ErrorContext::default(),
                        }));
                    }
                    let nap = interval.min(deadline - now);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(annotate(MediaError::cancelled())),
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
                JobState::Completed(artifact_ref) => {
                    info!(
                        job,
                        checks = check,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job completed"
                    );
                    let artifact = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(annotate(MediaError::cancelled())),
                        fetched = self.fetcher.fetch(&artifact_ref) => fetched.map_err(annotate)?,
                    };
                    return Ok(artifact);
                }
                JobState::Failed { raw } => {
                    let err = classify(None, &raw);
                    warn!(job, kind = %err.kind(), "job failed");
                    return Err(annotate(err));
                }
                JobState::Blocked { raw } => {
                    let mut err = classify(None, &raw);
                    if err.kind() != ErrorKind::SafetyBlocked {
                        err = safety_blocked(Vec::new(), ErrorContext::with_raw(raw));
                    }
                    warn!(job, "job blocked by safety filters");
                    return Err(annotate(err));
                }
            }
        }
    }
}
