//! Concurrent Hit Dispatch
//!
//! Fires `hit_count` independent hits on a dedicated rayon pool and hands
//! back one [`HitResult`] per hit, in submission order. A failing or
//! panicking request never affects its siblings.
//!
//! Payload preparation is different: it is the caller's code, it sees the
//! same batch size for every hit, and a panic there aborts the whole
//! dispatch once the remaining hits have finished.

use crate::error::{Categorized, ErrorCategory};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Failure of a single hit
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HitError {
    #[error("Failed to prepare hit: {0}")]
    Prepare(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Hit panicked: {0}")]
    Panicked(String),
}

impl Categorized for HitError {
    fn category(&self) -> ErrorCategory {
        match self {
            HitError::Prepare(_) => ErrorCategory::Setup,
            HitError::Transport(_) | HitError::Status { .. } | HitError::Panicked(_) => {
                ErrorCategory::Collaborator
            }
        }
    }
}

/// Failure of the dispatch as a whole
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to build hit pool: {0}")]
    Pool(String),
}

impl Categorized for DispatchError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Setup
    }
}

/// Produces and sends hits.
///
/// `prepare` builds the payload and caller-defined metadata; `send` performs
/// the request. Only `send` is timed, and only a panic in `send` is
/// contained to its hit.
pub trait HitFactory: Sync {
    type Payload;
    type Response: Send;
    type Metadata: Send;

    fn prepare(&self, index: usize) -> Result<(Self::Payload, Self::Metadata), HitError>;

    fn send(&self, payload: Self::Payload) -> Result<Self::Response, HitError>;
}

/// [`HitFactory`] built from two closures
pub struct FnHit<P, S> {
    prepare: P,
    send: S,
}

impl<P, S> FnHit<P, S> {
    pub fn new<Payload, Metadata, Response>(prepare: P, send: S) -> Self
    where
        P: Fn(usize) -> Result<(Payload, Metadata), HitError>,
        S: Fn(Payload) -> Result<Response, HitError>,
    {
        Self { prepare, send }
    }
}

impl<P, S, Payload, Metadata, Response> HitFactory for FnHit<P, S>
where
    P: Fn(usize) -> Result<(Payload, Metadata), HitError> + Sync,
    S: Fn(Payload) -> Result<Response, HitError> + Sync,
    Metadata: Send,
    Response: Send,
{
    type Payload = Payload;
    type Response = Response;
    type Metadata = Metadata;

    fn prepare(&self, index: usize) -> Result<(Payload, Metadata), HitError> {
        (self.prepare)(index)
    }

    fn send(&self, payload: Payload) -> Result<Response, HitError> {
        (self.send)(payload)
    }
}

/// Outcome of one hit
#[derive(Debug, Clone)]
pub struct HitResult<R, M> {
    /// Submission index, `0..hit_count`
    pub index: usize,
    pub outcome: Result<R, HitError>,
    /// `None` only when preparation failed
    pub metadata: Option<M>,
    /// Time spent waiting for the response
    pub wait_time: Duration,
}

impl<R, M> HitResult<R, M> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs hits concurrently
#[derive(Debug, Clone, Copy, Default)]
pub struct HitDispatcher {
    max_concurrency: Option<usize>,
}

impl HitDispatcher {
    /// `None` runs every hit of a dispatch at once
    pub fn new(max_concurrency: Option<usize>) -> Self {
        Self {
            max_concurrency: max_concurrency.map(|n| n.max(1)),
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    /// Run `hit_count` hits and wait for all of them.
    pub fn dispatch_all<F>(
        &self,
        hit_count: usize,
        factory: &F,
    ) -> Result<Vec<HitResult<F::Response, F::Metadata>>, DispatchError>
    where
        F: HitFactory,
    {
        if hit_count == 0 {
            return Ok(Vec::new());
        }

        let threads = self.max_concurrency.unwrap_or(hit_count).min(hit_count);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("servebench-hit-{}", i))
            .build()
            .map_err(|e| DispatchError::Pool(e.to_string()))?;

        debug!(hit_count, threads, "dispatching hits");
        let results: Vec<_> = pool.install(|| {
            (0..hit_count)
                .into_par_iter()
                .with_max_len(1)
                .map(|index| run_hit(factory, index))
                .collect()
        });

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        if failed > 0 {
            debug!(failed, hit_count, "some hits failed");
        }
        Ok(results)
    }
}

fn run_hit<F: HitFactory>(factory: &F, index: usize) -> HitResult<F::Response, F::Metadata> {
    let (payload, metadata) = match factory.prepare(index) {
        Ok(prepared) => prepared,
        Err(e) => {
            return HitResult {
                index,
                outcome: Err(e),
                metadata: None,
                wait_time: Duration::ZERO,
            };
        }
    };

    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| factory.send(payload)))
        .unwrap_or_else(|panic| Err(HitError::Panicked(panic_message(panic.as_ref()))));
    let wait_time = start.elapsed();

    HitResult {
        index,
        outcome,
        metadata: Some(metadata),
        wait_time,
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
