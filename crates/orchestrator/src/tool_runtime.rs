//! C8 — the tool runtime: the per-surface semaphore, wall-clock timeout,
//! and uniform degraded-envelope mapping that wraps every `council.ask` /
//! `council.pipeline` invocation. Grounded on
//! `original_source/backend/src/mcp/server.py`'s tool-call wrapper; the
//! per-surface semaphore mirrors the teacher's `runtime::concurrency`
//! pattern of one `Semaphore` per resource class.

use parking_lot::RwLock;
use sa_ledger::Ledger;
use sa_domain::records::RunStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSurface {
    Mcp,
    Http,
}

/// The reasons a tool invocation can fail to produce its success type.
/// Matches the error taxonomy's tool-runtime wrapper errors (spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    Timeout,
    Cancelled,
    InvalidInput,
    InputTooLarge,
    InternalError,
}

impl ToolFailure {
    pub fn as_error_code(&self) -> &'static str {
        match self {
            ToolFailure::Timeout => "timeout",
            ToolFailure::Cancelled => "cancelled",
            ToolFailure::InvalidInput => "invalid_input",
            ToolFailure::InputTooLarge => "input_too_large",
            ToolFailure::InternalError => "internal_error",
        }
    }
}

/// A handler-raised error, distinct from the wrapper-raised [`ToolFailure`]
/// so a validator can report "is this a size complaint" without the
/// runtime having to parse arbitrary error strings.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    fn to_failure(&self) -> ToolFailure {
        match self {
            ToolError::Validation(msg) if mentions_size(msg) => ToolFailure::InputTooLarge,
            ToolError::Validation(_) => ToolFailure::InvalidInput,
            ToolError::Cancelled(_) => ToolFailure::Cancelled,
            ToolError::Internal(_) => ToolFailure::InternalError,
        }
    }
}

fn mentions_size(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("too large") || lower.contains("too long") || lower.contains("exceeds") || lower.contains("max_")
}

/// A handler writes its run id here once `create_run` commits, so the
/// wrapper can finalize that run on a failure path without the handler
/// itself needing to know about timeouts or cancellation.
#[derive(Clone, Default)]
pub struct RunSlot(Arc<AtomicU64Pair>);

#[derive(Default)]
struct AtomicU64Pair {
    hi: AtomicU64,
    lo: AtomicU64,
    set: std::sync::atomic::AtomicBool,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, run_id: Uuid) {
        let (hi, lo) = run_id.as_u64_pair();
        self.0.hi.store(hi, Ordering::Release);
        self.0.lo.store(lo, Ordering::Release);
        self.0.set.store(true, Ordering::Release);
    }

    pub fn get(&self) -> Option<Uuid> {
        if !self.0.set.load(Ordering::Acquire) {
            return None;
        }
        let hi = self.0.hi.load(Ordering::Acquire);
        let lo = self.0.lo.load(Ordering::Acquire);
        Some(Uuid::from_u64_pair(hi, lo))
    }
}

/// One semaphore per tool surface, each independently resizable. `Mcp`
/// covers in-process "MCP"-style calls, `Http` covers the HTTP tool
/// surface — spec §5 requires each configured (and recreated) separately.
pub struct ToolRuntime {
    mcp: RwLock<SurfaceState>,
    http: RwLock<SurfaceState>,
}

struct SurfaceState {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
}

impl ToolRuntime {
    pub fn new(mcp_max_concurrent: usize, mcp_timeout_seconds: f64, http_max_concurrent: usize, http_timeout_seconds: f64) -> Self {
        Self {
            mcp: RwLock::new(SurfaceState {
                semaphore: Arc::new(Semaphore::new(mcp_max_concurrent.max(1))),
                max_concurrent: mcp_max_concurrent,
                timeout: Duration::from_secs_f64(mcp_timeout_seconds),
            }),
            http: RwLock::new(SurfaceState {
                semaphore: Arc::new(Semaphore::new(http_max_concurrent.max(1))),
                max_concurrent: http_max_concurrent,
                timeout: Duration::from_secs_f64(http_timeout_seconds),
            }),
        }
    }

    fn state(&self, surface: ToolSurface) -> &RwLock<SurfaceState> {
        match surface {
            ToolSurface::Mcp => &self.mcp,
            ToolSurface::Http => &self.http,
        }
    }

    /// Recreates the surface's semaphore if `max_concurrent` changed.
    /// Existing permit holders keep running against the old semaphore; new
    /// acquisitions see the new limit.
    pub fn reconfigure(&self, surface: ToolSurface, max_concurrent: usize, timeout_seconds: f64) {
        let lock = self.state(surface);
        let mut state = lock.write();
        if state.max_concurrent != max_concurrent {
            state.semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
            state.max_concurrent = max_concurrent;
        }
        state.timeout = Duration::from_secs_f64(timeout_seconds);
    }

    /// Runs `handler` under the surface's semaphore and wall-clock timeout.
    /// On any failure path, finalizes whatever run `run_slot` was populated
    /// with as `failed` before returning the mapped [`ToolFailure`].
    pub async fn invoke<T, Fut>(&self, surface: ToolSurface, ledger: &Ledger, run_slot: &RunSlot, handler: Fut) -> Result<T, ToolFailure>
    where
        Fut: std::future::Future<Output = Result<T, ToolError>>,
    {
        let (semaphore, timeout) = {
            let state = self.state(surface).read();
            (state.semaphore.clone(), state.timeout)
        };
        let _permit = semaphore.acquire().await;
        let start = std::time::Instant::now();

        let outcome = tokio::time::timeout(timeout, handler).await;
        let failure = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err.to_failure(),
            Err(_elapsed) => ToolFailure::Timeout,
        };

        if let Some(run_id) = run_slot.get() {
            ledger.end_run(run_id, RunStatus::Failed, start.elapsed().as_millis() as u64);
        }
        Err(failure)
    }
}
