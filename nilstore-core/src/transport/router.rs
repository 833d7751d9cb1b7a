//! Transport selection and fallback
//!
//! The router orders candidate backends by the configured preference, then
//! tries them one after another. Each backend carries its own backoff state:
//! a backend that recently failed is skipped until it becomes eligible again.
//! Every call produces a [`DecisionTrace`] describing what was tried.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ErrorClass, TransportError};
use crate::backoff::{BackoffConfig, BackoffState};
use crate::ids::ValidationError;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Gateway,
    DirectSp,
    Libp2p,
    LocalCache,
}

impl Backend {
    pub const COUNT: usize = 4;
    pub const ALL: [Backend; Backend::COUNT] = [
        Backend::Gateway,
        Backend::DirectSp,
        Backend::Libp2p,
        Backend::LocalCache,
    ];

    pub fn index(&self) -> usize {
        match self {
            Backend::Gateway => 0,
            Backend::DirectSp => 1,
            Backend::Libp2p => 2,
            Backend::LocalCache => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Gateway => "gateway",
            Backend::DirectSp => "direct_sp",
            Backend::Libp2p => "libp2p",
            Backend::LocalCache => "local_cache",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePreference {
    #[default]
    Auto,
    PreferGateway,
    PreferDirectSp,
    PreferP2p,
}

impl RoutePreference {
    pub fn preferred_backend(&self) -> Option<Backend> {
        match self {
            RoutePreference::Auto => None,
            RoutePreference::PreferGateway => Some(Backend::Gateway),
            RoutePreference::PreferDirectSp => Some(Backend::DirectSp),
            RoutePreference::PreferP2p => Some(Backend::Libp2p),
        }
    }
}

impl FromStr for RoutePreference {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(RoutePreference::Auto),
            "prefer_gateway" => Ok(RoutePreference::PreferGateway),
            "prefer_direct_sp" => Ok(RoutePreference::PreferDirectSp),
            "prefer_p2p" => Ok(RoutePreference::PreferP2p),
            other => Err(ValidationError::InvalidPreference(other.to_string())),
        }
    }
}

pub type AttemptFuture<T> = BoxFuture<'static, Result<T, TransportError>>;

type AttemptFn<T> = dyn Fn(CancellationToken) -> AttemptFuture<T> + Send + Sync;

/// One way of performing an operation
pub struct Candidate<T> {
    pub backend: Backend,
    pub endpoint: String,
    run: Arc<AttemptFn<T>>,
}

impl<T: 'static> Candidate<T> {
    /// `attempt` is invoked once per try with a token that is cancelled when
    /// the try is abandoned (timeout or caller cancellation).
    pub fn new<F, Fut>(backend: Backend, endpoint: impl Into<String>, attempt: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let run: Arc<AttemptFn<T>> =
            Arc::new(move |token: CancellationToken| -> AttemptFuture<T> { attempt(token).boxed() });
        Self {
            backend,
            endpoint: endpoint.into(),
            run,
        }
    }
}

impl<T> fmt::Debug for Candidate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Local cache first, then the preferred backend, then the rest in the
/// order given. The sort is stable.
pub fn order_candidates<T>(
    preference: RoutePreference,
    mut candidates: Vec<Candidate<T>>,
) -> Vec<Candidate<T>> {
    let preferred = preference.preferred_backend();
    candidates.sort_by_key(|c| {
        if c.backend == Backend::LocalCache {
            0
        } else if Some(c.backend) == preferred {
            1
        } else {
            2
        }
    });
    candidates
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub backend: Backend,
    pub endpoint: String,
    pub ok: bool,
    pub skipped: bool,
    pub status: Option<u16>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionTrace {
    pub op: String,
    pub preference: RoutePreference,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub attempts: Vec<AttemptRecord>,
    pub chosen: Option<Backend>,
}

impl DecisionTrace {
    fn new(op: &str, preference: RoutePreference) -> Self {
        Self {
            op: op.to_string(),
            preference,
            started_at: SystemTime::now(),
            finished_at: None,
            attempts: Vec::new(),
            chosen: None,
        }
    }

    fn finish(&mut self, chosen: Option<Backend>) {
        self.chosen = chosen;
        self.finished_at = Some(SystemTime::now());
    }

    /// Attempts that actually ran (not skipped for backoff)
    pub fn executed(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.attempts.iter().filter(|a| !a.skipped)
    }
}

#[derive(Debug)]
pub struct Routed<T> {
    pub value: T,
    pub backend: Backend,
    pub trace: DecisionTrace,
}

#[derive(Error, Debug)]
#[error("{} failed: {error}", .trace.op)]
pub struct RouteFailure {
    pub error: TransportError,
    pub trace: DecisionTrace,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub preference: RoutePreference,
    pub request_timeout: Duration,
    pub max_attempts_per_backend: u32,
    /// Defaults to candidates x attempts per backend
    pub max_total_attempts: Option<u32>,
    pub backoff: BackoffConfig,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            preference: RoutePreference::Auto,
            request_timeout: Duration::from_secs(10),
            max_attempts_per_backend: 1,
            max_total_attempts: None,
            backoff: BackoffConfig::default(),
        }
    }
}

fn rate_limit_delay(attempt: u32) -> Duration {
    let ms = 250u64.saturating_mul(1 << attempt.saturating_sub(1).min(4));
    Duration::from_millis(ms.min(2_000))
}

pub struct TransportRouter {
    options: RouterOptions,
    backoff: Mutex<HashMap<Backend, BackoffState>>,
    metrics: Metrics,
}

impl TransportRouter {
    pub fn new(options: RouterOptions) -> Self {
        Self::with_metrics(options, Metrics::new())
    }

    pub fn with_metrics(options: RouterOptions, metrics: Metrics) -> Self {
        Self {
            options,
            backoff: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    pub fn can_attempt(&self, backend: Backend) -> bool {
        self.with_backoff(backend, |state| state.can_attempt(Instant::now()))
    }

    pub fn retry_in(&self, backend: Backend) -> Duration {
        self.with_backoff(backend, |state| state.retry_in(Instant::now()))
    }

    pub fn failures(&self, backend: Backend) -> u32 {
        self.with_backoff(backend, |state| state.failures())
    }

    fn with_backoff<R>(&self, backend: Backend, f: impl FnOnce(&mut BackoffState) -> R) -> R {
        let mut states = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(backend)
            .or_insert_with(|| BackoffState::new(self.options.backoff));
        f(state)
    }

    /// Run `op` against the candidates until one succeeds.
    pub async fn execute<T: 'static>(
        &self,
        op: &str,
        candidates: Vec<Candidate<T>>,
        cancel: &CancellationToken,
    ) -> Result<Routed<T>, RouteFailure> {
        let ordered = order_candidates(self.options.preference, candidates);
        let per_backend = self.options.max_attempts_per_backend.max(1);
        let max_total = self
            .options
            .max_total_attempts
            .unwrap_or(ordered.len() as u32 * per_backend);
        let timeout = self.options.request_timeout;

        let mut trace = DecisionTrace::new(op, self.options.preference);
        let mut last_error: Option<TransportError> = None;
        let mut total = 0u32;

        'backends: for candidate in &ordered {
            let backend = candidate.backend;
            if !self.can_attempt(backend) {
                let wait = self.retry_in(backend);
                debug!(op, %backend, retry_in_ms = wait.as_millis() as u64, "Skipping backend in backoff");
                trace.attempts.push(AttemptRecord {
                    backend,
                    endpoint: candidate.endpoint.clone(),
                    ok: false,
                    skipped: true,
                    status: None,
                    error_class: None,
                    error_message: Some(format!("backing off for {}ms", wait.as_millis())),
                    elapsed_ms: 0,
                });
                continue;
            }

            for attempt in 1..=per_backend {
                if total >= max_total {
                    // Cut off mid-retry: the earlier attempts still count
                    if attempt > 1 && last_error.as_ref().is_some_and(|e| e.class.penalizes_backoff()) {
                        self.with_backoff(backend, |state| state.record_failure(Instant::now()));
                    }
                    break 'backends;
                }
                total += 1;
                self.metrics.transport_attempt(backend);

                let started = Instant::now();
                let token = cancel.child_token();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransportError::aborted()),
                    outcome = tokio::time::timeout(timeout, (candidate.run)(token.clone())) => {
                        outcome.unwrap_or_else(|_| Err(TransportError::timeout(timeout)))
                    }
                };
                token.cancel();
                let elapsed_ms = started.elapsed().as_millis() as u64;

                let err = match result {
                    Ok(value) => {
                        self.with_backoff(backend, |state| state.record_success());
                        trace.attempts.push(AttemptRecord {
                            backend,
                            endpoint: candidate.endpoint.clone(),
                            ok: true,
                            skipped: false,
                            status: None,
                            error_class: None,
                            error_message: None,
                            elapsed_ms,
                        });
                        trace.finish(Some(backend));
                        info!(op, %backend, elapsed_ms, "Transport succeeded");
                        return Ok(Routed {
                            value,
                            backend,
                            trace,
                        });
                    }
                    Err(err) => err,
                };

                trace.attempts.push(AttemptRecord {
                    backend,
                    endpoint: candidate.endpoint.clone(),
                    ok: false,
                    skipped: false,
                    status: err.status,
                    error_class: Some(err.class),
                    error_message: Some(err.message.clone()),
                    elapsed_ms,
                });

                let class = err.class;
                if class == ErrorClass::Aborted {
                    trace.finish(None);
                    return Err(RouteFailure { error: err, trace });
                }
                self.metrics.transport_failure(backend);
                warn!(op, %backend, attempt, error = %err, "Transport attempt failed");

                let give_up = !class.is_retryable() || attempt == per_backend;
                if give_up && class.penalizes_backoff() {
                    let delay = self.with_backoff(backend, |state| state.record_failure(Instant::now()));
                    debug!(%backend, delay_ms = delay.as_millis() as u64, "Backend backing off");
                }
                last_error = Some(err);

                if class.is_terminal() {
                    break 'backends;
                }
                if give_up {
                    continue 'backends;
                }
                if class == ErrorClass::Http429 {
                    let delay = rate_limit_delay(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            trace.finish(None);
                            return Err(RouteFailure { error: TransportError::aborted(), trace });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        trace.finish(None);
        let error = last_error.unwrap_or_else(|| {
            TransportError::new(ErrorClass::Unknown, "no transport available")
        });
        Err(RouteFailure { error, trace })
    }
}
