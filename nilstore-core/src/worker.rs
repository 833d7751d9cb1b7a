//! Background execution context for the commitment engine
//!
//! The engine lives on a dedicated OS thread and is only reachable through a
//! bounded mailbox. Every request carries a correlation id; the caller awaits
//! a oneshot that the worker resolves exactly once. When the worker exits
//! (shutdown, last handle dropped, or engine panic) every outstanding caller
//! is released with [`EngineError::WorkerGone`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::engine::{Aggregation, Commitment, CommitmentEngine, EngineError, Expansion, Root};

/// Queued requests the worker accepts before callers wait on the mailbox
pub const MAILBOX_CAPACITY: usize = 16;

#[derive(Debug)]
enum Request {
    Expand(Vec<u8>),
    ExpandStriped { unit: Vec<u8>, k: usize, m: usize },
    CommitRoot(Vec<u8>),
    CommitBlobs(Vec<u8>),
    Aggregate(Vec<u8>),
    Shutdown,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Expand(_) => "expand",
            Request::ExpandStriped { .. } => "expand_striped",
            Request::CommitRoot(_) => "commit_root",
            Request::CommitBlobs(_) => "commit_blobs",
            Request::Aggregate(_) => "aggregate",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
enum Response {
    Expansion(Expansion),
    Root(Root),
    Commitment(Commitment),
    Aggregation(Aggregation),
    Stopped,
}

struct Envelope {
    id: u64,
    request: Request,
}

type Reply = oneshot::Sender<Result<Response, EngineError>>;

/// Outstanding requests keyed by correlation id
#[derive(Clone, Default)]
struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, Reply>>>,
}

impl PendingRequests {
    fn register(&self, id: u64) -> oneshot::Receiver<Result<Response, EngineError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    fn complete(&self, id: u64, result: Result<Response, EngineError>) {
        match self.lock().remove(&id) {
            // Receiver may be gone if the caller stopped waiting
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => warn!(request_id = id, "No pending caller for engine response"),
        }
    }

    fn cancel(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Drop every sender so all waiting callers observe a closed channel.
    fn fail_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Releasing pending engine callers");
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Reply>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the mailbox on the worker thread; closing it on drop covers
/// normal exit and unwinding alike.
struct WorkerMailbox {
    rx: mpsc::Receiver<Envelope>,
    pending: PendingRequests,
}

impl Drop for WorkerMailbox {
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            self.pending.complete(envelope.id, Err(EngineError::WorkerGone));
        }
        self.pending.fail_all();
    }
}

fn serve<E: CommitmentEngine>(engine: &mut E, request: Request) -> Result<Response, EngineError> {
    match request {
        Request::Expand(unit) => engine.expand(&unit).map(Response::Expansion),
        Request::ExpandStriped { unit, k, m } => {
            engine.expand_striped(&unit, k, m).map(Response::Expansion)
        }
        Request::CommitRoot(witness) => engine.commit_root(&witness).map(Response::Root),
        Request::CommitBlobs(data) => engine.commit_blobs(&data).map(Response::Commitment),
        Request::Aggregate(roots) => engine.aggregate(&roots).map(Response::Aggregation),
        Request::Shutdown => Ok(Response::Stopped),
    }
}

struct Ready {
    mailbox: mpsc::Sender<Envelope>,
    next_id: AtomicU64,
    pending: PendingRequests,
}

/// Handle to the engine worker.
///
/// Either `uninitialized` (every call fails with [`EngineError::NotReady`])
/// or `ready`. Clones share the same worker; the worker stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct EngineClient {
    ready: Option<Arc<Ready>>,
}

impl EngineClient {
    /// A handle with no engine behind it.
    pub fn uninitialized() -> Self {
        Self { ready: None }
    }

    /// Move `engine` onto a dedicated worker thread.
    pub fn spawn<E: CommitmentEngine>(mut engine: E) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::channel::<Envelope>(MAILBOX_CAPACITY);
        let pending = PendingRequests::default();
        let mut mailbox = WorkerMailbox {
            rx,
            pending: pending.clone(),
        };

        std::thread::Builder::new()
            .name("nilstore-engine".to_string())
            .spawn(move || {
                while let Some(Envelope { id, request }) = mailbox.rx.blocking_recv() {
                    let stop = matches!(request, Request::Shutdown);
                    trace!(request_id = id, op = request.name(), "Engine request");
                    let result = serve(&mut engine, request);
                    mailbox.pending.complete(id, result);
                    if stop {
                        break;
                    }
                }
                debug!("Engine worker stopped");
            })
            .map_err(|e| EngineError::Failed(format!("failed to start engine worker: {}", e)))?;

        Ok(Self {
            ready: Some(Arc::new(Ready {
                mailbox: tx,
                next_id: AtomicU64::new(1),
                pending,
            })),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
            .as_ref()
            .is_some_and(|ready| !ready.mailbox.is_closed())
    }

    /// Requests waiting for a worker response
    pub fn in_flight(&self) -> usize {
        self.ready.as_ref().map_or(0, |ready| ready.pending.len())
    }

    async fn call(&self, request: Request) -> Result<Response, EngineError> {
        let ready = self.ready.as_ref().ok_or(EngineError::NotReady)?;
        let id = ready.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = ready.pending.register(id);

        if ready.mailbox.send(Envelope { id, request }).await.is_err() {
            ready.pending.cancel(id);
            return Err(EngineError::WorkerGone);
        }

        reply.await.map_err(|_| EngineError::WorkerGone)?
    }

    pub async fn expand(&self, unit: Vec<u8>) -> Result<Expansion, EngineError> {
        match self.call(Request::Expand(unit)).await? {
            Response::Expansion(expansion) => Ok(expansion),
            other => Err(unexpected("expand", &other)),
        }
    }

    pub async fn expand_striped(
        &self,
        unit: Vec<u8>,
        k: usize,
        m: usize,
    ) -> Result<Expansion, EngineError> {
        match self.call(Request::ExpandStriped { unit, k, m }).await? {
            Response::Expansion(expansion) => Ok(expansion),
            other => Err(unexpected("expand_striped", &other)),
        }
    }

    pub async fn commit_root(&self, witness_flat: Vec<u8>) -> Result<Root, EngineError> {
        match self.call(Request::CommitRoot(witness_flat)).await? {
            Response::Root(root) => Ok(root),
            other => Err(unexpected("commit_root", &other)),
        }
    }

    pub async fn commit_blobs(&self, data: Vec<u8>) -> Result<Commitment, EngineError> {
        match self.call(Request::CommitBlobs(data)).await? {
            Response::Commitment(commitment) => Ok(commitment),
            other => Err(unexpected("commit_blobs", &other)),
        }
    }

    pub async fn aggregate(&self, roots_flat: Vec<u8>) -> Result<Aggregation, EngineError> {
        match self.call(Request::Aggregate(roots_flat)).await? {
            Response::Aggregation(aggregation) => Ok(aggregation),
            other => Err(unexpected("aggregate", &other)),
        }
    }

    /// Expand a unit and commit its witness, returning the unit root and
    /// the flattened witness.
    pub async fn commit_unit(&self, unit: Vec<u8>) -> Result<(Root, Vec<u8>), EngineError> {
        let witness = self.expand(unit).await?.witness_flat();
        let root = self.commit_root(witness.clone()).await?;
        Ok((root, witness))
    }

    /// Stop the worker after it drains requests queued ahead of this one.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        match self.call(Request::Shutdown).await? {
            Response::Stopped => Ok(()),
            other => Err(unexpected("shutdown", &other)),
        }
    }
}

fn unexpected(op: &str, response: &Response) -> EngineError {
    EngineError::Failed(format!("unexpected response to {}: {:?}", op, variant(response)))
}

fn variant(response: &Response) -> &'static str {
    match response {
        Response::Expansion(_) => "expansion",
        Response::Root(_) => "root",
        Response::Commitment(_) => "commitment",
        Response::Aggregation(_) => "aggregation",
        Response::Stopped => "stopped",
    }
}
