//! Tessera reactive notebook kernel.
//!
//! Runs one notebook session behind an asynchronous request queue.
//!
//! # Architecture
//!
//! The kernel consists of:
//! - **Session**: Owns the dependency graph and namespace, applies requests
//! - **Protocol**: Defines request and message types
//! - **Publisher**: Fans messages out to broadcast subscribers and lossless streams
//! - **Kernel**: Request queue and worker task
//!
//! Requests are processed strictly in arrival order by a single worker.
//! `Interrupt` bypasses the queue and reaches the running cell directly.

pub mod error;
pub mod protocol;
pub mod publisher;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use tessera_core::execute::ExecutionSlot;
use tessera_core::runtime::RuntimeConfig;

pub use error::{KernelError, KernelResult};
pub use protocol::{CellSnapshot, KernelMessage, Request, RequestId};
pub use publisher::Publisher;
pub use session::Session;

/// Capacity for the broadcast channel.
/// Subscribers that fall further behind lose the oldest messages; use
/// [`Kernel::stream`] to see all of them.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Kernel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Capacity of the message broadcast channel.
    pub channel_capacity: usize,
    /// Limits applied to cell execution.
    pub runtime: RuntimeConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: MESSAGE_CHANNEL_CAPACITY,
            runtime: RuntimeConfig::default(),
        }
    }
}

type QueuedRequest = (RequestId, Request);

/// Handle to a running kernel.
///
/// Subscribe before submitting to observe every message a request produces.
pub struct Kernel {
    requests: mpsc::UnboundedSender<QueuedRequest>,
    publisher: Publisher,
    slot: ExecutionSlot,
    next_request_id: AtomicU64,
    session_id: Uuid,
    worker: JoinHandle<()>,
}

impl Kernel {
    /// Start a kernel on the current tokio runtime.
    pub fn spawn(config: KernelConfig) -> Self {
        let publisher = Publisher::new(config.channel_capacity);
        let (requests, rx) = mpsc::unbounded_channel();
        let session = Session::new(config.runtime, publisher.clone());
        let slot = session.slot().clone();
        let session_id = Uuid::new_v4();

        let span = tracing::info_span!("kernel", session = %session_id);
        let worker = tokio::spawn(run_loop(session, rx, publisher.clone()).instrument(span));

        Self {
            requests,
            publisher,
            slot,
            next_request_id: AtomicU64::new(1),
            session_id,
            worker,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Receive messages published from now on. A receiver that falls more
    /// than `channel_capacity` messages behind loses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<KernelMessage> {
        self.publisher.subscribe()
    }

    /// Receive every message published from now on, without loss. The
    /// stream ends after [`Kernel::shutdown`] once the worker has stopped.
    pub fn stream(&self) -> mpsc::UnboundedReceiver<KernelMessage> {
        self.publisher.stream()
    }

    /// Queue a request and return its id.
    ///
    /// `Interrupt` is applied immediately instead of waiting behind queued
    /// requests.
    pub fn submit(&self, request: Request) -> KernelResult<RequestId> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        if matches!(request, Request::Interrupt) {
            let interrupted = self.interrupt();
            tracing::info!("Interrupt requested (running cell: {})", interrupted);
            self.publisher.send(KernelMessage::RequestCompleted { request_id });
            return Ok(request_id);
        }

        self.requests
            .send((request_id, request))
            .map_err(|_| KernelError::Shutdown)?;
        Ok(request_id)
    }

    /// Interrupt the running cell. Returns false when nothing was running.
    pub fn interrupt(&self) -> bool {
        self.slot.interrupt()
    }

    /// Stop accepting requests and wait for queued ones to finish. Streams
    /// end once this returns.
    pub async fn shutdown(self) -> KernelResult<()> {
        let Kernel {
            requests,
            publisher,
            worker,
            ..
        } = self;
        drop(requests);
        let finished = worker
            .await
            .map_err(|e| KernelError::Fatal(format!("kernel worker failed: {}", e)));
        drop(publisher);
        finished
    }
}

/// Worker loop: one request at a time, each on the blocking pool.
async fn run_loop(
    mut session: Session,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    publisher: Publisher,
) {
    tracing::info!("Kernel session started");

    while let Some((request_id, request)) = rx.recv().await {
        let span = tracing::Span::current();
        let outcome = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            let result = session.handle(request);
            (session, result)
        })
        .await;

        let (returned, result) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Request {} panicked: {}", request_id, e);
                publisher.send(KernelMessage::Fatal {
                    message: format!("request {} panicked: {}", request_id, e),
                });
                break;
            }
        };
        session = returned;

        match result {
            Ok(()) => {
                publisher.send(KernelMessage::RequestCompleted { request_id });
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("Request {} failed fatally: {}", request_id, e);
                publisher.send(KernelMessage::Fatal {
                    message: e.to_string(),
                });
                break;
            }
            Err(e) => {
                tracing::warn!("Request {} rejected: {}", request_id, e);
                publisher.send(KernelMessage::RequestRejected {
                    request_id,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!("Kernel session stopped");
}
