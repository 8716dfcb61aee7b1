// ABOUTME: Execution handle exposing a bounded, lazy stream of sandbox events
// ABOUTME: The sending half is split so only the driver can emit the single terminal event

use crate::types::{CancelReason, ExecutionEvent, OutputChunk, Termination};
use futures::Stream;
use runhub_core::OutputStream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// Requests cancellation of a running execution. Cheap to clone; the first
/// reason wins and later calls are ignored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call triggered the cancellation
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender is owned by self, so this cannot close while we wait
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Consumer side of one execution.
///
/// Yields output chunks followed by exactly one terminal event, then ends.
/// Dropping the handle tears the sandbox down.
pub struct ExecutionHandle {
    execution_id: String,
    events: mpsc::Receiver<ExecutionEvent>,
    cancel: CancelHandle,
    finished: bool,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.cancel.cancel(reason)
    }
}

impl Stream for ExecutionHandle {
    type Item = ExecutionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Output-only sender handed to stream readers
#[derive(Clone)]
pub(crate) struct OutputSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl OutputSink {
    /// Waits for buffer space. Returns false once the consumer is gone.
    pub(crate) async fn send(&self, stream: OutputStream, data: Vec<u8>) -> bool {
        self.tx
            .send(ExecutionEvent::Output(OutputChunk::new(stream, data)))
            .await
            .is_ok()
    }
}

/// Terminal sender owned by the runtime driver. Consumed on use.
pub(crate) struct TerminalSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl TerminalSink {
    pub(crate) async fn finish(self, termination: Termination) {
        let _ = self.tx.send(termination.into()).await;
    }

    /// Resolves when the execution handle has been dropped
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Wire up a new execution: readers get `OutputSink`s, the driver gets the
/// `TerminalSink` and a `CancelHandle`, the caller gets the handle.
pub(crate) fn execution_channel(
    execution_id: &str,
    capacity: usize,
) -> (OutputSink, TerminalSink, CancelHandle, ExecutionHandle) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancelHandle::new();
    let handle = ExecutionHandle {
        execution_id: execution_id.to_string(),
        events: rx,
        cancel: cancel.clone(),
        finished: false,
    };
    (
        OutputSink { tx: tx.clone() },
        TerminalSink { tx },
        cancel,
        handle,
    )
}
