//! Request handlers.
//!
//! Long operations (build, push, pull) answer 200 immediately and stream
//! Docker progress frames; short ones (tag, inspect) are captured and
//! answered in one piece. Either way the operation runs in its own task so
//! a disconnecting client cancels it without skipping cleanup.

pub mod build;
pub mod chunks;
pub mod images;
pub mod proxy;
pub mod system;

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use ferry_core::{FerryError, Frame, OperationRequest, Result};
use ferry_runtime::{CaptureSink, ExecutionPath, FramedSink};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Frames buffered between an operation and a slow client.
const STREAM_BUFFER: usize = 64;

/// A header value as text, empty when absent or not valid UTF-8.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// A token cancelled once `deadline` passes or the caller cancels it.
pub(crate) fn with_deadline(deadline: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "Operation exceeded maximum execution time");
                timer.cancel();
            }
            _ = timer.cancelled() => {}
        }
    });
    cancel
}

/// Run `operation` in a task and stream what it sends as the response body.
///
/// The operation is cancelled when the client goes away or the deadline
/// passes. The body ends once the operation returns.
pub(crate) fn stream_operation<F, Fut>(deadline: Duration, operation: F) -> Response
where
    F: FnOnce(FramedSink, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let sink = FramedSink::new(tx);
    let cancel = with_deadline(deadline);

    let watcher = sink.clone();
    let disconnect = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.closed() => {
                tracing::info!("Client disconnected, cancelling operation");
                disconnect.cancel();
            }
            _ = disconnect.cancelled() => {}
        }
    });

    tokio::spawn(async move {
        let done = cancel.clone();
        operation(sink, cancel).await;
        // Stops the watcher and the deadline timer, releasing the last senders.
        done.cancel();
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    ([(CONTENT_TYPE, "application/json")], body).into_response()
}

/// Report the outcome of a streamed operation: nothing more on success, an
/// error frame on failure.
pub(crate) async fn report(sink: &FramedSink, action: &str, result: Result<ExecutionPath>) {
    match result {
        Ok(path) => tracing::info!(action, path = %path, "Operation completed"),
        Err(e) => {
            tracing::warn!(action, error = %e, "Operation failed");
            let _ = sink.send(Frame::error(format!("{}: {}", action, e))).await;
        }
    }
}

/// Run `request` to completion, capturing its output.
///
/// Returns the outcome and what was captured. If the handler is dropped
/// (client gone) the operation is cancelled but still cleans up.
pub(crate) async fn run_captured(
    state: Arc<AppState>,
    request: OperationRequest,
    sink: CaptureSink,
) -> (Result<ExecutionPath>, Bytes) {
    let cancel = with_deadline(state.config.max_execution_time());
    let _cancel_on_drop = cancel.clone().drop_guard();
    let sink = Arc::new(sink);

    let task = {
        let sink = sink.clone();
        tokio::spawn(async move {
            state
                .scheduler
                .execute(&request, None, sink.as_ref(), &cancel)
                .await
        })
    };

    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(FerryError::Other(format!("operation task failed: {}", e))),
    };
    (result, sink.take_bytes())
}
