// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The table of calls awaiting a response from a worker.

use super::{CallResult, RequestId, Response, TerminateReason};
use crate::errors::{CallError, ProtocolError};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
};
use tokio::sync::oneshot;

pub(crate) type CallOutcome = Result<CallResult, CallError>;

/// A call that has been sent to a worker and is waiting for its response.
///
/// Awaiting a `PendingCall` yields the worker's result, or an error if the worker terminates first.
/// Dropping it abandons the call: a later response is discarded.
#[derive(Debug)]
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall {
    request_id: RequestId,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    /// Returns the ID of the request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Future for PendingCall {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            // The sender is only dropped without sending if the table itself goes away, which
            // means the worker is gone.
            res.unwrap_or(Err(CallError::WorkerTerminated {
                reason: TerminateReason::SocketClosed,
            }))
        })
    }
}

/// Maps request IDs to the callers waiting on them.
///
/// Every request ID is completed exactly once: by its response, or by [`close_all`] when the
/// worker goes away.
///
/// [`close_all`]: Self::close_all
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<PendingInner>,
}

#[derive(Debug, Default)]
struct PendingInner {
    last_id: u64,
    calls: HashMap<RequestId, oneshot::Sender<CallOutcome>>,
    closed: Option<CallError>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Issues the next request ID and registers a caller for it.
    ///
    /// If the table is already closed, the returned call resolves immediately with the error the
    /// table was closed with.
    pub(crate) fn register(&self) -> PendingCall {
        let mut inner = self.lock();
        inner.last_id += 1;
        let request_id = RequestId(inner.last_id);
        let (tx, rx) = oneshot::channel();
        match &inner.closed {
            Some(err) => {
                _ = tx.send(Err(err.clone()));
            }
            None => {
                inner.calls.insert(request_id, tx);
            }
        }
        PendingCall { request_id, rx }
    }

    /// Completes the call a response belongs to.
    ///
    /// Returns an error if the response doesn't correspond to an outstanding request. Responses
    /// that arrive after the table was closed are dropped.
    pub(crate) fn fulfill(&self, response: Response) -> Result<(), ProtocolError> {
        let mut inner = self.lock();
        let request_id = response.request_id;
        let Some(tx) = inner.calls.remove(&request_id) else {
            if inner.closed.is_some() {
                return Ok(());
            }
            return Err(if request_id.0 >= 1 && request_id.0 <= inner.last_id {
                ProtocolError::DuplicateResponse { request_id }
            } else {
                ProtocolError::UnknownRequestId { request_id }
            });
        };
        drop(inner);

        let outcome = match (response.result, response.error) {
            (_, Some(error)) => Err(CallError::Remote {
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(CallError::Protocol(ProtocolError::EmptyResponse {
                request_id,
            })),
        };
        // The caller may have stopped waiting, e.g. because the call timed out.
        _ = tx.send(outcome);
        Ok(())
    }

    /// Completes every outstanding call with `error`, and makes all later registrations fail with
    /// it too. Only the first close takes effect.
    pub(crate) fn close_all(&self, error: CallError) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(error.clone());
            inner.calls.drain().collect()
        };
        for (_, tx) in drained {
            _ = tx.send(Err(error.clone()));
        }
    }

    /// Drops a registration whose request could not be sent, completing it with `error`.
    pub(crate) fn fail(&self, request_id: RequestId, error: CallError) {
        let tx = self.lock().calls.remove(&request_id);
        if let Some(tx) = tx {
            _ = tx.send(Err(error));
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        // A panic while holding this lock can only come from a bug in this module; the data is
        // still consistent, so keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
