// Caller-side handle to a submitted task

use crate::error::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) type Reply = oneshot::Sender<Result<Value>>;

/// Handle to the eventual result of a submitted task
///
/// Resolves exactly once. Await it from async code, or call [`PendingCall::wait`]
/// from a thread that may block.
#[must_use = "a pending call does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub(crate) fn channel() -> (Reply, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A call that is already settled
    pub(crate) fn settled(outcome: Result<Value>) -> Self {
        let (tx, call) = Self::channel();
        let _ = tx.send(outcome);
        call
    }

    /// Block the current thread until the call settles
    pub fn wait(self) -> Result<Value> {
        futures::executor::block_on(self)
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the pool went away without settling the call
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Terminated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_call_resolves_immediately() {
        let call = PendingCall::settled(Ok(Value::from(42)));
        assert_eq!(call.wait().unwrap(), Value::from(42));
    }

    #[test]
    fn dropped_sender_reads_as_terminated() {
        let (tx, call) = PendingCall::channel();
        drop(tx);
        assert_eq!(call.wait().unwrap_err(), Error::Terminated);
    }

    #[tokio::test]
    async fn call_can_be_awaited() {
        let (tx, call) = PendingCall::channel();
        std::thread::spawn(move || {
            let _ = tx.send(Ok(Value::from("done")));
        });
        assert_eq!(call.await.unwrap(), Value::from("done"));
    }
}
