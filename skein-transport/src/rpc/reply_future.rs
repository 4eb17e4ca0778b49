//! ReplyFuture: caller-side future waiting for a response.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::Deprecation;
use crate::error::RpcError;

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The `result` value sent by the remote handler.
    pub result: Value,
    /// Deprecation notice attached to the response.
    pub deprecation: Option<Deprecation>,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, RpcError>>;

/// Future that resolves exactly once: with the reply, a remote error, a
/// timeout, or a send-time failure.
///
/// Dropping it abandons the call; a response arriving afterwards is
/// discarded.
#[derive(Debug)]
pub struct ReplyFuture {
    request_id: String,
    receiver: oneshot::Receiver<Result<Reply, RpcError>>,
}

impl ReplyFuture {
    pub(crate) fn channel(request_id: String) -> (ReplySender, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                request_id,
                receiver,
            },
        )
    }

    /// A future that is already resolved.
    pub(crate) fn ready(request_id: String, outcome: Result<Reply, RpcError>) -> Self {
        let (sender, future) = Self::channel(request_id);
        let _ = sender.send(outcome);
        future
    }

    /// The id correlating this call with its response.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for ReplyFuture {
    type Output = Result<Reply, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The correlator dropped the waiter without resolving it.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_future_success() {
        let (sender, future) = ReplyFuture::channel("r1".into());
        assert_eq!(future.request_id(), "r1");
        let reply = Reply {
            result: json!(5),
            deprecation: None,
        };
        sender.send(Ok(reply.clone())).expect("send");
        assert_eq!(future.await, Ok(reply));
    }

    #[tokio::test]
    async fn test_reply_future_ready_error() {
        let future = ReplyFuture::ready("r2".into(), Err(RpcError::ConnectionClosed));
        assert_eq!(future.await, Err(RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_connection_closed() {
        let (sender, future) = ReplyFuture::channel("r3".into());
        drop(sender);
        assert_eq!(future.await, Err(RpcError::ConnectionClosed));
    }
}
