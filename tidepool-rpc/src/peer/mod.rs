//! Per-connection peer state machines.
//!
//! A peer owns one transport connection end to end: the inbound byte
//! buffer, the streaming decode state, and a one-shot close
//! notification. Two flavours build on that base:
//!
//! - [`ClientPeer`] multiplexes concurrent requests over channels and
//!   correlates responses back to their futures.
//! - [`RpcServer`] accepts connections and dispatches decoded requests
//!   to a [`RequestHandler`], writing each response back on the channel
//!   its request arrived on.
//!
//! # Connection lifecycle
//!
//! ```text
//! ┌──────────┐   data_to_send    ┌───────────┐
//! │ caller   ├──────────────────►│ connection │──► transport.write
//! │ context  │   (queue+notify)  │   task     │
//! └──────────┘                   │            │◄── transport.read
//!                                └─────┬──────┘
//!                                      │ decode pump
//!                                      ▼
//!                               handle_frame(body, channel)
//! ```
//!
//! The connection task is the only place that touches the socket. Any
//! frame error in the decode pump tears the connection down with that
//! error as the close cause; in-flight and queued requests are drained
//! per the rules in [`client`].

/// Channel-multiplexed client connection.
pub mod client;

/// Request dispatch and the server-side accept loop.
pub mod server;

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tidepool_core::MessageCodec;

use crate::error::RpcError;
use crate::frame::{DecodeState, FrameCodec, FrameError};

pub use client::{ClientPeer, PeerStats, ResponseFuture};
pub use server::{RequestHandler, RpcServer, ServerConnection};

/// One-shot close notification with fan-out.
///
/// The first `notify` wins; later calls are ignored. Every waiter -
/// registered before or after the close - observes the same cause.
/// `None` means a clean close.
pub(crate) struct CloseNotify {
    inner: RefCell<CloseInner>,
}

struct CloseInner {
    /// `Some(cause)` once closed; the inner `Option` is the cause itself.
    closed: Option<Option<RpcError>>,
    wakers: Vec<Waker>,
}

impl CloseNotify {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(CloseInner {
                closed: None,
                wakers: Vec::new(),
            }),
        })
    }

    /// Record the close cause and wake every waiter. Idempotent.
    pub(crate) fn notify(&self, cause: Option<RpcError>) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed.is_some() {
            return;
        }
        inner.closed = Some(cause);
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.borrow().closed.is_some()
    }

    /// Wait for the close and return its cause.
    pub(crate) fn closed(self: &Rc<Self>) -> ClosedFuture {
        ClosedFuture {
            notify: Rc::clone(self),
        }
    }
}

/// Future resolving to the close cause of a connection.
pub(crate) struct ClosedFuture {
    notify: Rc<CloseNotify>,
}

impl Future for ClosedFuture {
    type Output = Option<RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.notify.inner.borrow_mut();
        if let Some(cause) = &inner.closed {
            return Poll::Ready(cause.clone());
        }
        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

/// Drain every complete frame out of `read_buffer`.
///
/// Invokes `on_frame` once per decoded frame and stops when the buffer
/// holds only a partial frame. This is the shared inbound pump both peer
/// flavours run inside their connection tasks; a `FrameError` from it
/// closes the connection.
pub(crate) fn pump_frames<C: MessageCodec>(
    codec: &FrameCodec<C>,
    read_buffer: &mut Vec<u8>,
    state: &mut DecodeState,
    mut on_frame: impl FnMut(Vec<u8>, u16),
) -> Result<(), FrameError> {
    while let Some((body, channel)) = codec.decode_frame(read_buffer, state)? {
        on_frame(body, channel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::JsonCodec;

    #[test]
    fn close_notify_first_cause_wins() {
        let notify = CloseNotify::new();
        assert!(!notify.is_closed());

        notify.notify(Some(RpcError::ConnectionClosed));
        notify.notify(None);
        assert!(notify.is_closed());
    }

    #[tokio::test]
    async fn close_notify_delivers_cause_to_late_waiter() {
        let notify = CloseNotify::new();
        notify.notify(Some(RpcError::Timeout));

        let cause = notify.closed().await;
        assert!(matches!(cause, Some(RpcError::Timeout)));
    }

    #[tokio::test]
    async fn close_notify_clean_close() {
        let notify = CloseNotify::new();
        notify.notify(None);
        assert!(notify.closed().await.is_none());
    }

    #[test]
    fn pump_yields_every_complete_frame() {
        let codec = FrameCodec::new(JsonCodec);
        let mut buf = codec.encode(&1u32, 0).expect("encode");
        buf.extend_from_slice(&codec.encode(&2u32, 1).expect("encode"));
        // Partial third frame
        let third = codec.encode(&3u32, 2).expect("encode");
        buf.extend_from_slice(&third[..4]);

        let mut state = DecodeState::default();
        let mut seen = Vec::new();
        pump_frames(&codec, &mut buf, &mut state, |body, channel| {
            seen.push((body, channel));
        })
        .expect("pump");

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 0);
        assert_eq!(seen[1].1, 1);
        // Partial frame left in the buffer for the next read
        assert!(!buf.is_empty());
    }
}
