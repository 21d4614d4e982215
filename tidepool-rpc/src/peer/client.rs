//! Client peer: channel-multiplexed requests over one connection.
//!
//! Every in-flight request owns a channel for its lifetime. The channel
//! table is a fixed array of `max_channels` slots; allocation takes the
//! lowest free index. When the table is full, requests wait in a strict
//! FIFO queue - already encoded against a placeholder channel so that
//! dequeueing only has to patch the channel bytes via
//! [`FrameCodec::recode`].
//!
//! Timed-out requests fail their future but keep their channel slot
//! occupied until the response eventually arrives (and is dropped
//! silently) or the connection closes. Freeing the slot early would
//! require stamping assignments with a nonce to tell a late response
//! from a current one; keeping the slot simplifies the accounting at
//! the cost of one channel per outstanding timeout.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, oneshot};

use tidepool_core::{MessageCodec, NetworkProvider, Providers, TimeProvider};

use super::{CloseNotify, pump_frames};
use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::frame::{DecodeState, FrameCodec, PLACEHOLDER_CHANNEL};

/// Reply channel for one request; carries the raw response body.
type ReplySender = oneshot::Sender<RpcResult<Vec<u8>>>;

/// One slot of the channel table.
enum ChannelSlot {
    /// No request in flight on this channel.
    Free,
    /// A request is in flight; the response fulfils `reply_tx`.
    Waiting {
        /// Request ID, so a timeout timer can find its own request.
        id: u64,
        /// Completion side of the request future.
        reply_tx: ReplySender,
    },
    /// The request timed out; the slot stays occupied until the
    /// response arrives or the connection closes.
    TimedOut,
}

impl ChannelSlot {
    fn is_free(&self) -> bool {
        matches!(self, ChannelSlot::Free)
    }

    fn is_occupied(&self) -> bool {
        !self.is_free()
    }
}

/// A request waiting for a free channel.
struct PendingSend {
    id: u64,
    /// Complete frame encoded against [`PLACEHOLDER_CHANNEL`].
    frame: Vec<u8>,
    reply_tx: ReplySender,
}

/// State shared between caller context and the connection task.
struct ClientShared {
    channels: Vec<ChannelSlot>,
    /// FIFO queue of requests awaiting a channel.
    pending: VecDeque<PendingSend>,
    /// Frames ready for the writer, in send order.
    outbound: VecDeque<Vec<u8>>,
    closed: bool,
    next_request_id: u64,
    sent_messages: u64,
    received_responses: u64,
    timeouts: u64,
}

impl ClientShared {
    fn new(max_channels: usize) -> Self {
        let mut channels = Vec::with_capacity(max_channels);
        channels.resize_with(max_channels, || ChannelSlot::Free);
        Self {
            channels,
            pending: VecDeque::new(),
            outbound: VecDeque::new(),
            closed: false,
            next_request_id: 1,
            sent_messages: 0,
            received_responses: 0,
            timeouts: 0,
        }
    }

    fn free_channel(&self) -> Option<usize> {
        self.channels.iter().position(ChannelSlot::is_free)
    }
}

/// Point-in-time statistics for one client peer.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Configured channel cap.
    pub max_channels: usize,
    /// Channels currently occupied (in flight or timed out).
    pub active_channels: usize,
    /// Requests queued for a free channel.
    pub queued_messages: usize,
    /// Requests handed to the transport over the peer's lifetime.
    pub sent_messages: u64,
    /// Responses correlated back to a request future.
    pub received_responses: u64,
    /// Requests failed by their timer.
    pub timeouts: u64,
}

/// A client-side connection multiplexing requests over channels.
///
/// Created by [`connect`](ClientPeer::connect) (or
/// [`from_stream`](ClientPeer::from_stream) for pre-established
/// streams); owned behind `Rc` so the supervisor, response futures, and
/// the connection task can share it. Dropping the last handle shuts the
/// connection down.
pub struct ClientPeer<P: Providers, C: MessageCodec> {
    host: String,
    port: u16,
    codec: FrameCodec<C>,
    providers: P,
    shared: Rc<RefCell<ClientShared>>,
    data_to_send: Rc<Notify>,
    close: Rc<CloseNotify>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl<P: Providers, C: MessageCodec> ClientPeer<P, C> {
    /// Connect to `host:port` and start the connection task.
    ///
    /// The connect attempt is bounded by `config.connection_timeout`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `max_channels` exceeds the wire format's
    /// limit; `Connect` if the dial fails or times out.
    pub async fn connect(
        providers: P,
        host: &str,
        port: u16,
        codec: FrameCodec<C>,
        config: ClientConfig,
    ) -> RpcResult<Rc<Self>> {
        config.validate().map_err(RpcError::InvalidConfig)?;
        let addr = format!("{}:{}", host, port);
        let connect = providers.network().connect(&addr);
        let stream = match providers.time().timeout(config.connection_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::Connect {
                    message: format!("{}: {}", addr, e),
                });
            }
            Err(_) => {
                return Err(RpcError::Connect {
                    message: format!("{}: connect timed out", addr),
                });
            }
        };
        Self::from_stream(providers, host, port, stream, codec, config)
    }

    /// Wrap an already-established stream in a client peer.
    pub fn from_stream(
        providers: P,
        host: &str,
        port: u16,
        stream: <P::Network as NetworkProvider>::TcpStream,
        codec: FrameCodec<C>,
        config: ClientConfig,
    ) -> RpcResult<Rc<Self>> {
        config.validate().map_err(RpcError::InvalidConfig)?;

        let shared = Rc::new(RefCell::new(ClientShared::new(config.max_channels)));
        let data_to_send = Rc::new(Notify::new());
        let close = CloseNotify::new();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let peer = Rc::new(Self {
            host: host.to_string(),
            port,
            codec: codec.clone(),
            providers: providers.clone(),
            shared: Rc::clone(&shared),
            data_to_send: Rc::clone(&data_to_send),
            close: Rc::clone(&close),
            shutdown_tx,
        });

        providers.spawn(
            "client_connection",
            connection_task(stream, shared, data_to_send, close, codec, shutdown_rx),
        );

        Ok(peer)
    }

    /// Remote host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }

    /// Wait for the connection to close; yields the cause (`None` for a
    /// clean close).
    pub async fn closed(&self) -> Option<RpcError> {
        self.close.closed().await
    }

    /// Snapshot the peer's statistics in one borrow.
    pub fn stats(&self) -> PeerStats {
        let shared = self.shared.borrow();
        PeerStats {
            host: self.host.clone(),
            port: self.port,
            max_channels: shared.channels.len(),
            active_channels: shared
                .channels
                .iter()
                .filter(|slot| slot.is_occupied())
                .count(),
            queued_messages: shared.pending.len(),
            sent_messages: shared.sent_messages,
            received_responses: shared.received_responses,
            timeouts: shared.timeouts,
        }
    }

    /// Send a request; the returned future resolves with the response.
    ///
    /// The request is assigned the lowest free channel, or queued FIFO
    /// when the table is full. An optional `timeout` arms a timer that
    /// fails the future with [`RpcError::Timeout`]; the late response,
    /// if any, is dropped silently.
    ///
    /// Channel assignment happens before this method returns, so call
    /// order - not poll order - fixes the FIFO position of queued
    /// requests.
    pub fn send_message<Req, Resp>(
        &self,
        request: &Req,
        timeout: Option<Duration>,
    ) -> ResponseFuture<Resp, C>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let future = ResponseFuture::new(reply_rx, self.codec.message_codec().clone());

        let id = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed {
                drop(shared);
                let _ = reply_tx.send(Err(RpcError::RequestNotSent));
                return future;
            }

            let id = shared.next_request_id;
            shared.next_request_id += 1;

            match shared.free_channel() {
                Some(index) => match self.codec.encode(request, index as u16) {
                    Ok(frame) => {
                        shared.channels[index] = ChannelSlot::Waiting { id, reply_tx };
                        shared.sent_messages += 1;
                        shared.outbound.push_back(frame);
                    }
                    Err(e) => {
                        drop(shared);
                        let _ = reply_tx.send(Err(e.into()));
                        return future;
                    }
                },
                None => {
                    // Encode now, on the calling path, so the connection
                    // task only has to patch the channel bytes on dequeue.
                    debug_assert!(self.codec.supports_recoding());
                    match self.codec.encode(request, PLACEHOLDER_CHANNEL) {
                        Ok(frame) => {
                            shared.pending.push_back(PendingSend {
                                id,
                                frame,
                                reply_tx,
                            });
                        }
                        Err(e) => {
                            drop(shared);
                            let _ = reply_tx.send(Err(e.into()));
                            return future;
                        }
                    }
                }
            }
            id
        };

        self.data_to_send.notify_one();

        if let Some(duration) = timeout {
            let shared = Rc::clone(&self.shared);
            let time = self.providers.time().clone();
            self.providers.spawn("request_timeout", async move {
                let _ = time.sleep(duration).await;
                fire_timeout(&shared, id);
            });
        }

        future
    }

    /// Close the connection with the given cause.
    ///
    /// In-flight requests fail with [`RpcError::ConnectionClosed`],
    /// queued ones with [`RpcError::RequestNotSent`]. Idempotent.
    pub fn close(&self, cause: Option<RpcError>) {
        drain_on_close(&self.shared);
        self.close.notify(cause);
        let _ = self.shutdown_tx.send(());
    }
}

impl<P: Providers, C: MessageCodec> Drop for ClientPeer<P, C> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl<P: Providers, C: MessageCodec> std::fmt::Debug for ClientPeer<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client peer {}:{}", self.host, self.port)
    }
}

/// Fail request `id` with a timeout, wherever it currently lives.
///
/// No-op when the request already completed; its timer outliving it is
/// expected and harmless.
fn fire_timeout(shared: &Rc<RefCell<ClientShared>>, id: u64) {
    let mut shared = shared.borrow_mut();
    if shared.closed {
        return;
    }

    // Still queued: remove the entry outright, its channel was never
    // assigned.
    if let Some(position) = shared.pending.iter().position(|entry| entry.id == id) {
        if let Some(entry) = shared.pending.remove(position) {
            shared.timeouts += 1;
            let _ = entry.reply_tx.send(Err(RpcError::Timeout));
        }
        return;
    }

    // In flight: fail the future but keep the slot occupied.
    let index = shared.channels.iter().position(
        |slot| matches!(slot, ChannelSlot::Waiting { id: slot_id, .. } if *slot_id == id),
    );
    if let Some(index) = index {
        let slot = mem::replace(&mut shared.channels[index], ChannelSlot::TimedOut);
        if let ChannelSlot::Waiting { reply_tx, .. } = slot {
            shared.timeouts += 1;
            let _ = reply_tx.send(Err(RpcError::Timeout));
        }
    }
}

/// Deliver a response body to channel `channel`, then flush the queue.
fn handle_response<C: MessageCodec>(
    shared: &Rc<RefCell<ClientShared>>,
    codec: &FrameCodec<C>,
    body: Vec<u8>,
    channel: u16,
) {
    let mut shared = shared.borrow_mut();
    let index = channel as usize;
    if index >= shared.channels.len() {
        tracing::debug!(channel, "response on out-of-range channel dropped");
    } else {
        match mem::replace(&mut shared.channels[index], ChannelSlot::Free) {
            ChannelSlot::Waiting { reply_tx, .. } => {
                shared.received_responses += 1;
                let _ = reply_tx.send(Ok(body));
            }
            ChannelSlot::TimedOut => {
                tracing::debug!(channel, "late response after timeout dropped");
            }
            ChannelSlot::Free => {
                tracing::debug!(channel, "response on free channel dropped");
            }
        }
    }
    flush_pending(&mut shared, codec);
}

/// Move queued requests onto freed channels, front of the queue first.
///
/// Stops at the first failure to allocate, preserving FIFO order.
fn flush_pending<C: MessageCodec>(shared: &mut ClientShared, codec: &FrameCodec<C>) {
    while !shared.pending.is_empty() {
        let Some(index) = shared.free_channel() else {
            break;
        };
        let Some(mut entry) = shared.pending.pop_front() else {
            break;
        };
        match codec.recode(&mut entry.frame, index as u16) {
            Ok(()) => {
                shared.channels[index] = ChannelSlot::Waiting {
                    id: entry.id,
                    reply_tx: entry.reply_tx,
                };
                shared.sent_messages += 1;
                shared.outbound.push_back(entry.frame);
            }
            Err(e) => {
                let _ = entry.reply_tx.send(Err(e.into()));
            }
        }
    }
}

/// Drain the channel table and queues after a close. Idempotent.
fn drain_on_close(shared: &Rc<RefCell<ClientShared>>) {
    let mut shared = shared.borrow_mut();
    if shared.closed {
        return;
    }
    shared.closed = true;

    for slot in shared.channels.iter_mut() {
        if let ChannelSlot::Waiting { reply_tx, .. } =
            mem::replace(slot, ChannelSlot::Free)
        {
            let _ = reply_tx.send(Err(RpcError::ConnectionClosed));
        }
    }
    for entry in shared.pending.drain(..) {
        let _ = entry.reply_tx.send(Err(RpcError::RequestNotSent));
    }
    shared.outbound.clear();
}

/// Write every queued outbound frame to the stream, in order.
async fn drain_outbound<S>(
    stream: &mut S,
    shared: &Rc<RefCell<ClientShared>>,
) -> Result<(), RpcError>
where
    S: AsyncWriteExt + Unpin,
{
    loop {
        let frame = shared.borrow_mut().outbound.pop_front();
        let Some(frame) = frame else {
            return Ok(());
        };
        stream.write_all(&frame).await?;
    }
}

/// The connection task: sole owner of the socket.
///
/// Selects between writer wakeups and inbound data until shutdown, a
/// clean remote close, or an error. On exit the channel table and the
/// queues are drained and the close notification fires with the cause.
async fn connection_task<S, C>(
    mut stream: S,
    shared: Rc<RefCell<ClientShared>>,
    data_to_send: Rc<Notify>,
    close: Rc<CloseNotify>,
    codec: FrameCodec<C>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
    C: MessageCodec,
{
    let mut read_buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut decode_state = DecodeState::default();
    let mut chunk = vec![0u8; 4096];

    let cause: Option<RpcError> = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break None;
            }

            _ = data_to_send.notified() => {
                if let Err(e) = drain_outbound(&mut stream, &shared).await {
                    tracing::debug!(error = %e, "client write failed");
                    break Some(e);
                }
            }

            read = stream.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("client connection closed by remote");
                        break None;
                    }
                    Ok(n) => {
                        read_buffer.extend_from_slice(&chunk[..n]);
                        let pumped = pump_frames(
                            &codec,
                            &mut read_buffer,
                            &mut decode_state,
                            |body, channel| handle_response(&shared, &codec, body, channel),
                        );
                        if let Err(e) = pumped {
                            tracing::warn!(error = %e, "client decode failed, closing connection");
                            let _ = stream.shutdown().await;
                            break Some(RpcError::Frame(e));
                        }
                        // Responses free channels; flushed frames need the writer.
                        if let Err(e) = drain_outbound(&mut stream, &shared).await {
                            tracing::debug!(error = %e, "client write failed");
                            break Some(e);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "client read failed");
                        break Some(RpcError::Io(e.to_string()));
                    }
                }
            }
        }
    };

    drain_on_close(&shared);
    close.notify(cause);
}

/// Future side of one request; resolves to the decoded response.
///
/// Decoding happens at resolution: a body that fails to deserialize
/// fails this request only, without touching the connection.
pub struct ResponseFuture<T: DeserializeOwned, C: MessageCodec> {
    reply_rx: oneshot::Receiver<RpcResult<Vec<u8>>>,
    codec: C,
    _response: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, C: MessageCodec> ResponseFuture<T, C> {
    fn new(reply_rx: oneshot::Receiver<RpcResult<Vec<u8>>>, codec: C) -> Self {
        Self {
            reply_rx,
            codec,
            _response: PhantomData,
        }
    }
}

// No pinned state: the receiver is Unpin and the codec is only cloned.
impl<T: DeserializeOwned, C: MessageCodec> Unpin for ResponseFuture<T, C> {}

impl<T: DeserializeOwned, C: MessageCodec> Future for ResponseFuture<T, C> {
    type Output = RpcResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.reply_rx).poll(cx) {
            Poll::Ready(Ok(Ok(body))) => {
                let decoded = this.codec.decode::<T>(&body).map_err(|e| {
                    RpcError::Frame(crate::frame::FrameError::Message {
                        message: e.to_string(),
                    })
                });
                Poll::Ready(decoded)
            }
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            // Sender dropped without completing; close-time draining
            // makes this unreachable in practice.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
