//! Server peer: request dispatch over accepted connections.
//!
//! The server decodes inbound request frames, hands each request to the
//! user's [`RequestHandler`], and writes the response back tagged with
//! the channel the request arrived on - the client uses that channel to
//! correlate the response with its waiting future. Handlers run as
//! independent tasks, so responses may complete out of order; the
//! channel makes that safe.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};

use tidepool_core::{MessageCodec, NetworkProvider, Providers, TcpListenerTrait, TimeProvider};

use super::pump_frames;
use crate::config::ServerConfig;
use crate::error::{RpcError, RpcResult};
use crate::frame::{DecodeState, FrameCodec};

/// One accepted connection, as seen by handler hooks.
///
/// Handlers that need per-connection state can key it off
/// [`id`](ServerConnection::id), which is unique for the life of the
/// server.
#[derive(Debug, Clone)]
pub struct ServerConnection {
    id: u64,
    peer_addr: String,
}

impl ServerConnection {
    /// Server-unique connection ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

/// User-supplied request dispatch.
///
/// `handle_request` is the only required method. The error hook and the
/// connection hook have no-op defaults.
#[async_trait(?Send)]
pub trait RequestHandler: 'static {
    /// Decoded request payload type.
    type Request: DeserializeOwned + 'static;
    /// Response payload type.
    type Response: Serialize + 'static;

    /// Invoked once per accepted connection, before any dispatch.
    async fn handle_connection(&self, conn: &ServerConnection) {
        let _ = conn;
    }

    /// Produce the response for one request.
    async fn handle_request(
        &self,
        request: &Self::Request,
        conn: &ServerConnection,
    ) -> RpcResult<Self::Response>;

    /// Recover from a failed request.
    ///
    /// Called when `handle_request` fails (`response` is `None`) or when
    /// encoding its response fails (`response` carries the response that
    /// would not encode). Returning `Some` writes the alternate response
    /// on the original channel; returning `None` leaves the request
    /// unanswered, which parks that channel on the client until its own
    /// close semantics clear it.
    async fn handle_error(
        &self,
        error: RpcError,
        request: Option<&Self::Request>,
        response: Option<&Self::Response>,
        conn: &ServerConnection,
    ) -> Option<Self::Response> {
        let _ = (request, response);
        tracing::warn!(
            peer = %conn.peer_addr(),
            error = %error,
            "request failed with no recovery response"
        );
        None
    }
}

/// Accepts connections and dispatches requests to a handler.
pub struct RpcServer<P: Providers, C: MessageCodec, H: RequestHandler> {
    providers: P,
    codec: FrameCodec<C>,
    handler: Rc<H>,
    config: ServerConfig,
    shutdown: Rc<ShutdownSignal>,
    accept_shutdown_tx: RefCell<Option<mpsc::UnboundedSender<()>>>,
}

/// Shared stop flag plus wakeup for connection tasks.
struct ShutdownSignal {
    stopped: Cell<bool>,
    notify: Notify,
}

impl ShutdownSignal {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            stopped: Cell::new(false),
            notify: Notify::new(),
        })
    }

    fn stop(&self) {
        self.stopped.set(true);
        self.notify.notify_waiters();
    }
}

impl<P: Providers, C: MessageCodec, H: RequestHandler> RpcServer<P, C, H> {
    /// Create a server; call [`listen`](Self::listen) to start it.
    pub fn new(providers: P, codec: FrameCodec<C>, handler: H, config: ServerConfig) -> Self {
        Self {
            providers,
            codec,
            handler: Rc::new(handler),
            config,
            shutdown: ShutdownSignal::new(),
            accept_shutdown_tx: RefCell::new(None),
        }
    }

    /// Bind `bind_address:port` and start accepting connections.
    ///
    /// Returns the bound local address (useful with port 0).
    pub async fn listen(&self, port: u16) -> RpcResult<String> {
        let addr = format!("{}:{}", self.config.bind_address, port);
        let listener = self
            .providers
            .network()
            .bind(&addr, self.config.queue_size)
            .await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        *self.accept_shutdown_tx.borrow_mut() = Some(shutdown_tx);

        self.providers.spawn(
            "server_accept",
            accept_loop(
                listener,
                self.providers.clone(),
                self.codec.clone(),
                Rc::clone(&self.handler),
                Rc::clone(&self.shutdown),
                shutdown_rx,
            ),
        );

        tracing::debug!(addr = %local_addr, "server listening");
        Ok(local_addr)
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        if let Some(tx) = self.accept_shutdown_tx.borrow_mut().take() {
            let _ = tx.send(());
        }
        self.shutdown.stop();
    }
}

impl<P: Providers, C: MessageCodec, H: RequestHandler> Drop for RpcServer<P, C, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop<P, C, H>(
    listener: <P::Network as NetworkProvider>::TcpListener,
    providers: P,
    codec: FrameCodec<C>,
    handler: Rc<H>,
    shutdown: Rc<ShutdownSignal>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) where
    P: Providers,
    C: MessageCodec,
    H: RequestHandler,
{
    let mut next_conn_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!("accept loop stopping");
                return;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        next_conn_id += 1;
                        let conn = ServerConnection {
                            id: next_conn_id,
                            peer_addr,
                        };
                        tracing::debug!(peer = %conn.peer_addr(), id = conn.id(), "connection accepted");
                        providers.spawn(
                            "server_connection",
                            connection_task(
                                stream,
                                conn,
                                providers.clone(),
                                codec.clone(),
                                Rc::clone(&handler),
                                Rc::clone(&shutdown),
                            ),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        // Back off briefly so a persistent accept error
                        // cannot spin the loop.
                        let _ = providers.time().sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Per-connection task: decode pump plus response writer.
async fn connection_task<S, P, C, H>(
    mut stream: S,
    conn: ServerConnection,
    providers: P,
    codec: FrameCodec<C>,
    handler: Rc<H>,
    shutdown: Rc<ShutdownSignal>,
) where
    S: AsyncReadExt + AsyncWriteExt + Unpin + 'static,
    P: Providers,
    C: MessageCodec,
    H: RequestHandler,
{
    handler.handle_connection(&conn).await;

    let outbound: Rc<RefCell<VecDeque<Vec<u8>>>> = Rc::new(RefCell::new(VecDeque::new()));
    let data_to_send = Rc::new(Notify::new());

    let mut read_buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut decode_state = DecodeState::default();
    let mut chunk = vec![0u8; 4096];

    loop {
        if shutdown.stopped.get() {
            break;
        }

        tokio::select! {
            _ = shutdown.notify.notified() => {
                break;
            }

            _ = data_to_send.notified() => {
                if let Err(e) = write_outbound(&mut stream, &outbound).await {
                    tracing::debug!(peer = %conn.peer_addr(), error = %e, "server write failed");
                    break;
                }
            }

            read = stream.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        tracing::debug!(peer = %conn.peer_addr(), "connection closed by client");
                        break;
                    }
                    Ok(n) => {
                        read_buffer.extend_from_slice(&chunk[..n]);
                        let mut requests: Vec<(Vec<u8>, u16)> = Vec::new();
                        let pumped = pump_frames(
                            &codec,
                            &mut read_buffer,
                            &mut decode_state,
                            |body, channel| requests.push((body, channel)),
                        );
                        if let Err(e) = pumped {
                            tracing::warn!(
                                peer = %conn.peer_addr(),
                                error = %e,
                                "frame decode failed, closing connection"
                            );
                            let _ = stream.shutdown().await;
                            break;
                        }

                        let mut decode_failed = false;
                        for (body, channel) in requests {
                            match codec.decode_message::<H::Request>(&body) {
                                Ok(request) => {
                                    providers.spawn(
                                        "server_dispatch",
                                        dispatch_request(
                                            request,
                                            channel,
                                            conn.clone(),
                                            codec.clone(),
                                            Rc::clone(&handler),
                                            Rc::clone(&outbound),
                                            Rc::clone(&data_to_send),
                                        ),
                                    );
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        peer = %conn.peer_addr(),
                                        error = %e,
                                        "request decode failed, closing connection"
                                    );
                                    decode_failed = true;
                                    break;
                                }
                            }
                        }
                        if decode_failed {
                            let _ = stream.shutdown().await;
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %conn.peer_addr(), error = %e, "server read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Run the handler for one request and write its response.
///
/// Failures route through `handle_error` exactly once; an encoding
/// failure of the original response re-enters it with the response
/// supplied. A failure past that is logged and the request stays
/// unanswered.
async fn dispatch_request<C, H>(
    request: H::Request,
    channel: u16,
    conn: ServerConnection,
    codec: FrameCodec<C>,
    handler: Rc<H>,
    outbound: Rc<RefCell<VecDeque<Vec<u8>>>>,
    data_to_send: Rc<Notify>,
) where
    C: MessageCodec,
    H: RequestHandler,
{
    let frame = match handler.handle_request(&request, &conn).await {
        Ok(response) => match codec.encode(&response, channel) {
            Ok(frame) => Some(frame),
            Err(encode_err) => {
                // Encoding failure of the original response takes the
                // same recovery path as a handler failure.
                let alternate = handler
                    .handle_error(encode_err.into(), Some(&request), Some(&response), &conn)
                    .await;
                encode_alternate(&codec, alternate.as_ref(), channel, &conn)
            }
        },
        Err(e) => {
            let alternate = handler
                .handle_error(e, Some(&request), None, &conn)
                .await;
            encode_alternate(&codec, alternate.as_ref(), channel, &conn)
        }
    };

    if let Some(frame) = frame {
        outbound.borrow_mut().push_back(frame);
        data_to_send.notify_one();
    }
}

/// Encode the recovery response, if any. A failure here ends the error
/// path: it is logged and nothing is written.
fn encode_alternate<C: MessageCodec, R: Serialize>(
    codec: &FrameCodec<C>,
    alternate: Option<&R>,
    channel: u16,
    conn: &ServerConnection,
) -> Option<Vec<u8>> {
    let alternate = alternate?;
    match codec.encode(alternate, channel) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(
                peer = %conn.peer_addr(),
                channel,
                error = %e,
                "recovery response failed to encode, request left unanswered"
            );
            None
        }
    }
}

/// Write every queued response frame, in order.
async fn write_outbound<S>(
    stream: &mut S,
    outbound: &Rc<RefCell<VecDeque<Vec<u8>>>>,
) -> Result<(), RpcError>
where
    S: AsyncWriteExt + Unpin,
{
    loop {
        let frame = outbound.borrow_mut().pop_front();
        let Some(frame) = frame else {
            return Ok(());
        };
        stream.write_all(&frame).await?;
    }
}
