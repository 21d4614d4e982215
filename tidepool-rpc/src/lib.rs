//! # tidepool-rpc
//!
//! A bidirectional, length-prefixed, channel-multiplexed
//! request/response framework over stream transports.
//!
//! Many concurrent requests share one connection: each in-flight
//! request borrows an integer *channel* for its lifetime, the server
//! echoes the channel on the response frame, and the client uses it to
//! correlate the response back to the waiting future.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                    │
//! │      send_request() / RequestHandler             │
//! ├─────────────────────────────────────────────────┤
//! │     ClientSupervisor (pooling + routing)         │
//! │     • Host set, reconnect with backoff           │
//! │     • Retry-once on closed connections           │
//! ├─────────────────────────────────────────────────┤
//! │     ClientPeer / RpcServer (multiplexing)        │
//! │     • Channel table + FIFO overflow queue        │
//! │     • Per-request timeouts                       │
//! ├─────────────────────────────────────────────────┤
//! │     FrameCodec (wire format)                     │
//! │     • Length-prefixed frames, two versions       │
//! │     • Streaming decode, optional compression     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`FrameCodec`] | Frame encode/decode with channel recoding |
//! | [`ClientPeer`] | One connection, many in-flight requests |
//! | [`RpcServer`] | Accept loop + [`RequestHandler`] dispatch |
//! | [`ClientSupervisor`] | Connection pool across a host set |
//!
//! ## Quick start
//!
//! ```ignore
//! use tidepool_core::{JsonCodec, TokioProviders};
//! use tidepool_rpc::{ClientConfig, ClientSupervisor, FrameCodec};
//!
//! let providers = TokioProviders::new();
//! let supervisor = ClientSupervisor::new(
//!     providers,
//!     FrameCodec::new(JsonCodec),
//!     ClientConfig::default(),
//! );
//! supervisor.add_host("127.0.0.1", 4600);
//! supervisor.start().await?;
//!
//! let response: Pong = supervisor.send_request(&Ping { seq: 1 }, None).await?;
//! ```
//!
//! All I/O, timers, and task spawning go through the provider traits
//! of [`tidepool_core`]; the peer subsystem itself is runtime-agnostic
//! and single-threaded (`spawn_local` tasks, no locks).

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use tidepool_core::{
    CodecError, CompressError, Compressor, JsonCodec, MessageCodec, MsgpackCodec, NetworkProvider,
    Providers, TaskProvider, TcpListenerTrait, TimeError, TimeProvider, TokioNetworkProvider,
    TokioProviders, TokioTaskProvider, TokioTimeProvider, ZstdCompressor,
};

// =============================================================================
// Modules
// =============================================================================

/// Configuration for clients and servers.
pub mod config;

/// Error types for the RPC layer.
pub mod error;

/// Wire format: framing, streaming decode, channel recoding.
pub mod frame;

/// Client and server peer state machines.
pub mod peer;

/// Connection pooling, routing, and reconnection.
pub mod supervisor;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Configuration exports
pub use config::{ClientConfig, ServerConfig};

// Error exports
pub use error::{RpcError, RpcResult};

// Frame codec exports
pub use frame::{
    DecodeState, FLAG_COMPRESSED, FRAME_VERSION_1, FRAME_VERSION_2, FrameCodec, FrameError,
    HEADER_SIZE_V1, HEADER_SIZE_V2, MAX_CHANNELS, PLACEHOLDER_CHANNEL,
};

// Peer exports
pub use peer::{
    ClientPeer, PeerStats, RequestHandler, ResponseFuture, RpcServer, ServerConnection,
};

// Supervisor exports
pub use supervisor::{ClientSupervisor, RandomPolicy, Registration, SupervisorPolicy};
