//! # tidepool-core
//!
//! Core abstractions for the tidepool RPC toolkit.
//!
//! The peer subsystem in `tidepool-rpc` never touches sockets, clocks,
//! or task spawning directly. It depends on the small set of traits
//! defined here, so the same peer code can run against real Tokio I/O in
//! production and against scripted mock implementations in tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  tidepool-rpc                         │
//! │   Uses: NetworkProvider, TimeProvider, TaskProvider   │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ depends on traits
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!   ┌─────────────────┐         ┌─────────────────┐
//!   │  Test doubles   │         │   Production    │
//!   │ scripted conns, │         │ TokioNetworkProv.│
//!   │ instant clocks  │         │ TokioTimeProvider│
//!   └─────────────────┘         └─────────────────┘
//! ```
//!
//! ## Provider traits
//!
//! | Trait | Production impl | Purpose |
//! |-------|-----------------|---------|
//! | [`NetworkProvider`] | [`TokioNetworkProvider`] | Connect, bind, accept |
//! | [`TimeProvider`] | [`TokioTimeProvider`] | Sleep, timeout, now() |
//! | [`TaskProvider`] | [`TokioTaskProvider`] | Local task spawning |
//!
//! **Important**: never call tokio directly in peer code.
//! - ❌ `tokio::time::sleep()`
//! - ✅ `time_provider.sleep()`
//!
//! ## Application payloads
//!
//! [`MessageCodec`] is the pluggable serialization seam: the framing
//! layer treats message bodies as opaque bytes and delegates the
//! typed encode/decode to the codec. [`JsonCodec`] and [`MsgpackCodec`]
//! ship in the box; [`Compressor`] optionally shrinks bodies on the
//! wire.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod compress;
mod network;
mod providers;
mod task;
mod time;

// Codec exports
pub use codec::{CodecError, JsonCodec, MessageCodec, MsgpackCodec};

// Compression exports
pub use compress::{CompressError, Compressor, ZstdCompressor};

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
