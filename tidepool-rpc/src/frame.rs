//! Wire format: length-prefixed frames with channel multiplexing.
//!
//! Every message travels in a frame: a compact header carrying the
//! format version, the channel the message belongs to, and the body
//! length, followed by the encoded body. All integers are big-endian.
//!
//! Two header versions are live on the wire:
//!
//! ```text
//! version 1 (6 bytes):
//! ┌───────────┬───────────┬──────────────┬───────────────┐
//! │ ver=1 (1B)│ chan (1B) │ body len (4B)│ body           │
//! └───────────┴───────────┴──────────────┴───────────────┘
//!
//! version 2 (8 bytes):
//! ┌───────────┬───────────┬───────────┬──────────────┬────┐
//! │ ver=2 (1B)│ flags (1B)│ chan (2B) │ body len (4B)│body│
//! └───────────┴───────────┴───────────┴──────────────┴────┘
//! ```
//!
//! Encoders always emit version 2; decoders accept both. Bit 0 of the
//! version-2 flags marks a compressed body.
//!
//! Decoding is streaming: [`FrameCodec::decode_frame`] consumes exactly
//! one frame's bytes from the caller's buffer, returns `Ok(None)` while
//! the frame is incomplete, and leaves trailing bytes untouched for the
//! next call. The in-progress parse lives in a caller-held
//! [`DecodeState`], so the codec itself stays stateless and one codec
//! instance can serve many connections.

use std::rc::Rc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use tidepool_core::{Compressor, MessageCodec};

/// Version byte of the legacy header.
pub const FRAME_VERSION_1: u8 = 1;

/// Version byte of the current header.
pub const FRAME_VERSION_2: u8 = 2;

/// Header size of a version-1 frame.
pub const HEADER_SIZE_V1: usize = 6;

/// Header size of a version-2 frame.
pub const HEADER_SIZE_V2: usize = 8;

/// Version-2 flag bit: the body is compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Hard upper bound on per-connection channels (2^15).
///
/// Channel IDs above this never appear in a valid channel table, which
/// is what makes [`PLACEHOLDER_CHANNEL`] safe to use as a sentinel.
pub const MAX_CHANNELS: usize = 1 << 15;

/// Sentinel channel written into eagerly-encoded frames that are still
/// waiting for a real channel assignment; rewritten via
/// [`FrameCodec::recode`] on dequeue.
pub const PLACEHOLDER_CHANNEL: u16 = u16::MAX;

/// Errors from encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The first byte of a frame was neither version 1 nor 2.
    #[error("unknown frame version: {0}")]
    UnknownVersion(u8),

    /// The channel does not fit the target header version.
    #[error("channel {channel} out of range for version {version} header")]
    ChannelOutOfRange {
        /// The rejected channel ID.
        channel: u16,
        /// The header version it did not fit.
        version: u8,
    },

    /// A compressed frame arrived but no compressor is configured.
    #[error("compressed frame received with no compressor configured")]
    MissingCompressor,

    /// Compressing or decompressing a body failed.
    #[error("compression failed: {message}")]
    Compression {
        /// Details from the compressor.
        message: String,
    },

    /// The delegate message codec failed.
    #[error("message codec failed: {message}")]
    Message {
        /// Details from the codec.
        message: String,
    },

    /// A frame slice was too short to carry the requested header.
    #[error("frame truncated: {len} bytes")]
    Truncated {
        /// Length of the offending slice.
        len: usize,
    },
}

/// Streaming decode state, carried by the caller across
/// [`FrameCodec::decode_frame`] calls.
///
/// A fresh state starts at [`NeedHeader`](DecodeState::NeedHeader); once
/// a complete header has been consumed the state records the parsed
/// fields and waits for the body. Completing a frame resets the state,
/// so one value can be reused for the life of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for a complete header.
    #[default]
    NeedHeader,

    /// Header consumed; waiting for `body_len` body bytes.
    NeedBody {
        /// Channel from the header.
        channel: u16,
        /// Compression flag from the header.
        compressed: bool,
        /// Body length from the header.
        body_len: usize,
    },
}

/// Frame codec: pairs a delegate [`MessageCodec`] with the wire framing
/// and an optional [`Compressor`].
pub struct FrameCodec<C: MessageCodec> {
    codec: C,
    compressor: Option<Rc<dyn Compressor>>,
}

impl<C: MessageCodec> Clone for FrameCodec<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            compressor: self.compressor.clone(),
        }
    }
}

impl<C: MessageCodec> FrameCodec<C> {
    /// Create a codec with no compression.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            compressor: None,
        }
    }

    /// Create a codec that compresses bodies the compressor's advisory
    /// predicate admits, and decompresses flagged inbound bodies.
    pub fn with_compressor(codec: C, compressor: Rc<dyn Compressor>) -> Self {
        Self {
            codec,
            compressor: Some(compressor),
        }
    }

    /// The delegate message codec.
    pub fn message_codec(&self) -> &C {
        &self.codec
    }

    /// Serialize a message body via the delegate codec.
    pub fn encode_message<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, FrameError> {
        self.codec.encode(msg).map_err(|e| FrameError::Message {
            message: e.to_string(),
        })
    }

    /// Deserialize a message body via the delegate codec.
    pub fn decode_message<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, FrameError> {
        self.codec.decode(body).map_err(|e| FrameError::Message {
            message: e.to_string(),
        })
    }

    /// Encode a message into a complete version-2 frame for `channel`.
    pub fn encode<T: Serialize>(&self, msg: &T, channel: u16) -> Result<Vec<u8>, FrameError> {
        let body = self.encode_message(msg)?;
        self.encode_body(body, channel)
    }

    /// Frame an already-serialized body for `channel`.
    fn encode_body(&self, body: Vec<u8>, channel: u16) -> Result<Vec<u8>, FrameError> {
        let (flags, body) = match &self.compressor {
            Some(compressor) if compressor.should_compress(&body) => {
                let compressed =
                    compressor
                        .compress(&body)
                        .map_err(|e| FrameError::Compression {
                            message: e.to_string(),
                        })?;
                (FLAG_COMPRESSED, compressed)
            }
            _ => (0, body),
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE_V2 + body.len());
        frame.push(FRAME_VERSION_2);
        frame.push(flags);
        frame.extend_from_slice(&channel.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Consume at most one frame from `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete; the partial
    /// parse is recorded in `state` and `buf` keeps any bytes not yet
    /// consumed. On completion returns the decompressed body and the
    /// channel, resets `state`, and leaves trailing bytes in `buf`.
    ///
    /// # Errors
    ///
    /// An unknown version byte, a flagged body with no compressor, or a
    /// decompression failure. After an error the connection is expected
    /// to close; neither `buf` nor `state` is left in a resumable shape.
    pub fn decode_frame(
        &self,
        buf: &mut Vec<u8>,
        state: &mut DecodeState,
    ) -> Result<Option<(Vec<u8>, u16)>, FrameError> {
        if *state == DecodeState::NeedHeader {
            if buf.is_empty() {
                return Ok(None);
            }
            match buf[0] {
                FRAME_VERSION_1 => {
                    if buf.len() < HEADER_SIZE_V1 {
                        return Ok(None);
                    }
                    let channel = buf[1] as u16;
                    let body_len =
                        u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
                    buf.drain(..HEADER_SIZE_V1);
                    *state = DecodeState::NeedBody {
                        channel,
                        compressed: false,
                        body_len,
                    };
                }
                FRAME_VERSION_2 => {
                    if buf.len() < HEADER_SIZE_V2 {
                        return Ok(None);
                    }
                    let compressed = buf[1] & FLAG_COMPRESSED != 0;
                    let channel = u16::from_be_bytes([buf[2], buf[3]]);
                    let body_len =
                        u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    buf.drain(..HEADER_SIZE_V2);
                    *state = DecodeState::NeedBody {
                        channel,
                        compressed,
                        body_len,
                    };
                }
                other => return Err(FrameError::UnknownVersion(other)),
            }
        }

        let DecodeState::NeedBody {
            channel,
            compressed,
            body_len,
        } = *state
        else {
            return Ok(None);
        };

        if buf.len() < body_len {
            return Ok(None);
        }

        let body: Vec<u8> = buf.drain(..body_len).collect();
        *state = DecodeState::NeedHeader;

        let body = if compressed {
            let compressor = self.compressor.as_ref().ok_or(FrameError::MissingCompressor)?;
            compressor
                .decompress(&body)
                .map_err(|e| FrameError::Compression {
                    message: e.to_string(),
                })?
        } else {
            body
        };

        Ok(Some((body, channel)))
    }

    /// Consume at most one frame and decode its body to `T`.
    ///
    /// Convenience over [`decode_frame`](Self::decode_frame) +
    /// [`decode_message`](Self::decode_message) for callers that know
    /// the payload type up front.
    pub fn decode<T: DeserializeOwned>(
        &self,
        buf: &mut Vec<u8>,
        state: &mut DecodeState,
    ) -> Result<Option<(T, u16)>, FrameError> {
        match self.decode_frame(buf, state)? {
            Some((body, channel)) => Ok(Some((self.decode_message(&body)?, channel))),
            None => Ok(None),
        }
    }

    /// Whether [`recode`](Self::recode) is supported.
    ///
    /// Both header versions keep the channel at a fixed offset, so
    /// recoding is always available for this wire format. Send paths
    /// consult this before choosing the eager-encode queueing strategy.
    pub fn supports_recoding(&self) -> bool {
        true
    }

    /// Rewrite the channel of an already-encoded frame in place.
    ///
    /// The body is untouched; only the header's channel field changes.
    /// Used to encode queued requests eagerly with
    /// [`PLACEHOLDER_CHANNEL`] and patch in the real channel on dequeue.
    pub fn recode(&self, frame: &mut [u8], new_channel: u16) -> Result<(), FrameError> {
        match frame.first() {
            Some(&FRAME_VERSION_1) => {
                if frame.len() < HEADER_SIZE_V1 {
                    return Err(FrameError::Truncated { len: frame.len() });
                }
                if new_channel > u8::MAX as u16 {
                    return Err(FrameError::ChannelOutOfRange {
                        channel: new_channel,
                        version: FRAME_VERSION_1,
                    });
                }
                frame[1] = new_channel as u8;
                Ok(())
            }
            Some(&FRAME_VERSION_2) => {
                if frame.len() < HEADER_SIZE_V2 {
                    return Err(FrameError::Truncated { len: frame.len() });
                }
                frame[2..4].copy_from_slice(&new_channel.to_be_bytes());
                Ok(())
            }
            Some(&other) => Err(FrameError::UnknownVersion(other)),
            None => Err(FrameError::Truncated { len: 0 }),
        }
    }
}
