//! Length-prefixed framing shared by all architectures.
//!
//! An envelope is a 4-byte big-endian payload length followed by the payload,
//! a bincode encoding of any serde type. The encoding is the same in both
//! directions and for every architecture.
//!
//! [`FrameDecoder`] is the incremental reader. It never consumes bytes past the
//! end of the current envelope, so a connection needs no carry-over buffer
//! between frames: the decoder always says exactly how many bytes it still wants.

use crate::error::{Error, Result};
use bincode::config::{BigEndian, Configuration, Fixint};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read};
use std::mem;

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload accepted from a peer (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Anything that can travel as a request or a response.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Serialize `value` into a complete envelope.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload = bincode::serde::encode_to_vec(value, wire_config())?;
    frame_payload(&payload)
}

/// Prefix already-serialized bytes with their length.
pub fn frame_payload(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Deserialize a payload. Every byte must belong to the value.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let (value, read) = bincode::serde::decode_from_slice(payload, wire_config())?;
    if read != payload.len() {
        return Err(Error::TrailingBytes {
            trailing: payload.len() - read,
        });
    }
    Ok(value)
}

/// Where a connection is inside the current envelope.
#[derive(Debug)]
pub enum ReadState {
    Length {
        prefix: [u8; LENGTH_PREFIX_LEN],
        filled: usize,
    },
    Payload {
        payload: BytesMut,
        filled: usize,
    },
}

impl ReadState {
    fn idle() -> Self {
        ReadState::Length {
            prefix: [0; LENGTH_PREFIX_LEN],
            filled: 0,
        }
    }

    /// Advance the state by `n` freshly read bytes.
    ///
    /// Returns the next state and the payload if this read completed an envelope.
    pub fn transition(self, n: usize) -> Result<(ReadState, Option<Bytes>)> {
        match self {
            ReadState::Length { prefix, filled } => {
                let filled = filled + n;
                if filled < LENGTH_PREFIX_LEN {
                    return Ok((ReadState::Length { prefix, filled }, None));
                }
                let len = u32::from_be_bytes(prefix) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(Error::FrameTooLarge {
                        len,
                        limit: MAX_FRAME_LEN,
                    });
                }
                if len == 0 {
                    return Ok((ReadState::idle(), Some(Bytes::new())));
                }
                let payload = BytesMut::zeroed(len);
                Ok((ReadState::Payload { payload, filled: 0 }, None))
            }
            ReadState::Payload { payload, filled } => {
                let filled = filled + n;
                if filled < payload.len() {
                    return Ok((ReadState::Payload { payload, filled }, None));
                }
                Ok((ReadState::idle(), Some(payload.freeze())))
            }
        }
    }
}

/// Incremental envelope reader.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: ReadState::idle(),
        }
    }

    pub fn state(&self) -> &ReadState {
        &self.state
    }

    /// True when positioned exactly between two envelopes.
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, ReadState::Length { filled: 0, .. })
    }

    /// The bytes still missing from the current state. Never empty.
    pub fn unfilled(&mut self) -> &mut [u8] {
        match &mut self.state {
            ReadState::Length { prefix, filled } => &mut prefix[*filled..],
            ReadState::Payload { payload, filled } => &mut payload[*filled..],
        }
    }

    /// Record that `n` bytes were read into [`unfilled`](Self::unfilled).
    pub fn advance(&mut self, n: usize) -> Result<Option<Bytes>> {
        debug_assert!(n <= self.unfilled().len());
        let state = mem::replace(&mut self.state, ReadState::idle());
        let (next, frame) = state.transition(n)?;
        self.state = next;
        Ok(frame)
    }

    /// Classify end of stream: clean at a boundary, a framing error otherwise.
    pub fn finish(&self) -> Result<()> {
        match &self.state {
            ReadState::Length { filled: 0, .. } => Ok(()),
            ReadState::Length { filled, .. } => Err(Error::Framing {
                expected: LENGTH_PREFIX_LEN,
                received: *filled,
            }),
            ReadState::Payload { payload, filled } => Err(Error::Framing {
                expected: payload.len(),
                received: *filled,
            }),
        }
    }
}

/// Read one envelope from a blocking reader.
///
/// `Ok(None)` means the peer closed the stream between envelopes.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut decoder = FrameDecoder::new();
    loop {
        let n = match reader.read(decoder.unfilled()) {
            Ok(0) => {
                decoder.finish()?;
                return Ok(None);
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(frame) = decoder.advance(n)? {
            return Ok(Some(frame));
        }
    }
}

/// Read and deserialize one envelope from a blocking reader.
pub fn decode_one<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: Read,
{
    match read_frame(reader)? {
        Some(payload) => decode_payload(&payload).map(Some),
        None => Ok(None),
    }
}
