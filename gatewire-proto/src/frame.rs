//! Message envelopes shared by both endpoints.
//!
//! Every message on the wire is one frame:
//! `[code:1][channel_id:4][payload_len:4][payload]`, integers big-endian.
//! The framer guarantees per-stream ordering and nothing else; a short read
//! means the peer is gone.

use std::fmt;
use std::io::{self, Read};

use thiserror::Error;

/// Wire code of a message. The numeric values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgCode {
    /// Schedule execution on the peer with a channel bound.
    ChannelExec = 1,
    /// A codec-encoded value for a channel's receive queue.
    ChannelData = 2,
    /// The peer transitions the channel to CLOSED.
    ChannelClose = 3,
    /// Like [`MsgCode::ChannelClose`], with an error text attached first.
    ChannelCloseError = 4,
    /// The peer transitions the channel to SEND_ONLY.
    ChannelLastMessage = 5,
    /// Introduces a channel the sender has just allocated.
    ChannelNew = 6,
    /// Request for a counters reply on the same channel id.
    Status = 7,
    /// The peer stops its exec loop and closes its write side.
    GatewayTerminate = 8,
    /// Codec string-coercion options for the receiving decoder.
    Reconfigure = 9,
}

impl MsgCode {
    /// Decode a wire byte.
    pub fn from_wire(byte: u8) -> Option<MsgCode> {
        Some(match byte {
            1 => MsgCode::ChannelExec,
            2 => MsgCode::ChannelData,
            3 => MsgCode::ChannelClose,
            4 => MsgCode::ChannelCloseError,
            5 => MsgCode::ChannelLastMessage,
            6 => MsgCode::ChannelNew,
            7 => MsgCode::Status,
            8 => MsgCode::GatewayTerminate,
            9 => MsgCode::Reconfigure,
            _ => return None,
        })
    }

    /// Protocol-level name, for trace output.
    pub fn name(self) -> &'static str {
        match self {
            MsgCode::ChannelExec => "CHANNEL_EXEC",
            MsgCode::ChannelData => "CHANNEL_DATA",
            MsgCode::ChannelClose => "CHANNEL_CLOSE",
            MsgCode::ChannelCloseError => "CHANNEL_CLOSE_ERROR",
            MsgCode::ChannelLastMessage => "CHANNEL_LAST_MESSAGE",
            MsgCode::ChannelNew => "CHANNEL_NEW",
            MsgCode::Status => "STATUS",
            MsgCode::GatewayTerminate => "GATEWAY_TERMINATE",
            MsgCode::Reconfigure => "RECONFIGURE",
        }
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The framer failed to produce or consume a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended inside a frame; the peer is gone.
    #[error("connection closed while reading a frame")]
    Eof,
    /// A message code outside the defined enumeration.
    #[error("unknown message code {0:#04x}")]
    BadCode(u8),
    /// The payload does not fit the 32-bit length field.
    #[error("frame payload of {0} bytes exceeds the 32-bit length field")]
    PayloadTooLong(usize),
    /// Any other I/O failure on the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One framed message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// What kind of message this is.
    pub code: MsgCode,
    /// The channel the message belongs to; 0 for administrative messages
    /// that have no channel.
    pub channel_id: u32,
    /// Raw payload bytes; whether they are codec-encoded depends on `code`.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Make a frame with a payload.
    pub fn new(code: MsgCode, channel_id: u32, payload: Vec<u8>) -> Frame {
        Frame {
            code,
            channel_id,
            payload,
        }
    }

    /// Make a payload-less frame.
    pub fn empty(code: MsgCode, channel_id: u32) -> Frame {
        Frame::new(code, channel_id, Vec::new())
    }

    /// Serialise into a single buffer, ready for one atomic write.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| FrameError::PayloadTooLong(self.payload.len()))?;
        let mut out = Vec::with_capacity(9 + self.payload.len());
        out.push(self.code as u8);
        out.extend_from_slice(&self.channel_id.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Read one frame from a byte stream.
    pub fn read_from(reader: &mut impl Read) -> Result<Frame, FrameError> {
        let mut header = [0u8; 9];
        read_exact_or_eof(reader, &mut header)?;
        let code = MsgCode::from_wire(header[0]).ok_or(FrameError::BadCode(header[0]))?;
        let channel_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut payload = vec![0u8; len];
        read_exact_or_eof(reader, &mut payload)?;
        Ok(Frame {
            code,
            channel_id,
            payload,
        })
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(err)
        }
    })
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} channel={} len={}>",
            self.code,
            self.channel_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn roundtrip() {
        let frame = Frame::new(MsgCode::ChannelData, 42, b"payload".to_vec());
        let bytes = frame.to_bytes().unwrap();
        let back = Frame::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let frame = Frame::empty(MsgCode::GatewayTerminate, 0);
        let bytes = frame.to_bytes().unwrap();
        let back = Frame::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn header_layout_is_fixed() {
        let frame = Frame::new(MsgCode::ChannelExec, 0x0102_0304, vec![0xaa; 3]);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(&bytes[..9], &[1, 1, 2, 3, 4, 0, 0, 0, 3]);
        assert_eq!(&bytes[9..], &[0xaa, 0xaa, 0xaa]);
    }

    #[test]
    fn short_read_is_eof() {
        let frame = Frame::new(MsgCode::ChannelData, 1, b"abc".to_vec());
        let bytes = frame.to_bytes().unwrap();
        assert!(matches!(
            Frame::read_from(&mut &bytes[..bytes.len() - 1]),
            Err(FrameError::Eof)
        ));
        assert!(matches!(
            Frame::read_from(&mut &bytes[..4]),
            Err(FrameError::Eof)
        ));
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut bytes = Frame::empty(MsgCode::Status, 5).to_bytes().unwrap();
        bytes[0] = 0xf0;
        assert!(matches!(
            Frame::read_from(&mut bytes.as_slice()),
            Err(FrameError::BadCode(0xf0))
        ));
    }

    #[test]
    fn every_code_survives_the_wire() {
        for byte in 1..=9u8 {
            let code = MsgCode::from_wire(byte).unwrap();
            assert_eq!(code as u8, byte);
        }
        assert_eq!(MsgCode::from_wire(0), None);
        assert_eq!(MsgCode::from_wire(10), None);
    }
}
