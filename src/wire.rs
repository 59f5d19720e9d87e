//! Binary frame encoding and decoding.
//!
//! Outbound notification frames (commands 0 and 1) and the fixed 6-byte
//! inbound error frame (command 8). All integers are big-endian.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::delivery::{DeliveryError, DeliveryResult};
use crate::notification::{Notification, WireFormat};

/// Command byte of a simple notification frame.
pub const COMMAND_SIMPLE: u8 = 0;
/// Command byte of an enhanced notification frame.
pub const COMMAND_ENHANCED: u8 = 1;
/// Command byte of an inbound error frame.
pub const COMMAND_ERROR: u8 = 8;

/// Exact size of an inbound error frame.
pub const ERROR_FRAME_SIZE: usize = 6;

/// Error decoding an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// First byte of the error frame was not [`COMMAND_ERROR`]. Fatal to the
    /// connection that produced it.
    UnexpectedCommand(u8),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnexpectedCommand(cmd) => {
                write!(f, "unexpected command byte {cmd}, expected {COMMAND_ERROR}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a notification to its wire frame.
///
/// Deterministic and infallible: token and payload bounds are enforced at
/// [`Notification`] construction.
pub fn encode_notification(notification: &Notification) -> Bytes {
    let token = notification.device_token();
    let payload = notification.payload();
    let mut buf = BytesMut::with_capacity(1 + 8 + 2 + token.len() + 2 + payload.len());
    match notification.format() {
        WireFormat::Enhanced => {
            buf.put_u8(COMMAND_ENHANCED);
            buf.put_u32(notification.identifier());
            buf.put_u32(notification.expiry());
        }
        WireFormat::Simple => {
            buf.put_u8(COMMAND_SIMPLE);
        }
    }
    buf.put_u16(token.len() as u16);
    buf.put_slice(token);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a 6-byte error frame.
///
/// Fails only on a wrong command byte. Unrecognized status bytes map to
/// [`DeliveryError::Unknown`] rather than failing, so unknown server codes
/// still carry their identifier through to reconciliation.
pub fn decode_delivery_result(frame: &[u8; ERROR_FRAME_SIZE]) -> Result<DeliveryResult, FrameError> {
    if frame[0] != COMMAND_ERROR {
        return Err(FrameError::UnexpectedCommand(frame[0]));
    }
    let error = DeliveryError::from_status(frame[1]);
    let identifier = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
    Ok(DeliveryResult::new(error, identifier))
}

/// Encode an error frame. The server side of the protocol; used by test
/// harnesses standing in for the push service.
pub fn encode_delivery_result(result: &DeliveryResult) -> [u8; ERROR_FRAME_SIZE] {
    let id = result.identifier.to_be_bytes();
    [COMMAND_ERROR, result.error.status(), id[0], id[1], id[2], id[3]]
}
