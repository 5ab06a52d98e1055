//! Binary Envelope Codec
//!
//! Packed calling convention for high-frequency object-method calls that
//! carry a single opaque binary argument. All integers are little-endian
//! `i32`:
//!
//! ```text
//! [cmdLen][cmd, padded][callbackId][objectIdLen][objectId, padded]
//! [methodLen][method, padded][payload bytes ...]
//! ```
//!
//! String fields are padded with `aligned_len`. Padding content is
//! unspecified; readers rely on the explicit lengths only.
//!
//! Binary replies are `[callbackId][payload bytes ...]`.

use super::envelope::{CorrelationId, ObjectId, ROOT_OBJECT_ID};
use super::error::CodecError;

/// Command name carried by every binary object call.
pub const OBJECT_CALL_COMMAND: &str = "postMessageToObject";

const INT32: usize = 4;

/// Padded length of a string field: always advances past `len` to the next
/// multiple of four, so an already aligned field gains four bytes.
pub fn aligned_len(len: usize) -> usize {
    len + (INT32 - len % INT32)
}

/// A decoded binary object call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryObjectCall {
    pub command: String,
    pub callback_id: Option<CorrelationId>,
    pub object_id: ObjectId,
    pub method: String,
    pub payload: Vec<u8>,
}

fn push_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_padded(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(field);
    out.resize(out.len() + aligned_len(field.len()) - field.len(), 0);
}

/// Pack an object-method call.
///
/// Fails before anything is produced when `object_id` is the extension root.
pub fn encode_object_call(
    callback_id: Option<CorrelationId>,
    object_id: ObjectId,
    method: &str,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if object_id == ROOT_OBJECT_ID {
        return Err(CodecError::MissingObjectId);
    }
    let object_id = object_id.to_string();
    let command = OBJECT_CALL_COMMAND.as_bytes();

    let total = INT32
        + aligned_len(command.len())
        + 2 * INT32
        + aligned_len(object_id.len())
        + INT32
        + aligned_len(method.len())
        + payload.len();
    let mut out = Vec::with_capacity(total);

    push_i32(&mut out, command.len() as i32);
    push_padded(&mut out, command);
    push_i32(&mut out, callback_id.map_or(0, |id| id.get() as i32));
    push_i32(&mut out, object_id.len() as i32);
    push_padded(&mut out, object_id.as_bytes());
    push_i32(&mut out, method.len() as i32);
    push_padded(&mut out, method.as_bytes());
    out.extend_from_slice(payload);

    debug_assert_eq!(out.len(), total);
    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.offset;
        if needed > available {
            return Err(CodecError::Truncated {
                offset: self.offset,
                needed,
                available,
            });
        }
        let slice = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(INT32)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        let len = len as usize;
        let padded = self.take(aligned_len(len))?;
        String::from_utf8(padded[..len].to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn callback_id(&mut self) -> Result<Option<CorrelationId>, CodecError> {
        let raw = self.i32()?;
        if raw < 0 {
            return Err(CodecError::InvalidCallbackId(raw));
        }
        Ok((raw > 0).then_some(CorrelationId(raw as u32)))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offset..];
        self.offset = self.buf.len();
        rest
    }
}

/// Unpack an object-method call (native side).
pub fn decode_object_call(frame: &[u8]) -> Result<BinaryObjectCall, CodecError> {
    let mut reader = Reader {
        buf: frame,
        offset: 0,
    };
    let command = reader.string()?;
    let callback_id = reader.callback_id()?;
    let object_id_text = reader.string()?;
    let object_id = object_id_text
        .parse::<ObjectId>()
        .map_err(|_| CodecError::InvalidObjectId(object_id_text.clone()))?;
    let method = reader.string()?;
    let payload = reader.rest().to_vec();

    Ok(BinaryObjectCall {
        command,
        callback_id,
        object_id,
        method,
        payload,
    })
}

/// Pack a binary reply.
pub fn encode_binary_reply(callback_id: CorrelationId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INT32 + payload.len());
    push_i32(&mut out, callback_id.get() as i32);
    out.extend_from_slice(payload);
    out
}

/// Split a binary reply into its callback id and payload.
pub fn decode_binary_reply(frame: &[u8]) -> Result<(Option<CorrelationId>, &[u8]), CodecError> {
    let mut reader = Reader {
        buf: frame,
        offset: 0,
    };
    let callback_id = reader.callback_id()?;
    Ok((callback_id, reader.rest()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aligned_len_always_advances() {
        assert_eq!(aligned_len(0), 4);
        assert_eq!(aligned_len(1), 4);
        assert_eq!(aligned_len(3), 4);
        assert_eq!(aligned_len(4), 8);
        assert_eq!(aligned_len(19), 20);
    }

    #[test]
    fn layout_matches_field_order() {
        let frame = encode_object_call(Some(CorrelationId(9)), 12, "write", &[0xAA, 0xBB]).unwrap();
        // "postMessageToObject" is 19 bytes, padded to 20.
        assert_eq!(&frame[0..4], &19i32.to_le_bytes());
        assert_eq!(&frame[4..23], OBJECT_CALL_COMMAND.as_bytes());
        assert_eq!(&frame[24..28], &9i32.to_le_bytes());
        assert_eq!(&frame[28..32], &2i32.to_le_bytes());
        assert_eq!(&frame[32..34], b"12");
        assert_eq!(&frame[36..40], &5i32.to_le_bytes());
        assert_eq!(&frame[40..45], b"write");
        assert_eq!(&frame[48..], &[0xAA, 0xBB]);
    }

    #[test]
    fn root_object_is_rejected() {
        assert_eq!(
            encode_object_call(None, ROOT_OBJECT_ID, "write", &[]),
            Err(CodecError::MissingObjectId)
        );
    }

    #[test]
    fn padding_content_is_ignored() {
        let mut frame = encode_object_call(None, 3, "ab", b"xyz").unwrap();
        // Scribble over the padding after "ab".
        let method_start = 4 + 20 + 4 + 4 + 4 + 4;
        frame[method_start + 2] = 0xFF;
        frame[method_start + 3] = 0xFF;
        let call = decode_object_call(&frame).unwrap();
        assert_eq!(call.method, "ab");
        assert_eq!(call.payload, b"xyz");
        assert_eq!(call.callback_id, None);
    }

    #[test]
    fn truncated_frames_fail_cleanly() {
        let frame = encode_object_call(Some(CorrelationId(1)), 3, "send", b"").unwrap();
        for cut in 0..frame.len() {
            assert!(decode_object_call(&frame[..cut]).is_err(), "cut at {}", cut);
        }
        assert!(decode_object_call(&frame).is_ok());
    }

    #[test]
    fn binary_reply_round_trip() {
        let frame = encode_binary_reply(CorrelationId(4), b"ok");
        let (id, payload) = decode_binary_reply(&frame).unwrap();
        assert_eq!(id, Some(CorrelationId(4)));
        assert_eq!(payload, b"ok");
        assert_eq!(
            decode_binary_reply(&(-1i32).to_le_bytes()),
            Err(CodecError::InvalidCallbackId(-1))
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_object_call(&bytes);
            let _ = decode_binary_reply(&bytes);
        }

        #[test]
        fn encoded_calls_decode_to_their_fields(
            callback in 0u32..10_000,
            object_id in 1u32..1_000_000,
            method in "[a-zA-Z_]{0,24}",
            payload in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let cid = (callback > 0).then_some(CorrelationId(callback));
            let frame = encode_object_call(cid, object_id, &method, &payload).unwrap();
            prop_assert_eq!(frame.len() % 4, payload.len() % 4);
            let call = decode_object_call(&frame).unwrap();
            prop_assert_eq!(call.command.as_str(), OBJECT_CALL_COMMAND);
            prop_assert_eq!(call.callback_id, cid);
            prop_assert_eq!(call.object_id, object_id);
            prop_assert_eq!(call.method, method);
            prop_assert_eq!(call.payload, payload);
        }
    }
}
