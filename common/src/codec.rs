//! Binary framing for intra-swarm message replication.
//!
//! `push` and `push_batch` bodies are a concatenation of records. Each
//! record carries, in fixed order: `pubkey`, `data`, `hash`, `nonce` as
//! u32-LE length-prefixed strings, then `ttl` and `timestamp` as bare
//! u64 LE (both in milliseconds).

use crate::Message;
use thiserror::Error;

/// Decoding failures. Truncated or oversized input is an error, never a
/// panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("field length {0} exceeds the remaining input")]
    BadFieldLength(u32),
    #[error("field is not valid utf-8")]
    BadEncoding,
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Serialize messages into the wire framing.
pub fn serialize_messages(messages: &[Message]) -> Vec<u8> {
    let mut out = Vec::new();
    for msg in messages {
        put_str(&mut out, &msg.pubkey);
        put_str(&mut out, &msg.data);
        put_str(&mut out, &msg.hash);
        put_str(&mut out, &msg.nonce);
        out.extend_from_slice(&msg.ttl_ms.to_le_bytes());
        out.extend_from_slice(&msg.timestamp_ms.to_le_bytes());
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()?;
        if len as usize > self.buf.len() - self.pos {
            return Err(CodecError::BadFieldLength(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadEncoding)
    }
}

/// Parse the wire framing back into messages. The whole input must be
/// consumed; trailing garbage is an error.
pub fn deserialize_messages(body: &[u8]) -> Result<Vec<Message>, CodecError> {
    let mut reader = Reader { buf: body, pos: 0 };
    let mut out = Vec::new();
    while reader.pos < body.len() {
        let pubkey = reader.read_str()?;
        let data = reader.read_str()?;
        let hash = reader.read_str()?;
        let nonce = reader.read_str()?;
        let ttl_ms = reader.read_u64()?;
        let timestamp_ms = reader.read_u64()?;
        out.push(Message {
            pubkey,
            data,
            hash,
            ttl_ms,
            timestamp_ms,
            nonce,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u8) -> Message {
        Message {
            pubkey: "ab".repeat(32),
            data: format!("payload-{n}"),
            hash: format!("hash-{n}"),
            ttl_ms: 60_000,
            timestamp_ms: 1_700_000_000_000 + n as u64,
            nonce: "deadbeef".into(),
        }
    }

    #[test]
    fn test_batch_round_trip() {
        let msgs = vec![sample(1), sample(2), sample(3)];
        let wire = serialize_messages(&msgs);
        assert_eq!(deserialize_messages(&wire).unwrap(), msgs);
    }

    #[test]
    fn test_empty_input_is_empty_batch() {
        assert_eq!(deserialize_messages(&[]).unwrap(), vec![]);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let wire = serialize_messages(&[sample(1)]);
        let err = deserialize_messages(&wire[..wire.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof(_)));
    }

    #[test]
    fn test_overlong_length_prefix_is_an_error() {
        // claims a 1 GiB pubkey in a 10-byte body
        let mut wire = (1u32 << 30).to_le_bytes().to_vec();
        wire.extend_from_slice(b"short!");
        assert_eq!(
            deserialize_messages(&wire),
            Err(CodecError::BadFieldLength(1 << 30))
        );
    }
}
