//! Binary XML encoding/decoding for the WhatsApp protocol.
//!
//! Stanzas travel as token-compressed binary trees. A one-byte flag ahead
//! of the tree marks optional zlib compression of the remainder.

pub mod decoder;
pub mod encoder;
pub mod node;
pub mod token;

pub use decoder::{decode, DecodeError};
pub use encoder::encode;
pub use node::{AttrValue, Attrs, Node, NodeContent};

use crate::error::{Result, WireError};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Flag bit in the leading byte marking a zlib-compressed payload.
const FLAG_COMPRESSED: u8 = 0x02;

/// Serialize a node for the wire: flag byte plus encoded tree.
///
/// Outbound stanzas are sent uncompressed; the flag byte stays zero.
pub fn marshal(node: &Node) -> Vec<u8> {
    let encoded = encode(node);
    let mut out = Vec::with_capacity(encoded.len() + 1);
    out.push(0);
    out.extend_from_slice(&encoded);
    out
}

/// Strip the flag byte, inflating the remainder when it is compressed.
pub fn unpack(data: &[u8]) -> Result<Vec<u8>> {
    let (&flag, rest) = data
        .split_first()
        .ok_or_else(|| WireError::MalformedFrame("empty frame".to_string()))?;

    if flag & FLAG_COMPRESSED != 0 {
        let mut inflated = Vec::with_capacity(rest.len() * 4);
        ZlibDecoder::new(rest)
            .read_to_end(&mut inflated)
            .map_err(|e| WireError::MalformedFrame(format!("zlib inflate: {e}")))?;
        Ok(inflated)
    } else {
        Ok(rest.to_vec())
    }
}

/// Deserialize a framed stanza payload into a node tree.
pub fn unmarshal(data: &[u8]) -> Result<Node> {
    let raw = unpack(data)?;
    decode(&raw).map_err(|e| WireError::MalformedFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let mut node = Node::new("iq");
        node.set_attr("id", "123.4-1");
        node.set_attr("type", "get");
        node.set_attr("xmlns", "usync");

        let bytes = marshal(&node);
        assert_eq!(bytes[0], 0);
        let back = unmarshal(&bytes).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_unpack_compressed_frame() {
        let node = Node::with_bytes("plaintext", b"hello hello hello hello".to_vec());
        let encoded = encode(&node);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&encoded).unwrap();
        let mut framed = vec![FLAG_COMPRESSED];
        framed.extend_from_slice(&encoder.finish().unwrap());

        let back = unmarshal(&framed).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_unmarshal_empty_is_malformed() {
        assert!(matches!(unmarshal(&[]), Err(WireError::MalformedFrame(_))));
    }
}
