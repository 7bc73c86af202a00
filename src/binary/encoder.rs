//! Binary encoder for the token-compressed XML format.
//!
//! A node is framed as a list: tag, attribute key/value pairs, then an
//! optional content element. Encoding is deterministic: attributes are
//! written in sorted key order, so the same tree always yields the same
//! bytes.

use super::node::{AttrValue, Node, NodeContent};
use super::token::{index_of_double, index_of_single, DICT_VERSION_0};
use crate::types::JID;

// Wire markers, shared with the decoder.
pub(super) const LIST_EMPTY: u8 = 0x00;
pub(super) const DICT_0: u8 = DICT_VERSION_0;
pub(super) const LIST_8: u8 = 0xF8;
pub(super) const LIST_16: u8 = 0xF9;
pub(super) const JID_PAIR: u8 = 0xF9;
pub(super) const JID_AD: u8 = 0xFA;
pub(super) const BINARY_8: u8 = 0xFC;
pub(super) const BINARY_16: u8 = 0xFD;
pub(super) const BINARY_24: u8 = 0xFE;
pub(super) const RAW_BYTES: u8 = 0xFF;

/// Binary encoder for XML nodes.
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { data: Vec::with_capacity(256) }
    }

    /// Encode a node and return the binary data.
    pub fn encode(node: &Node) -> Vec<u8> {
        let mut encoder = Self::new();
        encoder.write_node(node);
        encoder.data
    }

    fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn write_list_size(&mut self, size: usize) {
        if size == 0 {
            self.write_byte(LIST_EMPTY);
        } else if size < 256 {
            self.write_byte(LIST_8);
            self.write_byte(size as u8);
        } else {
            self.write_byte(LIST_16);
            self.write_byte((size >> 8) as u8);
            self.write_byte(size as u8);
        }
    }

    /// Length-prefixed raw data in the shortest form that fits.
    fn write_binary(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.write_byte(BINARY_8);
            self.write_byte(len as u8);
        } else if len < 65536 {
            self.write_byte(BINARY_16);
            self.write_byte((len >> 8) as u8);
            self.write_byte(len as u8);
        } else {
            self.write_byte(BINARY_24);
            self.write_byte((len >> 16) as u8);
            self.write_byte((len >> 8) as u8);
            self.write_byte(len as u8);
        }
        self.write_bytes(bytes);
    }

    /// A string is a dictionary token when possible, a literal otherwise.
    fn write_string(&mut self, s: &str) {
        if let Some(token) = index_of_single(s) {
            self.write_byte(token);
        } else if let Some((dict, index)) = index_of_double(s) {
            self.write_byte(DICT_0 + dict);
            self.write_byte(index);
        } else {
            self.write_binary(s.as_bytes());
        }
    }

    fn write_jid(&mut self, jid: &JID) {
        let agent = if jid.raw_agent > 0 { jid.raw_agent } else { jid.actual_agent() };
        if agent > 0 || jid.device > 0 {
            self.write_byte(JID_AD);
            self.write_byte(agent);
            self.write_byte(jid.device as u8);
            self.write_string(&jid.user);
        } else {
            self.write_byte(JID_PAIR);
            self.write_string(&jid.user);
            self.write_string(&jid.server);
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::JID(jid) => self.write_jid(jid),
            AttrValue::Bytes(b) => {
                self.write_byte(RAW_BYTES);
                self.write_binary(b);
            }
        }
    }

    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, NodeContent::None);
        let size = 1 + 2 * node.attrs.len() + usize::from(has_content);
        self.write_list_size(size);

        self.write_string(&node.tag);

        let mut keys: Vec<&String> = node.attrs.keys().collect();
        keys.sort();
        for key in keys {
            self.write_string(key);
            self.write_attr_value(&node.attrs[key]);
        }

        match &node.content {
            NodeContent::None => {}
            NodeContent::Children(children) => {
                self.write_list_size(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
            NodeContent::Bytes(bytes) => {
                self.write_binary(bytes);
            }
        }
    }
}

/// Encode a node to binary format.
pub fn encode(node: &Node) -> Vec<u8> {
    Encoder::encode(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_deterministic() {
        let mut a = Node::new("message");
        a.set_attr("id", "ABC");
        a.set_attr("type", "text");
        a.set_attr("to", "x@s.whatsapp.net");

        let mut b = Node::new("message");
        b.set_attr("to", "x@s.whatsapp.net");
        b.set_attr("type", "text");
        b.set_attr("id", "ABC");

        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_tokenised_tag_is_one_byte_header() {
        let node = Node::new("message");
        let encoded = encode(&node);
        // list of one element, then the single-byte token for "message"
        assert_eq!(encoded, vec![LIST_8, 1, 19]);
    }

    #[test]
    fn test_literal_string_is_length_prefixed() {
        let node = Node::new("zzz-custom");
        let encoded = encode(&node);
        assert_eq!(&encoded[..4], &[LIST_8, 1, BINARY_8, 10]);
        assert_eq!(&encoded[4..], b"zzz-custom");
    }
}
