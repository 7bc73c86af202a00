//! Binary decoder for the token-compressed XML format.
//!
//! Total over well-formed input; anything else fails with a
//! [`DecodeError`] which surfaces as `MalformedFrame` at the API boundary.

use super::encoder::{
    BINARY_16, BINARY_24, BINARY_8, JID_AD, JID_PAIR, LIST_16, LIST_8, RAW_BYTES,
};
use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::token::{double_token, single_token, DICT_VERSION_0, DICT_VERSION_3};
use crate::types::JID;
use thiserror::Error;

/// Error type for decoding.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("{0} leftover bytes after decoding")]
    LeftoverBytes(usize),
    #[error("invalid utf8 in string: {0}")]
    InvalidUtf8(String),
    #[error("unknown token 0x{0:02x}")]
    UnknownToken(u8),
    #[error("unknown double token dict={0} index={1}")]
    UnknownDoubleToken(u8, u8),
    #[error("expected list marker, got 0x{0:02x}")]
    ExpectedList(u8),
    #[error("invalid node list size {0}")]
    InvalidNodeSize(usize),
    #[error("invalid length marker 0x{0:02x}")]
    InvalidLength(u8),
    #[error("invalid JID marker 0x{0:02x}")]
    InvalidJid(u8),
}

/// Binary decoder over a byte slice.
pub struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    /// Decode one node, requiring the input to be fully consumed.
    pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
        let mut decoder = Decoder::new(data);
        let node = decoder.read_node()?;

        if decoder.index != decoder.data.len() {
            return Err(DecodeError::LeftoverBytes(decoder.data.len() - decoder.index));
        }

        Ok(node)
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        if self.index >= self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let b = self.data[self.index];
        self.index += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        if self.index + n > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let bytes = self.data[self.index..self.index + n].to_vec();
        self.index += n;
        Ok(bytes)
    }

    fn read_int(&mut self, bytes: usize) -> Result<usize, DecodeError> {
        let mut result = 0usize;
        for _ in 0..bytes {
            result = (result << 8) | (self.read_byte()? as usize);
        }
        Ok(result)
    }

    /// Length of a binary literal given its marker.
    fn read_binary_len(&mut self, marker: u8) -> Result<usize, DecodeError> {
        match marker {
            BINARY_8 => Ok(self.read_byte()? as usize),
            BINARY_16 => self.read_int(2),
            BINARY_24 => self.read_int(3),
            other => Err(DecodeError::InvalidLength(other)),
        }
    }

    fn read_string(&mut self, marker: u8) -> Result<String, DecodeError> {
        match marker {
            0x00 => Ok(String::new()),
            BINARY_8 | BINARY_16 | BINARY_24 => {
                let len = self.read_binary_len(marker)?;
                let bytes = self.read_bytes(len)?;
                String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
            }
            DICT_VERSION_0..=DICT_VERSION_3 => {
                let dict = marker - DICT_VERSION_0;
                let index = self.read_byte()?;
                double_token(dict, index)
                    .map(str::to_string)
                    .ok_or(DecodeError::UnknownDoubleToken(dict, index))
            }
            token => single_token(token)
                .map(str::to_string)
                .ok_or(DecodeError::UnknownToken(token)),
        }
    }

    fn read_jid(&mut self, marker: u8) -> Result<JID, DecodeError> {
        match marker {
            JID_PAIR => {
                let user_marker = self.read_byte()?;
                let user = self.read_string(user_marker)?;
                let server_marker = self.read_byte()?;
                let server = self.read_string(server_marker)?;
                Ok(JID::new(user, server))
            }
            JID_AD => {
                let agent = self.read_byte()?;
                let device = self.read_byte()?;
                let user_marker = self.read_byte()?;
                let user = self.read_string(user_marker)?;
                Ok(JID::new_ad(user, agent, device as u16))
            }
            other => Err(DecodeError::InvalidJid(other)),
        }
    }

    fn read_attr_value(&mut self) -> Result<AttrValue, DecodeError> {
        let marker = self.read_byte()?;
        match marker {
            JID_PAIR | JID_AD => Ok(AttrValue::JID(self.read_jid(marker)?)),
            RAW_BYTES => {
                let len_marker = self.read_byte()?;
                let len = self.read_binary_len(len_marker)?;
                Ok(AttrValue::Bytes(self.read_bytes(len)?))
            }
            _ => Ok(AttrValue::String(self.read_string(marker)?)),
        }
    }

    fn read_list_size(&mut self, marker: u8) -> Result<usize, DecodeError> {
        match marker {
            0x00 => Ok(0),
            LIST_8 => Ok(self.read_byte()? as usize),
            LIST_16 => self.read_int(2),
            other => Err(DecodeError::ExpectedList(other)),
        }
    }

    fn read_node(&mut self) -> Result<Node, DecodeError> {
        let marker = self.read_byte()?;
        let size = self.read_list_size(marker)?;
        if size == 0 {
            return Err(DecodeError::InvalidNodeSize(0));
        }

        let tag_marker = self.read_byte()?;
        let tag = self.read_string(tag_marker)?;

        let num_attrs = (size - 1) / 2;
        let mut attrs = Attrs::with_capacity(num_attrs);
        for _ in 0..num_attrs {
            let key_marker = self.read_byte()?;
            let key = self.read_string(key_marker)?;
            let value = self.read_attr_value()?;
            attrs.insert(key, value);
        }

        // An odd remainder after the attribute pairs is the content element.
        let content = if (size - 1) % 2 == 1 {
            let content_marker = self.read_byte()?;
            match content_marker {
                LIST_8 | LIST_16 | 0x00 => {
                    let len = self.read_list_size(content_marker)?;
                    let mut children = Vec::with_capacity(len);
                    for _ in 0..len {
                        children.push(self.read_node()?);
                    }
                    NodeContent::Children(children)
                }
                BINARY_8 | BINARY_16 | BINARY_24 => {
                    let len = self.read_binary_len(content_marker)?;
                    NodeContent::Bytes(self.read_bytes(len)?)
                }
                other => {
                    // Token-string content is carried as bytes.
                    let s = self.read_string(other)?;
                    NodeContent::Bytes(s.into_bytes())
                }
            }
        } else {
            NodeContent::None
        };

        Ok(Node { tag, attrs, content })
    }
}

/// Decode binary data into a node.
pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
    Decoder::decode(data)
}
