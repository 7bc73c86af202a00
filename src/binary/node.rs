//! Binary XML node type.
//!
//! WhatsApp frames every application-layer unit as a token-compressed
//! binary XML tree. The [`Node`] tree is the sole wire unit above the
//! noise transport.

use crate::types::JID;
use std::collections::HashMap;
use std::fmt;

/// Attributes of a node.
pub type Attrs = HashMap<String, AttrValue>;

/// Possible attribute values.
///
/// Only forms with a distinct wire representation are kept; integers and
/// booleans are carried as strings, which keeps `decode(encode(n)) == n`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    JID(JID),
    Bytes(Vec<u8>),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<u64> for AttrValue {
    fn from(n: u64) -> Self {
        AttrValue::String(n.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::String(if b { "true" } else { "false" }.to_string())
    }
}

impl From<JID> for AttrValue {
    fn from(jid: JID) -> Self {
        AttrValue::JID(jid)
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_jid(&self) -> Option<&JID> {
        match self {
            AttrValue::JID(jid) => Some(jid),
            _ => None,
        }
    }

    /// String rendering used when a caller wants the value regardless of form.
    pub fn to_display_string(&self) -> String {
        match self {
            AttrValue::String(s) => s.clone(),
            AttrValue::JID(jid) => jid.to_string(),
            AttrValue::Bytes(b) => hex::encode(b),
        }
    }
}

/// Node represents one binary XML element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

/// Content of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    None,
    Children(Vec<Node>),
    Bytes(Vec<u8>),
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::None,
        }
    }

    pub fn with_attrs(tag: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            tag: tag.into(),
            attrs,
            content: NodeContent::None,
        }
    }

    pub fn with_children(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Children(children),
        }
    }

    pub fn with_bytes(tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Bytes(bytes),
        }
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(key.into(), value.into());
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn get_attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    pub fn get_attr_jid(&self, key: &str) -> Option<&JID> {
        self.attrs.get(key).and_then(|v| v.as_jid())
    }

    /// Attribute as a parsed JID, accepting both string and compact forms.
    pub fn parse_attr_jid(&self, key: &str) -> Option<JID> {
        match self.attrs.get(key)? {
            AttrValue::JID(jid) => Some(jid.clone()),
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_attr_u64(&self, key: &str) -> Option<u64> {
        self.get_attr_str(key).and_then(|s| s.parse().ok())
    }

    pub fn set_children(&mut self, children: Vec<Node>) {
        self.content = NodeContent::Children(children);
    }

    pub fn add_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Children(children) => children.push(child),
            _ => self.content = NodeContent::Children(vec![child]),
        }
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.content = NodeContent::Bytes(bytes);
    }

    pub fn get_children(&self) -> Option<&[Node]> {
        match &self.content {
            NodeContent::Children(children) => Some(children),
            _ => None,
        }
    }

    pub fn get_children_by_tag(&self, tag: &str) -> Vec<&Node> {
        match &self.content {
            NodeContent::Children(children) => children.iter().filter(|n| n.tag == tag).collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.get_children_by_tag(tag).into_iter().next()
    }

    /// Walks nested tags, returning the innermost match.
    pub fn get_optional_child_by_tag(&self, tags: &[&str]) -> Option<&Node> {
        let mut current = self;
        for tag in tags {
            current = current.get_child_by_tag(tag)?;
        }
        Some(current)
    }

    pub fn get_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        let mut keys: Vec<&String> = self.attrs.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, " {}=\"{}\"", key, self.attrs[key].to_display_string())?;
        }
        match &self.content {
            NodeContent::None => write!(f, "/>"),
            NodeContent::Bytes(b) => write!(f, ">[{} bytes]</{}>", b.len(), self.tag),
            NodeContent::Children(children) => {
                write!(f, ">")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}
