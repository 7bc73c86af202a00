//! Signal protocol addresses.

use crate::types::JID;
use std::fmt;

/// Address of one device in the signal layer: `name.device`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalAddress {
    name: String,
    device_id: u32,
}

impl SignalAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for SignalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Deterministic mapping from a JID to its signal address.
///
/// A bare JID maps to device 0; non-default domains are folded into the
/// name so phone-number and LID sessions stay disjoint.
pub fn jid_to_signal_address(jid: &JID) -> SignalAddress {
    SignalAddress::new(jid.signal_address_user(), jid.device as u32)
}
