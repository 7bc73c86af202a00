//! WhatsApp JID (Jabber ID) types.
//!
//! JIDs identify users, individual devices, groups, newsletters and
//! broadcast lists. The relay engine classifies every destination by the
//! server part of its JID.

use std::fmt;
use std::str::FromStr;

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
    pub const NEWSLETTER: &str = "newsletter";
    pub const HOSTED: &str = "hosted";
    pub const HOSTED_LID: &str = "hosted.lid";
}

/// Domain type constants
pub const WHATSAPP_DOMAIN: u8 = 0;
pub const LID_DOMAIN: u8 = 1;
pub const HOSTED_DOMAIN: u8 = 128;
pub const HOSTED_LID_DOMAIN: u8 = 129;

/// MessageID is the internal ID of a WhatsApp message.
pub type MessageID = String;

/// How the relay engine treats a destination, derived from the JID server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageServer {
    Individual,
    Lid,
    Group,
    Newsletter,
    Status,
}

/// JID represents a WhatsApp user ID.
///
/// There are two wire forms:
/// - Regular JID pairs (user and server)
/// - AD-JIDs (user, agent and device) addressing a specific device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct JID {
    pub user: String,
    pub raw_agent: u8,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Creates a new AD JID with agent and device.
    pub fn new_ad(user: impl Into<String>, agent: u8, device: u16) -> Self {
        let user = user.into();
        let (server, raw_agent) = match agent {
            LID_DOMAIN => (servers::HIDDEN_USER.to_string(), 0),
            HOSTED_DOMAIN => (servers::HOSTED.to_string(), 0),
            HOSTED_LID_DOMAIN => (servers::HOSTED_LID.to_string(), 0),
            _ => (servers::DEFAULT_USER.to_string(), agent),
        };

        Self {
            user,
            raw_agent,
            device,
            server,
        }
    }

    /// Creates a device JID on the same server as `self`.
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            raw_agent: self.raw_agent,
            device,
        }
    }

    /// Returns the actual agent/domain type.
    pub fn actual_agent(&self) -> u8 {
        match self.server.as_str() {
            servers::DEFAULT_USER => WHATSAPP_DOMAIN,
            servers::HIDDEN_USER => LID_DOMAIN,
            servers::HOSTED => HOSTED_DOMAIN,
            servers::HOSTED_LID => HOSTED_LID_DOMAIN,
            _ => self.raw_agent,
        }
    }

    /// Returns a version of the JID without agent and device.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            ..Default::default()
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == servers::GROUP
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == servers::NEWSLETTER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == servers::BROADCAST && self.user == "status"
    }

    /// Returns true if this is a broadcast list (not status broadcast).
    pub fn is_broadcast_list(&self) -> bool {
        self.server == servers::BROADCAST && self.user != "status"
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Classifies the destination for the relay engine.
    pub fn message_server(&self) -> MessageServer {
        match self.server.as_str() {
            servers::GROUP => MessageServer::Group,
            servers::NEWSLETTER => MessageServer::Newsletter,
            servers::BROADCAST => MessageServer::Status,
            servers::HIDDEN_USER | servers::HOSTED_LID => MessageServer::Lid,
            _ => MessageServer::Individual,
        }
    }

    /// Returns the signal address user part, folding non-default domains
    /// into the name so LID and phone-number sessions never collide.
    pub fn signal_address_user(&self) -> String {
        let agent = self.actual_agent();
        if agent != 0 {
            format!("{}_{}", self.user, agent)
        } else {
            self.user.clone()
        }
    }

    /// Returns true if `other` addresses the same account (ignoring device).
    pub fn same_user_as(&self, other: &JID) -> bool {
        self.user == other.user && self.server == other.server
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_agent > 0 {
            write!(f, "{}.{}:{}@{}", self.user, self.raw_agent, self.device, self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJIDError(pub String);

impl fmt::Display for ParseJIDError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse JID: {}", self.0)
    }
}

impl std::error::Error for ParseJIDError {}

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_str, server) = match s.split_once('@') {
            Some((u, s)) => (u.to_string(), s.to_string()),
            None => return Ok(JID::new("", s)),
        };

        let mut jid = JID {
            user: user_str.clone(),
            server,
            ..Default::default()
        };

        // AD JID format: user.agent:device@server
        if let Some((user, ad)) = user_str.split_once('.') {
            jid.user = user.to_string();
            let (agent, device) = match ad.split_once(':') {
                Some((a, d)) => (a, Some(d)),
                None => (ad, None),
            };
            jid.raw_agent = agent
                .parse()
                .map_err(|_| ParseJIDError("failed to parse agent from JID".to_string()))?;
            if let Some(d) = device {
                jid.device = d
                    .parse()
                    .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
            }
        } else if let Some((user, device)) = user_str.split_once(':') {
            jid.user = user.to_string();
            jid.device = device
                .parse()
                .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
        }

        Ok(jid)
    }
}

// Common JIDs
lazy_static::lazy_static! {
    pub static ref EMPTY_JID: JID = JID::default();
    pub static ref SERVER_JID: JID = JID::new("", servers::DEFAULT_USER);
    pub static ref GROUP_SERVER_JID: JID = JID::new("", servers::GROUP);
    pub static ref BROADCAST_SERVER_JID: JID = JID::new("", servers::BROADCAST);
    pub static ref STATUS_BROADCAST_JID: JID = JID::new("status", servers::BROADCAST);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_jid() {
        let jid: JID = "14155550000@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "14155550000");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert_eq!(jid.raw_agent, 0);
    }

    #[test]
    fn test_parse_device_jid() {
        let jid: JID = "14155550000:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "14155550000");
        assert_eq!(jid.device, 2);
    }

    #[test]
    fn test_parse_ad_jid() {
        let jid: JID = "14155550000.0:1@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "14155550000");
        assert_eq!(jid.raw_agent, 0);
        assert_eq!(jid.device, 1);
    }

    #[test]
    fn test_roundtrip_display_parse() {
        for s in [
            "14155550000@s.whatsapp.net",
            "14155550000:12@s.whatsapp.net",
            "123456789-987654@g.us",
            "9876543@lid",
            "120363001234@newsletter",
            "status@broadcast",
        ] {
            let jid: JID = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn test_message_server_classification() {
        let group: JID = "1234-5678@g.us".parse().unwrap();
        assert_eq!(group.message_server(), MessageServer::Group);

        let news: JID = "120363001234@newsletter".parse().unwrap();
        assert_eq!(news.message_server(), MessageServer::Newsletter);

        let status: JID = "status@broadcast".parse().unwrap();
        assert_eq!(status.message_server(), MessageServer::Status);

        let lid: JID = "987654@lid".parse().unwrap();
        assert_eq!(lid.message_server(), MessageServer::Lid);

        let user: JID = "14155550000@s.whatsapp.net".parse().unwrap();
        assert_eq!(user.message_server(), MessageServer::Individual);
    }

    #[test]
    fn test_signal_address_user_for_lid() {
        let lid: JID = "987654@lid".parse().unwrap();
        assert_eq!(lid.signal_address_user(), "987654_1");

        let user: JID = "14155550000@s.whatsapp.net".parse().unwrap();
        assert_eq!(user.signal_address_user(), "14155550000");
    }
}
