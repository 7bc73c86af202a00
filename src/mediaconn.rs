//! Media connection info: hosts and auth token for the media endpoints.
//!
//! Fetched with `iq set xmlns=w:m`, cached until the server-provided TTL
//! elapses or a refresh is forced.

use log::debug;
use std::time::{Duration, Instant};

use crate::binary::{Node, NodeContent};
use crate::client::Client;
use crate::error::{Result, WireError};
use crate::request::{InfoQuery, InfoQueryType};

/// One media host entry.
#[derive(Debug, Clone)]
pub struct MediaHost {
    pub hostname: String,
    pub max_content_length_bytes: u64,
}

/// Cached media connection parameters.
#[derive(Debug, Clone)]
pub struct MediaConnInfo {
    pub hosts: Vec<MediaHost>,
    pub auth: String,
    pub ttl: Duration,
    pub fetch_date: Instant,
}

impl MediaConnInfo {
    pub fn is_expired(&self) -> bool {
        self.fetch_date.elapsed() > self.ttl
    }
}

/// Parse the `media_conn` child of the response.
pub(crate) fn parse_media_conn(response: &Node) -> Result<MediaConnInfo> {
    let conn = response
        .get_child_by_tag("media_conn")
        .ok_or_else(|| WireError::MalformedFrame("missing media_conn".to_string()))?;

    let hosts = conn
        .get_children_by_tag("host")
        .iter()
        .filter_map(|host| {
            Some(MediaHost {
                hostname: host.get_attr_str("hostname")?.to_string(),
                max_content_length_bytes: host.get_attr_u64("maxContentLengthBytes").unwrap_or(0),
            })
        })
        .collect();

    Ok(MediaConnInfo {
        hosts,
        auth: conn.get_attr_str("auth").unwrap_or_default().to_string(),
        ttl: Duration::from_secs(conn.get_attr_u64("ttl").unwrap_or(300)),
        fetch_date: Instant::now(),
    })
}

impl Client {
    /// Current media connection info, refreshed when stale or forced.
    pub async fn refresh_media_conn(&self, force: bool) -> Result<MediaConnInfo> {
        {
            let cached = self.media_conn.lock().await;
            if let Some(info) = cached.as_ref() {
                if !force && !info.is_expired() {
                    return Ok(info.clone());
                }
            }
        }

        debug!(target: "Client/MediaConn", "refreshing media connection info");
        let response = self
            .send_iq(InfoQuery {
                namespace: "w:m",
                query_type: InfoQueryType::Set,
                to: crate::types::jid::SERVER_JID.clone(),
                target: None,
                id: None,
                content: Some(NodeContent::Children(vec![Node::new("media_conn")])),
                timeout: None,
            })
            .await?;

        let info = parse_media_conn(&response)?;
        *self.media_conn.lock().await = Some(info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::*;
    use crate::client::SocketConfig;

    fn media_conn_response(id: &str, ttl: u64) -> Node {
        let mut conn = Node::new("media_conn").attr("auth", "token-abc").attr("ttl", ttl);
        conn.add_child(
            Node::new("host")
                .attr("hostname", "mmg.whatsapp.net")
                .attr("maxContentLengthBytes", 100_000_000u64),
        );
        conn.add_child(Node::new("host").attr("hostname", "mmg-fallback.whatsapp.net"));
        let mut iq = Node::new("iq").attr("id", id).attr("type", "result");
        iq.add_child(conn);
        iq
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.refresh_media_conn(false).await })
        };

        let request = outbound.recv().await.unwrap();
        assert_eq!(request.get_attr_str("xmlns"), Some("w:m"));
        assert_eq!(request.get_attr_str("type"), Some("set"));
        let id = request.get_attr_str("id").unwrap().to_string();
        client.process_node(media_conn_response(&id, 300)).await;

        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.auth, "token-abc");
        assert_eq!(info.hosts.len(), 2);
        assert_eq!(info.hosts[0].hostname, "mmg.whatsapp.net");
        assert_eq!(info.hosts[0].max_content_length_bytes, 100_000_000);

        // second call without force is served from cache: no new IQ
        let again = client.refresh_media_conn(false).await.unwrap();
        assert_eq!(again.auth, "token-abc");
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_refresh_requeries() {
        let (client, mut outbound) =
            connected_client(SocketConfig::default(), registered_creds("14155550000", 1)).await;

        *client.media_conn.lock().await = Some(MediaConnInfo {
            hosts: Vec::new(),
            auth: "stale".to_string(),
            ttl: Duration::from_secs(600),
            fetch_date: Instant::now(),
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.refresh_media_conn(true).await })
        };

        let request = outbound.recv().await.unwrap();
        let id = request.get_attr_str("id").unwrap().to_string();
        client.process_node(media_conn_response(&id, 60)).await;

        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.auth, "token-abc");
    }
}
