//! USync device discovery with a per-user TTL cache.
//!
//! Given a set of users, the server returns their current device lists.
//! Results are cached for five minutes per bare user; a call with
//! `use_cache = false` bypasses and refreshes.

use log::debug;
use std::time::{Duration, Instant};

use crate::binary::{Node, NodeContent};
use crate::client::{CachedDevices, Client};
use crate::error::Result;
use crate::request::{InfoQuery, InfoQueryType};
use crate::types::JID;

/// Device-list cache lifetime.
pub const USYNC_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Pull `(user, device)` pairs out of a usync response.
///
/// Filter rules: zero devices are dropped when `ignore_zero` is set, the
/// calling account's own device is always dropped, and a non-zero device
/// only counts when its descriptor carries a non-empty `key-index`.
pub fn extract_device_jids(response: &Node, own: &JID, ignore_zero: bool) -> Vec<JID> {
    let Some(list) = response.get_optional_child_by_tag(&["usync", "list"]) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for user_node in list.get_children_by_tag("user") {
        let Some(user_jid) = user_node.parse_attr_jid("jid") else {
            continue;
        };
        let Some(device_list) = user_node.get_optional_child_by_tag(&["devices", "device-list"])
        else {
            continue;
        };

        for device_node in device_list.get_children_by_tag("device") {
            let Some(device) = device_node.get_attr_u64("id").map(|d| d as u16) else {
                continue;
            };
            if device == 0 && ignore_zero {
                continue;
            }
            if user_jid.user == own.user && device == own.device {
                continue;
            }
            if device != 0 {
                let key_index = device_node.get_attr_str("key-index").unwrap_or("");
                if key_index.is_empty() {
                    continue;
                }
            }
            out.push(user_jid.with_device(device));
        }
    }
    out
}

impl Client {
    /// Resolve the device lists for `jids`, merging cached users with one
    /// batched usync query for the rest.
    pub async fn get_usync_devices(
        &self,
        jids: &[JID],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<JID>> {
        let (own, _) = self.own_identity().await?;

        // uniqueify by bare user, preserving order
        let mut users: Vec<JID> = Vec::new();
        for jid in jids {
            let bare = jid.to_non_ad();
            if !users.iter().any(|u| u.user == bare.user) {
                users.push(bare);
            }
        }

        let mut devices = Vec::new();
        let mut to_fetch = Vec::new();
        {
            let cache = self.user_devices_cache.lock().expect("devices cache lock");
            for user in &users {
                match cache.get(&user.user) {
                    Some(entry) if use_cache && entry.fetched.elapsed() < USYNC_CACHE_TTL => {
                        devices.extend(entry.devices.iter().cloned());
                    }
                    _ => to_fetch.push(user.clone()),
                }
            }
        }

        if !to_fetch.is_empty() {
            debug!(target: "Client/USync", "querying devices for {} users", to_fetch.len());
            let fetched = self.query_usync_devices(&to_fetch, &own).await?;

            let mut cache = self.user_devices_cache.lock().expect("devices cache lock");
            for user in &to_fetch {
                let for_user: Vec<JID> = fetched
                    .iter()
                    .filter(|d| d.user == user.user)
                    .cloned()
                    .collect();
                devices.extend(for_user.iter().cloned());
                cache.insert(
                    user.user.clone(),
                    CachedDevices {
                        fetched: Instant::now(),
                        devices: for_user,
                    },
                );
            }
        }

        if ignore_zero_devices {
            devices.retain(|d| d.device != 0);
        }
        Ok(devices)
    }

    /// One `iq/usync` round trip for the given users.
    async fn query_usync_devices(&self, users: &[JID], own: &JID) -> Result<Vec<JID>> {
        let user_nodes = users
            .iter()
            .map(|user| Node::new("user").attr("jid", user.to_non_ad().to_string()))
            .collect();

        let usync = Node::new("usync")
            .attr("sid", self.generate_request_id())
            .attr("mode", "query")
            .attr("last", "true")
            .attr("index", "0")
            .attr("context", "message");
        let mut usync = usync;
        usync.set_children(vec![
            Node::with_children(
                "query",
                vec![Node::new("devices").attr("version", "2")],
            ),
            Node::with_children("list", user_nodes),
        ]);

        let response = self
            .send_iq(InfoQuery {
                namespace: "usync",
                query_type: InfoQueryType::Get,
                to: crate::types::jid::SERVER_JID.clone(),
                target: None,
                id: None,
                content: Some(NodeContent::Children(vec![usync])),
                timeout: None,
            })
            .await?;

        Ok(extract_device_jids(&response, own, false))
    }
}
