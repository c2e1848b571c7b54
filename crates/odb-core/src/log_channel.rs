use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{
    domain::{DestinationId, GroupId},
    messaging::{port::ChatPort, types::Destination},
};

/// Per-group cache of the operator log destination.
///
/// Discovery picks the text destination whose name contains the marker (case-insensitive),
/// preferring the shortest name: `bot` wins over `bot-logs`, which wins over `robot-talk`.
/// A miss is not cached, so the next event searches again.
pub struct LogChannelResolver {
    marker: String,
    cache: Mutex<HashMap<GroupId, DestinationId>>,
}

impl LogChannelResolver {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().to_lowercase(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, port: &dyn ChatPort, group: GroupId) -> Option<DestinationId> {
        if let Some(id) = self.cache.lock().await.get(&group).copied() {
            return Some(id);
        }

        let destinations = match port.list_destinations(group).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(group = group.0, error = %e, "log channel discovery failed");
                return None;
            }
        };

        let picked = pick_log_destination(&destinations, &self.marker)?;
        tracing::debug!(group = group.0, destination = picked.id.0, name = %picked.name, "log channel discovered");

        let mut cache = self.cache.lock().await;
        // Another event may have raced us through discovery; keep the first entry.
        Some(*cache.entry(group).or_insert(picked.id))
    }

    /// Forget the cached destination (deleted channel, lost permission).
    pub async fn invalidate(&self, group: GroupId) {
        self.cache.lock().await.remove(&group);
    }

    /// Deliver an operator notice to the group's log destination, or the console sink.
    pub async fn send_log(&self, port: &dyn ChatPort, group: Option<GroupId>, text: &str) {
        let Some(group) = group else {
            tracing::info!("{text}");
            return;
        };

        let Some(dest) = self.resolve(port, group).await else {
            tracing::info!(group = group.0, "(no log channel) {text}");
            return;
        };

        if let Err(e) = port.send_text(dest, text).await {
            tracing::warn!(group = group.0, destination = dest.0, error = %e, "log send failed");
            tracing::info!(group = group.0, "{text}");
            self.invalidate(group).await;
        }
    }
}

fn pick_log_destination<'a>(destinations: &'a [Destination], marker: &str) -> Option<&'a Destination> {
    destinations
        .iter()
        .filter(|d| d.name.to_lowercase().contains(marker))
        // `min_by_key` keeps the first of equal keys, so ties go to listing order.
        .min_by_key(|d| d.name.chars().count())
}
