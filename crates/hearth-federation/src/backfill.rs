//! Backfill over federation: fetch unknown prev events from servers in the
//! room, verifying each returned event the way ingress does.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use hearth_common::Event;
use hearth_rooms::BackfillHook;
use tracing::{debug, warn};

use crate::{client::Transport, ingress::check_pdu, keyring::KeyLookup, types::MissingEventsRequest};

pub struct FederationBackfill {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyLookup>,
    /// Upper bound on events requested per call.
    limit: usize,
}

impl FederationBackfill {
    pub fn new(transport: Arc<dyn Transport>, keys: Arc<dyn KeyLookup>, limit: usize) -> Self {
        Self { transport, keys, limit: limit.max(1) }
    }
}

#[async_trait]
impl BackfillHook for FederationBackfill {
    async fn fetch_missing_events(
        &self,
        room_id: &str,
        event_ids: &[String],
        servers: &[String],
    ) -> anyhow::Result<Vec<Event>> {
        let request = MissingEventsRequest {
            earliest_events: Vec::new(),
            latest_events: event_ids.to_vec(),
            limit: self.limit.max(event_ids.len()),
        };

        for server in servers {
            let response = match self.transport.get_missing_events(server, room_id, &request).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(room_id = %room_id, server = %server, error = %e, "Server could not backfill");
                    continue;
                }
            };

            let mut events = Vec::with_capacity(response.events.len());
            for pdu in response.events {
                match check_pdu(self.keys.as_ref(), pdu).await {
                    Ok(event) if event.room_id == room_id => events.push(event),
                    Ok(event) => warn!(server = %server, event_id = %event.event_id, "Backfilled event from another room"),
                    Err(e) => warn!(server = %server, error = %e, "Backfilled event failed verification"),
                }
            }
            if events.iter().any(|ev| event_ids.contains(&ev.event_id)) {
                debug!(room_id = %room_id, server = %server, count = events.len(), "Backfilled events");
                return Ok(events);
            }
        }
        Err(anyhow!("no server could supply {} missing event(s) in {}", event_ids.len(), room_id))
    }
}
