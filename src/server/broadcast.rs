//! Area- and room-scoped fan-out over the live sessions.
//!
//! Both scans are linear in the number of sessions and run under the
//! registry's read lock. Sends never wait: a connection whose queue is full
//! is closed by its handle and torn down by its own pumps.

use tracing::{debug, warn};

use super::connection::ConnId;
use super::registry::SessionRegistry;
use crate::model::{areas_intersect, AreaId, RoomId, NO_ROOM};
use crate::protocol::{Notice, Outbound};

impl SessionRegistry {
    /// Sends `frame` to every session whose effective area meets `areas`,
    /// except `exclude`. Returns the number of connections reached.
    pub async fn broadcast_by_area(
        &self,
        areas: &[AreaId],
        frame: &str,
        exclude: Option<ConnId>,
    ) -> usize {
        let sessions = self.sessions.read().await;
        let mut sent = 0;
        for (id, session) in sessions.iter() {
            if Some(*id) == exclude {
                continue;
            }
            let effective = session.effective_area();
            if effective.is_empty() {
                let user_id = &session.account.user_id;
                debug!(conn = %id, %user_id, "session has no area, skipped");
                continue;
            }
            if !areas_intersect(effective, areas) {
                continue;
            }
            match session.conn.send(frame.to_string()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(conn = %id, error = %e, "area broadcast not delivered"),
            }
        }
        sent
    }

    /// Sends `frame` to every session in `room`, except `exclude`. Room 0 is
    /// "no room" and never matches.
    pub async fn broadcast_by_room(
        &self,
        room: RoomId,
        frame: &str,
        exclude: Option<ConnId>,
    ) -> usize {
        if room == NO_ROOM {
            return 0;
        }
        let sessions = self.sessions.read().await;
        let mut sent = 0;
        for (id, session) in sessions.iter() {
            if Some(*id) == exclude || session.device.room_id != room {
                continue;
            }
            match session.conn.send(frame.to_string()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(conn = %id, error = %e, "room broadcast not delivered"),
            }
        }
        sent
    }

    /// Pushes the current device list of `areas` to everyone in them.
    pub async fn announce_area(&self, areas: &[AreaId], exclude: Option<ConnId>) -> usize {
        if areas.is_empty() {
            return 0;
        }
        let devices = self.devices_in_area(areas).await;
        match Outbound::notice(Notice::DeviceListChanged).with_devices(devices).encode() {
            Ok(frame) => self.broadcast_by_area(areas, &frame, exclude).await,
            Err(e) => {
                warn!(error = %e, "encoding device list failed");
                0
            }
        }
    }
}
