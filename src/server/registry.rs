//! Live sessions keyed by connection.
//!
//! Every login, status change and logout goes through [`SessionRegistry`].
//! Decisions that read and then write (duplicate logins, answering a help
//! request) run inside a single write-lock section so two connections can
//! never both claim one device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

use super::connection::{ConnId, ConnectionHandle};
use crate::audit::SessionSnapshot;
use crate::error::CommandError;
use crate::model::{
    areas_intersect, Account, AreaId, Device, DeviceKey, DeviceStatus, DeviceType, RoomId, NO_ROOM,
};

pub struct Session {
    pub conn: ConnectionHandle,
    pub account: Account,
    pub device: Device,
    pub transaction_id: String,
}

impl Session {
    /// Glasses are scoped by their own area, tablets by their expert's.
    pub fn effective_area(&self) -> &[AreaId] {
        match self.device.device_type {
            DeviceType::Glasses => &self.device.area,
            DeviceType::Tablet => &self.account.area,
        }
    }
}

#[derive(Debug)]
pub struct BindOutcome {
    /// The device as bound: online and idle.
    pub device: Device,
    /// Another connection that held the device and lost its session.
    pub displaced: Option<ConnectionHandle>,
    /// The device this connection was bound to before, already reset,
    /// together with the area it was visible in.
    pub released: Option<(Device, Vec<AreaId>)>,
}

#[derive(Debug)]
pub struct AnswerOutcome {
    pub responder: Device,
    pub target: Device,
    pub target_conn: ConnId,
    /// Union of both sessions' areas.
    pub areas: Vec<AreaId>,
}

pub struct SessionRegistry {
    pub(super) sessions: RwLock<HashMap<ConnId, Session>>,
    last_room: AtomicI64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            last_room: AtomicI64::new(NO_ROOM),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn is_bound(&self, id: ConnId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Copies of the account and device bound to `id`.
    pub async fn lookup(&self, id: ConnId) -> Option<(Account, Device)> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|s| (s.account.clone(), s.device.clone()))
    }

    pub async fn effective_area(&self, id: ConnId) -> Option<Vec<AreaId>> {
        self.sessions.read().await.get(&id).map(|s| s.effective_area().to_vec())
    }

    /// Which connection currently holds `key`, if any.
    pub async fn holder_of(&self, key: &DeviceKey) -> Option<ConnId> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|(_, s)| s.device.key() == *key)
            .map(|(id, _)| *id)
    }

    /// Binds `conn` to `account` and `device`, resolving duplicate claims:
    ///
    /// * same device already bound here: the session is replaced in place;
    /// * a different device bound here: that device is reset and released;
    /// * the device held by another connection: that session is removed and
    ///   its connection returned as displaced. The requester always wins.
    pub async fn bind(
        &self,
        conn: &ConnectionHandle,
        account: Account,
        mut device: Device,
        transaction_id: String,
    ) -> BindOutcome {
        let key = device.key();
        device.go_online();

        let mut sessions = self.sessions.write().await;

        let released = match sessions.get(&conn.id) {
            Some(existing) if existing.device.key() != key => {
                let mut old = existing.device.clone();
                old.go_offline();
                Some((old, existing.effective_area().to_vec()))
            }
            _ => None,
        };

        let other = sessions
            .iter()
            .find(|(id, s)| **id != conn.id && s.device.key() == key)
            .map(|(id, _)| *id);
        let displaced = other.and_then(|id| sessions.remove(&id)).map(|s| s.conn);

        sessions.insert(
            conn.id,
            Session {
                conn: conn.clone(),
                account,
                device: device.clone(),
                transaction_id,
            },
        );

        BindOutcome {
            device,
            displaced,
            released,
        }
    }

    /// Drops the session for `id`, returning it with its device reset to
    /// offline. `None` when the connection was never bound or was displaced.
    pub async fn remove(&self, id: ConnId) -> Option<Session> {
        let mut session = self.sessions.write().await.remove(&id)?;
        session.device.go_offline();
        Some(session)
    }

    /// Runs `f` against the live device of `id`. `f` must check before it
    /// mutates: an `Err` from it is returned as is.
    pub async fn update_device<F>(
        &self,
        id: ConnId,
        f: F,
    ) -> Result<(Device, Vec<AreaId>), CommandError>
    where
        F: FnOnce(&mut Device) -> Result<(), CommandError>,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(CommandError::NotLoggedIn)?;
        f(&mut session.device)?;
        Ok((session.device.clone(), session.effective_area().to_vec()))
    }

    /// Puts the responder on `id` and the device `target` into one call.
    /// The target must be requesting help; its room is reused when it has one.
    pub async fn answer(
        &self,
        id: ConnId,
        target: &DeviceKey,
    ) -> Result<AnswerOutcome, CommandError> {
        let mut sessions = self.sessions.write().await;

        let responder = sessions.get(&id).ok_or(CommandError::NotLoggedIn)?;
        if !responder.device.is_idle() {
            return Err(CommandError::NotIdle(responder.device.device_status));
        }
        let target_conn = sessions
            .iter()
            .find(|(_, s)| s.device.key() == *target)
            .map(|(cid, _)| *cid)
            .ok_or_else(|| CommandError::DeviceNotFound(target.clone()))?;
        if target_conn == id {
            return Err(CommandError::InvalidField {
                field: "deviceID",
                reason: "cannot answer own device".to_string(),
            });
        }
        let waiting = sessions
            .get(&target_conn)
            .is_some_and(|s| s.device.device_status == DeviceStatus::RequestingHelp);
        if !waiting {
            return Err(CommandError::NotRequestingHelp(target.clone()));
        }

        let mut areas = Vec::new();
        let target_device = {
            let t = sessions
                .get_mut(&target_conn)
                .ok_or_else(|| CommandError::DeviceNotFound(target.clone()))?;
            if t.device.room_id == NO_ROOM {
                t.device.room_id = self.next_room_id();
            }
            t.device.device_status = DeviceStatus::InCall;
            areas.extend_from_slice(t.effective_area());
            t.device.clone()
        };
        let responder_device = {
            let r = sessions.get_mut(&id).ok_or(CommandError::NotLoggedIn)?;
            r.device.device_status = DeviceStatus::InCall;
            r.device.room_id = target_device.room_id;
            for a in r.effective_area() {
                if !areas.contains(a) {
                    areas.push(*a);
                }
            }
            r.device.clone()
        };

        Ok(AnswerOutcome {
            responder: responder_device,
            target: target_device,
            target_conn,
            areas,
        })
    }

    /// Issues a room id never handed out before.
    pub fn next_room_id(&self) -> RoomId {
        self.last_room.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Devices of every live session visible in `areas`, ordered by id.
    pub async fn devices_in_area(&self, areas: &[AreaId]) -> Vec<Device> {
        let sessions = self.sessions.read().await;
        let mut devices: Vec<Device> = sessions
            .values()
            .filter(|s| areas_intersect(s.effective_area(), areas))
            .map(|s| s.device.clone())
            .collect();
        devices.sort_by(|a, b| {
            (&a.device_id, &a.device_brand).cmp(&(&b.device_id, &b.device_brand))
        });
        devices
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(id, s)| SessionSnapshot {
                conn: id.0,
                user_id: s.account.user_id.clone(),
                device: s.device.clone(),
                transaction_id: s.transaction_id.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.conn);
        out
    }
}
