//! Per-connection command handling.
//!
//! Each text frame is decoded, checked for the fields its command needs,
//! gated on login, and executed. Exactly one response goes back for every
//! frame, and every outcome lands in the audit log together with the trail
//! of checks that led to it.

use chrono::{Duration, Utc};
use tracing::{debug, error, info};

use super::connection::{ConnId, ConnectionHandle};
use super::Server;
use crate::audit::AuditRecord;
use crate::auth::{generate_code, verify_secret, Secret};
use crate::error::CommandError;
use crate::model::{
    Account, AreaId, Device, DeviceKey, DeviceStatus, DeviceType, MediaStatus, RoomId, NO_ROOM,
};
use crate::protocol::{
    Command, Envelope, Notice, Outbound, HEADER_FIELDS, REQUEST, RESULT_FAIL, RESULT_OK,
};

/// What a command checked and decided, in order. Sent back on failure and
/// always written to the audit log.
#[derive(Debug, Default)]
pub struct Trail(Vec<String>);

impl Trail {
    pub fn note(&mut self, step: impl Into<String>) {
        self.0.push(step.into());
    }

    pub fn render(&self) -> String {
        self.0.join("; ")
    }

    fn failure(&self, err: &CommandError) -> String {
        if self.0.is_empty() {
            err.to_string()
        } else {
            format!("{} ({})", err, self.render())
        }
    }
}

/// Side effects that run once the response is queued.
#[derive(Debug)]
enum After {
    Announce {
        areas: Vec<AreaId>,
        exclude: Option<ConnId>,
    },
    Room {
        room: RoomId,
        message: Outbound,
        exclude: ConnId,
    },
    Disconnect(ConnId),
}

#[derive(Debug)]
struct Reply {
    out: Outbound,
    after: Vec<After>,
}

impl Reply {
    fn new(out: Outbound) -> Self {
        Self {
            out,
            after: Vec::new(),
        }
    }

    fn then(mut self, action: After) -> Self {
        self.after.push(action);
        self
    }
}

fn field(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or_default()
}

fn media(field: &'static str, v: Option<u8>) -> Result<MediaStatus, CommandError> {
    MediaStatus::try_from(v.unwrap_or_default())
        .map_err(|reason| CommandError::InvalidField { field, reason })
}

impl Server {
    /// Handles one inbound text frame. Returns whether it decoded into a
    /// well-formed request, which is what keeps the idle watchdog at bay.
    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) -> bool {
        let env = match Envelope::decode(text) {
            Ok(env) => env,
            Err(e) => {
                let caller = self.registry.lookup(conn.id).await;
                let err = CommandError::Decode(e.to_string());
                self.finish(conn, 0, "", Err(err), Trail::default(), caller)
                    .await;
                return false;
            }
        };

        let code = env.command.unwrap_or_default();
        let tx = env.transaction_id();
        let caller = self.registry.lookup(conn.id).await;

        let missing = env.missing(&HEADER_FIELDS);
        if !missing.is_empty() {
            let err = CommandError::MissingFields(missing);
            self.finish(conn, code, tx, Err(err), Trail::default(), caller)
                .await;
            return false;
        }
        let command_type = env.command_type.unwrap_or_default();
        if command_type != REQUEST {
            let err = CommandError::NotARequest(command_type);
            self.finish(conn, code, tx, Err(err), Trail::default(), caller)
                .await;
            return false;
        }

        let mut trail = Trail::default();
        let result = self.execute(conn, code, &env, &mut trail).await;
        self.finish(conn, code, tx, result, trail, caller).await;
        true
    }

    pub(super) async fn reject_binary(&self, conn: &ConnectionHandle) {
        let caller = self.registry.lookup(conn.id).await;
        let err = CommandError::Unsupported;
        self.finish(conn, 0, "", Err(err), Trail::default(), caller)
            .await;
    }

    async fn execute(
        &self,
        conn: &ConnectionHandle,
        code: i32,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let command = Command::from_code(code).ok_or(CommandError::UnknownCommand(code))?;

        let missing = env.missing(command.required_fields());
        if !missing.is_empty() {
            return Err(CommandError::MissingFields(missing));
        }
        if !command.allowed_anonymous() && !self.registry.is_bound(conn.id).await {
            return Err(CommandError::NotLoggedIn);
        }

        match command {
            Command::Login => self.login(conn, env, trail).await,
            Command::GetDeviceList => self.get_device_list(conn, env).await,
            Command::GetRoomId => Ok(self.get_room_id(env)),
            Command::Help => self.help(conn, env, trail).await,
            Command::AnswerHelp => self.answer_help(conn, env, trail).await,
            Command::CameraMicToggle => self.camera_mic_toggle(conn, env, trail).await,
            Command::Hangup => self.hangup(conn, env).await,
            Command::Logout => self.logout(conn, env).await,
            Command::Heartbeat => Ok(Reply::new(Outbound::success(
                code,
                env.transaction_id(),
                "alive",
            ))),
            Command::SendVerificationCode => self.send_verification_code(env, trail).await,
        }
    }

    async fn finish(
        &self,
        conn: &ConnectionHandle,
        code: i32,
        transaction_id: &str,
        result: Result<Reply, CommandError>,
        mut trail: Trail,
        caller: Option<(Account, Device)>,
    ) {
        let (reply, result_code) = match result {
            Ok(reply) => (reply, RESULT_OK),
            Err(err) => {
                let text = trail.failure(&err);
                trail.note(format!("failed: {err}"));
                let out = Outbound::failure(code, transaction_id, text);
                (Reply::new(out), RESULT_FAIL)
            }
        };

        if let Err(e) = conn.send_message(&reply.out) {
            debug!(conn = %conn.id, error = %e, "response not queued");
        }

        for action in reply.after {
            match action {
                After::Announce { areas, exclude } => {
                    let n = self.registry.announce_area(&areas, exclude).await;
                    trail.note(format!("area {areas:?} notified ({n})"));
                }
                After::Room {
                    room,
                    message,
                    exclude,
                } => match message.encode() {
                    Ok(frame) => {
                        let n = self
                            .registry
                            .broadcast_by_room(room, &frame, Some(exclude))
                            .await;
                        trail.note(format!("room {room} notified ({n})"));
                    }
                    Err(e) => error!(error = %e, "encoding room notice failed"),
                },
                After::Disconnect(id) => {
                    if let Err(e) = self.hub.unregister(id).await {
                        error!(conn = %id, error = %e, "unregister failed");
                    }
                    conn.close();
                }
            }
        }

        debug!(conn = %conn.id, command = code, result = result_code, "command handled");
        self.audit_event(
            conn.id,
            code,
            transaction_id,
            result_code,
            trail.render(),
            caller,
        )
        .await;
    }

    pub(super) async fn audit_event(
        &self,
        conn: ConnId,
        command: i32,
        transaction_id: &str,
        result_code: i32,
        detail: String,
        caller: Option<(Account, Device)>,
    ) {
        let (account, device) = match self.registry.lookup(conn).await.or(caller) {
            Some((a, d)) => (Some(a), Some(d)),
            None => (None, None),
        };
        self.audit.record(AuditRecord {
            at: Utc::now(),
            conn: conn.0,
            command,
            transaction_id: transaction_id.to_string(),
            result_code,
            detail,
            account,
            device,
            sessions: self.registry.snapshot().await,
        });
    }

    async fn area_names(&self, ids: &[AreaId]) -> Result<Vec<String>, CommandError> {
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(name) = self.store.find_area_name(*id).await? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// `None` when a token was accepted, otherwise the secret that matched.
    fn authenticate(
        &self,
        account: &Account,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Option<Secret>, CommandError> {
        if let Some(token) = env.token.as_deref().filter(|t| !t.is_empty()) {
            let claims = self.tokens.parse(token)?;
            if claims.sub == account.user_id {
                trail.note("token accepted");
                return Ok(None);
            }
            trail.note("token issued to another user");
            return Err(CommandError::BadCredentials);
        }

        let ttl = Duration::seconds(self.config.code_ttl_secs as i64);
        match verify_secret(account, field(&env.user_password), ttl, Utc::now()) {
            Some(secret) => {
                trail.note("credentials accepted");
                Ok(Some(secret))
            }
            None => {
                trail.note("credentials rejected");
                Err(CommandError::BadCredentials)
            }
        }
    }

    async fn login(
        &self,
        conn: &ConnectionHandle,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let user_id = field(&env.user_id);
        let key = DeviceKey::new(field(&env.device_id), field(&env.device_brand));
        let device_type = DeviceType::try_from(env.device_type.unwrap_or_default())
            .map_err(|reason| CommandError::InvalidField {
                field: "deviceType",
                reason,
            })?;

        let mut account = self
            .store
            .find_account(user_id)
            .await?
            .ok_or_else(|| CommandError::AccountNotFound(user_id.to_string()))?;
        trail.note(format!("account {user_id} found"));
        let secret = self.authenticate(&account, env, trail)?;

        let area = match device_type {
            DeviceType::Tablet => account.area.clone(),
            DeviceType::Glasses => match env.area.as_ref().filter(|a| !a.is_empty()) {
                Some(requested) => requested.clone(),
                None => match self.store.find_device(&key).await? {
                    Some(stored) if !stored.area.is_empty() => stored.area,
                    _ => account.area.clone(),
                },
            },
        };

        if let Some((_, current)) = self.registry.lookup(conn.id).await {
            let current_key = current.key();
            if current_key != key {
                if self.store.find_device(&current_key).await?.is_none() {
                    trail.note(format!("previous device {current_key} missing"));
                    return Err(CommandError::DeviceNotFound(current_key));
                }
                trail.note(format!("switching from {current_key}"));
            }
        }

        let mut device = self
            .store
            .update_device_area(&key, device_type, &area)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound(key.clone()))?;
        device.area_name = self.area_names(&device.area).await?;
        account.area_name = self.area_names(&account.area).await?;
        trail.note(format!("device {key} in area {:?}", device.area));

        let token = self.tokens.issue(&account.user_id)?;
        if secret == Some(Secret::Code) {
            self.store.clear_verification_code(user_id).await?;
            account.verification_code = None;
            account.code_issued_at = None;
            trail.note("verification code consumed");
        }

        let tx = env.transaction_id().to_string();
        let outcome = self.registry.bind(conn, account.clone(), device, tx).await;

        let mut after = Vec::new();
        if let Some(other) = outcome.displaced {
            trail.note(format!("displaced {}", other.id));
            info!(conn = %other.id, by = %conn.id, device = %key, "session displaced");
            let notice = Outbound::notice(Notice::Displaced)
                .with_results(format!("device {key} logged in elsewhere"));
            let _ = other.send_message(&notice);
            self.hub.unregister(other.id).await?;
        }
        if let Some((old, areas)) = outcome.released {
            trail.note(format!("released {}", old.key()));
            after.push(After::Announce {
                areas,
                exclude: Some(conn.id),
            });
        }

        let areas = self
            .registry
            .effective_area(conn.id)
            .await
            .unwrap_or_default();
        let devices = self.registry.devices_in_area(&areas).await;
        // The new session hears its own login announcement.
        after.push(After::Announce {
            areas,
            exclude: None,
        });

        let out = Outbound::success(Command::Login.code(), env.transaction_id(), "login ok")
            .with_account(account)
            .with_device(outcome.device)
            .with_devices(devices)
            .with_token(token);
        Ok(Reply { out, after })
    }

    async fn get_device_list(
        &self,
        conn: &ConnectionHandle,
        env: &Envelope,
    ) -> Result<Reply, CommandError> {
        let areas = self
            .registry
            .effective_area(conn.id)
            .await
            .ok_or(CommandError::NotLoggedIn)?;
        let devices = self.registry.devices_in_area(&areas).await;
        let results = format!("{} device(s)", devices.len());
        let out = Outbound::success(Command::GetDeviceList.code(), env.transaction_id(), results)
            .with_devices(devices);
        Ok(Reply::new(out))
    }

    fn get_room_id(&self, env: &Envelope) -> Reply {
        let room = self.registry.next_room_id();
        let out = Outbound::success(Command::GetRoomId.code(), env.transaction_id(), "room issued")
            .with_room(room);
        Reply::new(out)
    }

    async fn help(
        &self,
        conn: &ConnectionHandle,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let requested = env.room_id.unwrap_or(NO_ROOM);
        let pic = env.pic.clone().unwrap_or_default();
        let registry = &self.registry;

        let (device, areas) = registry
            .update_device(conn.id, |d| {
                if !d.is_idle() {
                    return Err(CommandError::NotIdle(d.device_status));
                }
                d.device_status = DeviceStatus::RequestingHelp;
                if !pic.is_empty() {
                    d.pic = pic;
                }
                d.room_id = if requested != NO_ROOM {
                    requested
                } else {
                    registry.next_room_id()
                };
                Ok(())
            })
            .await?;
        trail.note(format!("requesting help in room {}", device.room_id));

        let room = device.room_id;
        let out = Outbound::success(Command::Help.code(), env.transaction_id(), "help requested")
            .with_device(device)
            .with_room(room);
        Ok(Reply::new(out).then(After::Announce {
            areas,
            exclude: Some(conn.id),
        }))
    }

    async fn answer_help(
        &self,
        conn: &ConnectionHandle,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let target = DeviceKey::new(field(&env.device_id), field(&env.device_brand));
        let outcome = self.registry.answer(conn.id, &target).await?;
        trail.note(format!(
            "answering {target} on {} in room {}",
            outcome.target_conn, outcome.target.room_id
        ));

        let room = outcome.responder.room_id;
        let code = Command::AnswerHelp.code();
        let out = Outbound::success(code, env.transaction_id(), "call started")
            .with_device(outcome.responder)
            .with_devices(vec![outcome.target])
            .with_room(room);
        Ok(Reply::new(out).then(After::Announce {
            areas: outcome.areas,
            exclude: Some(conn.id),
        }))
    }

    async fn camera_mic_toggle(
        &self,
        conn: &ConnectionHandle,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let camera = media("cameraStatus", env.camera_status)?;
        let mic = media("micStatus", env.mic_status)?;

        let (device, _) = self
            .registry
            .update_device(conn.id, |d| {
                d.camera_status = camera;
                d.mic_status = mic;
                Ok(())
            })
            .await?;

        let room = device.room_id;
        let code = Command::CameraMicToggle.code();
        let out = Outbound::success(code, env.transaction_id(), "media updated")
            .with_device(device.clone());
        let reply = Reply::new(out);
        if room == NO_ROOM {
            trail.note("not in a room, nothing to notify");
            return Ok(reply);
        }
        let message = Outbound::notice(Notice::RoomMediaChanged)
            .with_device(device)
            .with_room(room);
        Ok(reply.then(After::Room {
            room,
            message,
            exclude: conn.id,
        }))
    }

    async fn hangup(&self, conn: &ConnectionHandle, env: &Envelope) -> Result<Reply, CommandError> {
        let (device, areas) = self
            .registry
            .update_device(conn.id, |d| {
                d.device_status = DeviceStatus::Idle;
                d.room_id = NO_ROOM;
                Ok(())
            })
            .await?;
        let out = Outbound::success(Command::Hangup.code(), env.transaction_id(), "call ended")
            .with_device(device);
        Ok(Reply::new(out).then(After::Announce {
            areas,
            exclude: Some(conn.id),
        }))
    }

    async fn logout(&self, conn: &ConnectionHandle, env: &Envelope) -> Result<Reply, CommandError> {
        let session = self
            .registry
            .remove(conn.id)
            .await
            .ok_or(CommandError::NotLoggedIn)?;
        let areas = session.effective_area().to_vec();
        let out = Outbound::success(Command::Logout.code(), env.transaction_id(), "logged out")
            .with_device(session.device);
        Ok(Reply::new(out)
            .then(After::Announce {
                areas,
                exclude: Some(conn.id),
            })
            .then(After::Disconnect(conn.id)))
    }

    async fn send_verification_code(
        &self,
        env: &Envelope,
        trail: &mut Trail,
    ) -> Result<Reply, CommandError> {
        let user_id = field(&env.user_id);
        let mut account = self
            .store
            .find_account(user_id)
            .await?
            .ok_or_else(|| CommandError::AccountNotFound(user_id.to_string()))?;

        let code = generate_code();
        let now = Utc::now();
        if !self.store.set_verification_code(user_id, &code, now).await? {
            return Err(CommandError::AccountNotFound(user_id.to_string()));
        }
        trail.note("code stored");
        account.verification_code = Some(code.clone());
        account.code_issued_at = Some(now);

        self.mailer.send_verification_code(&account, &code).await?;
        trail.note("code mailed");
        Ok(Reply::new(Outbound::success(
            Command::SendVerificationCode.code(),
            env.transaction_id(),
            "verification code sent",
        )))
    }
}
