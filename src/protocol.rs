use serde::{Deserialize, Serialize};

use crate::model::{Account, AreaId, Device, RoomId};

/// commandType values.
pub const REQUEST: i32 = 1;
pub const RESPONSE: i32 = 2;
pub const BROADCAST: i32 = 3;

pub const RESULT_OK: i32 = 0;
pub const RESULT_FAIL: i32 = 1;

/// Request codes a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login,
    GetDeviceList,
    GetRoomId,
    Help,
    AnswerHelp,
    CameraMicToggle,
    Hangup,
    Logout,
    Heartbeat,
    SendVerificationCode,
}

impl Command {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Login,
            2 => Self::GetDeviceList,
            3 => Self::GetRoomId,
            4 => Self::Help,
            5 => Self::AnswerHelp,
            6 => Self::CameraMicToggle,
            7 => Self::Hangup,
            8 => Self::Logout,
            9 => Self::Heartbeat,
            10 => Self::SendVerificationCode,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Login => 1,
            Self::GetDeviceList => 2,
            Self::GetRoomId => 3,
            Self::Help => 4,
            Self::AnswerHelp => 5,
            Self::CameraMicToggle => 6,
            Self::Hangup => 7,
            Self::Logout => 8,
            Self::Heartbeat => 9,
            Self::SendVerificationCode => 10,
        }
    }

    /// Fields that must be present, beyond the envelope header.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Login => &["userID", "userPassword", "deviceID", "deviceBrand", "deviceType"],
            Self::AnswerHelp => &["deviceID", "deviceBrand"],
            Self::CameraMicToggle => &["cameraStatus", "micStatus"],
            Self::SendVerificationCode => &["userID"],
            _ => &[],
        }
    }

    /// Commands a connection may issue before it is bound to a session.
    pub fn allowed_anonymous(self) -> bool {
        matches!(self, Self::Login | Self::SendVerificationCode)
    }
}

/// Codes the server pushes on its own (commandType = 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    DeviceListChanged = 20,
    RoomMediaChanged = 21,
    Displaced = 22,
    ServerNotice = 23,
}

pub const HEADER_FIELDS: [&str; 3] = ["command", "commandType", "transactionID"];

/// Inbound command envelope. Every field is optional at decode time;
/// presence is checked per command afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub command: Option<i32>,
    pub command_type: Option<i32>,
    #[serde(rename = "transactionID")]
    pub transaction_id: Option<String>,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    pub user_password: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "deviceID")]
    pub device_id: Option<String>,
    pub device_brand: Option<String>,
    pub device_type: Option<u8>,
    pub area: Option<Vec<AreaId>>,
    pub area_name: Option<Vec<String>>,
    pub pic: Option<String>,
    pub online_status: Option<u8>,
    pub device_status: Option<u8>,
    pub camera_status: Option<u8>,
    pub mic_status: Option<u8>,
    #[serde(rename = "roomID")]
    pub room_id: Option<RoomId>,
}

fn absent(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, str::is_empty)
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn has(&self, field: &str) -> bool {
        match field {
            "command" => self.command.is_some(),
            "commandType" => self.command_type.is_some(),
            "transactionID" => !absent(&self.transaction_id),
            "userID" => !absent(&self.user_id),
            // A token stands in for the password.
            "userPassword" => !absent(&self.user_password) || !absent(&self.token),
            "deviceID" => !absent(&self.device_id),
            "deviceBrand" => !absent(&self.device_brand),
            "deviceType" => self.device_type.is_some(),
            "area" => self.area.is_some(),
            "pic" => !absent(&self.pic),
            "cameraStatus" => self.camera_status.is_some(),
            "micStatus" => self.mic_status.is_some(),
            "roomID" => self.room_id.is_some(),
            _ => false,
        }
    }

    /// Names from `fields` that this envelope lacks, in the given order.
    pub fn missing(&self, fields: &[&'static str]) -> Vec<&'static str> {
        fields.iter().copied().filter(|f| !self.has(f)).collect()
    }

    pub fn transaction_id(&self) -> &str {
        self.transaction_id.as_deref().unwrap_or_default()
    }
}

/// Every frame the server writes: responses and pushed notices alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub command: i32,
    pub command_type: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
    #[serde(rename = "transactionID", skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<Device>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(rename = "roomID", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Outbound {
    fn bare(command: i32, command_type: i32) -> Self {
        Self {
            command,
            command_type,
            result_code: None,
            results: None,
            transaction_id: None,
            devices: None,
            device: None,
            room_id: None,
            account: None,
            token: None,
        }
    }

    pub fn response(
        command: i32,
        transaction_id: &str,
        result_code: i32,
        results: impl Into<String>,
    ) -> Self {
        let mut out = Self::bare(command, RESPONSE);
        out.result_code = Some(result_code);
        out.results = Some(results.into());
        out.transaction_id = Some(transaction_id.to_string());
        out
    }

    pub fn success(command: i32, transaction_id: &str, results: impl Into<String>) -> Self {
        Self::response(command, transaction_id, RESULT_OK, results)
    }

    pub fn failure(command: i32, transaction_id: &str, results: impl Into<String>) -> Self {
        Self::response(command, transaction_id, RESULT_FAIL, results)
    }

    pub fn notice(code: Notice) -> Self {
        Self::bare(code as i32, BROADCAST)
    }

    pub fn with_results(mut self, results: impl Into<String>) -> Self {
        self.results = Some(results.into());
        self
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wire_field_names() {
        let env = Envelope::decode(
            r#"{"command":1,"commandType":1,"transactionID":"t1","userID":"u1",
                "userPassword":"pw","deviceID":"g1","deviceBrand":"acme","deviceType":1,
                "area":[1,2],"roomID":0}"#,
        )
        .unwrap();
        assert_eq!(env.command, Some(1));
        assert_eq!(env.user_id.as_deref(), Some("u1"));
        assert_eq!(env.area, Some(vec![1, 2]));
        assert!(env.missing(Command::Login.required_fields()).is_empty());
    }

    #[test]
    fn reports_missing_fields_in_order() {
        let env = Envelope::decode(r#"{"command":1,"deviceID":""}"#).unwrap();
        assert_eq!(env.missing(&HEADER_FIELDS), vec!["commandType", "transactionID"]);
        assert_eq!(
            env.missing(Command::Login.required_fields()),
            vec!["userID", "userPassword", "deviceID", "deviceBrand", "deviceType"]
        );
    }

    #[test]
    fn token_satisfies_password_requirement() {
        let env = Envelope {
            token: Some("jwt".into()),
            ..Envelope::default()
        };
        assert!(env.missing(&["userPassword"]).is_empty());
    }

    #[test]
    fn notices_carry_no_transaction_or_result() {
        let text = Outbound::notice(Notice::DeviceListChanged)
            .with_devices(Vec::new())
            .encode()
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["command"], 20);
        assert_eq!(v["commandType"], BROADCAST);
        assert!(v.get("transactionID").is_none());
        assert!(v.get("resultCode").is_none());
    }

    #[test]
    fn responses_echo_transaction() {
        let out = Outbound::failure(2, "tx-9", "not logged in");
        let v: serde_json::Value = serde_json::from_str(&out.encode().unwrap()).unwrap();
        assert_eq!(v["transactionID"], "tx-9");
        assert_eq!(v["resultCode"], 1);
        assert_eq!(v["commandType"], RESPONSE);
    }

    #[test]
    fn command_codes_are_stable() {
        for code in 1..=10 {
            assert_eq!(Command::from_code(code).map(Command::code), Some(code));
        }
        assert_eq!(Command::from_code(11), None);
    }
}
