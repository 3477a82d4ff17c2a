use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Area identifiers as they appear on the wire.
pub type AreaId = i64;

/// Room tag shared by a help requester and its responder. `0` means no room.
pub type RoomId = i64;

pub const NO_ROOM: RoomId = 0;

/// Generates the integer-backed serde impls used by every status enum below.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                match v {
                    $($name::$variant => $value,)+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($value => Ok($name::$variant),)+
                    other => Err(format!("invalid {} {}", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeviceType {
    Glasses,
    Tablet,
}

wire_enum!(DeviceType { Glasses = 1, Tablet = 2 });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OnlineStatus {
    #[default]
    Offline,
    Online,
}

wire_enum!(OnlineStatus { Offline = 0, Online = 1 });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeviceStatus {
    #[default]
    Idle,
    RequestingHelp,
    InCall,
}

wire_enum!(DeviceStatus { Idle = 0, RequestingHelp = 1, InCall = 2 });

/// Camera and microphone switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MediaStatus {
    #[default]
    Off,
    On,
}

wire_enum!(MediaStatus { Off = 0, On = 1 });

/// (deviceID, deviceBrand): the identity a live session claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub id: String,
    pub brand: String,
}

impl DeviceKey {
    pub fn new(id: impl Into<String>, brand: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            brand: brand.into(),
        }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id, self.brand)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub device_brand: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub area: Vec<AreaId>,
    #[serde(default)]
    pub area_name: Vec<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pic: String,
    #[serde(default)]
    pub online_status: OnlineStatus,
    #[serde(default)]
    pub device_status: DeviceStatus,
    #[serde(default)]
    pub camera_status: MediaStatus,
    #[serde(default)]
    pub mic_status: MediaStatus,
    #[serde(rename = "roomID", default)]
    pub room_id: RoomId,
}

impl Device {
    pub fn new(key: &DeviceKey, device_type: DeviceType) -> Self {
        Self {
            device_id: key.id.clone(),
            device_brand: key.brand.clone(),
            device_type,
            area: Vec::new(),
            area_name: Vec::new(),
            display_name: String::new(),
            pic: String::new(),
            online_status: OnlineStatus::Offline,
            device_status: DeviceStatus::Idle,
            camera_status: MediaStatus::Off,
            mic_status: MediaStatus::Off,
            room_id: NO_ROOM,
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.device_id, &self.device_brand)
    }

    pub fn is_idle(&self) -> bool {
        self.device_status == DeviceStatus::Idle
    }

    pub fn go_online(&mut self) {
        self.online_status = OnlineStatus::Online;
        self.device_status = DeviceStatus::Idle;
    }

    /// Resets everything a departing session leaves behind.
    pub fn go_offline(&mut self) {
        self.online_status = OnlineStatus::Offline;
        self.device_status = DeviceStatus::Idle;
        self.room_id = NO_ROOM;
        self.camera_status = MediaStatus::Off;
        self.mic_status = MediaStatus::Off;
    }
}

/// A user account. Credentials never leave the process: they are skipped on
/// serialization, so responses and audit records carry them redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub is_expert: bool,
    #[serde(default)]
    pub is_frontline: bool,
    #[serde(default)]
    pub area: Vec<AreaId>,
    #[serde(default)]
    pub area_name: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pic: String,
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    #[serde(default, skip_serializing)]
    pub verification_code: Option<String>,
    #[serde(default, skip_serializing)]
    pub code_issued_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: String::new(),
            email: None,
            is_expert: false,
            is_frontline: false,
            area: Vec::new(),
            area_name: Vec::new(),
            pic: String::new(),
            password_hash: String::new(),
            verification_code: None,
            code_issued_at: None,
        }
    }
}

pub fn areas_intersect(a: &[AreaId], b: &[AreaId]) -> bool {
    a.iter().any(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_serializes_wire_names_and_integer_statuses() {
        let mut device = Device::new(&DeviceKey::new("g-1", "acme"), DeviceType::Glasses);
        device.area = vec![3];
        device.go_online();
        device.room_id = 7;

        let v = serde_json::to_value(&device).unwrap();
        assert_eq!(v["deviceID"], "g-1");
        assert_eq!(v["deviceBrand"], "acme");
        assert_eq!(v["deviceType"], 1);
        assert_eq!(v["onlineStatus"], 1);
        assert_eq!(v["deviceStatus"], 0);
        assert_eq!(v["roomID"], 7);
        assert!(v.get("pic").is_none());
    }

    #[test]
    fn account_never_serializes_credentials() {
        let mut account = Account::new("u1");
        account.password_hash = "secret-hash".into();
        account.verification_code = Some("123456".into());
        account.code_issued_at = Some(Utc::now());

        let text = serde_json::to_string(&account).unwrap();
        assert!(!text.contains("secret-hash"));
        assert!(!text.contains("123456"));
        assert!(text.contains("\"userID\":\"u1\""));
    }

    #[test]
    fn account_loads_credentials_from_records() {
        let account: Account = serde_json::from_str(
            r#"{"userID":"u1","passwordHash":"abc","area":[1,2],"isExpert":true}"#,
        )
        .unwrap();
        assert_eq!(account.password_hash, "abc");
        assert!(account.is_expert);
        assert_eq!(account.area, vec![1, 2]);
    }

    #[test]
    fn go_offline_clears_room_and_media() {
        let mut device = Device::new(&DeviceKey::new("t-1", "acme"), DeviceType::Tablet);
        device.go_online();
        device.device_status = DeviceStatus::InCall;
        device.room_id = 4;
        device.camera_status = MediaStatus::On;

        device.go_offline();
        assert_eq!(device.online_status, OnlineStatus::Offline);
        assert!(device.is_idle());
        assert_eq!(device.room_id, NO_ROOM);
        assert_eq!(device.camera_status, MediaStatus::Off);
    }

    #[test]
    fn rejects_unknown_device_type() {
        assert!(DeviceType::try_from(9).is_err());
        assert_eq!(DeviceType::try_from(2), Ok(DeviceType::Tablet));
    }

    #[test]
    fn area_intersection() {
        assert!(areas_intersect(&[1, 2], &[2]));
        assert!(!areas_intersect(&[1], &[2]));
        assert!(!areas_intersect(&[], &[1]));
    }
}
