use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{Account, AreaId, Device, DeviceKey, DeviceType};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Account, device and area lookups the hub needs from durable storage.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn find_account(&self, user_id: &str) -> Result<Option<Account>>;

    async fn find_device(&self, key: &DeviceKey) -> Result<Option<Device>>;

    /// Stores `area` on the device record, creating the record when the
    /// device has never been seen. Returns the stored record.
    async fn update_device_area(
        &self,
        key: &DeviceKey,
        device_type: DeviceType,
        area: &[AreaId],
    ) -> Result<Option<Device>>;

    async fn find_area_name(&self, area_id: AreaId) -> Result<Option<String>>;

    /// Returns false when the account does not exist.
    async fn set_verification_code(
        &self,
        user_id: &str,
        code: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Forgets a code once it has been used to log in.
    async fn clear_verification_code(&self, user_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaRecord {
    pub id: AreaId,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    devices: HashMap<DeviceKey, Device>,
    areas: HashMap<AreaId, String>,
}

/// In-memory [`Persistence`], optionally backed by JSON files in a data
/// directory. Device upserts are written back to `devices.json`.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    data_dir: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            data_dir: None,
        }
    }

    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut inner = Inner::default();

        if let Some(accounts) = read_json::<Vec<Account>>(&data_dir.join("accounts.json"))? {
            for a in accounts {
                inner.accounts.insert(a.user_id.clone(), a);
            }
        }
        if let Some(devices) = read_json::<Vec<Device>>(&data_dir.join("devices.json"))? {
            for d in devices {
                inner.devices.insert(d.key(), d);
            }
        }
        if let Some(areas) = read_json::<Vec<AreaRecord>>(&data_dir.join("areas.json"))? {
            for a in areas {
                inner.areas.insert(a.id, a.name);
            }
        }

        debug!(
            accounts = inner.accounts.len(),
            devices = inner.devices.len(),
            areas = inner.areas.len(),
            dir = %data_dir.display(),
            "store loaded"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            data_dir: Some(data_dir),
        })
    }

    pub fn insert_account(&self, account: Account) {
        self.write().accounts.insert(account.user_id.clone(), account);
    }

    pub fn insert_device(&self, device: Device) {
        self.write().devices.insert(device.key(), device);
    }

    pub fn insert_area(&self, id: AreaId, name: impl Into<String>) {
        self.write().areas.insert(id, name.into());
    }

    pub fn remove_device(&self, key: &DeviceKey) -> Option<Device> {
        self.write().devices.remove(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // A panic while holding the lock leaves maps that are still usable.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn find_account(&self, user_id: &str) -> Result<Option<Account>> {
        Ok(self.read().accounts.get(user_id).cloned())
    }

    async fn find_device(&self, key: &DeviceKey) -> Result<Option<Device>> {
        Ok(self.read().devices.get(key).cloned())
    }

    async fn update_device_area(
        &self,
        key: &DeviceKey,
        device_type: DeviceType,
        area: &[AreaId],
    ) -> Result<Option<Device>> {
        let mut inner = self.write();
        let device = inner
            .devices
            .entry(key.clone())
            .or_insert_with(|| Device::new(key, device_type));
        device.device_type = device_type;
        device.area = area.to_vec();
        let stored = device.clone();

        let snapshot: Option<Vec<Device>> = self
            .data_dir
            .as_ref()
            .map(|_| inner.devices.values().cloned().collect());
        drop(inner);

        if let (Some(dir), Some(devices)) = (&self.data_dir, snapshot) {
            if let Err(e) = write_json(&dir.join("devices.json"), &devices) {
                warn!(device = %key, error = %e, "persisting devices failed");
                return Err(e);
            }
        }
        Ok(Some(stored))
    }

    async fn find_area_name(&self, area_id: AreaId) -> Result<Option<String>> {
        Ok(self.read().areas.get(&area_id).cloned())
    }

    async fn set_verification_code(
        &self,
        user_id: &str,
        code: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.write();
        match inner.accounts.get_mut(user_id) {
            Some(account) => {
                account.verification_code = Some(code.to_string());
                account.code_issued_at = Some(issued_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_verification_code(&self, user_id: &str) -> Result<()> {
        if let Some(account) = self.write().accounts.get_mut(user_id) {
            account.verification_code = None;
            account.code_issued_at = None;
        }
        Ok(())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

fn write_json(path: &Path, v: &impl Serialize) -> Result<()> {
    let data = serde_json::to_string_pretty(v)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_updates_area() {
        let store = MemoryStore::new();
        let key = DeviceKey::new("g1", "acme");
        assert!(store.find_device(&key).await.unwrap().is_none());

        let d = store.update_device_area(&key, DeviceType::Glasses, &[1]).await.unwrap().unwrap();
        assert_eq!(d.area, vec![1]);

        let d = store
            .update_device_area(&key, DeviceType::Glasses, &[2, 3])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.area, vec![2, 3]);
        assert_eq!(store.find_device(&key).await.unwrap().unwrap().area, vec![2, 3]);
    }

    #[tokio::test]
    async fn verification_code_needs_existing_account() {
        let store = MemoryStore::new();
        assert!(!store.set_verification_code("ghost", "123456", Utc::now()).await.unwrap());

        store.insert_account(Account::new("u1"));
        assert!(store.set_verification_code("u1", "123456", Utc::now()).await.unwrap());
        let account = store.find_account("u1").await.unwrap().unwrap();
        assert_eq!(account.verification_code.as_deref(), Some("123456"));

        store.clear_verification_code("u1").await.unwrap();
        let account = store.find_account("u1").await.unwrap().unwrap();
        assert!(account.verification_code.is_none());
        assert!(account.code_issued_at.is_none());
    }

    #[tokio::test]
    async fn open_loads_files_and_writes_devices_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("accounts.json"),
            r#"[{"userID":"u1","passwordHash":"x","area":[1]}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("areas.json"), r#"[{"id":1,"name":"Plant A"}]"#).unwrap();

        let store = MemoryStore::open(dir.path()).unwrap();
        assert!(store.find_account("u1").await.unwrap().is_some());
        assert_eq!(store.find_area_name(1).await.unwrap().as_deref(), Some("Plant A"));

        let key = DeviceKey::new("t1", "acme");
        store.update_device_area(&key, DeviceType::Tablet, &[1]).await.unwrap();

        let reopened = MemoryStore::open(dir.path()).unwrap();
        let d = reopened.find_device(&key).await.unwrap().unwrap();
        assert_eq!(d.device_type, DeviceType::Tablet);
        assert_eq!(d.area, vec![1]);
    }

    #[test]
    fn open_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("areas.json"), "not json").unwrap();
        assert!(matches!(MemoryStore::open(dir.path()), Err(StoreError::Json(_))));
    }
}
