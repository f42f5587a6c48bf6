//! Device table and lease map shared by plugin handlers and the scheduler.
//!
//! Both live behind one mutex: the bus delivery path and scheduler jobs read
//! and mutate them concurrently. Lease expiry is lazy and only evaluated when
//! a lease is read; nothing sweeps expired entries.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lab_common::{AckCode, ParamMap, now_iso};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Field stamped onto every device entry when it is updated.
pub const LAST_SEEN: &str = "last_seen";

/// Time-bounded exclusive claim on a `module:device` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Serialize)]
struct LeaseView<'a> {
    holder: &'a str,
    /// Unix seconds.
    exp: f64,
}

impl<'a> From<&'a Lease> for LeaseView<'a> {
    fn from(lease: &'a Lease) -> Self {
        Self {
            holder: &lease.holder,
            exp: lease.expires_at.timestamp_millis() as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("in_use")]
    InUse { holder: String },

    #[error("not_owner")]
    NotOwner,
}

impl LeaseError {
    pub fn code(&self) -> AckCode {
        match self {
            Self::InUse { .. } => AckCode::InUse,
            Self::NotOwner => AckCode::NotOwner,
        }
    }
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<String, ParamMap>,
    locks: BTreeMap<String, Lease>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow-merge a device announcement (meta or liveness document).
    ///
    /// Returns the device id, or `None` when the document names no device.
    pub fn update_device(&self, document: &ParamMap) -> Option<String> {
        let device_id = document
            .get("device_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?
            .to_string();

        let mut inner = self.inner.lock();
        let entry = inner.devices.entry(device_id.clone()).or_default();
        for (key, value) in document {
            entry.insert(key.clone(), value.clone());
        }
        entry.insert(LAST_SEEN.to_string(), now_iso().into());
        Some(device_id)
    }

    /// Forget a device. Returns whether it was known.
    pub fn remove_device(&self, device_id: &str) -> bool {
        self.inner.lock().devices.remove(device_id).is_some()
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.inner.lock().devices.contains_key(device_id)
    }

    pub fn device(&self, device_id: &str) -> Option<ParamMap> {
        self.inner.lock().devices.get(device_id).cloned()
    }

    pub fn devices(&self) -> BTreeMap<String, ParamMap> {
        self.inner.lock().devices.clone()
    }

    pub fn lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<Lease, LeaseError> {
        self.lock_at(key, holder, ttl, Utc::now())
    }

    /// Acquire or renew `key` for `holder` as of `now`.
    ///
    /// Succeeds when the key is free, its lease has expired, or `holder`
    /// already owns it; the expiry is reset to `now + ttl` in every case.
    pub fn lock_at(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, LeaseError> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.locks.get(key) {
            if current.is_live(now) && current.holder != holder {
                return Err(LeaseError::InUse {
                    holder: current.holder.clone(),
                });
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let lease = Lease {
            holder: holder.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        inner.locks.insert(key.to_string(), lease.clone());
        Ok(lease)
    }

    /// Drop `key` if `holder` owns it. Expiry is not considered: the recorded
    /// holder may release an expired lease, nobody else may.
    pub fn release(&self, key: &str, holder: &str) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock();
        match inner.locks.get(key) {
            Some(current) if current.holder == holder => {
                inner.locks.remove(key);
                Ok(())
            }
            _ => Err(LeaseError::NotOwner),
        }
    }

    pub fn can_use(&self, key: &str, actor: &str) -> bool {
        self.can_use_at(key, actor, Utc::now())
    }

    /// Whether `actor` may act on `key` as of `now`.
    pub fn can_use_at(&self, key: &str, actor: &str, now: DateTime<Utc>) -> bool {
        match self.inner.lock().locks.get(key) {
            None => true,
            Some(lease) => !lease.is_live(now) || lease.holder == actor,
        }
    }

    /// Every recorded lease, expired ones included.
    pub fn leases(&self) -> BTreeMap<String, Lease> {
        self.inner.lock().locks.clone()
    }

    /// Lease map in wire form: `{key: {"holder","exp"}}`.
    pub fn locks_document(&self) -> Value {
        let inner = self.inner.lock();
        locks_value(&inner.locks)
    }

    /// `{"devices","locks","ts","modules"}`
    pub fn snapshot(&self, modules: &[String]) -> Value {
        let inner = self.inner.lock();
        json!({
            "devices": inner.devices,
            "locks": locks_value(&inner.locks),
            "ts": now_iso(),
            "modules": modules,
        })
    }
}

fn locks_value(locks: &BTreeMap<String, Lease>) -> Value {
    let view: BTreeMap<&str, LeaseView<'_>> = locks
        .iter()
        .map(|(key, lease)| (key.as_str(), LeaseView::from(lease)))
        .collect();
    serde_json::to_value(view).unwrap_or_default()
}
