use crate::error::StoreError;
use crate::types::{Registration, SubscriberConfig};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const REGISTRATIONS_FILE: &str = "registrations.json";
const SUBSCRIBERS_FILE: &str = "subscribers.json";

/// Keyed store of registrations (one per account) and subscriber configs.
///
/// Registration writes are compare-and-swap on [`Registration::version`]:
/// `expected` is the version the caller read, or `None` if it found nothing.
pub trait RegistrationStore: Send + Sync {
    fn get(&self, account: &str) -> Result<Option<Registration>, StoreError>;

    fn list(&self) -> Result<Vec<Registration>, StoreError>;

    /// Store `registration` if the current version still equals `expected`.
    /// Returns the stored copy with its new version.
    fn compare_and_swap(
        &self,
        registration: Registration,
        expected: Option<u64>,
    ) -> Result<Registration, StoreError>;

    fn remove(&self, account: &str, expected: u64) -> Result<(), StoreError>;

    fn get_subscriber(&self, id: &str) -> Result<Option<SubscriberConfig>, StoreError>;

    fn list_subscribers(&self) -> Result<Vec<SubscriberConfig>, StoreError>;

    fn put_subscriber(&self, subscriber: SubscriberConfig) -> Result<(), StoreError>;

    fn remove_subscriber(&self, id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct StoreState {
    registrations: HashMap<String, Registration>,
    subscribers: HashMap<String, SubscriberConfig>,
}

/// [`RegistrationStore`] kept in memory and, when given a data directory,
/// mirrored to JSON files after every write.
pub struct JsonStore {
    state: Mutex<StoreState>,
    data_dir: Option<PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            data_dir: None,
        }
    }

    /// Open the store in `data_dir`, loading any existing snapshot.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let registrations: Vec<Registration> = load_json(&data_dir.join(REGISTRATIONS_FILE))?;
        let subscribers: Vec<SubscriberConfig> = load_json(&data_dir.join(SUBSCRIBERS_FILE))?;
        tracing::info!(
            data_dir = %data_dir.display(),
            registrations = registrations.len(),
            subscribers = subscribers.len(),
            "Loaded registration store"
        );

        let state = StoreState {
            registrations: registrations
                .into_iter()
                .map(|r| (r.account.clone(), r))
                .collect(),
            subscribers: subscribers.into_iter().map(|s| (s.id.clone(), s)).collect(),
        };

        Ok(Self {
            state: Mutex::new(state),
            data_dir: Some(data_dir),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Writers persist a modified copy and only then swap it in, so a failed
    // write leaves memory as it was.

    fn save_registrations(
        &self,
        registrations: &HashMap<String, Registration>,
    ) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut items: Vec<&Registration> = registrations.values().collect();
        items.sort_by(|a, b| a.account.cmp(&b.account));
        save_json(&dir.join(REGISTRATIONS_FILE), &items)
    }

    fn save_subscribers(
        &self,
        subscribers: &HashMap<String, SubscriberConfig>,
    ) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut items: Vec<&SubscriberConfig> = subscribers.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        save_json(&dir.join(SUBSCRIBERS_FILE), &items)
    }
}

impl RegistrationStore for JsonStore {
    fn get(&self, account: &str) -> Result<Option<Registration>, StoreError> {
        Ok(self.lock().registrations.get(account).cloned())
    }

    fn list(&self) -> Result<Vec<Registration>, StoreError> {
        let mut items: Vec<Registration> = self.lock().registrations.values().cloned().collect();
        items.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(items)
    }

    fn compare_and_swap(
        &self,
        mut registration: Registration,
        expected: Option<u64>,
    ) -> Result<Registration, StoreError> {
        let mut state = self.lock();
        let found = state
            .registrations
            .get(&registration.account)
            .map(|r| r.version);
        if found != expected {
            return Err(StoreError::Conflict {
                account: registration.account,
                expected,
                found,
            });
        }

        registration.version = expected.map_or(1, |v| v + 1);
        registration.updated_at = Utc::now();
        let mut next = state.registrations.clone();
        next.insert(registration.account.clone(), registration.clone());
        self.save_registrations(&next)?;
        state.registrations = next;
        Ok(registration)
    }

    fn remove(&self, account: &str, expected: u64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let found = state.registrations.get(account).map(|r| r.version);
        if found != Some(expected) {
            return Err(StoreError::Conflict {
                account: account.to_string(),
                expected: Some(expected),
                found,
            });
        }
        let mut next = state.registrations.clone();
        next.remove(account);
        self.save_registrations(&next)?;
        state.registrations = next;
        Ok(())
    }

    fn get_subscriber(&self, id: &str) -> Result<Option<SubscriberConfig>, StoreError> {
        Ok(self.lock().subscribers.get(id).cloned())
    }

    fn list_subscribers(&self) -> Result<Vec<SubscriberConfig>, StoreError> {
        let mut items: Vec<SubscriberConfig> = self.lock().subscribers.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    fn put_subscriber(&self, subscriber: SubscriberConfig) -> Result<(), StoreError> {
        let mut state = self.lock();
        let mut next = state.subscribers.clone();
        next.insert(subscriber.id.clone(), subscriber);
        self.save_subscribers(&next)?;
        state.subscribers = next;
        Ok(())
    }

    fn remove_subscriber(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !state.subscribers.contains_key(id) {
            return Ok(false);
        }
        let mut next = state.subscribers.clone();
        next.remove(id);
        self.save_subscribers(&next)?;
        state.subscribers = next;
        Ok(true)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write via a temporary file so a crash never leaves a truncated snapshot.
fn save_json<T: Serialize>(path: &Path, items: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(items)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilterConfig, SubscriptionScope};
    use std::collections::BTreeSet;

    fn registration(account: &str) -> Registration {
        Registration {
            account: account.to_string(),
            webhook_id: "wh-1".to_string(),
            url: "https://hooks.example.com/webhooks/acme".to_string(),
            secret: "s3cret".to_string(),
            scope: SubscriptionScope::incidents(),
            subscribers: BTreeSet::from(["sub-1".to_string()]),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    fn subscriber(id: &str) -> SubscriberConfig {
        SubscriberConfig {
            id: id.to_string(),
            account: "acme".to_string(),
            scope: SubscriptionScope::incidents(),
            filter: FilterConfig::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn compare_and_swap_bumps_version() {
        let store = JsonStore::in_memory();
        let first = store.compare_and_swap(registration("acme"), None).unwrap();
        assert_eq!(first.version, 1);

        let second = store.compare_and_swap(first.clone(), Some(1)).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(store.get("acme").unwrap().unwrap().version, 2);
    }

    #[test]
    fn stale_write_is_rejected() {
        let store = JsonStore::in_memory();
        store.compare_and_swap(registration("acme"), None).unwrap();

        let err = store
            .compare_and_swap(registration("acme"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: None,
                found: Some(1),
                ..
            }
        ));

        let err = store.remove("acme", 7).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.get("acme").unwrap().is_some());
    }

    #[test]
    fn remove_with_current_version() {
        let store = JsonStore::in_memory();
        let stored = store.compare_and_swap(registration("acme"), None).unwrap();
        store.remove("acme", stored.version).unwrap();
        assert!(store.get("acme").unwrap().is_none());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.compare_and_swap(registration("acme"), None).unwrap();
            store.put_subscriber(subscriber("sub-1")).unwrap();
            store.put_subscriber(subscriber("sub-2")).unwrap();
            assert!(store.remove_subscriber("sub-2").unwrap());
        }

        let reopened = JsonStore::open(dir.path()).unwrap();
        let reg = reopened.get("acme").unwrap().unwrap();
        assert_eq!(reg.version, 1);
        assert_eq!(reg.secret, "s3cret");
        assert_eq!(reg.scope, SubscriptionScope::incidents());

        let subs = reopened.list_subscribers().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, "sub-1");
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonStore::open(&data_dir).unwrap();
        let stored = store.compare_and_swap(registration("acme"), None).unwrap();
        store.put_subscriber(subscriber("sub-1")).unwrap();
        std::fs::remove_dir_all(&data_dir).unwrap();

        assert!(store.compare_and_swap(stored.clone(), Some(1)).is_err());
        assert!(store.compare_and_swap(registration("globex"), None).is_err());
        assert_eq!(store.get("acme").unwrap().unwrap().version, 1);
        assert!(store.get("globex").unwrap().is_none());

        assert!(store.remove("acme", 1).is_err());
        assert!(store.get("acme").unwrap().is_some());

        assert!(store.put_subscriber(subscriber("sub-2")).is_err());
        assert!(store.get_subscriber("sub-2").unwrap().is_none());
        assert!(store.remove_subscriber("sub-1").is_err());
        assert!(store.get_subscriber("sub-1").unwrap().is_some());
    }

    #[test]
    fn remove_unknown_subscriber() {
        let store = JsonStore::in_memory();
        assert!(!store.remove_subscriber("nope").unwrap());
    }
}
