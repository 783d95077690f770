use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Holds the API key used for every remote call, plus the one-shot
/// "invalid credential" latch.
///
/// The latch fires at most once per credential value: storing a different
/// key re-arms it.
#[derive(Default)]
pub struct CredentialStore {
    key: RwLock<String>,
    invalid_notified: AtomicBool,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("configured", &self.is_configured())
            .field(
                "invalid_notified",
                &self.invalid_notified.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl CredentialStore {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: RwLock::new(key.into().trim().to_string()),
            invalid_notified: AtomicBool::new(false),
        }
    }

    /// Current key, `None` when empty.
    pub fn current(&self) -> Option<String> {
        let key = self.key.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if key.is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }

    pub fn is_configured(&self) -> bool {
        self.current().is_some()
    }

    /// Replace the key. Returns true when the value actually changed.
    pub fn set(&self, key: impl Into<String>) -> bool {
        let key = key.into().trim().to_string();
        let mut guard = self.key.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard == key {
            return false;
        }
        *guard = key;
        self.invalid_notified.store(false, Ordering::SeqCst);
        true
    }

    /// Clear the key only if it is still the one that was rejected. A key
    /// installed while the request was in flight survives.
    pub fn clear_if_current(&self, rejected: &str) -> bool {
        let mut guard = self.key.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_str() != rejected.trim() {
            return false;
        }
        guard.clear();
        true
    }

    /// Claim the right to emit the invalid-credential notification. Only the
    /// first caller since the last key change gets `true`.
    pub fn claim_invalid_notification(&self) -> bool {
        !self.invalid_notified.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_key_counts_as_missing() {
        assert!(CredentialStore::new("  ").current().is_none());
        assert_eq!(CredentialStore::new("k1").current().as_deref(), Some("k1"));
    }

    #[test]
    fn notification_latch_rearms_only_on_change() {
        let store = CredentialStore::new("");
        assert!(store.claim_invalid_notification());
        assert!(!store.claim_invalid_notification());

        assert!(!store.set(""));
        assert!(!store.claim_invalid_notification());

        assert!(store.set("fresh"));
        assert!(store.claim_invalid_notification());

        assert!(store.clear_if_current("fresh"));
        assert!(!store.is_configured());
        assert!(!store.claim_invalid_notification());
    }

    #[test]
    fn stale_rejection_keeps_replacement_key() {
        let store = CredentialStore::new("old");
        store.set("new");
        assert!(!store.clear_if_current("old"));
        assert_eq!(store.current().as_deref(), Some("new"));
        assert!(store.clear_if_current("new"));
        assert!(store.current().is_none());
    }
}
