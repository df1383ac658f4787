//! The display name chosen on this device.

use std::sync::{Arc, Mutex};

use crate::mirror::Tab;

/// Device storage slot holding the name
pub const IDENTITY_SLOT: &str = "username";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("display name must not be empty")]
    EmptyName,
}

#[derive(Debug, Default)]
struct IdentityState {
    loaded: bool,
    username: Option<String>,
}

/// Name persisted in device storage, read once at startup.
///
/// `loaded` stays false until [`IdentityStore::load`] runs so callers can
/// tell "no name yet" from "not read yet".
#[derive(Clone)]
pub struct IdentityStore {
    tab: Tab,
    state: Arc<Mutex<IdentityState>>,
}

impl IdentityStore {
    pub fn new(tab: Tab) -> Self {
        Self {
            tab,
            state: Arc::new(Mutex::new(IdentityState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn load(&self) {
        let stored = self
            .tab
            .get_item(IDENTITY_SLOT)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let mut state = self.state();
        state.username = stored;
        state.loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn get(&self) -> Option<String> {
        self.state().username.clone()
    }

    /// Store a trimmed name
    pub fn set(&self, name: &str) -> Result<String, IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        self.tab.set_item(IDENTITY_SLOT, name);
        let mut state = self.state();
        state.username = Some(name.to_string());
        state.loaded = true;
        Ok(name.to_string())
    }

    pub fn clear(&self) {
        self.tab.remove_item(IDENTITY_SLOT);
        let mut state = self.state();
        state.username = None;
        state.loaded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::DeviceStorage;

    #[test]
    fn test_identity_lifecycle() {
        let storage = DeviceStorage::in_memory();
        let identity = IdentityStore::new(storage.tab());
        assert!(!identity.is_loaded());
        identity.load();
        assert!(identity.is_loaded());
        assert_eq!(identity.get(), None);

        assert_eq!(identity.set("  alice "), Ok("alice".to_string()));
        assert_eq!(identity.set("   "), Err(IdentityError::EmptyName));
        assert_eq!(identity.get().as_deref(), Some("alice"));

        // another tab of the same device sees the stored name on load
        let other = IdentityStore::new(storage.tab());
        other.load();
        assert_eq!(other.get().as_deref(), Some("alice"));

        identity.clear();
        assert_eq!(identity.get(), None);
        let fresh = IdentityStore::new(storage.tab());
        fresh.load();
        assert_eq!(fresh.get(), None);
    }
}
