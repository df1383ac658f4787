//! Process-wide handle to the hosted store, or the explicit absence of one.

use std::sync::{Arc, OnceLock};

use crate::config::env_value;
use crate::mirror::{LocalMirror, Tab};
use crate::store::{RemoteStore, RowStore};
use crate::sync::Backend;

/// Where to reach the hosted store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub anon_key: String,
}

impl RemoteConfig {
    /// PARTYROOM_STORE_URL and PARTYROOM_STORE_ANON_KEY; both must be set
    pub fn from_env() -> Option<Self> {
        let url = env_value("PARTYROOM_STORE_URL");
        let anon_key = env_value("PARTYROOM_STORE_ANON_KEY");
        match (url, anon_key) {
            (Some(url), Some(anon_key)) => Some(Self { url, anon_key }),
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "PARTYROOM_STORE_URL and PARTYROOM_STORE_ANON_KEY must both be set to use the hosted store"
                );
                None
            }
        }
    }
}

pub enum Connection {
    Remote(Arc<RemoteStore>),
    Unavailable,
}

impl Connection {
    pub fn from_config(config: Option<RemoteConfig>) -> Self {
        let Some(config) = config else {
            tracing::warn!("No hosted store configured; rooms sync between tabs of this device only");
            return Connection::Unavailable;
        };
        match RemoteStore::new(&config.url, &config.anon_key) {
            Ok(store) => {
                tracing::info!("Using hosted store at {}", store.base_url());
                Connection::Remote(Arc::new(store))
            }
            Err(e) => {
                tracing::warn!("Hosted store unusable ({}); falling back to local mirror", e);
                Connection::Unavailable
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Connection::Remote(_))
    }

    pub fn store(&self) -> Option<Arc<dyn RowStore>> {
        match self {
            Connection::Remote(store) => Some(store.clone() as Arc<dyn RowStore>),
            Connection::Unavailable => None,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            Connection::Remote(store) => Some(store.base_url()),
            Connection::Unavailable => None,
        }
    }

    /// Backend for one room as seen from `tab`
    pub fn backend_for(&self, tab: &Tab, room_id: &str) -> Backend {
        match self.store() {
            Some(store) => Backend::Remote(store),
            None => Backend::Local(LocalMirror::new(tab.clone(), room_id)),
        }
    }
}

static CONNECTION: OnceLock<Connection> = OnceLock::new();

/// The process-wide connection, built from the environment on first use
pub fn connection() -> &'static Connection {
    CONNECTION.get_or_init(|| Connection::from_config(RemoteConfig::from_env()))
}
