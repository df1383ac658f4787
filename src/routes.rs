//! Views of the app and the login guard in front of them.

use std::fmt;

use crate::identity::IdentityStore;
use crate::types::RoomId;

pub const ROOM_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Login,
    Rooms,
    Room(RoomId),
}

impl Route {
    /// Parse `/`, `/rooms` or `/room/{id}`
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.trim().trim_end_matches('/');
        match path {
            "" => Some(Route::Login),
            "/rooms" => Some(Route::Rooms),
            _ => path
                .strip_prefix("/room/")
                .filter(|id| !id.is_empty() && !id.contains('/'))
                .map(|id| Route::Room(id.to_string())),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Login => f.write_str("/"),
            Route::Rooms => f.write_str("/rooms"),
            Route::Room(id) => write!(f, "/room/{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEntry {
    pub id: RoomId,
    pub label: String,
}

/// The ten rooms offered on the room list
pub fn fixed_rooms() -> Vec<RoomEntry> {
    (1..=ROOM_COUNT)
        .map(|n| RoomEntry {
            id: format!("room{}", n),
            label: format!("ルーム{}", n),
        })
        .collect()
}

/// Where a request for `route` should land.
///
/// `None` while the identity has not been read yet. Without a name every
/// route except login redirects to login.
pub fn guard(route: &Route, identity: &IdentityStore) -> Option<Route> {
    if !identity.is_loaded() {
        return None;
    }
    match (route, identity.get()) {
        (Route::Login, _) => Some(Route::Login),
        (_, None) => Some(Route::Login),
        (route, Some(_)) => Some(route.clone()),
    }
}
