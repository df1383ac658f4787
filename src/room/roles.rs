use chrono::Utc;
use rand::Rng;
use serde_json::json;

use super::{RoomContext, RoomResult};
use crate::store::{Filter, Query};
use crate::sync::{decode_rows, Backend, SyncedCollection};
use crate::types::{Member, Role, RoomId, RolesState, Table};

/// What a role assignment did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Fewer than two members online; nothing was written
    TooFewOnline(usize),
    Assigned { insider: String, master: String },
}

/// Two distinct indices below `n`, drawn uniformly
pub fn draw_pair<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Option<(usize, usize)> {
    if n < 2 {
        return None;
    }
    let first = rng.random_range(0..n);
    let mut second = rng.random_range(0..n);
    while second == first {
        second = rng.random_range(0..n);
    }
    Some((first, second))
}

/// Role assignment, the shared reveal flag, and the local user's own role
pub struct RolesPanel {
    room_id: RoomId,
    backend: Backend,
    state: SyncedCollection<RolesState>,
    mine: SyncedCollection<Member>,
}

impl RolesPanel {
    pub async fn open(context: &RoomContext) -> Self {
        let state = SyncedCollection::<RolesState>::open(
            context.backend.clone(),
            Query::new(Filter::room(&context.room_id)),
            context.timings.poll,
        )
        .await;
        // only our own row, so other members' roles never reach this client
        let mine = SyncedCollection::<Member>::open(
            context.backend.clone(),
            Query::new(Filter::room(&context.room_id).eq("username", &context.username)),
            context.timings.poll,
        )
        .await;

        Self {
            room_id: context.room_id.clone(),
            backend: context.backend.clone(),
            state,
            mine,
        }
    }

    pub fn my_role(&self) -> Role {
        self.mine
            .rows()
            .first()
            .map(|member| member.role)
            .unwrap_or_default()
    }

    pub fn revealed(&self) -> bool {
        self.state.rows().first().is_some_and(|state| state.revealed)
    }

    /// Deal insider and master among online members; everyone else online
    /// becomes a commoner. Hides roles again.
    pub async fn assign(&self) -> RoomResult<AssignOutcome> {
        let raw = self
            .backend
            .select(Table::Members, &Query::new(Filter::room(&self.room_id)))
            .await?;
        let now = Utc::now();
        let online: Vec<Member> = decode_rows::<Member>(raw)
            .into_iter()
            .filter(|m| m.is_online_at(now))
            .collect();

        let pair = {
            let mut rng = rand::rng();
            draw_pair(online.len(), &mut rng)
        };
        let Some((insider_idx, master_idx)) = pair else {
            tracing::info!(
                "Not assigning roles in {}: {} online",
                self.room_id,
                online.len()
            );
            return Ok(AssignOutcome::TooFewOnline(online.len()));
        };
        let insider = online[insider_idx].username.clone();
        let master = online[master_idx].username.clone();

        let room = Filter::room(&self.room_id);
        self.mine
            .update_where(&room, json!({ "role": Role::Undecided }))
            .await?;
        self.mine
            .update_where(&room.clone().eq("username", &insider), json!({ "role": Role::Insider }))
            .await?;
        self.mine
            .update_where(&room.clone().eq("username", &master), json!({ "role": Role::Master }))
            .await?;
        for member in online
            .iter()
            .filter(|m| m.username != insider && m.username != master)
        {
            self.mine
                .update_where(
                    &room.clone().eq("username", &member.username),
                    json!({ "role": Role::Commoner }),
                )
                .await?;
        }
        self.state
            .upsert(json!({ "room_id": self.room_id, "revealed": false }))
            .await?;

        tracing::info!("Assigned roles in {} among {} online", self.room_id, online.len());
        Ok(AssignOutcome::Assigned { insider, master })
    }

    /// Set the reveal flag; member roles are left alone
    pub async fn reveal(&self) -> RoomResult<()> {
        self.state
            .upsert(json!({ "room_id": self.room_id, "revealed": true }))
            .await?;
        Ok(())
    }
}
