use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::{GuestId, UserId};
use audioflow_jobs::Owner;

use crate::Role;

/// Resolved identity a job is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    AuthenticatedUser {
        id: UserId,
        #[serde(default)]
        roles: Vec<Role>,
    },
    Guest {
        guest_id: GuestId,
        expires_at: DateTime<Utc>,
    },
}

impl Principal {
    pub fn user(id: UserId) -> Self {
        Principal::AuthenticatedUser {
            id,
            roles: Vec::new(),
        }
    }

    /// The ownership key used on jobs and usage rows.
    pub fn owner(&self) -> Owner {
        match self {
            Principal::AuthenticatedUser { id, .. } => Owner::User(*id),
            Principal::Guest { guest_id, .. } => Owner::Guest(guest_id.clone()),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Principal::Guest { .. })
    }

    pub fn roles(&self) -> &[Role] {
        match self {
            Principal::AuthenticatedUser { roles, .. } => roles,
            Principal::Guest { .. } => &[],
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles().iter().any(Role::is_admin)
    }
}
