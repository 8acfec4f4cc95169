use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::{GuestId, UserId};

/// An ephemeral, unauthenticated session that can own jobs.
///
/// Guests are linked to jobs only by `guest_id` string match; nothing here
/// references a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub guest_id: GuestId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set when the guest registered and became a user
    pub converted_to_user_id: Option<UserId>,
}

impl Guest {
    pub fn new(guest_id: GuestId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            guest_id,
            created_at: now,
            last_active_at: now,
            expires_at: now + ttl,
            converted_to_user_id: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now.max(self.last_active_at);
    }

    /// Treat an expired guest as freshly seen: same id, new expiry window.
    pub fn renew(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.touch(now);
        self.expires_at = now + ttl;
    }

    pub fn convert_to(&mut self, user_id: UserId) {
        self.converted_to_user_id = Some(user_id);
    }
}
