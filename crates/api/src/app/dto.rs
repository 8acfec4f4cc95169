use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::{GuestId, UserId};
use audioflow_infra::store::JobFilter;
use audioflow_jobs::{JobStatus, Owner};

// -------------------------
// Request DTOs
// -------------------------

/// `skip`/`limit` paging for list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl PageQuery {
    pub fn skip(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(50)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AdminJobsQuery {
    pub status: Option<JobStatus>,
    pub user_id: Option<String>,
    pub guest_id: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl AdminJobsQuery {
    /// Turn query params into a store filter. A user id wins over a guest id.
    pub fn into_filter(self) -> Result<JobFilter, String> {
        let owner = match (self.user_id, self.guest_id) {
            (Some(raw), _) => Some(Owner::User(raw.parse::<UserId>().map_err(|e| e.to_string())?)),
            (None, Some(raw)) => Some(Owner::Guest(GuestId::parse(raw).map_err(|e| e.to_string())?)),
            (None, None) => None,
        };
        let defaults = JobFilter::default();
        Ok(JobFilter {
            status: self.status,
            owner,
            skip: self.skip.unwrap_or(defaults.skip),
            limit: self.limit.unwrap_or(defaults.limit),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimGuestRequest {
    pub guest_id: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct GuestSessionResponse {
    pub guest_id: GuestId,
    /// Bearer token carrying the guest id; the raw id works as `X-Guest-Id` too
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
