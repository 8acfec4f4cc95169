use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use audioflow_core::{GuestId, UserId};
use audioflow_jobs::Guest;

use crate::{Principal, TokenKind, TokenValidator};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("guest registry error: {0}")]
pub struct RegistryError(pub String);

/// Persistence seam for guest sessions (implemented by the job store backends).
#[async_trait]
pub trait GuestRegistry: Send + Sync {
    async fn find_guest(&self, guest_id: &GuestId) -> Result<Option<Guest>, RegistryError>;

    /// Insert or overwrite the guest row.
    async fn save_guest(&self, guest: &Guest) -> Result<(), RegistryError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no valid credentials supplied")]
    Unauthenticated,

    #[error("guest session has expired")]
    GuestExpired,

    #[error("malformed guest identifier: {0}")]
    InvalidGuestId(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What to do with a guest identifier whose session window has passed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredGuestPolicy {
    /// Keep the identifier and open a fresh expiry window
    #[default]
    Renew,
    /// Refuse the request
    Reject,
}

impl FromStr for ExpiredGuestPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "renew" => Ok(Self::Renew),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown expired guest policy '{other}' (expected renew|reject)")),
        }
    }
}

/// Raw credential material lifted off a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub guest_id: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            guest_id: None,
        }
    }

    pub fn guest(guest_id: impl Into<String>) -> Self {
        Self {
            bearer: None,
            guest_id: Some(guest_id.into()),
        }
    }
}

/// Derives a [`Principal`] from request credentials.
///
/// A valid access token wins. Otherwise the guest identifier (from a guest
/// token or the client-supplied header) is looked up, created on first sight,
/// and its `last_active_at` touched.
#[derive(Clone)]
pub struct IdentityResolver {
    validator: Arc<dyn TokenValidator>,
    registry: Arc<dyn GuestRegistry>,
    guest_ttl: Duration,
    policy: ExpiredGuestPolicy,
}

impl IdentityResolver {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        registry: Arc<dyn GuestRegistry>,
        guest_ttl: Duration,
        policy: ExpiredGuestPolicy,
    ) -> Self {
        Self {
            validator,
            registry,
            guest_ttl,
            policy,
        }
    }

    pub fn guest_ttl(&self) -> Duration {
        self.guest_ttl
    }

    pub async fn resolve(&self, credentials: &Credentials, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let mut guest_hint = credentials.guest_id.clone();

        if let Some(token) = credentials.bearer.as_deref() {
            match self.validator.validate(token, now) {
                Ok(claims) => match claims.kind {
                    TokenKind::Access => match UserId::from_str(&claims.sub) {
                        Ok(id) => {
                            return Ok(Principal::AuthenticatedUser {
                                id,
                                roles: claims.roles,
                            });
                        }
                        Err(e) => debug!(error = %e, "access token subject is not a user id"),
                    },
                    // A signed guest token outranks the unsigned header.
                    TokenKind::Guest => guest_hint = Some(claims.sub),
                },
                Err(e) => debug!(error = %e, "bearer token rejected; falling back to guest identifier"),
            }
        }

        let Some(raw) = guest_hint else {
            return Err(AuthError::Unauthenticated);
        };
        let guest_id = GuestId::parse(&raw).map_err(|e| AuthError::InvalidGuestId(e.to_string()))?;
        let guest = self.touch_guest(guest_id, now).await?;

        Ok(Principal::Guest {
            guest_id: guest.guest_id,
            expires_at: guest.expires_at,
        })
    }

    /// Open a brand new guest session.
    pub async fn start_guest_session(&self, now: DateTime<Utc>) -> Result<Guest, AuthError> {
        let guest = Guest::new(GuestId::generate(), now, self.guest_ttl);
        self.registry.save_guest(&guest).await?;
        info!(guest_id = %guest.guest_id, "guest session started");
        Ok(guest)
    }

    async fn touch_guest(&self, guest_id: GuestId, now: DateTime<Utc>) -> Result<Guest, AuthError> {
        let guest = match self.registry.find_guest(&guest_id).await? {
            None => {
                info!(guest_id = %guest_id, "first sight of guest identifier; creating guest");
                Guest::new(guest_id, now, self.guest_ttl)
            }
            Some(mut guest) if guest.is_expired(now) => match self.policy {
                ExpiredGuestPolicy::Reject => return Err(AuthError::GuestExpired),
                ExpiredGuestPolicy::Renew => {
                    info!(guest_id = %guest.guest_id, "renewing expired guest session");
                    guest.renew(now, self.guest_ttl);
                    guest
                }
            },
            Some(mut guest) => {
                guest.touch(now);
                guest
            }
        };

        self.registry.save_guest(&guest).await?;
        Ok(guest)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::{Hs256TokenValidator, Role, TokenClaims};

    #[derive(Default)]
    struct MemRegistry(Mutex<HashMap<GuestId, Guest>>);

    #[async_trait]
    impl GuestRegistry for MemRegistry {
        async fn find_guest(&self, guest_id: &GuestId) -> Result<Option<Guest>, RegistryError> {
            Ok(self.0.lock().unwrap().get(guest_id).cloned())
        }

        async fn save_guest(&self, guest: &Guest) -> Result<(), RegistryError> {
            self.0.lock().unwrap().insert(guest.guest_id.clone(), guest.clone());
            Ok(())
        }
    }

    fn resolver(policy: ExpiredGuestPolicy) -> (IdentityResolver, Arc<MemRegistry>, Hs256TokenValidator) {
        let validator = Hs256TokenValidator::new("test-secret");
        let registry = Arc::new(MemRegistry::default());
        let resolver = IdentityResolver::new(
            Arc::new(validator.clone()),
            registry.clone(),
            Duration::days(7),
            policy,
        );
        (resolver, registry, validator)
    }

    #[tokio::test]
    async fn no_credentials_is_unauthenticated() {
        let (r, _, _) = resolver(ExpiredGuestPolicy::Renew);
        let err = r.resolve(&Credentials::default(), Utc::now()).await.unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
    }

    #[tokio::test]
    async fn access_token_resolves_to_user_with_roles() {
        let (r, _, v) = resolver(ExpiredGuestPolicy::Renew);
        let now = Utc::now();
        let user = UserId::new();
        let token = v
            .issue(&TokenClaims::new(user.to_string(), TokenKind::Access, vec![Role::new("admin")], now, Duration::hours(1)))
            .unwrap();

        let p = r.resolve(&Credentials::bearer(token), now).await.unwrap();
        assert_eq!(p.owner(), audioflow_jobs::Owner::User(user));
        assert!(p.is_admin());
    }

    #[tokio::test]
    async fn unknown_guest_is_created_on_first_sight() {
        let (r, reg, _) = resolver(ExpiredGuestPolicy::Renew);
        let now = Utc::now();
        let p = r.resolve(&Credentials::guest("guest-abc"), now).await.unwrap();
        assert!(p.is_guest());

        let stored = reg.0.lock().unwrap().get(&GuestId::parse("guest-abc").unwrap()).cloned().unwrap();
        assert_eq!(stored.created_at, now);
        assert_eq!(stored.expires_at, now + Duration::days(7));
    }

    #[tokio::test]
    async fn invalid_bearer_falls_back_to_guest_header() {
        let (r, _, _) = resolver(ExpiredGuestPolicy::Renew);
        let creds = Credentials {
            bearer: Some("not-a-jwt".into()),
            guest_id: Some("g-1".into()),
        };
        assert!(r.resolve(&creds, Utc::now()).await.unwrap().is_guest());

        let only_bad_token = Credentials::bearer("not-a-jwt");
        assert_eq!(
            r.resolve(&only_bad_token, Utc::now()).await.unwrap_err(),
            AuthError::Unauthenticated
        );
    }

    #[tokio::test]
    async fn expired_guest_is_renewed_under_default_policy() {
        let (r, reg, _) = resolver(ExpiredGuestPolicy::Renew);
        let long_ago = Utc::now() - Duration::days(30);
        let id = GuestId::parse("old-guest").unwrap();
        reg.save_guest(&Guest::new(id.clone(), long_ago, Duration::days(7))).await.unwrap();

        let now = Utc::now();
        let p = r.resolve(&Credentials::guest("old-guest"), now).await.unwrap();
        match p {
            Principal::Guest { guest_id, expires_at } => {
                assert_eq!(guest_id, id);
                assert!(expires_at > now);
            }
            other => panic!("expected guest, got {other:?}"),
        }
        assert_eq!(reg.0.lock().unwrap()[&id].created_at, long_ago);
    }

    #[tokio::test]
    async fn expired_guest_is_rejected_under_reject_policy() {
        let (r, reg, _) = resolver(ExpiredGuestPolicy::Reject);
        let long_ago = Utc::now() - Duration::days(30);
        let id = GuestId::parse("old-guest").unwrap();
        reg.save_guest(&Guest::new(id, long_ago, Duration::days(7))).await.unwrap();

        let err = r.resolve(&Credentials::guest("old-guest"), Utc::now()).await.unwrap_err();
        assert_eq!(err, AuthError::GuestExpired);
    }

    #[tokio::test]
    async fn guest_token_subject_is_used_as_guest_id() {
        let (r, _, v) = resolver(ExpiredGuestPolicy::Renew);
        let now = Utc::now();
        let session = r.start_guest_session(now).await.unwrap();
        let token = v
            .issue(&TokenClaims::new(session.guest_id.as_str(), TokenKind::Guest, vec![], now, Duration::days(7)))
            .unwrap();

        let p = r.resolve(&Credentials::bearer(token), now).await.unwrap();
        assert_eq!(p.owner(), audioflow_jobs::Owner::Guest(session.guest_id));
    }

    #[tokio::test]
    async fn signed_guest_token_wins_over_guest_header() {
        let (r, reg, v) = resolver(ExpiredGuestPolicy::Renew);
        let now = Utc::now();
        let session = r.start_guest_session(now).await.unwrap();
        let token = v
            .issue(&TokenClaims::new(session.guest_id.as_str(), TokenKind::Guest, vec![], now, Duration::days(7)))
            .unwrap();
        let creds = Credentials {
            bearer: Some(token),
            guest_id: Some("someone-else".into()),
        };

        let p = r.resolve(&creds, now).await.unwrap();
        assert_eq!(p.owner(), audioflow_jobs::Owner::Guest(session.guest_id));
        assert!(!reg.0.lock().unwrap().contains_key(&GuestId::parse("someone-else").unwrap()));
    }

    #[test]
    fn policy_parses() {
        assert_eq!("renew".parse::<ExpiredGuestPolicy>(), Ok(ExpiredGuestPolicy::Renew));
        assert_eq!("REJECT".parse::<ExpiredGuestPolicy>(), Ok(ExpiredGuestPolicy::Reject));
        assert!("maybe".parse::<ExpiredGuestPolicy>().is_err());
    }
}
