use thiserror::Error;

use audioflow_jobs::Owner;

use crate::Principal;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: resource belongs to another principal")]
    NotOwner,

    #[error("forbidden: admin role required")]
    AdminRequired,
}

/// Authorize a principal against the owner of a job or usage row.
///
/// - No IO
/// - No panics
/// - Admins get no implicit bypass here; the admin surface has its own entry points
pub fn authorize_owner(principal: &Principal, owner: &Owner) -> Result<(), AuthzError> {
    if &principal.owner() == owner {
        Ok(())
    } else {
        Err(AuthzError::NotOwner)
    }
}

pub fn require_admin(principal: &Principal) -> Result<(), AuthzError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(AuthzError::AdminRequired)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use audioflow_core::{GuestId, UserId};

    use super::*;
    use crate::Role;

    fn guest(id: &GuestId) -> Principal {
        Principal::Guest {
            guest_id: id.clone(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn owner_is_authorized() {
        let g = GuestId::generate();
        assert!(authorize_owner(&guest(&g), &Owner::Guest(g.clone())).is_ok());
    }

    #[test]
    fn other_guest_is_forbidden() {
        let g1 = GuestId::generate();
        let g2 = GuestId::generate();
        assert_eq!(
            authorize_owner(&guest(&g2), &Owner::Guest(g1)),
            Err(AuthzError::NotOwner)
        );
    }

    #[test]
    fn user_and_guest_never_match() {
        let user = UserId::new();
        let p = Principal::user(user);
        assert!(authorize_owner(&p, &Owner::User(user)).is_ok());
        assert!(authorize_owner(&p, &Owner::Guest(GuestId::generate())).is_err());
    }

    #[test]
    fn admin_role_is_required_for_admin_surface() {
        let plain = Principal::user(UserId::new());
        assert_eq!(require_admin(&plain), Err(AuthzError::AdminRequired));

        let admin = Principal::AuthenticatedUser {
            id: UserId::new(),
            roles: vec![Role::new("admin")],
        };
        assert!(require_admin(&admin).is_ok());
        assert_eq!(require_admin(&guest(&GuestId::generate())), Err(AuthzError::AdminRequired));
    }
}
