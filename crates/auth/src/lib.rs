//! `audioflow-auth`: identity resolution and authorization boundary.
//!
//! This crate is decoupled from HTTP and storage: guest
//! persistence is reached through the [`GuestRegistry`] seam.

pub mod authorize;
pub mod claims;
pub mod principal;
pub mod resolver;
pub mod roles;

pub use authorize::{authorize_owner, require_admin, AuthzError};
pub use claims::{
    validate_claims, Hs256TokenValidator, TokenClaims, TokenKind, TokenValidationError,
    TokenValidator,
};
pub use principal::Principal;
pub use resolver::{
    AuthError, Credentials, ExpiredGuestPolicy, GuestRegistry, IdentityResolver, RegistryError,
};
pub use roles::Role;
