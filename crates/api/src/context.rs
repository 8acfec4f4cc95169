use audioflow_auth::Principal;
use audioflow_jobs::Owner;

/// Resolved caller for a request.
///
/// Inserted by the identity middleware; must be present for every owner or
/// admin route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal: Principal,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn owner(&self) -> Owner {
        self.principal.owner()
    }
}
