//! Authentication-provider seam.
//!
//! Sign-in flows live elsewhere; the engine only asks "who is signed in".

use crate::error::{Result, TrackerError};

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Identity fixed at construction, typically from config or `STINT_USER`.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        let user_id = user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        Self { user_id }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

pub(crate) fn require_user(identity: &dyn IdentityProvider) -> Result<String> {
    identity
        .current_user_id()
        .ok_or_else(|| TrackerError::Precondition("no authenticated user".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_user_counts_as_signed_out() {
        let identity = StaticIdentity::new(Some("   ".to_string()));
        assert!(identity.current_user_id().is_none());
        assert!(matches!(
            require_user(&identity),
            Err(TrackerError::Precondition(_))
        ));
        assert_eq!(
            require_user(&StaticIdentity::new(Some("u1".to_string()))).expect("user"),
            "u1"
        );
    }
}
