//! Identity collaborator

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::CurrentUser;

/// Reports who is signed in; used to scope pulls and subscriptions.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, or `None` when signed out.
    async fn current_user(&self) -> Result<Option<CurrentUser>>;
}

/// Identity fixed by the host application (CLI flag, tests)
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user: RwLock<Option<CurrentUser>>,
}

impl StaticIdentity {
    pub fn new(user: Option<CurrentUser>) -> Self {
        Self {
            user: RwLock::new(user),
        }
    }

    /// Identity for a user owning their own account
    pub fn signed_in(uid: impl Into<String>) -> Self {
        Self::new(Some(CurrentUser::owner(uid)))
    }

    pub fn set_user(&self, user: Option<CurrentUser>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<Option<CurrentUser>> {
        Ok(self
            .user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
