//! Signed-in user as reported by the identity collaborator

use serde::{Deserialize, Serialize};

/// The current user and the tenants they may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub uid: String,
    pub account_owner_id: String,
    #[serde(default)]
    pub allowed_owner_ids: Vec<String>,
}

impl CurrentUser {
    /// User who owns their own account.
    pub fn owner(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            account_owner_id: uid.clone(),
            allowed_owner_ids: vec![uid.clone()],
            uid,
        }
    }

    /// Owner ids used to scope pulls and subscriptions.
    ///
    /// Falls back to the account owner when no explicit list is present.
    pub fn owner_scope(&self) -> Vec<String> {
        if self.allowed_owner_ids.is_empty() {
            vec![self.account_owner_id.clone()]
        } else {
            self.allowed_owner_ids.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_scope_falls_back_to_account_owner() {
        let user = CurrentUser {
            uid: "employee".to_string(),
            account_owner_id: "boss".to_string(),
            allowed_owner_ids: Vec::new(),
        };
        assert_eq!(user.owner_scope(), vec!["boss".to_string()]);
        assert_eq!(CurrentUser::owner("solo").owner_scope(), vec!["solo".to_string()]);
    }
}
