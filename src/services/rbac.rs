use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::user::{AccessDecision, AuthenticatedUser, ResourceRef, UserContext};

pub const PERMISSION_DENIED: &str = "Permission denied";

/// Role and permission resolution.
#[async_trait]
pub trait RbacResolver: Send + Sync {
    async fn create_user_context(&self, user: &AuthenticatedUser) -> Result<UserContext>;

    async fn can_access_resource(
        &self,
        user: &UserContext,
        action: &str,
        resource: &ResourceRef,
    ) -> Result<AccessDecision>;
}

/// Role grants from a static table.
///
/// A grant is one of `*`, `{action}`, `{resource}:{action}` or `{action}:own`;
/// the last applies only when the caller owns the resource.
#[derive(Debug, Clone)]
pub struct StaticRbac {
    grants: HashMap<String, Vec<String>>,
    premium_grants: Vec<String>,
}

impl Default for StaticRbac {
    fn default() -> Self {
        let grants = HashMap::from([
            ("admin".to_string(), vec!["*".to_string()]),
            (
                "user".to_string(),
                ["read:own", "create:own", "update:own", "delete:own"]
                    .map(String::from)
                    .to_vec(),
            ),
        ]);
        Self {
            grants,
            premium_grants: vec!["export:own".to_string()],
        }
    }
}

impl StaticRbac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role<I, S>(mut self, role: &str, grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .insert(role.to_string(), grants.into_iter().map(Into::into).collect());
        self
    }

    fn permissions_for(&self, roles: &[String], premium: bool) -> Vec<String> {
        let mut permissions: Vec<String> = roles
            .iter()
            .filter_map(|role| self.grants.get(&role.to_ascii_lowercase()))
            .flatten()
            .cloned()
            .collect();
        if premium {
            permissions.extend(self.premium_grants.iter().cloned());
        }
        permissions.sort();
        permissions.dedup();
        permissions
    }
}

fn grant_matches(grant: &str, user: &UserContext, action: &str, resource: &ResourceRef) -> bool {
    if grant == "*" || grant == action {
        return true;
    }
    if let Some(owned) = grant.strip_suffix(":own") {
        return owned == action && resource.owner_id.as_deref() == Some(user.user_id.as_str());
    }
    grant
        .split_once(':')
        .is_some_and(|(kind, act)| kind == resource.resource_type && act == action)
}

#[async_trait]
impl RbacResolver for StaticRbac {
    async fn create_user_context(&self, user: &AuthenticatedUser) -> Result<UserContext> {
        Ok(UserContext {
            user_id: user.id.clone(),
            roles: user.roles.clone(),
            permissions: self.permissions_for(&user.roles, user.premium),
            is_premium: user.premium,
            email_verified: user.email_verified,
        })
    }

    async fn can_access_resource(
        &self,
        user: &UserContext,
        action: &str,
        resource: &ResourceRef,
    ) -> Result<AccessDecision> {
        let allowed = user
            .permissions
            .iter()
            .any(|grant| grant_matches(grant, user, action, resource));

        Ok(if allowed {
            AccessDecision::allow()
        } else {
            AccessDecision::deny(PERMISSION_DENIED)
        })
    }
}
