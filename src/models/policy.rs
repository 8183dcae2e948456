//! Declarative per-endpoint security policy.
//!
//! A policy is declared at two levels: once for a group of routes (the
//! "class" level) and optionally per handler. The effective policy is their
//! merge, computed once when the route is registered.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Requirements an endpoint places on the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGuardContext {
    pub required_permissions: Vec<String>,
    pub required_roles: Vec<String>,
    pub require_mfa: Option<bool>,
    pub require_email_verification: Option<bool>,
    pub require_trusted_device: Option<bool>,
    pub allow_anonymous: Option<bool>,
    pub risk_threshold: Option<u32>,
}

impl SecurityGuardContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anonymous() -> Self {
        Self::new().allow_anonymous(true)
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn require_mfa(mut self, value: bool) -> Self {
        self.require_mfa = Some(value);
        self
    }

    pub fn require_email_verification(mut self, value: bool) -> Self {
        self.require_email_verification = Some(value);
        self
    }

    pub fn require_trusted_device(mut self, value: bool) -> Self {
        self.require_trusted_device = Some(value);
        self
    }

    pub fn allow_anonymous(mut self, value: bool) -> Self {
        self.allow_anonymous = Some(value);
        self
    }

    pub fn risk_threshold(mut self, value: u32) -> Self {
        self.risk_threshold = Some(value);
        self
    }

    /// Merges a class-level policy with a handler-level one.
    ///
    /// Arrays are concatenated with class entries first. Scalars take the
    /// handler's value when it declares one, the class value otherwise.
    pub fn merge(class: &SecurityGuardContext, handler: &SecurityGuardContext) -> Self {
        let concat = |a: &[String], b: &[String]| a.iter().chain(b).cloned().collect::<Vec<_>>();
        Self {
            required_permissions: concat(&class.required_permissions, &handler.required_permissions),
            required_roles: concat(&class.required_roles, &handler.required_roles),
            require_mfa: handler.require_mfa.or(class.require_mfa),
            require_email_verification: handler
                .require_email_verification
                .or(class.require_email_verification),
            require_trusted_device: handler.require_trusted_device.or(class.require_trusted_device),
            allow_anonymous: handler.allow_anonymous.or(class.allow_anonymous),
            risk_threshold: handler.risk_threshold.or(class.risk_threshold),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.allow_anonymous.unwrap_or(false)
    }

    pub fn needs_mfa(&self) -> bool {
        self.require_mfa.unwrap_or(false)
    }

    pub fn needs_email_verification(&self) -> bool {
        self.require_email_verification.unwrap_or(false)
    }

    pub fn needs_trusted_device(&self) -> bool {
        self.require_trusted_device.unwrap_or(false)
    }
}

/// Effective policies keyed by route, merged once at registration.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<SecurityGuardContext>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges and caches the policy for `route`. Registering the same route
    /// twice returns the cached policy.
    pub fn register(
        &self,
        route: &str,
        class: &SecurityGuardContext,
        handler: &SecurityGuardContext,
    ) -> Arc<SecurityGuardContext> {
        if let Some(existing) = self.get(route) {
            return existing;
        }

        let merged = Arc::new(SecurityGuardContext::merge(class, handler));
        let mut policies = match self.policies.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        policies
            .entry(route.to_string())
            .or_insert_with(|| merged.clone())
            .clone()
    }

    pub fn get(&self, route: &str) -> Option<Arc<SecurityGuardContext>> {
        let policies = match self.policies.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        policies.get(route).cloned()
    }

    pub fn len(&self) -> usize {
        match self.policies.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_concatenate_class_first() {
        let class = SecurityGuardContext::new().roles(["A"]).permissions(["read"]);
        let handler = SecurityGuardContext::new().roles(["B"]).permissions(["write"]);

        let merged = SecurityGuardContext::merge(&class, &handler);
        assert_eq!(merged.required_roles, vec!["A", "B"]);
        assert_eq!(merged.required_permissions, vec!["read", "write"]);
    }

    #[test]
    fn handler_scalars_take_precedence() {
        let class = SecurityGuardContext::new()
            .require_mfa(true)
            .risk_threshold(40)
            .allow_anonymous(true);
        let handler = SecurityGuardContext::new()
            .allow_anonymous(false)
            .risk_threshold(70);

        let merged = SecurityGuardContext::merge(&class, &handler);
        assert!(merged.needs_mfa());
        assert!(!merged.is_anonymous());
        assert_eq!(merged.risk_threshold, Some(70));
        assert!(!merged.needs_trusted_device());
    }

    #[test]
    fn registry_caches_merged_policy() {
        let registry = PolicyRegistry::new();
        let class = SecurityGuardContext::new().roles(["admin"]);
        let first = registry.register("GET /api/x", &class, &SecurityGuardContext::new());
        let second = registry.register(
            "GET /api/x",
            &class,
            &SecurityGuardContext::new().roles(["other"]),
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(second.required_roles, vec!["admin"]);
    }
}
