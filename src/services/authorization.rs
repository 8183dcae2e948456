//! Per-endpoint authorization.
//!
//! [`AuthorizationGuard::authorize`] evaluates a [`SecurityGuardContext`] in a
//! fixed order and stops at the first failing check.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::policy::SecurityGuardContext;
use crate::models::security::SecurityContext;
use crate::models::user::{AuthenticatedUser, ResourceRef};
use crate::services::audit::{AuthorizationDetails, SecurityEventLogger};
use crate::services::rbac::{PERMISSION_DENIED, RbacResolver};
use crate::services::session::SessionManager;

/// Header carrying the session whose MFA state is checked.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Answers whether a (user, fingerprint) pair is a trusted device.
#[async_trait]
pub trait DeviceTrustResolver: Send + Sync {
    async fn is_device_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool>;
}

/// Reads the `trusted` flag from the session store's device records.
pub struct SessionDeviceTrust {
    sessions: Arc<SessionManager>,
}

impl SessionDeviceTrust {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeviceTrustResolver for SessionDeviceTrust {
    async fn is_device_trusted(&self, user_id: &str, fingerprint: &str) -> Result<bool> {
        Ok(self
            .sessions
            .get_device(user_id, fingerprint)
            .await?
            .is_some_and(|d| d.trusted))
    }
}

/// What the guard needs to know about the request.
#[derive(Debug, Clone, Copy)]
pub struct GuardRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub path_params: &'a HashMap<String, String>,
    pub user: Option<&'a AuthenticatedUser>,
    pub security: Option<&'a SecurityContext>,
    pub session_header: Option<&'a str>,
}

impl GuardRequest<'_> {
    /// `/api/{resource}/...` gives `{resource}`.
    fn resource_type(&self) -> String {
        self.path
            .split('/')
            .filter(|s| !s.is_empty())
            .nth(1)
            .unwrap_or("unknown")
            .to_string()
    }

    fn resource(&self, user: &AuthenticatedUser) -> ResourceRef {
        let owner = self
            .path_params
            .get("userId")
            .or_else(|| self.path_params.get("ownerId"))
            .cloned()
            .unwrap_or_else(|| user.id.clone());
        ResourceRef {
            resource_type: self.resource_type(),
            id: self.path_params.get("id").cloned(),
            owner_id: Some(owner),
        }
    }

    fn details(
        &self,
        action: Option<&str>,
        resource: Option<ResourceRef>,
        reason: Option<&str>,
    ) -> AuthorizationDetails {
        AuthorizationDetails {
            user_id: self.user.map(|u| u.id.clone()),
            method: self.method.to_string(),
            path: self.path.to_string(),
            action: action.map(str::to_string),
            resource,
            reason: reason.map(str::to_string),
        }
    }
}

pub struct AuthorizationGuard {
    rbac: Arc<dyn RbacResolver>,
    sessions: Arc<SessionManager>,
    devices: Arc<dyn DeviceTrustResolver>,
    events: Arc<dyn SecurityEventLogger>,
}

impl AuthorizationGuard {
    pub fn new(
        rbac: Arc<dyn RbacResolver>,
        sessions: Arc<SessionManager>,
        devices: Arc<dyn DeviceTrustResolver>,
        events: Arc<dyn SecurityEventLogger>,
    ) -> Self {
        Self {
            rbac,
            sessions,
            devices,
            events,
        }
    }

    pub async fn authorize(
        &self,
        policy: &SecurityGuardContext,
        req: &GuardRequest<'_>,
    ) -> Result<()> {
        if policy.is_anonymous() {
            return Ok(());
        }

        let Some(user) = req.user else {
            return Err(self.deny(req, None, None, AppError::AuthenticationRequired));
        };

        if policy.needs_email_verification() && !user.email_verified {
            return Err(self.deny(req, None, None, AppError::EmailVerificationRequired));
        }

        let context = self.rbac.create_user_context(user).await?;

        if !policy.required_roles.is_empty()
            && !policy.required_roles.iter().any(|role| context.has_role(role))
        {
            return Err(self.deny(req, None, None, AppError::InsufficientPrivilege));
        }

        if !policy.required_permissions.is_empty() {
            let resource = req.resource(user);
            for permission in &policy.required_permissions {
                let decision = self
                    .rbac
                    .can_access_resource(&context, permission, &resource)
                    .await?;
                if !decision.allowed {
                    let reason = decision.reason.unwrap_or_else(|| PERMISSION_DENIED.to_string());
                    return Err(self.deny(
                        req,
                        Some(permission),
                        Some(resource),
                        AppError::AccessDenied(reason),
                    ));
                }
            }
        }

        if policy.needs_mfa()
            && user.mfa_enabled
            && !self.mfa_verified(user, req.session_header).await?
        {
            return Err(self.deny(req, None, None, AppError::MfaRequired));
        }

        if policy.needs_trusted_device() {
            let fingerprint = req.security.and_then(|s| s.device_fingerprint.as_deref());
            let trusted = match fingerprint {
                Some(fp) => self.devices.is_device_trusted(&user.id, fp).await?,
                None => false,
            };
            if !trusted {
                return Err(self.deny(req, None, None, AppError::TrustedDeviceRequired));
            }
        }

        if let Some(threshold) = policy.risk_threshold {
            let score = req.security.map(|s| s.risk_score()).unwrap_or_default();
            if score > threshold {
                return Err(self.deny(req, None, None, AppError::RiskThresholdExceeded));
            }
        }

        self.events
            .log_authorization_event("access_granted", &req.details(None, None, None));
        Ok(())
    }

    async fn mfa_verified(&self, user: &AuthenticatedUser, header: Option<&str>) -> Result<bool> {
        let Some(raw) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(false);
        };
        let session_id = if raw.contains('.') {
            match self.sessions.session_id_from_token(raw) {
                Some(id) => id,
                None => return Ok(false),
            }
        } else {
            raw.to_string()
        };

        Ok(self
            .sessions
            .get_session(&session_id)
            .await?
            .is_some_and(|s| s.active && s.user_id == user.id && s.metadata.mfa_verified))
    }

    fn deny(
        &self,
        req: &GuardRequest<'_>,
        action: Option<&str>,
        resource: Option<ResourceRef>,
        error: AppError,
    ) -> AppError {
        let reason = match &error {
            AppError::AccessDenied(reason) => reason.clone(),
            other => other.code().to_ascii_lowercase(),
        };
        let details = req.details(action, resource, Some(&reason));
        self.events.log_authorization_event("access_denied", &details);
        error
    }
}
