use std::sync::Arc;

use crate::cache::{KeyValueStore, RedisStore};
use crate::config::Config;
use crate::crypto::encryptor::Encryptor;
use crate::error::Result;
use crate::models::policy::PolicyRegistry;
use crate::services::audit::{SecurityEventLogger, TracingSecurityLogger};
use crate::services::authorization::{AuthorizationGuard, DeviceTrustResolver, SessionDeviceTrust};
use crate::services::origin::OriginValidator;
use crate::services::pipeline::RiskPipeline;
use crate::services::rate_limit::{RateLimiter, StoreRateLimiter};
use crate::services::rbac::{RbacResolver, StaticRbac};
use crate::services::session::SessionManager;
use crate::services::users::{MemoryUserDirectory, NewUser, UserDirectory};

/// Context string for deriving the bearer-token signing key from the master key.
const TOKEN_KEY_CONTEXT: &str = "bastion session bearer token";

/// Pluggable collaborators. `None` selects the default implementation.
#[derive(Default)]
pub struct Collaborators {
    pub rbac: Option<Arc<dyn RbacResolver>>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub events: Option<Arc<dyn SecurityEventLogger>>,
    pub devices: Option<Arc<dyn DeviceTrustResolver>>,
    pub users: Option<Arc<dyn UserDirectory>>,
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn KeyValueStore>,
    pub encryptor: Arc<Encryptor>,
    pub sessions: Arc<SessionManager>,
    pub origins: Arc<OriginValidator>,
    pub pipeline: Arc<RiskPipeline>,
    pub guard: Arc<AuthorizationGuard>,
    pub users: Arc<dyn UserDirectory>,
    pub events: Arc<dyn SecurityEventLogger>,
    pub policies: Arc<PolicyRegistry>,
}

impl AppState {
    /// Connects to Redis and wires the default collaborators.
    pub async fn new(config: &Config) -> Result<Self> {
        let store = RedisStore::connect(&config.redis_url, config.store_timeout).await?;

        let users = Arc::new(MemoryUserDirectory::new());
        if let Some((username, password)) = &config.bootstrap_admin {
            users
                .insert(NewUser {
                    username: username.clone(),
                    password: password.to_string(),
                    email_verified: true,
                    roles: vec!["admin".to_string()],
                    ..NewUser::default()
                })
                .await?;
            tracing::info!(username = %username, "✅ Bootstrap admin seeded");
        }

        let state = Self::from_parts(
            config.clone(),
            Arc::new(store),
            Collaborators {
                users: Some(users),
                ..Collaborators::default()
            },
        )?;
        tracing::info!("✅ Security pipeline initialized");
        Ok(state)
    }

    /// Builds the state over an existing store.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let encryptor = Arc::new(Encryptor::new(&config.master_key)?);
        let token_key = blake3::derive_key(TOKEN_KEY_CONTEXT, &config.master_key);

        let events = collaborators
            .events
            .unwrap_or_else(|| Arc::new(TracingSecurityLogger));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            encryptor.clone(),
            config.session.clone(),
            token_key,
        ));
        let rate_limiter = collaborators.rate_limiter.unwrap_or_else(|| {
            Arc::new(StoreRateLimiter::new(
                store.clone(),
                &config.rate_limit,
                events.clone(),
            ))
        });
        let devices = collaborators
            .devices
            .unwrap_or_else(|| Arc::new(SessionDeviceTrust::new(sessions.clone())));
        let rbac = collaborators
            .rbac
            .unwrap_or_else(|| Arc::new(StaticRbac::new()));
        let users = collaborators
            .users
            .unwrap_or_else(|| Arc::new(MemoryUserDirectory::new()));

        let mut firewall = config.firewall.clone();
        firewall.debug_headers &= !config.is_production();

        Ok(Self {
            origins: Arc::new(OriginValidator::new(config.cors.clone())),
            pipeline: Arc::new(RiskPipeline::new(firewall, rate_limiter, events.clone())),
            guard: Arc::new(AuthorizationGuard::new(
                rbac,
                sessions.clone(),
                devices,
                events.clone(),
            )),
            config: Arc::new(config),
            store,
            encryptor,
            sessions,
            users,
            events,
            policies: Arc::new(PolicyRegistry::new()),
        })
    }
}
