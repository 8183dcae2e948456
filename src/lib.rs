//! Request-security and session-risk pipeline for axum services.
//!
//! Every request passes through origin validation, session authentication,
//! a scored risk pipeline and a per-route authorization guard before it
//! reaches a handler. [`app::router`] wires the full stack.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod state;

pub mod crypto {
    pub mod cipher;
    pub mod encryptor;
    pub mod tokens;
}

pub mod models {
    pub mod policy;
    pub mod security;
    pub mod session;
    pub mod user;
}

pub mod services {
    pub mod audit;
    pub mod authorization;
    pub mod origin;
    pub mod pipeline;
    pub mod rate_limit;
    pub mod rbac;
    pub mod sanitizer;
    pub mod session;
    pub mod threat;
    pub mod users;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod cors;
    pub mod csrf;
    pub mod firewall;
    pub mod guard;
}

pub mod handlers {
    pub mod auth;
    pub mod sessions;
}

pub mod validation {
    pub mod auth;
}
