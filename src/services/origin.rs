use once_cell::sync::Lazy;
use regex::Regex;
use url::{Host, Url};

use crate::config::CorsConfig;

static NUMERIC_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{5,}").expect("valid numeric run regex"));

/// TLDs handed out for free and disproportionately used for throwaway hosts.
const DISPOSABLE_TLDS: &[&str] = &[".tk", ".ml", ".ga", ".cf", ".gq", ".zip", ".mov"];

/// Why an origin was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginReason {
    SameOrigin,
    Blacklisted,
    Whitelisted,
    SubdomainMatch,
    Malformed,
    InsecureScheme,
    SuspiciousHost,
    UnknownAllowed,
    UnknownBlocked,
}

impl OriginReason {
    pub fn as_str(self) -> &'static str {
        match self {
            OriginReason::SameOrigin => "same_origin",
            OriginReason::Blacklisted => "blacklisted",
            OriginReason::Whitelisted => "whitelisted",
            OriginReason::SubdomainMatch => "subdomain_match",
            OriginReason::Malformed => "malformed_origin",
            OriginReason::InsecureScheme => "insecure_scheme",
            OriginReason::SuspiciousHost => "suspicious_host",
            OriginReason::UnknownAllowed => "unknown_origin_allowed",
            OriginReason::UnknownBlocked => "unknown_origin_blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginDecision {
    pub allowed: bool,
    pub reason: OriginReason,
}

impl OriginDecision {
    fn allow(reason: OriginReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: OriginReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Decides whether a declared `Origin` may receive cross-origin headers.
#[derive(Debug, Clone)]
pub struct OriginValidator {
    config: CorsConfig,
}

impl OriginValidator {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    pub fn allows_credentials(&self) -> bool {
        self.config.allow_credentials
    }

    /// First matching rule wins: blacklist, whitelist, subdomain matching,
    /// strict checks, then the permissive fallback.
    pub fn validate(&self, origin: Option<&str>) -> OriginDecision {
        let Some(raw) = origin else {
            return OriginDecision::allow(OriginReason::SameOrigin);
        };
        let origin = normalize(raw);

        if self.config.blacklist.contains(&origin) {
            tracing::warn!(origin = %origin, "🚫 Blacklisted origin rejected");
            return OriginDecision::deny(OriginReason::Blacklisted);
        }

        if self.config.whitelist.contains(&origin) {
            return OriginDecision::allow(OriginReason::Whitelisted);
        }

        let Some(url) = Url::parse(&origin).ok().filter(|u| u.host().is_some()) else {
            tracing::warn!(origin = %origin, "🚫 Malformed origin rejected");
            return OriginDecision::deny(OriginReason::Malformed);
        };

        if self.config.subdomain_matching && self.matches_base_domain(&url) {
            return OriginDecision::allow(OriginReason::SubdomainMatch);
        }

        if self.config.strict_mode {
            let loopback = self.config.allow_loopback && is_loopback(&url);
            if url.scheme() != "https" && !loopback {
                tracing::warn!(origin = %origin, "🚫 Non-HTTPS origin rejected in strict mode");
                return OriginDecision::deny(OriginReason::InsecureScheme);
            }
            if !loopback && is_suspicious_host(&url) {
                tracing::warn!(origin = %origin, "🚫 Suspicious origin host rejected");
                return OriginDecision::deny(OriginReason::SuspiciousHost);
            }
        }

        if self.config.permissive {
            tracing::info!(origin = %origin, "⚠️ Unknown origin allowed");
            OriginDecision::allow(OriginReason::UnknownAllowed)
        } else {
            tracing::warn!(origin = %origin, "🚫 Unknown origin blocked");
            OriginDecision::deny(OriginReason::UnknownBlocked)
        }
    }

    fn matches_base_domain(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        self.config.base_domains.iter().any(|base| {
            let base = base.trim_start_matches('.');
            host == base
                || host
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => d == "localhost",
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn is_suspicious_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => true,
        Some(Host::Domain(domain)) => {
            DISPOSABLE_TLDS.iter().any(|tld| domain.ends_with(tld))
                || NUMERIC_RUN_RE.is_match(domain)
        }
        None => true,
    }
}
