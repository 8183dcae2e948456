//! Request heuristics used by the firewall: client IP resolution, user-agent
//! scoring, suspicious pattern detection and device fingerprinting.

use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, Method};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::models::security::SecurityContext;

pub const SUSPICIOUS_IP_WEIGHT: u32 = 30;

pub const UA_MISSING_WEIGHT: u32 = 20;
pub const UA_BOT_WEIGHT: u32 = 10;
pub const UA_TOOL_WEIGHT: u32 = 15;
pub const UA_SCANNER_WEIGHT: u32 = 40;
pub const UA_SHORT_WEIGHT: u32 = 10;
pub const UA_LONG_WEIGHT: u32 = 10;

const UA_MIN_LENGTH: usize = 10;
const UA_MAX_LENGTH: usize = 512;

/// Headers consulted for the client address, most trusted first.
pub const CLIENT_IP_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
    "true-client-ip",
];

/// Named request patterns and the risk they add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspiciousPattern {
    AdminPathProbe,
    ScriptExtensionRequest,
    PathTraversalAttempt,
    SqlInjectionAttempt,
    XssAttempt,
    CodeExecutionAttempt,
    UnusualHttpMethod,
}

impl SuspiciousPattern {
    pub fn name(self) -> &'static str {
        match self {
            SuspiciousPattern::AdminPathProbe => "admin_path_probe",
            SuspiciousPattern::ScriptExtensionRequest => "script_extension_request",
            SuspiciousPattern::PathTraversalAttempt => "path_traversal_attempt",
            SuspiciousPattern::SqlInjectionAttempt => "sql_injection_attempt",
            SuspiciousPattern::XssAttempt => "xss_attempt",
            SuspiciousPattern::CodeExecutionAttempt => "code_execution_attempt",
            SuspiciousPattern::UnusualHttpMethod => "unusual_http_method",
        }
    }

    pub fn weight(self) -> u32 {
        match self {
            SuspiciousPattern::AdminPathProbe => 15,
            SuspiciousPattern::ScriptExtensionRequest => 10,
            SuspiciousPattern::PathTraversalAttempt => 30,
            SuspiciousPattern::SqlInjectionAttempt => 35,
            SuspiciousPattern::XssAttempt => 30,
            SuspiciousPattern::CodeExecutionAttempt => 40,
            SuspiciousPattern::UnusualHttpMethod => 20,
        }
    }
}

const CONTENT_PATTERNS: [SuspiciousPattern; 6] = [
    SuspiciousPattern::AdminPathProbe,
    SuspiciousPattern::ScriptExtensionRequest,
    SuspiciousPattern::PathTraversalAttempt,
    SuspiciousPattern::SqlInjectionAttempt,
    SuspiciousPattern::XssAttempt,
    SuspiciousPattern::CodeExecutionAttempt,
];

static PATH_PATTERNS: Lazy<[Regex; 6]> = Lazy::new(|| {
    [
        r"(?i)/(?:wp-admin|wp-login|phpmyadmin|administrator|admin\.php|\.env|\.git/|server-status|cgi-bin)",
        r"(?i)\.(?:php\d?|asp|aspx|jsp|cgi|pl|sh|bat|exe)(?:$|[?/#])",
        r"(?i)(?:\.\./|\.\.\\|%2e%2e(?:%2f|/|%5c)|\.\.%2f|\.\.%5c)",
        r"(?i)(?:\bunion\b[\s+/*]+(?:all[\s+/*]+)?select\b|\bor\b[\s+]+1\s*=\s*1|'\s*or\s*'|;\s*drop\s+table|\bsleep\s*\(|\bbenchmark\s*\(|--\s*$)",
        r"(?i)(?:<script|%3cscript|javascript:|\bon(?:error|load|click|mouseover)\s*=|<iframe|%3ciframe)",
        r"(?i)(?:\beval\s*\(|\bexec\s*\(|\bsystem\s*\(|`[^`]*`|\$\(|;\s*(?:cat|ls|rm|wget|curl|nc)\s|\|\s*(?:sh|bash)\b|/bin/(?:sh|bash))",
    ]
    .map(|p| Regex::new(p).expect("valid suspicious pattern"))
});

static BOT_UA: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"(?i)\bbot\b", r"(?i)crawler", r"(?i)spider", r"(?i)slurp", r"(?i)bot/"])
        .expect("valid bot patterns")
});
static TOOL_UA: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^curl/",
        r"(?i)^wget/",
        r"(?i)python-requests",
        r"(?i)python-urllib",
        r"(?i)^go-http-client",
        r"(?i)^java/",
        r"(?i)libwww-perl",
        r"(?i)httpie",
        r"(?i)postmanruntime",
    ])
    .expect("valid tool patterns")
});
static SCANNER_UA: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)sqlmap",
        r"(?i)nikto",
        r"(?i)nmap",
        r"(?i)masscan",
        r"(?i)acunetix",
        r"(?i)nessus",
        r"(?i)burp",
        r"(?i)dirbuster",
        r"(?i)gobuster",
        r"(?i)wpscan",
        r"(?i)zgrab",
    ])
    .expect("valid scanner patterns")
});

/// Resolves the client address from proxy headers, ignoring non-public
/// addresses, and falls back to the transport peer.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in CLIENT_IP_HEADERS {
        let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let candidate = value.split(',').next().unwrap_or_default().trim();
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            if is_public(&ip) {
                return ip.to_string();
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// Scores the user agent. Never blocks on its own.
pub fn score_user_agent(user_agent: Option<&str>, ctx: &mut SecurityContext) {
    let Some(ua) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
        ctx.add_risk("missing_user_agent", UA_MISSING_WEIGHT);
        return;
    };

    if SCANNER_UA.is_match(ua) {
        ctx.add_risk("scanner_user_agent", UA_SCANNER_WEIGHT);
    } else if TOOL_UA.is_match(ua) {
        ctx.add_risk("tool_user_agent", UA_TOOL_WEIGHT);
    } else if BOT_UA.is_match(ua) {
        ctx.add_risk("bot_user_agent", UA_BOT_WEIGHT);
    }

    let len = ua.chars().count();
    if len < UA_MIN_LENGTH {
        ctx.add_risk("short_user_agent", UA_SHORT_WEIGHT);
    } else if len > UA_MAX_LENGTH {
        ctx.add_risk("long_user_agent", UA_LONG_WEIGHT);
    }
}

/// Matches the raw path, query and header values against the named patterns.
/// Each pattern counts at most once per request.
pub fn detect_patterns(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Vec<SuspiciousPattern> {
    let mut haystacks: Vec<String> = vec![path.to_string()];
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        haystacks.push(q.to_string());
        for (key, value) in url::form_urlencoded::parse(q.as_bytes()) {
            haystacks.push(format!("{}={}", key, value));
        }
    }
    for (name, value) in headers {
        if matches!(name.as_str(), "cookie" | "authorization" | "user-agent") {
            continue;
        }
        if let Ok(v) = value.to_str() {
            haystacks.push(v.to_string());
        }
    }

    let mut found = Vec::new();
    for (pattern, regex) in CONTENT_PATTERNS.iter().zip(PATH_PATTERNS.iter()) {
        // Admin probes and script extensions only make sense on the path.
        let scope: &[String] = match pattern {
            SuspiciousPattern::AdminPathProbe | SuspiciousPattern::ScriptExtensionRequest => {
                &haystacks[..1]
            }
            _ => &haystacks,
        };
        if scope.iter().any(|h| regex.is_match(h)) {
            found.push(*pattern);
        }
    }

    if !is_common_method(method) {
        found.push(SuspiciousPattern::UnusualHttpMethod);
    }
    found
}

fn is_common_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::POST
            | Method::PUT
            | Method::PATCH
            | Method::DELETE
            | Method::HEAD
            | Method::OPTIONS
    )
}

/// Stable device fingerprint from (user agent, ip, accept-language).
pub fn device_fingerprint(user_agent: &str, ip: &str, language: &str) -> String {
    let material = format!("{}|{}|{}", user_agent, ip, language);
    let mut hex = blake3::hash(material.as_bytes()).to_hex().to_string();
    hex.truncate(32);
    hex
}

/// Human readable device label, e.g. "Chrome on Windows".
pub fn device_name(user_agent: &str) -> String {
    let ua = user_agent.to_ascii_lowercase();

    let browser = if ua.contains("edg/") {
        "Edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("firefox/") {
        "Firefox"
    } else if ua.contains("chrome/") || ua.contains("crios/") {
        "Chrome"
    } else if ua.contains("safari/") {
        "Safari"
    } else if ua.contains("curl/") {
        "curl"
    } else {
        "Unknown browser"
    };

    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("iphone") || ua.contains("ipad") {
        "iOS"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Unknown OS"
    };

    format!("{} on {}", browser, os)
}
