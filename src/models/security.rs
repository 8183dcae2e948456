use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Threat bucket derived from the accumulated risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..25 => ThreatLevel::Low,
            25..50 => ThreatLevel::Medium,
            50..80 => ThreatLevel::High,
            _ => ThreatLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named heuristic that fired for the request, with the points it added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskIndicator {
    pub name: &'static str,
    pub weight: u32,
}

/// Per-request security state written by the firewall and read downstream.
///
/// The score only ever grows within a request; [`SecurityContext::add_risk`]
/// is the single way to change it.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub request_id: String,
    risk_score: u32,
    threat_level: ThreatLevel,
    pub indicators: Vec<RiskIndicator>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub sanitized_body: Option<Value>,
    pub sanitized_query: HashMap<String, String>,
    pub sanitized_params: HashMap<String, String>,
    pub device_fingerprint: Option<String>,
}

impl SecurityContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    pub fn risk_score(&self) -> u32 {
        self.risk_score
    }

    pub fn threat_level(&self) -> ThreatLevel {
        self.threat_level
    }

    /// Records an indicator and raises the score by its weight.
    pub fn add_risk(&mut self, name: &'static str, weight: u32) {
        self.risk_score = self.risk_score.saturating_add(weight);
        self.threat_level = ThreatLevel::from_score(self.risk_score);
        self.indicators.push(RiskIndicator { name, weight });
    }

    pub fn has_indicator(&self, name: &str) -> bool {
        self.indicators.iter().any(|i| i.name == name)
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.blocked = true;
        self.block_reason = Some(reason.into());
    }
}

/// Severity of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Subsystem a security event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Authentication,
    Authorization,
    Session,
    Firewall,
    Cors,
    RateLimit,
    SystemIntegrity,
}

/// A structured security event handed to the event logger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub level: EventLevel,
    pub category: EventCategory,
    pub event: String,
    pub description: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub risk_score: Option<u32>,
    pub threat_level: Option<ThreatLevel>,
    pub indicators: Vec<String>,
}

impl SecurityEvent {
    pub fn new(
        level: EventLevel,
        category: EventCategory,
        event: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            level,
            category,
            event: event.into(),
            description: description.into(),
            user_id: None,
            ip: None,
            path: None,
            method: None,
            risk_score: None,
            threat_level: None,
            indicators: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_request(mut self, method: &str, path: &str, ip: &str) -> Self {
        self.method = Some(method.to_string());
        self.path = Some(path.to_string());
        self.ip = Some(ip.to_string());
        self
    }

    pub fn with_security(mut self, ctx: &SecurityContext) -> Self {
        self.risk_score = Some(ctx.risk_score());
        self.threat_level = Some(ctx.threat_level());
        self.indicators = ctx.indicators.iter().map(|i| i.name.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_levels_are_exact_at_boundaries() {
        let cases = [
            (0, ThreatLevel::Low),
            (24, ThreatLevel::Low),
            (25, ThreatLevel::Medium),
            (49, ThreatLevel::Medium),
            (50, ThreatLevel::High),
            (79, ThreatLevel::High),
            (80, ThreatLevel::Critical),
            (u32::MAX, ThreatLevel::Critical),
        ];
        for (score, level) in cases {
            assert_eq!(ThreatLevel::from_score(score), level, "score {}", score);
        }
    }

    #[test]
    fn risk_only_accumulates() {
        let mut ctx = SecurityContext::new("req");
        let mut previous = ctx.risk_score();
        for (name, weight) in [("a", 10), ("b", 0), ("c", 15), ("d", 30), ("e", 40)] {
            ctx.add_risk(name, weight);
            assert!(ctx.risk_score() >= previous);
            assert_eq!(ctx.threat_level(), ThreatLevel::from_score(ctx.risk_score()));
            previous = ctx.risk_score();
        }
        assert_eq!(ctx.risk_score(), 95);
        assert_eq!(ctx.threat_level(), ThreatLevel::Critical);
        assert!(ctx.has_indicator("d"));
    }
}
