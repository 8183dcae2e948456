//! Stateless input cleaning.
//!
//! Every function here is pure and safe to call from any task. Validation
//! style helpers reject to an empty string instead of failing.

use std::collections::HashSet;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, Result};

/// Default cap for free text.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 10_000;
/// Default recursion cap for [`sanitize_object`].
pub const DEFAULT_MAX_DEPTH: usize = 10;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static SCRIPT_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script regex")
});
static STYLE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid style regex")
});
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)([^>]*)>").expect("valid html tag regex")
});
static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});
static SAFE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:https?|mailto|tel):|[^a-z]|[a-z+.\-]+(?:[^a-z+.\-:]|$))")
        .expect("valid url scheme regex")
});
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9](?:[a-z0-9\-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9\-]*[a-z0-9])?)*\.[a-z]{2,}$")
        .expect("valid email regex")
});
static INLINE_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("valid whitespace regex"));
static ANY_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static NEWLINE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));
static SPACE_AROUND_NEWLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" ?\n ?").expect("valid newline regex"));

/// Options for [`sanitize_text`].
#[derive(Debug, Clone, Copy)]
pub struct TextOptions {
    pub max_length: usize,
    pub allow_newlines: bool,
    pub strip_html: bool,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_TEXT_LENGTH,
            allow_newlines: false,
            strip_html: true,
        }
    }
}

/// Strips markup and control characters, collapses whitespace and truncates.
pub fn sanitize_text(input: &str, options: TextOptions) -> String {
    if input.is_empty() {
        return String::new();
    }

    let stripped = if options.strip_html {
        TAG_RE.replace_all(input, "").into_owned()
    } else {
        input.to_string()
    };

    let normalized = stripped.replace("\r\n", "\n");
    let cleaned: String = normalized
        .chars()
        .filter_map(|c| match c {
            '\n' | '\t' | '\r' if options.allow_newlines => {
                Some(if c == '\r' { '\n' } else { c })
            }
            '\n' | '\t' | '\r' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    let collapsed = if options.allow_newlines {
        let inline = INLINE_SPACE_RE.replace_all(&cleaned, " ");
        let trimmed_lines = SPACE_AROUND_NEWLINE_RE.replace_all(&inline, "\n");
        NEWLINE_RUN_RE.replace_all(&trimmed_lines, "\n\n").into_owned()
    } else {
        ANY_SPACE_RE.replace_all(&cleaned, " ").into_owned()
    };

    truncate_chars(collapsed.trim(), options.max_length)
        .trim_end()
        .to_string()
}

/// Text sanitization with the default options.
pub fn clean_text(input: &str) -> String {
    sanitize_text(input, TextOptions::default())
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Allow-lists for [`sanitize_html`].
#[derive(Debug, Clone)]
pub struct HtmlPolicy {
    pub allowed_tags: HashSet<String>,
    pub allowed_attrs: HashSet<String>,
}

impl Default for HtmlPolicy {
    fn default() -> Self {
        let tags = [
            "b", "i", "em", "strong", "u", "p", "br", "ul", "ol", "li", "a", "code", "pre",
            "blockquote", "h1", "h2", "h3", "h4", "h5", "h6", "span",
        ];
        let attrs = ["href", "title", "target", "rel"];
        Self {
            allowed_tags: tags.iter().map(|t| t.to_string()).collect(),
            allowed_attrs: attrs.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Removes every tag and attribute outside the allow-list. URL attributes must
/// use an allow-listed scheme. Alterations are logged, never treated as errors.
pub fn sanitize_html(input: &str, policy: &HtmlPolicy) -> String {
    if input.is_empty() {
        return String::new();
    }

    let without_blocks = SCRIPT_BLOCK_RE.replace_all(input, "");
    let without_blocks = STYLE_BLOCK_RE.replace_all(&without_blocks, "");

    let rebuilt = HTML_TAG_RE.replace_all(&without_blocks, |caps: &regex::Captures<'_>| {
        let closing = !caps[1].is_empty();
        let tag = caps[2].to_ascii_lowercase();

        if !policy.allowed_tags.contains(&tag) {
            return String::new();
        }
        if closing {
            return format!("</{}>", tag);
        }

        let mut out = format!("<{}", tag);
        for attr in ATTR_RE.captures_iter(&caps[3]) {
            let name = attr[1].to_ascii_lowercase();
            if name.starts_with("on") || !policy.allowed_attrs.contains(&name) {
                continue;
            }
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if is_url_attribute(&name) && !is_safe_url(value) {
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", name, escape_attribute(value)));
        }
        if caps[3].trim_end().ends_with('/') {
            out.push_str(" /");
        }
        out.push('>');
        out
    });

    let result = rebuilt.into_owned();
    if result != input {
        tracing::debug!(
            original_len = input.len(),
            sanitized_len = result.len(),
            "HTML content was sanitized"
        );
    }
    result
}

/// Browsers drop whitespace and C0 controls anywhere in a URL before reading
/// its scheme, and decode character references, so the scheme is checked on
/// the value with those removed. A reference ahead of the first `:` could hide
/// the scheme and is rejected outright.
fn is_safe_url(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_ascii_control())
        .collect();
    let head = compact.split(':').next().unwrap_or_default();
    if compact.contains(':') && head.contains('&') {
        return false;
    }
    SAFE_URL_RE.is_match(&compact)
}

fn is_url_attribute(name: &str) -> bool {
    matches!(name, "href" | "src" | "action" | "formaction" | "xlink:href")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Lowercases and validates an email address; invalid input becomes `""`.
pub fn sanitize_email(input: &str) -> String {
    let candidate = input.trim().to_ascii_lowercase();
    if candidate.len() > 254 || !EMAIL_RE.is_match(&candidate) {
        return String::new();
    }
    candidate
}

/// Accepts only absolute `http`/`https` URLs, normalized; everything else becomes `""`.
/// Stricter than the links [`sanitize_html`] keeps: `mailto:` and `tel:` are
/// rejected here.
pub fn sanitize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.len() > 2048 {
        return String::new();
    }
    match url::Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {
            url.to_string()
        }
        _ => String::new(),
    }
}

/// Reduces a file name to a safe basename of `[A-Za-z0-9._-]`.
pub fn sanitize_file_name(input: &str) -> String {
    let base = input
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let mut cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", ".");
    }
    let cleaned = cleaned.trim_start_matches('.');
    truncate_chars(cleaned, 255).to_string()
}

/// Parses and re-renders an IP address; anything unparsable becomes `""`.
pub fn sanitize_ip_address(input: &str) -> String {
    input
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

/// Field-name classification for [`sanitize_object`].
#[derive(Debug, Clone, Default)]
pub struct SanitizationRules {
    pub text_fields: HashSet<String>,
    pub html_fields: HashSet<String>,
    pub email_fields: HashSet<String>,
    pub url_fields: HashSet<String>,
    pub text_options: TextOptions,
    pub html_policy: HtmlPolicy,
}

impl SanitizationRules {
    fn classify(&self, field: &str, value: &str) -> String {
        if self.html_fields.contains(field) {
            sanitize_html(value, &self.html_policy)
        } else if self.email_fields.contains(field) {
            sanitize_email(value)
        } else if self.url_fields.contains(field) {
            sanitize_url(value)
        } else {
            sanitize_text(value, self.text_options)
        }
    }
}

/// Recursively sanitizes string leaves by field name. Subtrees deeper than
/// `max_depth` are returned unmodified.
pub fn sanitize_object(value: &Value, rules: &SanitizationRules, max_depth: usize) -> Value {
    sanitize_value(value, None, rules, 0, max_depth)
}

fn sanitize_value(
    value: &Value,
    field: Option<&str>,
    rules: &SanitizationRules,
    depth: usize,
    max_depth: usize,
) -> Value {
    if depth > max_depth {
        return value.clone();
    }
    match value {
        Value::String(s) => Value::String(match field {
            Some(name) => rules.classify(name, s),
            None => sanitize_text(s, rules.text_options),
        }),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, field, rules, depth + 1, max_depth))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    (
                        key.clone(),
                        sanitize_value(item, Some(key), rules, depth + 1, max_depth),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rejects content whose leading bytes look executable or scripted, whatever
/// its declared MIME type. `text/*` content is additionally text-sanitized.
pub fn sanitize_file_content(content: &[u8], mime_type: &str) -> Result<Vec<u8>> {
    if let Some(kind) = dangerous_signature(content) {
        tracing::warn!(
            mime_type = %mime_type,
            signature = kind,
            "⚠️ Rejected file content with dangerous signature"
        );
        return Err(AppError::Validation(format!(
            "File content rejected: {} signature",
            kind
        )));
    }

    if mime_type.trim().to_ascii_lowercase().starts_with("text/") {
        let text = String::from_utf8_lossy(content);
        let cleaned = sanitize_text(
            &text,
            TextOptions {
                max_length: usize::MAX,
                allow_newlines: true,
                strip_html: true,
            },
        );
        return Ok(cleaned.into_bytes());
    }

    Ok(content.to_vec())
}

fn dangerous_signature(content: &[u8]) -> Option<&'static str> {
    if infer::app::is_exe(content) || infer::app::is_dll(content) {
        return Some("windows executable");
    }
    if infer::app::is_elf(content) {
        return Some("elf executable");
    }
    if infer::app::is_mach(content) {
        return Some("mach-o executable");
    }
    if infer::app::is_java(content) || infer::app::is_dex(content) {
        return Some("bytecode");
    }

    let head = &content[..content.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let lead = text.trim_start_matches(['\u{feff}', ' ', '\t', '\r', '\n']);
    let lower = lead.to_ascii_lowercase();

    if content.starts_with(b"\x7fELF") {
        return Some("elf executable");
    }
    if lead.starts_with("MZ") {
        return Some("windows executable");
    }
    if lower.starts_with("#!") {
        return Some("shebang script");
    }
    if lower.starts_with("<script") || lower.starts_with("<?php") || lower.starts_with("<%") {
        return Some("script preamble");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_strips_markup_and_controls() {
        assert_eq!(
            clean_text("  <b>Hello</b>\u{0007}   <i>world</i>\n\tagain "),
            "Hello world again"
        );
        assert_eq!(clean_text(""), "");

        let multi = sanitize_text(
            "line one  \r\n\n\n\nline\ttwo",
            TextOptions {
                allow_newlines: true,
                ..TextOptions::default()
            },
        );
        assert_eq!(multi, "line one\n\nline two");
    }

    #[test]
    fn text_truncates_on_char_boundaries() {
        let out = sanitize_text(
            "héllo wörld",
            TextOptions {
                max_length: 6,
                ..TextOptions::default()
            },
        );
        assert_eq!(out, "héllo");
    }

    #[test]
    fn text_sanitization_is_idempotent() {
        let samples = [
            "plain",
            "  spaced   out  ",
            "<<a>script>alert(1)</script>",
            "a<b",
            "tab\tand\nnewline\r\n\r\nend",
            "ctrl\u{0000}\u{001b}[31mred",
            "<div><p>nested <em>tags</em></p></div>",
            "unicode ünïcødé \u{200b} zero width",
            "truncate me at some point please",
        ];
        for allow_newlines in [false, true] {
            for max_length in [5, 12, DEFAULT_MAX_TEXT_LENGTH] {
                let options = TextOptions {
                    max_length,
                    allow_newlines,
                    strip_html: true,
                };
                for sample in samples {
                    let once = sanitize_text(sample, options);
                    assert_eq!(sanitize_text(&once, options), once, "{:?}", sample);
                }
            }
        }
    }

    #[test]
    fn html_keeps_only_allow_listed_markup() {
        let policy = HtmlPolicy::default();
        let out = sanitize_html(
            r#"<p onclick="steal()">Hi <a href="javascript:alert(1)" title="t">x</a><script>bad()</script><a href="https://ok.example/">ok</a><iframe src="x"></iframe></p>"#,
            &policy,
        );
        assert_eq!(
            out,
            r#"<p>Hi <a title="t">x</a><a href="https://ok.example/">ok</a></p>"#
        );

        for payload in [
            "<a href=\"java\tscript:alert(1)\">x</a>",
            "<a href=\"\u{1}javascript:alert(1)\">x</a>",
            "<a href=\"java\nscript:alert(1)\">x</a>",
            "<a href=\"java&#9;script:alert(1)\">x</a>",
            "<a href=\"&#106;avascript:alert(1)\">x</a>",
        ] {
            assert_eq!(sanitize_html(payload, &policy), "<a>x</a>", "{:?}", payload);
        }
        assert_eq!(
            sanitize_html(r#"<a href="/search?q=a&b=c">x</a>"#, &policy),
            r#"<a href="/search?q=a&amp;b=c">x</a>"#
        );
    }

    #[test]
    fn html_allows_mailto_and_tel() {
        let policy = HtmlPolicy::default();
        assert_eq!(
            sanitize_html(r#"<a href="mailto:a@b.co">m</a>"#, &policy),
            r#"<a href="mailto:a@b.co">m</a>"#
        );
        assert_eq!(
            sanitize_html(r#"<a href="tel:+123">t</a>"#, &policy),
            r#"<a href="tel:+123">t</a>"#
        );
    }

    #[test]
    fn validators_reject_to_empty() {
        assert_eq!(sanitize_email(" Ada@Example.COM "), "ada@example.com");
        assert_eq!(sanitize_email("not-an-email"), "");
        assert_eq!(sanitize_url("https://example.com/a b"), "https://example.com/a%20b");
        assert_eq!(sanitize_url("javascript:alert(1)"), "");
        assert_eq!(sanitize_url("ftp://example.com"), "");
        assert_eq!(sanitize_url("mailto:a@b.co"), "");
        assert_eq!(sanitize_url("tel:+123"), "");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\evil..name?.txt"), "evil.name_.txt");
        assert_eq!(sanitize_ip_address(" 10.0.0.1 "), "10.0.0.1");
        assert_eq!(sanitize_ip_address("10.0.0.300"), "");
    }

    #[test]
    fn object_sanitization_classifies_fields() {
        let rules = SanitizationRules {
            html_fields: ["bio".to_string()].into(),
            email_fields: ["email".to_string()].into(),
            url_fields: ["site".to_string()].into(),
            ..SanitizationRules::default()
        };
        let out = sanitize_object(
            &json!({
                "name": " <b>Ada</b> ",
                "email": "ADA@EXAMPLE.COM",
                "site": "javascript:void(0)",
                "bio": "<em>hi</em><script>x</script>",
                "age": 36,
                "tags": ["<i>a</i>", "b"]
            }),
            &rules,
            DEFAULT_MAX_DEPTH,
        );
        assert_eq!(out["name"], "Ada");
        assert_eq!(out["email"], "ada@example.com");
        assert_eq!(out["site"], "");
        assert_eq!(out["bio"], "<em>hi</em>");
        assert_eq!(out["age"], 36);
        assert_eq!(out["tags"], json!(["a", "b"]));
    }

    #[test]
    fn object_sanitization_stops_at_max_depth() {
        let mut nested = json!("<b>deep</b>");
        for _ in 0..50 {
            nested = json!({ "child": nested });
        }
        let out = sanitize_object(&nested, &SanitizationRules::default(), 3);

        let mut cursor = &out;
        let mut expected = &nested;
        for _ in 0..3 {
            cursor = &cursor["child"];
            expected = &expected["child"];
        }
        assert_eq!(cursor, expected);

        let shallow = sanitize_object(&json!({"a": {"b": "<b>x</b>"}}), &SanitizationRules::default(), 3);
        assert_eq!(shallow["a"]["b"], "x");
    }

    #[test]
    fn file_content_rejects_dangerous_preambles() {
        assert!(sanitize_file_content(b"MZ\x90\x00\x03\x00\x00\x00", "image/png").is_err());
        assert!(sanitize_file_content(b"\x7fELF\x02\x01\x01\x00", "application/pdf").is_err());
        let class_file = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x34, 0x00, 0x1d];
        assert!(sanitize_file_content(&class_file, "application/octet-stream").is_err());
        assert!(sanitize_file_content(b"  <script>alert(1)</script>", "text/plain").is_err());
        assert!(sanitize_file_content(b"#!/bin/sh\nrm -rf /", "text/plain").is_err());

        let cleaned = sanitize_file_content(b"hello <b>world</b>\n", "text/plain").unwrap();
        assert_eq!(cleaned, b"hello world");

        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        assert_eq!(sanitize_file_content(&png, "image/png").unwrap(), png.to_vec());
    }
}
