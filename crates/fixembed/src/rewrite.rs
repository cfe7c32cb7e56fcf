//! Link detection and rewriting.
//!
//! Everything here is pure: callers hand in the message text together with the
//! channel flag and the enabled-services set, and get back what to post.

use std::sync::OnceLock;

use regex::Regex;

use crate::service::{Service, ServiceSet};

/// Placeholder used when a subject token cannot be pulled out of a link.
pub const UNKNOWN_SUBJECT: &str = "Unknown";

/// Mirror hosts, keyed by the host a matched link starts with.
const HOST_REWRITES: &[(&str, &str)] = &[
    ("instagram.com", "ddinstagram.com"),
    ("twitter.com", "fxtwitter.com"),
    ("tiktok.com", "vxtiktok.com"),
    ("reddit.com", "rxddit.com"),
    ("x.com", "fixupx.com"),
];

static LINK_RE: OnceLock<Regex> = OnceLock::new();
static TWITTER_RE: OnceLock<Regex> = OnceLock::new();
static TIKTOK_VIDEO_RE: OnceLock<Regex> = OnceLock::new();
static TIKTOK_SHORT_RE: OnceLock<Regex> = OnceLock::new();
static INSTAGRAM_RE: OnceLock<Regex> = OnceLock::new();
static REDDIT_RE: OnceLock<Regex> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid regex pattern"))
}

/// Matches a whole supported link. Group 1 is everything after the scheme and
/// optional `www.`, starting at the service host.
fn link_regex() -> &'static Regex {
    compiled(
        &LINK_RE,
        r"https?://(?:www\.)?(twitter\.com/\w+/status/\d+|x\.com/\w+/status/\d+|tiktok\.com/@[^/\s]+/video/\d+|tiktok\.com/t/\w+|instagram\.com/(?:p|reel)/\w+|reddit\.com/r/\w+/comments/\w+/\w+)",
    )
}

/// A supported link found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMatch {
    pub service: Service,
    pub subject: String,
    pub original_url: String,
    pub rewritten_url: String,
}

impl LinkMatch {
    /// Human-readable label, e.g. `Twitter • alice`.
    pub fn label(&self) -> String {
        format!("{} • {}", self.service, self.subject)
    }
}

/// One reply to post in place of the original message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteAction {
    pub label: String,
    pub url: String,
}

impl RewriteAction {
    /// Reply body attributing the original author.
    pub fn reply_text(&self, author_id: u64) -> String {
        format!("[{}]({}) | Sent by <@{}>", self.label, self.url, author_id)
    }
}

impl From<LinkMatch> for RewriteAction {
    fn from(m: LinkMatch) -> Self {
        Self {
            label: m.label(),
            url: m.rewritten_url,
        }
    }
}

/// Find every supported link in `text`, in order of appearance. Duplicates are
/// reported once per occurrence.
pub fn scan(text: &str) -> Vec<LinkMatch> {
    link_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let original_url = caps.get(0)?.as_str();
            let target = caps.get(1)?.as_str();
            classify(original_url, target)
        })
        .collect()
}

/// Rewrites for the links in `text` that are allowed to fire. A disabled
/// channel short-circuits before any scanning happens.
pub fn rewrite_links(text: &str, channel_enabled: bool, services: &ServiceSet) -> Vec<RewriteAction> {
    if !channel_enabled || services.is_empty() {
        return Vec::new();
    }
    scan(text)
        .into_iter()
        .filter(|m| services.contains(m.service))
        .map(RewriteAction::from)
        .collect()
}

fn classify(original_url: &str, target: &str) -> Option<LinkMatch> {
    let (service, subject) = if target.starts_with("twitter.com/") || target.starts_with("x.com/") {
        (Service::Twitter, capture(&TWITTER_RE, r"(?:twitter\.com|x\.com)/(\w+)/status/\d+", target))
    } else if target.starts_with("tiktok.com/@") {
        (Service::TikTok, capture(&TIKTOK_VIDEO_RE, r"tiktok\.com/@([^/\s]+)/video/\d+", target))
    } else if target.starts_with("tiktok.com/t/") {
        (Service::TikTok, capture(&TIKTOK_SHORT_RE, r"tiktok\.com/t/(\w+)", target))
    } else if target.starts_with("instagram.com/") {
        (Service::Instagram, capture(&INSTAGRAM_RE, r"instagram\.com/(?:p|reel)/(\w+)", target))
    } else if target.starts_with("reddit.com/") {
        (Service::Reddit, capture(&REDDIT_RE, r"reddit\.com/r/(\w+)/comments", target))
    } else {
        return None;
    };

    Some(LinkMatch {
        service,
        subject: subject.unwrap_or_else(|| UNKNOWN_SUBJECT.to_string()),
        original_url: original_url.to_string(),
        rewritten_url: format!("https://{}", rewrite_host(target)),
    })
}

fn capture(cell: &'static OnceLock<Regex>, pattern: &str, target: &str) -> Option<String> {
    compiled(cell, pattern)
        .captures(target)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

/// Swap the leading host for its embed-friendly mirror. The path is never
/// touched, so a username containing a host name stays intact.
pub fn rewrite_host(target: &str) -> String {
    for (host, replacement) in HOST_REWRITES {
        if let Some(rest) = target.strip_prefix(host) {
            if rest.is_empty() || rest.starts_with('/') {
                return format!("{replacement}{rest}");
            }
        }
    }
    target.to_string()
}
