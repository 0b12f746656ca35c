//! Frame label rules
//!
//! Labels look like `"name (https://host/path.js:line:col)"`, or for code run
//! through eval, `"name (https://host/ line 7327 > injectedScript line 2 > eval:1:165)"`.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Prefix the profiler gives frames on the DOM API surface.
pub const DOM_MARKER: &str = "(DOM) ";

/// Frames injected by the automation tooling itself.
pub const AUTOMATION_MARKERS: &[&str] = &["pptr:internal", "pptr:evaluateHandle"];

/// Browser-internal and extension schemes; calls from these are UI chrome.
pub const INTERNAL_SCHEMES: &[&str] = &[
    "chrome://",
    "resource://",
    "moz-extension://",
    "chrome-extension://",
];

fn script_location() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((.+?)(?: .+)?(?::\d+:\d+)\)").expect("script location pattern")
    })
}

pub fn is_dom_call(label: &str) -> bool {
    label.starts_with(DOM_MARKER)
}

pub fn is_automation_frame(label: &str) -> bool {
    AUTOMATION_MARKERS.iter().any(|m| label.contains(m))
}

pub fn is_internal_url(url: &str) -> bool {
    INTERNAL_SCHEMES.iter().any(|s| url.starts_with(s))
}

/// The URL-looking prefix of a label's parenthesised location.
///
/// Strips the `:line:col` suffix and any ` line N > eval ...` chain. Labels
/// without a `:line:col` location yield `None`.
pub fn script_url_from_label(label: &str) -> Option<&str> {
    script_location()
        .captures(label)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

pub fn is_valid_url(candidate: &str) -> bool {
    Url::parse(candidate).is_ok()
}
