use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::ScanError;

/// theHarvester data sources offered for a scan.
pub const SOURCES: &[&str] = &[
    "bing",
    "baidu",
    "brave",
    "duckduckgo",
    "crtsh",
    "hackertarget",
    "otx",
    "rapiddns",
    "sitedossier",
    "subdomainfinderc99",
    "threatminer",
    "urlscan",
];

pub const DEFAULT_SOURCE: &str = "bing";

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9-]{1,63}\.)+[a-zA-Z]{2,}$").expect("domain pattern compiles")
});

/// Pull a bare host out of user input.
///
/// Accepts plain hosts (`example.com`), URLs (`https://www.example.com/path`)
/// and hosts with ports. A leading `www.` is dropped.
pub fn extract_domain(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let with_scheme = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("https://{input}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    Some(host.to_string())
}

/// Hostname syntax check: dotted labels, alphabetic TLD, no leading hyphen.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.starts_with('-') && DOMAIN_RE.is_match(domain)
}

/// Turn user input into a scan-ready domain, or reject it.
pub fn normalize_target(input: &str) -> Result<String, ScanError> {
    match extract_domain(input) {
        Some(d) if is_valid_domain(&d) => Ok(d),
        _ => Err(ScanError::InvalidDomain(input.trim().to_string())),
    }
}

pub fn validate_source(source: &str) -> Result<&'static str, ScanError> {
    SOURCES
        .iter()
        .copied()
        .find(|s| *s == source)
        .ok_or_else(|| ScanError::InvalidSource(source.to_string()))
}
