use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ::time::{format_description::well_known, OffsetDateTime};

/// One of the external data-gathering tools whose findings are merged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolName {
    #[serde(rename = "theHarvester")]
    TheHarvester,
    #[serde(rename = "amass")]
    Amass,
    #[serde(rename = "subfinder")]
    Subfinder,
}

impl ToolName {
    /// Tools a scan expects unless told otherwise.
    pub const DEFAULT: [ToolName; 2] = [ToolName::TheHarvester, ToolName::Amass];
    pub const KNOWN: [ToolName; 3] = [ToolName::TheHarvester, ToolName::Amass, ToolName::Subfinder];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::TheHarvester => "theHarvester",
            ToolName::Amass => "amass",
            ToolName::Subfinder => "subfinder",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::KNOWN
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tool: {s}"))
    }
}

/// Findings reported by a single tool run. Lists are kept as the tool emitted them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings {
    #[serde(default)]
    pub subdomains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub social_profiles: Vec<String>,
}

/// Deduplicated union of every tool's findings for one session.
///
/// Sets are ordered so that serialized output and printed tables are stable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinedResult {
    #[serde(default)]
    pub subdomains: BTreeSet<String>,
    #[serde(default)]
    pub ips: BTreeSet<String>,
    #[serde(default)]
    pub emails: BTreeSet<String>,
    #[serde(default)]
    pub social_profiles: BTreeSet<String>,
}

impl CombinedResult {
    /// Union `findings` into this result, field by field.
    pub fn absorb(&mut self, findings: &Findings) {
        self.subdomains.extend(findings.subdomains.iter().cloned());
        self.ips.extend(findings.ips.iter().cloned());
        self.emails.extend(findings.emails.iter().cloned());
        self.social_profiles
            .extend(findings.social_profiles.iter().cloned());
    }

    pub fn fields(&self) -> [(FindingKind, &BTreeSet<String>); 4] {
        [
            (FindingKind::Subdomain, &self.subdomains),
            (FindingKind::Ip, &self.ips),
            (FindingKind::Email, &self.emails),
            (FindingKind::SocialProfile, &self.social_profiles),
        ]
    }

    pub fn total(&self) -> usize {
        self.fields().iter().map(|(_, set)| set.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// The four categories of findings a tool can report.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Subdomain,
    #[serde(rename = "IP")]
    Ip,
    Email,
    #[serde(rename = "Social Profile")]
    SocialProfile,
}

impl FindingKind {
    pub fn label(self) -> &'static str {
        match self {
            FindingKind::Subdomain => "Subdomain",
            FindingKind::Ip => "IP",
            FindingKind::Email => "Email",
            FindingKind::SocialProfile => "Social Profile",
        }
    }
}

/// Initial client frame of a scan session. `scan_id` travels unchanged through every frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub domain: String,
    pub source: String,
    pub scan_id: String,
}

impl ScanRequest {
    /// Build a request with a freshly generated scan id.
    pub fn new(domain: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            source: source.into(),
            scan_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// One server frame: a tool's findings (or failure) plus the backend's union so far.
///
/// `source` is kept as a raw string so frames naming unknown tools still decode
/// and can be reported instead of failing the session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ToolFrame {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Findings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined: Option<CombinedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_completed: Option<usize>,
}

impl ToolFrame {
    pub fn result(source: ToolName, scan_id: &str, result: Findings) -> Self {
        Self {
            source: source.to_string(),
            result: Some(result),
            scan_id: Some(scan_id.to_string()),
            ..Self::default()
        }
    }

    pub fn failure(source: ToolName, scan_id: &str, error: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            scan_id: Some(scan_id.to_string()),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// RFC3339 UTC timestamp used for history records.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
