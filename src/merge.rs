use std::collections::{BTreeMap, HashSet};

use crate::session::ToolState;
use crate::types::{CombinedResult, Findings, ToolName};

/// Combine every reported tool result into one deduplicated result.
///
/// Tools that have not reported contribute nothing; with no reports the result
/// is all-empty. Values are compared by exact string equality.
pub fn merge(tools: &BTreeMap<ToolName, ToolState>) -> CombinedResult {
    merge_findings(tools.values().filter_map(|t| t.result.as_ref()))
}

/// Union an arbitrary sequence of findings. Order of the input does not matter.
pub fn merge_findings<'a>(findings: impl IntoIterator<Item = &'a Findings>) -> CombinedResult {
    let mut combined = CombinedResult::default();
    for f in findings {
        combined.absorb(f);
    }
    combined
}

/// Trim entries, drop empty ones and deduplicate, keeping first-seen order.
///
/// Applied by the backend to raw tool output before it is streamed.
pub fn clean_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let v = item.as_ref().trim();
        if v.is_empty() {
            continue;
        }
        if seen.insert(v.to_string()) {
            out.push(v.to_string());
        }
    }
    out
}

/// Clean every list of a tool's findings.
pub fn clean_findings(findings: Findings) -> Findings {
    Findings {
        subdomains: clean_list(findings.subdomains),
        ips: clean_list(findings.ips),
        emails: clean_list(findings.emails),
        social_profiles: clean_list(findings.social_profiles),
    }
}
