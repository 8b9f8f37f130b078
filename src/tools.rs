use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use crate::types::{Findings, ToolName};

/// A data-gathering tool the backend runs for each scan.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    fn name(&self) -> ToolName;

    /// Run against `domain`. `source` is only meaningful for tools that take a data source.
    async fn run(&self, domain: &str, source: &str) -> Result<Findings>;
}

/// Passive amass enumeration.
#[derive(Debug, Clone)]
pub struct Amass {
    pub binary: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl ToolRunner for Amass {
    fn name(&self) -> ToolName {
        ToolName::Amass
    }

    async fn run(&self, domain: &str, _source: &str) -> Result<Findings> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["enum", "-d", domain, "-passive", "-norecursive"]);
        let stdout = run_capture(cmd, self.timeout, false).await?;
        Ok(parse_amass_output(domain, &stdout))
    }
}

/// theHarvester against a single data source.
#[derive(Debug, Clone)]
pub struct TheHarvester {
    pub binary: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl ToolRunner for TheHarvester {
    fn name(&self) -> ToolName {
        ToolName::TheHarvester
    }

    async fn run(&self, domain: &str, source: &str) -> Result<Findings> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-d", domain, "-b", source]);
        let stdout = run_capture(cmd, self.timeout, true).await?;
        Ok(parse_harvester_output(&stdout))
    }
}

/// Passive subfinder enumeration. Not part of the default tool set.
#[derive(Debug, Clone)]
pub struct Subfinder {
    pub binary: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl ToolRunner for Subfinder {
    fn name(&self) -> ToolName {
        ToolName::Subfinder
    }

    async fn run(&self, domain: &str, _source: &str) -> Result<Findings> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-d", domain, "-silent"]);
        let stdout = run_capture(cmd, self.timeout, false).await?;
        Ok(parse_subfinder_output(domain, &stdout))
    }
}

/// Spawn `cmd`, wait up to `timeout`, and return stdout as lossy UTF-8.
///
/// The child is killed if the future is dropped or times out.
async fn run_capture(mut cmd: Command, timeout: Duration, log_stderr: bool) -> Result<String> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if log_stderr { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res.with_context(|| format!("failed to wait for {program}"))?,
        Err(_) => bail!("{program} timed out after {}s", timeout.as_secs()),
    };

    if log_stderr && !output.stderr.is_empty() {
        warn!(program = %program, stderr = %String::from_utf8_lossy(&output.stderr), "tool stderr");
    }
    if !output.status.success() && output.stdout.is_empty() {
        bail!("{program} exited with {}", output.status);
    }
    debug!(program = %program, bytes = output.stdout.len(), "tool finished");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn parse_amass_output(domain: &str, stdout: &str) -> Findings {
    subdomain_lines(domain, stdout)
}

pub fn parse_subfinder_output(domain: &str, stdout: &str) -> Findings {
    subdomain_lines(domain, stdout)
}

/// Keep lines that name a subdomain of `domain`.
fn subdomain_lines(domain: &str, stdout: &str) -> Findings {
    let suffix = format!(".{domain}");
    Findings {
        subdomains: stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with(&suffix))
            .map(str::to_string)
            .collect(),
        ..Findings::default()
    }
}

#[derive(Clone, Copy)]
enum Section {
    Hosts,
    Ips,
    Emails,
    People,
}

/// Parse theHarvester's sectioned report.
///
/// Host lines of the form `host:ip` contribute to both subdomains and IPs.
pub fn parse_harvester_output(stdout: &str) -> Findings {
    let mut out = Findings::default();
    let mut section: Option<Section> = None;

    for raw in stdout.lines() {
        let line = raw.trim();
        if line.is_empty() || line.chars().all(|c| c == '-' || c == '=') {
            continue;
        }

        if line.starts_with("[*] Hosts found:") {
            section = Some(Section::Hosts);
        } else if line.starts_with("[*] IPs found:") {
            section = Some(Section::Ips);
        } else if line.starts_with("[*] Emails found:") {
            section = Some(Section::Emails);
        } else if line.starts_with("[*] people found:") {
            section = Some(Section::People);
        } else if line.starts_with("[*]") || line.starts_with("Target") {
            section = None;
        } else if let Some(current) = section {
            match current {
                Section::Hosts => match line.split_once(':') {
                    Some((host, ip)) => {
                        out.subdomains.push(host.trim().to_string());
                        out.ips.push(ip.trim().to_string());
                    }
                    None => out.subdomains.push(line.to_string()),
                },
                Section::Ips => out.ips.push(line.to_string()),
                Section::Emails => out.emails.push(line.to_string()),
                Section::People => out.social_profiles.push(line.to_string()),
            }
        }
    }
    out
}
