use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;

use recon_stream::client::{PersistOutcome, SessionReport, StreamClient, WsTransport};
use recon_stream::config::{ServerConfig, SessionConfig};
use recon_stream::export::{export_rows, write_export};
use recon_stream::history::{FileHistory, HistoryEntry, HistoryStore, HttpHistory, PersistenceBridge};
use recon_stream::session::SessionStatus;
use recon_stream::target::{self, DEFAULT_SOURCE};
use recon_stream::types::{ScanRequest, ToolName};
use recon_stream::{logging, server};

/// recon-stream: run theHarvester and amass against a domain and watch their findings merge live.
#[derive(Debug, Parser)]
#[command(
    name = "recon-stream",
    version,
    about = "Run theHarvester and amass against a domain and watch their findings merge live.",
    long_about = None
)]
struct Cli {
    /// Log level used when neither RUST_LOG nor RECON_STREAM_LOG is set.
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a domain through a running backend.
    Scan(ScanArgs),
    /// Run the backend: scan stream plus history API.
    Serve(ServeArgs),
    /// Inspect or prune stored scans.
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(Debug, Clone, Args)]
struct HistoryTarget {
    /// Base URL of the backend history API.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    api: String,

    /// Use a local history file instead of the backend API.
    #[arg(long = "history-file")]
    history_file: Option<PathBuf>,
}

impl HistoryTarget {
    fn store(&self) -> Arc<dyn HistoryStore> {
        match &self.history_file {
            Some(path) => Arc::new(FileHistory::new(path.clone())),
            None => Arc::new(HttpHistory::new(self.api.clone())),
        }
    }

    fn bridge(&self) -> Arc<dyn PersistenceBridge> {
        match &self.history_file {
            Some(path) => Arc::new(FileHistory::new(path.clone())),
            None => Arc::new(HttpHistory::new(self.api.clone())),
        }
    }

    fn describe(&self) -> String {
        match &self.history_file {
            Some(path) => path.display().to_string(),
            None => format!("{}/save", self.api.trim_end_matches('/')),
        }
    }
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Domain or URL to scan (e.g. example.com or https://www.example.com).
    target: String,

    /// theHarvester data source.
    #[arg(long, default_value = DEFAULT_SOURCE)]
    source: String,

    /// WebSocket URL of the backend scan stream.
    #[arg(long, default_value = "ws://127.0.0.1:8000/scan/stream")]
    backend: String,

    #[command(flatten)]
    history: HistoryTarget,

    /// Tools that must report before the scan counts as complete (theHarvester, amass, subfinder).
    #[arg(long, value_delimiter = ',', default_values_t = ToolName::DEFAULT)]
    tools: Vec<ToolName>,

    /// Progress refresh period in milliseconds.
    #[arg(long = "tick-ms", default_value_t = 1000)]
    tick_ms: u64,

    /// Keep the channel open this long after completion; 0 waits for the backend to close it.
    #[arg(long = "grace-ms", default_value_t = 2000)]
    grace_ms: u64,

    /// Write the merged findings as `{type, value}` rows into this directory.
    #[arg(long = "export-dir")]
    export_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,

    /// JSON file holding the scan history.
    #[arg(long = "history-file", default_value = "scan_history.json")]
    history_file: PathBuf,

    /// amass executable.
    #[arg(long = "amass-bin", default_value = "amass")]
    amass_bin: PathBuf,

    /// theHarvester executable.
    #[arg(long = "harvester-bin", default_value = "theHarvester")]
    harvester_bin: PathBuf,

    /// subfinder executable; subfinder only runs when this is given.
    #[arg(long = "subfinder-bin")]
    subfinder_bin: Option<PathBuf>,

    /// Per-tool time limit in seconds.
    #[arg(long = "tool-timeout-secs", default_value_t = 900)]
    tool_timeout_secs: u64,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// List stored scans, newest first.
    List(HistoryTarget),
    /// Delete a stored scan by id.
    Delete {
        id: u64,
        #[command(flatten)]
        target: HistoryTarget,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Serve(args) => run_serve(args).await,
        Command::History(cmd) => run_history(cmd).await,
    }
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let domain = target::normalize_target(&args.target)
        .with_context(|| "please enter a valid domain (e.g. example.com)")?;
    let source = target::validate_source(&args.source)?;
    if args.tools.is_empty() {
        bail!("at least one tool must be expected");
    }
    let config = SessionConfig {
        expected_tools: args.tools.clone(),
        tick_interval: Duration::from_millis(args.tick_ms.max(50)),
        grace_period: (args.grace_ms > 0).then(|| Duration::from_millis(args.grace_ms)),
    };
    let request = ScanRequest::new(domain, source);

    println!("recon-stream scan:");
    println!("  domain   : {}", request.domain);
    println!("  source   : {}", request.source);
    println!("  scan_id  : {}", request.scan_id);
    println!("  backend  : {}", args.backend);
    println!(
        "  tools    : {}",
        args.tools.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );
    println!("  history  : {}", args.history.describe());

    let client = StreamClient::new(request, &config, args.history.bridge())?;

    // Ctrl-C tears the session down.
    let teardown = client.teardown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        teardown.cancel();
    });

    let clock = client.spawn_clock(config.tick_interval, |tick| {
        let mut err = std::io::stderr();
        let _ = write!(err, "\r{}   ", tick.render());
        let _ = err.flush();
    });

    let url = args.backend.clone();
    let report = client.run(WsTransport::connect(&url)).await;
    clock.stop();
    clock.join().await;
    eprintln!();

    print_report(&report);

    if let Some(dir) = args.export_dir.as_deref() {
        if report.session.combined.is_empty() {
            println!("Nothing to export.");
        } else {
            let at = report.session.ended_at.unwrap_or_else(OffsetDateTime::now_utc);
            match write_export(
                dir,
                &report.session.request.domain,
                &report.session.request.source,
                at,
                &report.session.combined,
            ) {
                Ok(path) => println!("Wrote export to {}", path.display()),
                Err(e) => eprintln!("Failed to write export: {e:#}"),
            }
        }
    }

    match report.status() {
        SessionStatus::Completed => Ok(()),
        SessionStatus::Failed => bail!(
            "scan failed: {}",
            report.session.failure.as_deref().unwrap_or("unknown error")
        ),
        SessionStatus::Running => {
            println!("Scan cancelled before all tools reported; nothing was saved.");
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let cfg = ServerConfig {
        bind: args.bind,
        history_path: args.history_file,
        amass_bin: args.amass_bin,
        harvester_bin: args.harvester_bin,
        subfinder_bin: args.subfinder_bin,
        tool_timeout: Duration::from_secs(args.tool_timeout_secs),
    };
    println!("recon-stream backend:");
    println!("  bind         : {}", cfg.bind);
    println!("  history      : {}", cfg.history_path.display());
    println!("  amass        : {}", cfg.amass_bin.display());
    println!("  theHarvester : {}", cfg.harvester_bin.display());
    if let Some(bin) = &cfg.subfinder_bin {
        println!("  subfinder    : {}", bin.display());
    }
    println!("  tool timeout : {}s", cfg.tool_timeout.as_secs());

    let state = server::AppState::from_config(&cfg);
    tokio::select! {
        res = server::spawn_server(&cfg.bind, state) => res,
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down.");
            Ok(())
        }
    }
}

async fn run_history(cmd: HistoryCommand) -> Result<()> {
    match cmd {
        HistoryCommand::List(target) => {
            let entries = target.store().list().await?;
            print_history(&entries);
        }
        HistoryCommand::Delete { id, target } => {
            if target.store().delete(id).await? {
                println!("Deleted scan {id}.");
            } else {
                println!("No scan with id {id}.");
            }
        }
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    let session = &report.session;
    let combined = &session.combined;
    let now = OffsetDateTime::now_utc();

    println!(
        "\nSummary: {} subdomains, {} IPs, {} emails, {} social profiles ({:.1}s)",
        combined.subdomains.len(),
        combined.ips.len(),
        combined.emails.len(),
        combined.social_profiles.len(),
        session.elapsed(now).as_secs_f64()
    );
    for tool in session.tools.values() {
        let state = match (&tool.result, &tool.error) {
            (Some(_), _) => "done".to_string(),
            (None, Some(e)) => format!("failed: {e}"),
            (None, None) => "no result".to_string(),
        };
        println!(
            "  {:<13} {:>7.1}s  {}",
            tool.name.as_str(),
            tool.elapsed(now).as_secs_f64(),
            state
        );
    }

    let rows = export_rows(combined);
    if !rows.is_empty() {
        let type_w = rows
            .iter()
            .map(|r| r.kind.label().len())
            .max()
            .unwrap_or(0)
            .max("type".len());
        let value_w = rows
            .iter()
            .map(|r| r.value.len().min(80))
            .max()
            .unwrap_or(0)
            .max("value".len());
        println!();
        println!("{:<type_w$}  {:<value_w$}", "type", "value", type_w = type_w, value_w = value_w);
        println!("{:-<type_w$}  {:-<value_w$}", "", "", type_w = type_w, value_w = value_w);
        for r in &rows {
            println!(
                "{:<type_w$}  {:<value_w$}",
                r.kind.label(),
                r.value,
                type_w = type_w,
                value_w = value_w
            );
        }
    }

    match &report.persisted {
        Some(PersistOutcome::Saved(entry)) => println!("\nSaved as history entry {}.", entry.id),
        Some(PersistOutcome::Failed(e)) => {
            eprintln!("\nResult not saved: {e}. The findings above are still valid.")
        }
        None => {}
    }
}

fn print_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No scan history found.");
        return;
    }
    let domain_w = entries
        .iter()
        .map(|e| e.domain.len())
        .max()
        .unwrap_or(0)
        .max("domain".len());
    println!(
        "{:>5}  {:<domain_w$}  {:<12}  {:<25}  {:<25}  {:>8}",
        "id",
        "domain",
        "source",
        "start",
        "end",
        "findings",
        domain_w = domain_w
    );
    for e in entries {
        println!(
            "{:>5}  {:<domain_w$}  {:<12}  {:<25}  {:<25}  {:>8}",
            e.id,
            e.domain,
            e.source,
            e.start_time,
            e.end_time,
            e.result.total(),
            domain_w = domain_w
        );
    }
}
