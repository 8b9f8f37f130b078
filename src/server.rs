use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    history::{FileHistory, HistoryStore, NewHistoryEntry},
    merge::clean_findings,
    target::{is_valid_domain, DEFAULT_SOURCE},
    tools::{Amass, Subfinder, TheHarvester, ToolRunner},
    types::{CombinedResult, Findings, ScanRequest, ToolFrame, ToolName},
};

#[derive(Clone)]
pub struct AppState {
    history: Arc<dyn HistoryStore>,
    tools: Arc<Vec<Arc<dyn ToolRunner>>>,
}

impl AppState {
    pub fn new(history: Arc<dyn HistoryStore>, tools: Vec<Arc<dyn ToolRunner>>) -> Self {
        Self {
            history,
            tools: Arc::new(tools),
        }
    }

    /// File-backed history plus the real tool binaries.
    pub fn from_config(cfg: &ServerConfig) -> Self {
        let mut tools: Vec<Arc<dyn ToolRunner>> = vec![
            Arc::new(TheHarvester {
                binary: cfg.harvester_bin.clone(),
                timeout: cfg.tool_timeout,
            }),
            Arc::new(Amass {
                binary: cfg.amass_bin.clone(),
                timeout: cfg.tool_timeout,
            }),
        ];
        if let Some(binary) = &cfg.subfinder_bin {
            tools.push(Arc::new(Subfinder {
                binary: binary.clone(),
                timeout: cfg.tool_timeout,
            }));
        }
        Self::new(Arc::new(FileHistory::new(cfg.history_path.clone())), tools)
    }
}

/// First frame a client sends on `/scan/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub domain: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub scan_id: Option<String>,
}

impl StreamRequest {
    fn into_request(self) -> ScanRequest {
        let source = self.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        match self.scan_id {
            Some(scan_id) => ScanRequest {
                domain: self.domain,
                source,
                scan_id,
            },
            None => ScanRequest::new(self.domain, source),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scan/stream", get(scan_stream))
        .route("/save", post(save_scan))
        .route("/history", get(list_history))
        .route("/history/{id}", delete(delete_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "backend listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn save_scan(
    State(app): State<AppState>,
    Json(entry): Json<NewHistoryEntry>,
) -> impl IntoResponse {
    match app.history.save(entry).await {
        Ok(saved) => (StatusCode::OK, Json(json!({"status": "saved", "id": saved.id}))).into_response(),
        Err(e) => {
            warn!(error = %e, "save failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn list_history(State(app): State<AppState>) -> impl IntoResponse {
    match app.history.list().await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => {
            warn!(error = %e, "history listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn delete_history(State(app): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    match app.history.delete(id).await {
        Ok(removed) => (StatusCode::OK, Json(json!({"status": "deleted", "removed": removed}))).into_response(),
        Err(e) => {
            warn!(error = %e, id, "history delete failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn scan_stream(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_scan_socket(socket, app))
}

struct ToolReport {
    name: ToolName,
    outcome: Result<Findings>,
}

async fn read_request(socket: &mut WebSocket) -> Option<ScanRequest> {
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match serde_json::from_str::<StreamRequest>(text.as_str()) {
            Ok(req) => return Some(req.into_request()),
            Err(e) => {
                let _ = send_json(socket, &json!({"error": format!("invalid scan request: {e}")})).await;
                return None;
            }
        }
    }
    None
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            false
        }
    }
}

/// Run every tool concurrently and stream one frame per tool as it finishes.
async fn handle_scan_socket(mut socket: WebSocket, app: AppState) {
    let Some(request) = read_request(&mut socket).await else {
        debug!("stream closed before a scan request arrived");
        return;
    };
    if !is_valid_domain(&request.domain) {
        let _ = send_json(&mut socket, &json!({"error": "invalid domain", "scan_id": request.scan_id})).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(scan_id = %request.scan_id, domain = %request.domain, source = %request.source, "scan started");

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<ToolReport>(app.tools.len().max(1));
    let mut set = JoinSet::new();
    for runner in app.tools.iter().cloned() {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let domain = request.domain.clone();
        let source = request.source.clone();
        set.spawn(async move {
            let name = runner.name();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                res = runner.run(&domain, &source) => res,
            };
            let _ = tx.send(ToolReport { name, outcome }).await;
        });
    }
    drop(tx);

    let started = Instant::now();
    let mut combined = CombinedResult::default();
    let mut completed: BTreeSet<ToolName> = BTreeSet::new();
    loop {
        let report = tokio::select! {
            report = rx.recv() => match report {
                Some(report) => report,
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!(scan_id = %request.scan_id, "client disconnected; cancelling remaining tools");
                    cancel.cancel();
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };
        let frame = match report.outcome {
            Ok(findings) => {
                let findings = clean_findings(findings);
                combined.absorb(&findings);
                completed.insert(report.name);
                let mut frame = ToolFrame::result(report.name, &request.scan_id, findings);
                frame.combined = Some(combined.clone());
                frame.tools_completed = Some(completed.len());
                frame
            }
            Err(e) => {
                warn!(scan_id = %request.scan_id, tool = %report.name, error = %e, "tool failed");
                ToolFrame::failure(report.name, &request.scan_id, format!("{e:#}"))
            }
        };
        let frame = ToolFrame {
            duration: Some(round2(started.elapsed())),
            ..frame
        };
        if !send_json(&mut socket, &frame).await {
            warn!(scan_id = %request.scan_id, "client went away; cancelling remaining tools");
            cancel.cancel();
            break;
        }
    }

    cancel.cancel();
    set.shutdown().await;
    let _ = socket.send(Message::Close(None)).await;
    info!(scan_id = %request.scan_id, tools_completed = completed.len(), "scan stream finished");
}

fn round2(d: Duration) -> f64 {
    (d.as_secs_f64() * 100.0).round() / 100.0
}
