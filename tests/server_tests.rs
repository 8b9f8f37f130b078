use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use recon_stream::client::{ChannelState, CloseKind, StreamClient, WsTransport};
use recon_stream::config::SessionConfig;
use recon_stream::history::{HistoryStore, HttpHistory, MemoryHistory};
use recon_stream::merge::merge_findings;
use recon_stream::server::{router, AppState};
use recon_stream::session::SessionStatus;
use recon_stream::tools::ToolRunner;
use recon_stream::types::{Findings, ScanRequest, ToolFrame, ToolName};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

struct FakeTool {
    name: ToolName,
    delay: Duration,
    findings: Option<Findings>,
}

#[async_trait]
impl ToolRunner for FakeTool {
    fn name(&self) -> ToolName {
        self.name
    }

    async fn run(&self, _domain: &str, _source: &str) -> anyhow::Result<Findings> {
        tokio::time::sleep(self.delay).await;
        match &self.findings {
            Some(f) => Ok(f.clone()),
            None => bail!("{} exited with status 1", self.name),
        }
    }
}

fn fake(name: ToolName, delay_ms: u64, subs: &[&str], ips: &[&str]) -> Arc<dyn ToolRunner> {
    Arc::new(FakeTool {
        name,
        delay: Duration::from_millis(delay_ms),
        findings: Some(Findings {
            subdomains: subs.iter().map(|s| s.to_string()).collect(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            ..Findings::default()
        }),
    })
}

fn broken(name: ToolName) -> Arc<dyn ToolRunner> {
    Arc::new(FakeTool {
        name,
        delay: Duration::from_millis(5),
        findings: None,
    })
}

/// Sets its flag when dropped, i.e. when a run future is abandoned.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct SlowTool {
    name: ToolName,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl ToolRunner for SlowTool {
    fn name(&self) -> ToolName {
        self.name
    }

    async fn run(&self, _domain: &str, _source: &str) -> anyhow::Result<Findings> {
        let _guard = DropFlag(self.dropped.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Findings::default())
    }
}

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(state)).await });
    addr
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn save_request(payload: Value) -> Request<Body> {
    Request::post("/save")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn save_list_and_delete_routes() {
    let app = router(AppState::new(Arc::new(MemoryHistory::new()), vec![]));

    let payload = json!({
        "domain": "example.com",
        "source": "bing",
        "start_time": "2024-01-01T00:00:00Z",
        "end_time": "2024-01-01T00:10:00Z",
        "result": {
            "subdomains": ["a.example.com"],
            "ips": ["1.1.1.1"],
            "emails": ["info@example.com"],
            "social_profiles": ["https://twitter.com/example"]
        }
    });
    let resp = app.clone().oneshot(save_request(payload)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let saved = body_json(resp).await;
    assert_eq!(saved["status"], "saved");
    assert_eq!(saved["id"], 1);

    let resp = app
        .clone()
        .oneshot(Request::get("/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listed = body_json(resp).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["result"]["emails"][0], "info@example.com");

    let resp = app
        .clone()
        .oneshot(Request::delete("/history/999999").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "deleted");

    let resp = app
        .oneshot(Request::delete("/history/1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let deleted = body_json(resp).await;
    assert_eq!(deleted["removed"], true);
}

#[tokio::test]
async fn save_with_missing_fields_is_rejected() {
    let app = router(AppState::new(Arc::new(MemoryHistory::new()), vec![]));
    let resp = app
        .oneshot(save_request(json!({"domain": "example.com", "source": "bing"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn stream_sends_one_frame_per_tool_with_running_union() {
    let state = AppState::new(
        Arc::new(MemoryHistory::new()),
        vec![
            fake(ToolName::TheHarvester, 10, &[" a.example.com ", "a.example.com", ""], &["1.1.1.1"]),
            fake(ToolName::Amass, 60, &["b.example.com", "a.example.com"], &[]),
        ],
    );
    let addr = serve(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/scan/stream"))
        .await
        .unwrap();
    ws.send(Message::Text(
        json!({"domain": "example.com", "source": "crtsh", "scan_id": "scan-1"}).to_string(),
    ))
    .await
    .unwrap();

    let mut frames: Vec<ToolFrame> = Vec::new();
    while let Some(msg) = ws.next().await {
        match msg.unwrap() {
            Message::Text(text) => frames.push(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => break,
            _ => {}
        }
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].source, "theHarvester");
    assert_eq!(frames[1].source, "amass");
    assert!(frames.iter().all(|f| f.scan_id.as_deref() == Some("scan-1")));
    assert_eq!(
        frames[0].result.as_ref().unwrap().subdomains,
        vec!["a.example.com"]
    );
    assert_eq!(frames[1].tools_completed, Some(2));

    // The backend's running union matches a local merge of the per-tool results.
    let local = merge_findings(frames.iter().filter_map(|f| f.result.as_ref()));
    assert_eq!(frames[1].combined.as_ref(), Some(&local));
}

#[tokio::test]
async fn end_to_end_session_saves_through_http_history() {
    let history = Arc::new(MemoryHistory::new());
    let state = AppState::new(
        history.clone(),
        vec![
            fake(ToolName::TheHarvester, 20, &["a.example.com"], &[]),
            fake(ToolName::Amass, 5, &["b.example.com"], &["1.2.3.4"]),
        ],
    );
    let addr = serve(state).await;

    let cfg = SessionConfig {
        grace_period: None,
        ..SessionConfig::default()
    };
    let bridge = Arc::new(HttpHistory::new(format!("http://{addr}/")));
    let client = StreamClient::new(ScanRequest::new("example.com", "bing"), &cfg, bridge.clone())
        .unwrap();
    let url = format!("ws://{addr}/scan/stream");
    let report = client.run(WsTransport::connect(&url)).await;

    assert_eq!(report.status(), SessionStatus::Completed);
    assert_eq!(report.channel, ChannelState::Closed(CloseKind::Clean));
    assert_eq!(report.session.combined.subdomains.len(), 2);
    assert!(report.session.combined.ips.contains("1.2.3.4"));

    assert_eq!(history.save_calls().await, 1);
    let listed = bridge.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].result, report.session.combined);

    assert!(bridge.delete(listed[0].id).await.unwrap());
    assert!(history.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn tool_failure_leaves_session_failed_with_partial_results() {
    let history = Arc::new(MemoryHistory::new());
    let state = AppState::new(
        history.clone(),
        vec![
            broken(ToolName::TheHarvester),
            fake(ToolName::Amass, 20, &["b.example.com"], &[]),
        ],
    );
    let addr = serve(state).await;

    let cfg = SessionConfig {
        grace_period: None,
        ..SessionConfig::default()
    };
    let client = StreamClient::new(ScanRequest::new("example.com", "bing"), &cfg, history.clone())
        .unwrap();
    let url = format!("ws://{addr}/scan/stream");
    let report = client.run(WsTransport::connect(&url)).await;

    assert_eq!(report.status(), SessionStatus::Failed);
    assert!(report.session.combined.subdomains.contains("b.example.com"));
    let harvester = &report.session.tools[&ToolName::TheHarvester];
    assert!(harvester.error.as_deref().unwrap_or("").contains("exited with status 1"));
    assert_eq!(history.save_calls().await, 0);
}

#[tokio::test]
async fn unreachable_backend_fails_the_session() {
    let history = Arc::new(MemoryHistory::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = StreamClient::new(
        ScanRequest::new("example.com", "bing"),
        &SessionConfig::default(),
        history.clone(),
    )
    .unwrap();
    let url = format!("ws://{addr}/scan/stream");
    let report = client.run(WsTransport::connect(&url)).await;

    assert_eq!(report.status(), SessionStatus::Failed);
    assert!(matches!(report.channel, ChannelState::Closed(CloseKind::Error(_))));
    assert_eq!(history.save_calls().await, 0);
}

#[tokio::test]
async fn client_disconnect_cancels_running_tools() {
    let flags = [Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false))];
    let tools: Vec<Arc<dyn ToolRunner>> = vec![
        Arc::new(SlowTool {
            name: ToolName::TheHarvester,
            dropped: flags[0].clone(),
        }),
        Arc::new(SlowTool {
            name: ToolName::Amass,
            dropped: flags[1].clone(),
        }),
    ];
    let addr = serve(AppState::new(Arc::new(MemoryHistory::new()), tools)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/scan/stream"))
        .await
        .unwrap();
    ws.send(Message::Text(
        json!({"domain": "example.com", "source": "bing"}).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!flags[0].load(Ordering::SeqCst));

    let _ = ws.close(None).await;
    drop(ws);

    let cancelled = tokio::time::timeout(Duration::from_secs(2), async {
        while !flags.iter().all(|f| f.load(Ordering::SeqCst)) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(cancelled.is_ok(), "tools still running after the client left");
}
