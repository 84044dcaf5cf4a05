//! Test utilities for k2-client
//!
//! - [`MockDevice`]: an axum app answering the subset of the device REST API
//!   the harness uses, with knobs for upgrades, reboots and reference locks
//! - [`TestServer`]: runs a router on an ephemeral port
//! - [`RecordingSleeper`]: records poll sleeps and returns at once
//! - [`ScriptedRunner`]: replays canned command output
//! - [`ScriptedSession`]: replays canned device states
//! - [`FakeShell`]: scripted device CLI over an in-memory stream

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use k2_core::{
    ApiGeneration, DeviceState, ImageDescriptor, LocalImage, PriorityEntry, ReferencePriorityList,
    ReferenceSource, SyncState, TimeSource,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;

use crate::config::TimeoutsConfig;
use crate::error::{DeviceError, Result};
use crate::image::ReleaseServer;
use crate::poll::Sleeper;
use crate::runner::CommandRunner;
use crate::session::{DeviceSession, RestSession};

// =============================================================================
// Sleeper
// =============================================================================

/// Sleeper that only records what it was asked to wait
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sleeps requested so far
    pub fn count(&self) -> usize {
        self.sleeps.lock().len()
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

// =============================================================================
// Command runner
// =============================================================================

/// Runner that records commands and returns pre-configured responses
///
/// Responses are handed out in order; once they run out every command
/// succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<String>>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands run so far, each as `program arg1 arg2 ...`
    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.commands.lock().push(line);
        self.responses.lock().pop_front().unwrap_or_else(|| Ok(String::new()))
    }
}

// =============================================================================
// Device session
// =============================================================================

/// In-memory [`DeviceSession`] with queued state snapshots
///
/// `get_state` hands out the queued results in order and reports the device
/// unreachable once the queue is empty. Writes are recorded.
#[derive(Default)]
pub struct ScriptedSession {
    states: Mutex<VecDeque<Result<DeviceState>>>,
    resources: Mutex<HashMap<String, Value>>,
    state_reads: Mutex<u32>,
    puts: Mutex<Vec<(String, Value)>>,
    installs: Mutex<Vec<String>>,
    pulls: Mutex<Vec<String>>,
    install_status: Option<u16>,
    write_status: Option<u16>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(states: Vec<Result<DeviceState>>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            ..Self::default()
        }
    }

    /// Queue one more `get_state` result
    pub fn push_state(&self, state: Result<DeviceState>) {
        self.states.lock().push_back(state);
    }

    /// Serve `value` for `GET path`
    pub fn with_resource(self, path: &str, value: Value) -> Self {
        self.resources.lock().insert(path.to_string(), value);
        self
    }

    /// Make `install_image` fail with this HTTP status
    pub fn failing_install(mut self, status: u16) -> Self {
        self.install_status = Some(status);
        self
    }

    /// Make `put_resource` fail with this HTTP status
    pub fn failing_writes(mut self, status: u16) -> Self {
        self.write_status = Some(status);
        self
    }

    pub fn state_reads(&self) -> u32 {
        *self.state_reads.lock()
    }

    pub fn puts(&self) -> Vec<(String, Value)> {
        self.puts.lock().clone()
    }

    /// Image names passed to `install_image`
    pub fn installs(&self) -> Vec<String> {
        self.installs.lock().clone()
    }

    /// Image names passed to `pull_image`
    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().clone()
    }
}

#[async_trait]
impl DeviceSession for ScriptedSession {
    async fn get_state(&self) -> Result<DeviceState> {
        *self.state_reads.lock() += 1;
        self.states
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(DeviceError::ConnectionFailed("no answer".to_string())))
    }

    async fn get_resource(&self, path: &str) -> Result<Value> {
        self.resources
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| DeviceError::http_status(404, format!("{} not found", path)))
    }

    async fn put_resource(&self, path: &str, body: &Value) -> Result<u16> {
        self.puts.lock().push((path.to_string(), body.clone()));
        match self.write_status {
            Some(status) => Err(DeviceError::http_status(status, "write rejected")),
            None => Ok(200),
        }
    }

    async fn install_image(&self, image: &LocalImage) -> Result<()> {
        if !image.local_path_valid() {
            return Err(DeviceError::Command("image files missing".to_string()));
        }
        self.installs.lock().push(image.descriptor.name.clone());
        match self.install_status {
            Some(status) => Err(DeviceError::http_status(status, "upload rejected")),
            None => Ok(()),
        }
    }

    async fn pull_image(&self, descriptor: &ImageDescriptor, _server: &ReleaseServer) -> Result<()> {
        self.pulls.lock().push(descriptor.name.clone());
        Ok(())
    }
}

// =============================================================================
// Fake CLI
// =============================================================================

#[derive(Debug, Clone)]
enum Reply {
    /// Output followed by the prompt
    Output(String),
    /// Exactly this text, no prompt
    Raw(String),
}

/// Scripted device CLI
///
/// Echoes every line it receives, like a terminal would, then answers with
/// the scripted reply. Unknown commands get `Invalid command` and the prompt.
#[derive(Debug, Clone)]
pub struct FakeShell {
    prompt: String,
    replies: HashMap<String, Reply>,
}

impl FakeShell {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            replies: HashMap::new(),
        }
    }

    /// Answer `command` with `output` and a fresh prompt
    pub fn on(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.replies
            .insert(command.into(), Reply::Output(output.into()));
        self
    }

    /// Answer `line` with `text` and no prompt (password or confirmation requests)
    pub fn on_raw(mut self, line: impl Into<String>, text: impl Into<String>) -> Self {
        self.replies.insert(line.into(), Reply::Raw(text.into()));
        self
    }

    /// Start the fake CLI; returns the client end of the stream and the lines
    /// the CLI has received
    pub fn spawn(self) -> (DuplexStream, Arc<Mutex<Vec<String>>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();

        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            let prompt = format!("{} ", self.prompt);
            if writer
                .write_all(format!("Welcome\r\n{}", prompt).as_bytes())
                .await
                .is_err()
            {
                return;
            }

            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end_matches('\r').to_string();
                log.lock().push(line.clone());

                let reply = match self.replies.get(&line) {
                    Some(Reply::Output(output)) if output.is_empty() => prompt.clone(),
                    Some(Reply::Output(output)) => format!("{}\r\n{}", output, prompt),
                    Some(Reply::Raw(text)) => text.clone(),
                    None => format!("Invalid command\r\n{}", prompt),
                };
                let echoed = format!("{}\r\n{}", line, reply);
                if writer.write_all(echoed.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        (client, received)
    }
}

// =============================================================================
// Mock device
// =============================================================================

/// One multipart upload to `admin/upgrade`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    /// `(field name, file name)` in the order received
    pub parts: Vec<(String, String)>,
}

/// Everything the mock device knows, open for inspection and tweaking
#[derive(Debug, Clone)]
pub struct MockDeviceState {
    pub sync_state: u8,
    pub curr_ref: u8,
    pub software_version: String,
    pub oscillator: String,
    /// `GET /timing` body, priorities in read numbering
    pub timing: Value,
    pub ntp_servers: Vec<Value>,
    pub ntp_option: Value,
    pub ntp_restarts: u32,
    pub gnss: Value,
    pub timing_status: Value,
    /// `/system/state` requests still to answer with 503
    pub outage: u32,
    /// Version installed by the next upload
    pub upgrade_to: Option<String>,
    /// Outage length started by an upload
    pub reboot_outage: u32,
    /// Lock to the new top reference when the priority list is written
    pub lock_on_switch: bool,
    pub uploads: Vec<UploadRecord>,
    /// Raw `PUT /timing` bodies
    pub timing_writes: Vec<Value>,
}

impl Default for MockDeviceState {
    fn default() -> Self {
        let priorities = ReferencePriorityList::new(vec![
            PriorityEntry::new(TimeSource::Gnss, 0),
            PriorityEntry::new(TimeSource::Ptp, 1),
            PriorityEntry::new(TimeSource::SlotAJ1Timecode, 2),
        ]);
        Self {
            sync_state: SyncState::Locked.code(),
            curr_ref: TimeSource::Gnss.reference().code(),
            software_version: "5.1.2.7".to_string(),
            oscillator: "OCXO".to_string(),
            timing: json!({
                "timeRefPriority": priorities,
                "freqRefPriority": [],
            }),
            ntp_servers: Vec::new(),
            ntp_option: json!({}),
            ntp_restarts: 0,
            gnss: json!({
                "constellation": {
                    "satelliteSystem": [
                        {"satConstellation": "gps", "state": "enabled"},
                        {"satConstellation": "glonass", "state": "enabled"},
                        {"satConstellation": "galileo", "state": "enabled"},
                        {"satConstellation": "beidou", "state": "enabled"},
                    ],
                    "sbas": "enabled",
                }
            }),
            timing_status: json!([{"status": {"clockClass": 6}}]),
            outage: 0,
            upgrade_to: None,
            reboot_outage: 0,
            lock_on_switch: false,
            uploads: Vec::new(),
            timing_writes: Vec::new(),
        }
    }
}

/// In-process stand-in for a device REST API
///
/// Serves `/api/v1/...` and `/api/v2/...`; requests without basic auth get
/// 401.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.state.lock().software_version = version.into();
        self
    }

    /// Set `timeRefPriority` (read numbering)
    pub fn with_priorities(self, list: ReferencePriorityList) -> Self {
        self.state.lock().timing["timeRefPriority"] = json!(list);
        self
    }

    pub fn with_sync(self, sync_state: SyncState, reference: ReferenceSource) -> Self {
        {
            let mut state = self.state.lock();
            state.sync_state = sync_state.code();
            state.curr_ref = reference.code();
        }
        self
    }

    /// Install `version` on upload, then answer 503 for `outage` state reads
    pub fn upgrades_to(self, version: impl Into<String>, outage: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.upgrade_to = Some(version.into());
            state.reboot_outage = outage;
        }
        self
    }

    pub fn locks_on_switch(self) -> Self {
        self.state.lock().lock_on_switch = true;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockDeviceState> {
        self.state.lock()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/{generation}", post(open_session))
            .route("/api/{generation}/", post(open_session))
            .route("/api/{generation}/system/state", get(system_state))
            .route("/api/{generation}/system/inventory", get(system_inventory))
            .route("/api/{generation}/timing", get(get_timing).put(put_timing))
            .route("/api/{generation}/timingService/status", get(timing_status))
            .route("/api/{generation}/admin/upgrade", post(upload_image))
            .route("/api/{generation}/ntp/servers", get(ntp_servers).post(ntp_post))
            .route(
                "/api/{generation}/ntp/servers/{index}",
                put(ntp_put).delete(ntp_delete),
            )
            .route("/api/{generation}/ntp/option", put(ntp_option))
            .route("/api/{generation}/gnss", get(get_gnss).put(put_gnss))
            .layer(middleware::from_fn(require_auth))
            .with_state(self.clone())
    }
}

async fn require_auth(request: Request, next: Next) -> Response {
    if request.headers().contains_key(header::AUTHORIZATION) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "authentication required").into_response()
    }
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "API starting").into_response()
}

async fn open_session() -> Json<Value> {
    Json(json!({}))
}

async fn system_state(State(device): State<MockDevice>) -> Response {
    let mut state = device.state.lock();
    if state.outage > 0 {
        state.outage -= 1;
        return unavailable();
    }
    Json(json!({"syncState": state.sync_state, "currRef": state.curr_ref})).into_response()
}

async fn system_inventory(State(device): State<MockDevice>) -> Response {
    let state = device.state.lock();
    if state.outage > 0 {
        return unavailable();
    }
    Json(json!({
        "softwareVer": state.software_version,
        "inventory": {"oscillator": state.oscillator},
    }))
    .into_response()
}

async fn get_timing(State(device): State<MockDevice>) -> Json<Value> {
    Json(device.state.lock().timing.clone())
}

async fn put_timing(
    State(device): State<MockDevice>,
    Path(generation): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Ok(generation) = ApiGeneration::from_str(&generation) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(written) = body.pointer("/timing/timeRefPriority") else {
        return (StatusCode::BAD_REQUEST, "timeRefPriority missing").into_response();
    };
    let Ok(mut list) = serde_json::from_value::<ReferencePriorityList>(written.clone()) else {
        return (StatusCode::BAD_REQUEST, "malformed timeRefPriority").into_response();
    };

    // the device accepts write numbering and hands back read numbering
    let offset = generation.write_offset();
    for entry in list.entries_mut() {
        entry.priority -= offset;
    }

    let mut state = device.state.lock();
    state.timing_writes.push(body.clone());
    state.timing["timeRefPriority"] = json!(list);

    if state.lock_on_switch {
        let top = list
            .top_index()
            .and_then(|index| list.entries()[index].time_source());
        if let Some(source) = top {
            state.curr_ref = source.reference().code();
            state.sync_state = SyncState::Locked.code();
        }
    }
    Json(json!({})).into_response()
}

async fn timing_status(State(device): State<MockDevice>) -> Json<Value> {
    Json(device.state.lock().timing_status.clone())
}

async fn upload_image(State(device): State<MockDevice>, mut multipart: Multipart) -> Response {
    let mut parts = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        if field.bytes().await.is_err() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        parts.push((name, file_name));
    }

    let mut state = device.state.lock();
    state.uploads.push(UploadRecord { parts });
    if let Some(version) = state.upgrade_to.take() {
        state.software_version = version;
        state.outage = state.reboot_outage;
    }
    Json(json!({})).into_response()
}

async fn ntp_servers(State(device): State<MockDevice>) -> Json<Value> {
    Json(Value::Array(device.state.lock().ntp_servers.clone()))
}

async fn ntp_post(State(device): State<MockDevice>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = device.state.lock();
    if body.get("restart").and_then(Value::as_bool) == Some(true) {
        state.ntp_restarts += 1;
    }
    if let Some(servers) = body.get("servers").and_then(Value::as_array) {
        state.ntp_servers.extend(servers.iter().cloned());
    }
    Json(json!({}))
}

async fn ntp_put(
    State(device): State<MockDevice>,
    Path((_, index)): Path<(String, usize)>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = device.state.lock();
    match (index.checked_sub(1), body.get("server")) {
        (Some(slot), Some(server)) if slot < state.ntp_servers.len() => {
            state.ntp_servers[slot] = server.clone();
            Json(json!({})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ntp_delete(
    State(device): State<MockDevice>,
    Path((_, index)): Path<(String, usize)>,
) -> Response {
    let mut state = device.state.lock();
    match index.checked_sub(1) {
        Some(slot) if slot < state.ntp_servers.len() => {
            state.ntp_servers.remove(slot);
            Json(json!({})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ntp_option(State(device): State<MockDevice>, Json(body): Json<Value>) -> Json<Value> {
    device.state.lock().ntp_option = body;
    Json(json!({}))
}

async fn get_gnss(State(device): State<MockDevice>) -> Json<Value> {
    Json(device.state.lock().gnss.clone())
}

async fn put_gnss(State(device): State<MockDevice>, Json(body): Json<Value>) -> Response {
    let Some(constellation) = body.pointer("/conf/constellation") else {
        return (StatusCode::BAD_REQUEST, "conf.constellation missing").into_response();
    };
    device.state.lock().gnss = json!({"constellation": constellation});
    Json(json!({})).into_response()
}

// =============================================================================
// Test server
// =============================================================================

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` on an ephemeral localhost port
    pub async fn start(router: Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the test server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// API root for one generation
    pub fn api_url(&self, generation: ApiGeneration) -> String {
        format!("{}/api/{}", self.base_url(), generation)
    }

    /// REST session against this server with short timeouts
    pub fn session(&self, generation: ApiGeneration) -> Result<RestSession> {
        let timeouts = TimeoutsConfig {
            request_ms: 5_000,
            connect_ms: 2_000,
            upload_ms: 5_000,
        };
        RestSession::with_base_url(&self.api_url(generation), generation, "admin", "secret", &timeouts)
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
