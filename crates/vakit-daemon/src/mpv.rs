/// mpv-backed [`Pipeline`]: one mpv process per pipeline, driven over its
/// JSON IPC socket.
///
/// Architecture:
///
/// ```text
///   MpvFactory::create()
///         │  spawns `mpv --idle`, returns MpvPipeline immediately
///         ▼
///   ipc_task ── connect (retry up to 5 s) ──┬── writer_task ← Value commands via mpsc
///                                           └── reader loop → events / property-change
///                                                   ├── update Shared::observed
///                                                   └── BusMessage → watched BusSink
/// ```
///
/// Commands issued before the socket is up are queued and flushed once
/// connected, so every [`Pipeline`] call returns without waiting.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::pipeline::{
    BusMessage, BusSink, Pipeline, PipelineError, PipelineFactory, PipelineState,
    StateChangeResult, StateQuery, WatchId,
};

// ── global counters ───────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_IDLE_ACTIVE: u64 = 3;
pub const OBS_PAUSED_FOR_CACHE: u64 = 4;
pub const OBS_CACHE_STATE: u64 = 5;

const OBSERVED: [(u64, &str); 5] = [
    (OBS_CORE_IDLE, "core-idle"),
    (OBS_PAUSE, "pause"),
    (OBS_IDLE_ACTIVE, "idle-active"),
    (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
    (OBS_CACHE_STATE, "cache-buffering-state"),
];

// ── shared state ──────────────────────────────────────────────────────────────

/// Player state as last reported by mpv.
#[derive(Debug, Clone)]
struct Observed {
    connected: bool,
    failed: bool,
    core_idle: Option<bool>,
    pause: bool,
    idle_active: bool,
    paused_for_cache: bool,
    /// `loadfile` sent, no `file-loaded`/`end-file` yet.
    load_in_flight: bool,
}

impl Default for Observed {
    fn default() -> Self {
        Self {
            connected: false,
            failed: false,
            core_idle: None,
            pause: false,
            idle_active: true,
            paused_for_cache: false,
            load_in_flight: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    observed: Observed,
    watch: Option<(WatchId, BusSink)>,
}

type SharedRef = Arc<Mutex<Shared>>;

fn lock(shared: &SharedRef) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn post(&self, message: BusMessage) {
        if let Some((_, sink)) = &self.watch {
            sink.post(message);
        }
    }
}

// ── factory ───────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MpvFactory {
    seq: Arc<AtomicU64>,
}

impl MpvFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineFactory for MpvFactory {
    type Pipeline = MpvPipeline;

    fn create(&mut self, name: &str) -> Result<MpvPipeline, PipelineError> {
        let binary = vakit_proto::platform::find_mpv_binary().ok_or(PipelineError::NoBinary)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        MpvPipeline::spawn(name, binary, vakit_proto::platform::mpv_socket_name(seq))
    }
}

// ── pipeline ──────────────────────────────────────────────────────────────────

pub struct MpvPipeline {
    name: String,
    socket_name: String,
    process: tokio::process::Child,
    cmd_tx: mpsc::UnboundedSender<Value>,
    shared: SharedRef,
    io_task: tokio::task::JoinHandle<()>,
    uri: Option<String>,
    loaded_uri: Option<String>,
    target: PipelineState,
}

impl MpvPipeline {
    fn spawn(name: &str, binary: PathBuf, socket_name: String) -> Result<Self, PipelineError> {
        #[cfg(unix)]
        let _ = std::fs::remove_file(&socket_name);

        info!("mpv[{}]: spawning process", name);
        let process = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--cache=yes")
            .arg(vakit_proto::platform::mpv_socket_arg(&socket_name))
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let shared: SharedRef = Arc::default();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let io_task = tokio::spawn(ipc_task(
            name.to_string(),
            socket_name.clone(),
            cmd_rx,
            shared.clone(),
        ));

        Ok(Self {
            name: name.to_string(),
            socket_name,
            process,
            cmd_tx,
            shared,
            io_task,
            uri: None,
            loaded_uri: None,
            target: PipelineState::Null,
        })
    }

    fn send(&self, command: Value) -> Result<(), PipelineError> {
        debug!("mpv[{}]: queue {}", self.name, command);
        self.cmd_tx.send(command).map_err(|_| PipelineError::Closed)
    }
}

impl Pipeline for MpvPipeline {
    fn set_uri(&mut self, uri: &str) -> Result<(), PipelineError> {
        // loaded on the next set_state(Playing)
        self.uri = Some(uri.to_string());
        Ok(())
    }

    fn set_state(&mut self, state: PipelineState) -> Result<StateChangeResult, PipelineError> {
        self.target = state;
        match state {
            PipelineState::Playing => {
                if let Some(uri) = self.uri.clone() {
                    if self.loaded_uri.as_deref() != Some(uri.as_str()) {
                        self.send(json!(["loadfile", uri, "replace"]))?;
                        lock(&self.shared).observed.load_in_flight = true;
                        self.loaded_uri = Some(uri);
                    }
                }
                self.send(json!(["set_property", "pause", false]))?;
                Ok(StateChangeResult::Async)
            }
            PipelineState::Paused => {
                self.send(json!(["set_property", "pause", true]))?;
                Ok(StateChangeResult::Async)
            }
            PipelineState::Ready | PipelineState::Null => {
                self.loaded_uri = None;
                // a dead player is already stopped
                if let Err(e) = self.send(json!(["stop"])) {
                    debug!("mpv[{}]: stop: {}", self.name, e);
                }
                Ok(StateChangeResult::Success)
            }
        }
    }

    fn query_state(&self) -> StateQuery {
        let observed = lock(&self.shared).observed.clone();
        query_from(&observed, self.target)
    }

    fn watch(&mut self, sink: BusSink) -> Result<WatchId, PipelineError> {
        let id = WatchId(NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed));
        let mut shared = lock(&self.shared);
        if shared.observed.failed {
            return Err(PipelineError::Closed);
        }
        shared.watch = Some((id, sink));
        Ok(id)
    }

    fn unwatch(&mut self, id: WatchId) {
        let mut shared = lock(&self.shared);
        if shared.watch.as_ref().map(|(w, _)| *w) == Some(id) {
            shared.watch = None;
        }
    }
}

impl Drop for MpvPipeline {
    fn drop(&mut self) {
        lock(&self.shared).watch = None;
        self.io_task.abort();
        if let Err(e) = self.process.start_kill() {
            debug!("mpv[{}]: kill: {}", self.name, e);
        }
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_name);
        debug!("mpv[{}]: released", self.name);
    }
}

fn query_from(observed: &Observed, target: PipelineState) -> StateQuery {
    let pending = match target {
        PipelineState::Playing | PipelineState::Paused => Some(target),
        _ => None,
    };
    if observed.failed {
        return StateQuery {
            result: StateChangeResult::Failure,
            current: PipelineState::Null,
            pending: None,
        };
    }
    if !observed.connected || observed.load_in_flight {
        return StateQuery {
            result: StateChangeResult::Async,
            current: PipelineState::Ready,
            pending,
        };
    }
    let current = if observed.idle_active {
        PipelineState::Ready
    } else if observed.pause {
        PipelineState::Paused
    } else {
        PipelineState::Playing
    };
    StateQuery {
        result: StateChangeResult::Success,
        current,
        pending: None,
    }
}

// ── event translation ─────────────────────────────────────────────────────────

/// Fold one unsolicited mpv message into `observed`, returning the bus
/// messages it produces.
fn translate(raw: &Value, observed: &mut Observed) -> Vec<BusMessage> {
    let mut out = Vec::new();
    let Some(event) = raw.get("event").and_then(Value::as_str) else {
        return out;
    };
    match event {
        "file-loaded" => observed.load_in_flight = false,
        "end-file" => {
            observed.load_in_flight = false;
            let reason = raw.get("reason").and_then(Value::as_str).unwrap_or("");
            match reason {
                "error" | "network" => {
                    let detail = raw
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    out.push(BusMessage::Error(format!("{}: {}", reason, detail)));
                }
                "eof" => out.push(BusMessage::EndOfStream),
                // stop, quit, redirect: our own doing
                _ => {}
            }
        }
        "property-change" => {
            let id = raw.get("id").and_then(Value::as_u64).unwrap_or(0);
            let data = raw.get("data").unwrap_or(&Value::Null);
            match id {
                OBS_CORE_IDLE => {
                    let idle = data.as_bool().unwrap_or(true);
                    observed.core_idle = Some(idle);
                    if !idle && !observed.pause {
                        out.push(BusMessage::StateChanged(PipelineState::Playing));
                    }
                }
                OBS_PAUSE => {
                    observed.pause = data.as_bool().unwrap_or(false);
                    if observed.pause {
                        out.push(BusMessage::StateChanged(PipelineState::Paused));
                    } else if observed.core_idle == Some(false) {
                        out.push(BusMessage::StateChanged(PipelineState::Playing));
                    }
                }
                OBS_IDLE_ACTIVE => {
                    observed.idle_active = data.as_bool().unwrap_or(true);
                    if observed.idle_active {
                        out.push(BusMessage::StateChanged(PipelineState::Ready));
                    }
                }
                OBS_PAUSED_FOR_CACHE => {
                    let was = observed.paused_for_cache;
                    observed.paused_for_cache = data.as_bool().unwrap_or(false);
                    if was && !observed.paused_for_cache {
                        out.push(BusMessage::Buffering(100));
                    }
                }
                OBS_CACHE_STATE => {
                    if observed.paused_for_cache {
                        if let Some(pct) = data.as_u64() {
                            out.push(BusMessage::Buffering(pct.min(100) as u8));
                        }
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
    out
}

// ── io tasks ──────────────────────────────────────────────────────────────────

async fn ipc_task(
    name: String,
    socket_name: String,
    cmd_rx: mpsc::UnboundedReceiver<Value>,
    shared: SharedRef,
) {
    match connect_and_drive(&name, &socket_name, cmd_rx, &shared).await {
        Ok(()) => debug!("mpv[{}]: ipc closed", name),
        Err(e) => info!("mpv[{}]: ipc failed: {}", name, e),
    }
    let mut guard = lock(&shared);
    guard.observed.failed = true;
    guard.observed.connected = false;
    guard.post(BusMessage::Error(format!("mpv[{}] is gone", name)));
}

#[cfg(unix)]
async fn connect_and_drive(
    name: &str,
    socket_name: &str,
    cmd_rx: mpsc::UnboundedReceiver<Value>,
    shared: &SharedRef,
) -> anyhow::Result<()> {
    let socket_path = PathBuf::from(socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }
    let stream = UnixStream::connect(&socket_path).await?;
    info!("mpv[{}]: connected to IPC socket", name);
    let (read_half, write_half) = stream.into_split();
    drive(name, BufReader::new(read_half), write_half, cmd_rx, shared).await
}

#[cfg(windows)]
async fn connect_and_drive(
    name: &str,
    socket_name: &str,
    cmd_rx: mpsc::UnboundedReceiver<Value>,
    shared: &SharedRef,
) -> anyhow::Result<()> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            info!("mpv[{}]: connected to named pipe", name);
            let (read_half, write_half) = tokio::io::split(client);
            return drive(name, BufReader::new(read_half), write_half, cmd_rx, shared).await;
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

async fn drive<R, W>(
    name: &str,
    mut reader: BufReader<R>,
    writer: W,
    cmd_rx: mpsc::UnboundedReceiver<Value>,
    shared: &SharedRef,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    lock(shared).observed.connected = true;
    let writer = tokio::spawn(writer_task(name.to_string(), writer, cmd_rx));

    let mut line = String::new();
    let result = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv[{}] reader: invalid json '{}': {}", name, trimmed, e);
                        continue;
                    }
                };
                if let Some(req_id) = val.get("request_id").and_then(Value::as_u64) {
                    let status = val.get("error").and_then(Value::as_str).unwrap_or("");
                    if status != "success" {
                        debug!("mpv[{}] reader: req={} err={}", name, req_id, status);
                    }
                    continue;
                }
                debug!("mpv[{}] reader: event {}", name, trimmed);
                let mut guard = lock(shared);
                let messages = translate(&val, &mut guard.observed);
                for message in messages {
                    guard.post(message);
                }
            }
            Err(e) => break Err(e.into()),
        }
    };
    writer.abort();
    result
}

async fn writer_task<W>(name: String, mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    for (id, prop) in OBSERVED {
        if let Err(e) = write_command(&mut writer, json!(["observe_property", id, prop])).await {
            warn!("mpv[{}] writer: observe {}: {}", name, prop, e);
            return;
        }
    }
    while let Some(command) = rx.recv().await {
        if let Err(e) = write_command(&mut writer, command).await {
            warn!("mpv[{}] writer: write error: {}", name, e);
            break;
        }
    }
    debug!("mpv[{}] writer: task exiting", name);
}

async fn write_command<W>(writer: &mut W, command: Value) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
    let mut raw = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
    raw.push('\n');
    writer.write_all(raw.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(id: u64, data: Value) -> Value {
        json!({ "event": "property-change", "id": id, "data": data })
    }

    #[test]
    fn test_end_file_reasons() {
        let mut o = Observed::default();
        let err = json!({ "event": "end-file", "reason": "error", "file_error": "loading failed" });
        assert_eq!(
            translate(&err, &mut o),
            vec![BusMessage::Error("error: loading failed".into())]
        );
        let eof = json!({ "event": "end-file", "reason": "eof" });
        assert_eq!(translate(&eof, &mut o), vec![BusMessage::EndOfStream]);
        let stop = json!({ "event": "end-file", "reason": "stop" });
        assert!(translate(&stop, &mut o).is_empty());
    }

    #[test]
    fn test_core_idle_false_means_playing() {
        let mut o = Observed::default();
        assert_eq!(
            translate(&prop(OBS_CORE_IDLE, json!(false)), &mut o),
            vec![BusMessage::StateChanged(PipelineState::Playing)]
        );
        assert_eq!(
            translate(&prop(OBS_PAUSE, json!(true)), &mut o),
            vec![BusMessage::StateChanged(PipelineState::Paused)]
        );
        assert_eq!(
            translate(&prop(OBS_PAUSE, json!(false)), &mut o),
            vec![BusMessage::StateChanged(PipelineState::Playing)]
        );
    }

    #[test]
    fn test_cache_pause_reports_buffering() {
        let mut o = Observed::default();
        assert!(translate(&prop(OBS_CACHE_STATE, json!(40)), &mut o).is_empty());
        translate(&prop(OBS_PAUSED_FOR_CACHE, json!(true)), &mut o);
        assert_eq!(
            translate(&prop(OBS_CACHE_STATE, json!(40)), &mut o),
            vec![BusMessage::Buffering(40)]
        );
        assert_eq!(
            translate(&prop(OBS_PAUSED_FOR_CACHE, json!(false)), &mut o),
            vec![BusMessage::Buffering(100)]
        );
    }

    #[test]
    fn test_query_tracks_observed_state() {
        let mut o = Observed::default();
        let q = query_from(&o, PipelineState::Playing);
        assert_eq!(q.result, StateChangeResult::Async);
        assert!(q.is_healthy());

        o.connected = true;
        let q = query_from(&o, PipelineState::Playing);
        assert_eq!(q.current, PipelineState::Ready);
        assert!(!q.is_healthy());

        o.idle_active = false;
        assert_eq!(query_from(&o, PipelineState::Playing).current, PipelineState::Playing);
        o.pause = true;
        assert_eq!(query_from(&o, PipelineState::Paused).current, PipelineState::Paused);

        o.failed = true;
        assert!(!query_from(&o, PipelineState::Playing).is_healthy());
    }
}
