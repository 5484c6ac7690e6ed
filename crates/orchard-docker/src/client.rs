//! Minimal container-engine API client.
//!
//! Talks HTTP/1.1 to the engine's control socket. Only the operations the
//! backend needs are modelled: container lifecycle, image build/inspect/
//! remove/prune, and log capture. Build output streams back as JSON lines
//! and is surfaced line by line through the progress sink.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::debug;

use orchard_backend::ProgressSink;
use orchard_core::{OrchardError, OrchardResult, OutputChunk};

/// Engine API version prefix.
const API_PREFIX: &str = "/v1.43";

/// Client for one engine control socket.
#[derive(Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    pub state: String,
}

impl ContainerSummary {
    /// First name with the leading slash stripped.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub state: ContainerState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    #[serde(default)]
    pub started_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking_config: Option<NetworkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    pub endpoints_config: HashMap<String, EndpointConfig>,
}

#[derive(Debug, Serialize)]
pub struct EndpointConfig {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// One line of the streaming build response.
#[derive(Debug, Deserialize)]
struct BuildLine {
    stream: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PruneResponse {
    #[serde(default)]
    images_deleted: Option<Vec<serde_json::Value>>,
}

/// Parameters for a streaming image build.
pub struct BuildImageParams {
    /// Image tag, also the engine-side resource name.
    pub tag: String,
    /// Dockerfile path relative to the context root.
    pub dockerfile: String,
    /// Tar archive of the build context.
    pub context: Bytes,
    pub build_args: HashMap<String, String>,
    /// Pre-encoded `X-Registry-Config` header value.
    pub registry_config: Option<String>,
}

impl EngineClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    // ── Containers ─────────────────────────────────────────────────

    pub async fn list_containers(&self, all: bool) -> OrchardResult<Vec<ContainerSummary>> {
        let path = format!("{API_PREFIX}/containers/json?all={}", all);
        let body = self.request(http::Method::GET, &path, None).await?;
        parse_json(&body)
    }

    pub async fn inspect_container(&self, name: &str) -> OrchardResult<ContainerInspect> {
        let path = format!("{API_PREFIX}/containers/{name}/json");
        let body = self.request(http::Method::GET, &path, None).await?;
        parse_json(&body)
    }

    pub async fn create_container(&self, name: &str, spec: &CreateContainer) -> OrchardResult<()> {
        let path = format!("{API_PREFIX}/containers/create?name={}", encode(name));
        let body = serde_json::to_vec(spec)
            .map_err(|e| OrchardError::backend(format!("encode create body: {e}")))?;
        self.request(
            http::Method::POST,
            &path,
            Some((Bytes::from(body), "application/json")),
        )
        .await?;
        Ok(())
    }

    pub async fn start_container(&self, name: &str) -> OrchardResult<()> {
        let path = format!("{API_PREFIX}/containers/{name}/start");
        self.request(http::Method::POST, &path, None).await?;
        Ok(())
    }

    pub async fn stop_container(&self, name: &str) -> OrchardResult<()> {
        let path = format!("{API_PREFIX}/containers/{name}/stop");
        self.request(http::Method::POST, &path, None).await?;
        Ok(())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> OrchardResult<()> {
        let path = format!("{API_PREFIX}/containers/{name}?force={force}");
        self.request(http::Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Fetch one log stream of a container, demultiplexed to plain text.
    pub async fn container_logs(
        &self,
        name: &str,
        stdout: bool,
        stderr: bool,
        tail: Option<usize>,
    ) -> OrchardResult<String> {
        let tail = tail.map_or("all".to_string(), |n| n.to_string());
        let path = format!(
            "{API_PREFIX}/containers/{name}/logs?stdout={stdout}&stderr={stderr}&timestamps=true&tail={tail}"
        );
        let body = self.request(http::Method::GET, &path, None).await?;
        Ok(demux_log_stream(&body))
    }

    // ── Images ─────────────────────────────────────────────────────

    pub async fn inspect_image(&self, name: &str) -> OrchardResult<ImageInspect> {
        let path = format!("{API_PREFIX}/images/{name}/json");
        let body = self.request(http::Method::GET, &path, None).await?;
        parse_json(&body)
    }

    pub async fn remove_image(&self, name: &str) -> OrchardResult<()> {
        let path = format!("{API_PREFIX}/images/{name}");
        self.request(http::Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Prune dangling images unreferenced for `until`. Returns how many
    /// were deleted.
    pub async fn prune_images(&self, until: &str) -> OrchardResult<usize> {
        let filters = format!(r#"{{"dangling":["true"],"until":["{until}"]}}"#);
        let path = format!("{API_PREFIX}/images/prune?filters={}", encode(&filters));
        let body = self.request(http::Method::POST, &path, None).await?;
        let response: PruneResponse = parse_json(&body)?;
        Ok(response.images_deleted.map_or(0, |deleted| deleted.len()))
    }

    /// Drive a streaming image build, reporting each output line.
    ///
    /// The engine keeps streaming even for failed builds; an `error` line
    /// fails the call. Cancellation is observed between response frames.
    pub async fn build_image(
        &self,
        params: BuildImageParams,
        mut cancel: watch::Receiver<bool>,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let build_args = serde_json::to_string(&params.build_args)
            .map_err(|e| OrchardError::backend(format!("encode build args: {e}")))?;
        let path = format!(
            "{API_PREFIX}/build?t={}&dockerfile={}&buildargs={}&networkmode=host&forcerm=true",
            encode(&params.tag),
            encode(&params.dockerfile),
            encode(&build_args),
        );

        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri(&path)
            .header(http::header::HOST, "engine")
            .header(http::header::CONTENT_TYPE, "application/x-tar");
        if let Some(config) = &params.registry_config {
            builder = builder.header("X-Registry-Config", config.as_str());
        }
        let request = builder
            .body(Full::new(params.context))
            .map_err(|e| OrchardError::backend(format!("build request: {e}")))?;

        let mut sender = self.connect().await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| OrchardError::backend(format!("engine build request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = collect_body(response.into_body()).await?;
            return Err(engine_error(status.as_u16(), &body));
        }

        let mut body = response.into_body();
        let mut pending = Vec::new();
        let mut build_error: Option<String> = None;

        loop {
            let frame = tokio::select! {
                frame = body.frame() => frame,
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(OrchardError::Cancelled("image build aborted".to_string()));
                    }
                    continue;
                }
            };

            let Some(frame) = frame else { break };
            let frame =
                frame.map_err(|e| OrchardError::backend(format!("engine build stream: {e}")))?;
            let Some(data) = frame.data_ref() else { continue };
            pending.extend_from_slice(data);

            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let (chunks, error) = decode_build_line(&line);
                progress.output(chunks).await;
                if let Some(error) = error {
                    build_error.get_or_insert(error);
                }
            }
        }
        if !pending.is_empty() {
            let (chunks, error) = decode_build_line(&pending);
            progress.output(chunks).await;
            if let Some(error) = error {
                build_error.get_or_insert(error);
            }
        }

        match build_error {
            Some(error) => Err(OrchardError::backend(format!("image build failed: {error}"))),
            None => Ok(()),
        }
    }

    // ── Transport ──────────────────────────────────────────────────

    async fn connect(&self) -> OrchardResult<hyper::client::conn::http1::SendRequest<Full<Bytes>>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            OrchardError::backend(format!(
                "engine socket {} unavailable: {e}",
                self.socket_path.display()
            ))
        })?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OrchardError::backend(format!("engine handshake failed: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        Ok(sender)
    }

    async fn request(
        &self,
        method: http::Method,
        path: &str,
        body: Option<(Bytes, &str)>,
    ) -> OrchardResult<Bytes> {
        debug!(%method, %path, "engine request");
        let builder = http::Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "engine");
        let request = match body {
            Some((bytes, content_type)) => builder
                .header(http::header::CONTENT_TYPE, content_type)
                .body(Full::new(bytes)),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| OrchardError::backend(format!("engine request: {e}")))?;

        let mut sender = self.connect().await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| OrchardError::backend(format!("engine request failed: {e}")))?;

        let status = response.status();
        let bytes = collect_body(response.into_body()).await?;
        if status.is_success() || status == http::StatusCode::NOT_MODIFIED {
            Ok(bytes)
        } else {
            Err(engine_error(status.as_u16(), &bytes))
        }
    }
}

async fn collect_body(body: hyper::body::Incoming) -> OrchardResult<Bytes> {
    Ok(body
        .collect()
        .await
        .map_err(|e| OrchardError::backend(format!("engine response: {e}")))?
        .to_bytes())
}

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> OrchardResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| OrchardError::backend(format!("engine response decode: {e}")))
}

/// Normalize an engine error body into the shared taxonomy.
fn engine_error(status: u16, body: &Bytes) -> OrchardError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("engine returned status {status}"));
    if status == 404 {
        OrchardError::NotFound(message)
    } else {
        OrchardError::backend(message)
    }
}

/// Decode one build-output line into chunks plus an error message for
/// `error` lines.
fn decode_build_line(line: &[u8]) -> (Vec<OutputChunk>, Option<String>) {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return (Vec::new(), None);
    }

    match serde_json::from_str::<BuildLine>(trimmed) {
        Ok(line) => {
            let mut chunks = Vec::new();
            if let Some(stream) = line.stream {
                if !stream.trim().is_empty() {
                    chunks.push(OutputChunk::message(stream));
                }
            }
            if let Some(error) = &line.error {
                chunks.push(OutputChunk {
                    stderr: Some(error.clone()),
                    ..OutputChunk::default()
                });
            }
            (chunks, line.error)
        }
        // Unknown line shapes are still worth surfacing.
        Err(_) => (vec![OutputChunk::message(trimmed.to_string())], None),
    }
}

/// Demultiplex the engine's framed log stream into plain text.
///
/// Frames are `[stream_type, 0, 0, 0, len_be32]` followed by payload; TTY
/// containers return a raw byte stream instead, which is passed through.
fn demux_log_stream(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    if !matches!(body[0], 0 | 1 | 2) {
        return String::from_utf8_lossy(body).into_owned();
    }

    let mut text = String::new();
    let mut offset = 0;
    while offset + 8 <= body.len() {
        let len = u32::from_be_bytes([
            body[offset + 4],
            body[offset + 5],
            body[offset + 6],
            body[offset + 7],
        ]) as usize;
        let start = offset + 8;
        let end = (start + len).min(body.len());
        text.push_str(&String::from_utf8_lossy(&body[start..end]));
        offset = end;
    }
    text
}

/// Percent-encode a query value.
fn encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => {
                encoded.push('%');
                encoded.push_str(&format!("{other:02X}"));
            }
        }
    }
    encoded
}

/// Pack a build-context directory into a tar archive.
pub fn pack_context(dir: &std::path::Path) -> OrchardResult<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| OrchardError::backend(format!("pack build context: {e}")))?;
    let data = builder
        .into_inner()
        .map_err(|e| OrchardError::backend(format!("pack build context: {e}")))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_query_metacharacters() {
        assert_eq!(encode("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(encode("plain-value_1.2~"), "plain-value_1.2~");
    }

    #[test]
    fn demux_reassembles_frames() {
        let mut body = Vec::new();
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        body.extend_from_slice(b"hello");
        body.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 6]);
        body.extend_from_slice(b" world");
        assert_eq!(demux_log_stream(&body), "hello world");
    }

    #[test]
    fn demux_passes_raw_streams_through() {
        assert_eq!(demux_log_stream(b"plain tty output"), "plain tty output");
        assert_eq!(demux_log_stream(b""), "");
    }

    #[test]
    fn container_summary_name_strips_slash() {
        let summary = ContainerSummary {
            id: "abc".to_string(),
            names: vec!["/orchard-123".to_string()],
            state: "running".to_string(),
        };
        assert_eq!(summary.name(), "orchard-123");
    }

    #[test]
    fn build_line_stream_is_reported() {
        let (chunks, error) = decode_build_line(br#"{"stream":"Step 1/4"}"#);
        assert!(error.is_none());
        assert_eq!(chunks[0].stdout.as_deref(), Some("Step 1/4"));
    }

    #[test]
    fn build_line_error_is_returned() {
        let (chunks, error) = decode_build_line(br#"{"error":"exit code 1"}"#);
        assert_eq!(error.as_deref(), Some("exit code 1"));
        assert_eq!(chunks[0].stderr.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn unknown_build_lines_pass_through() {
        let (chunks, error) = decode_build_line(b"not json at all");
        assert!(error.is_none());
        assert_eq!(chunks[0].stdout.as_deref(), Some("not json at all"));
    }

    #[test]
    fn blank_build_lines_produce_nothing() {
        let (chunks, error) = decode_build_line(b"  \n");
        assert!(chunks.is_empty());
        assert!(error.is_none());
    }

    #[test]
    fn engine_error_maps_404_to_not_found() {
        let body = Bytes::from(r#"{"message":"No such container: orchard-x"}"#);
        assert!(engine_error(404, &body).is_not_found());
        assert!(matches!(
            engine_error(500, &body),
            OrchardError::Backend { .. }
        ));
    }

    #[test]
    fn pack_context_contains_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        let tar_bytes = pack_context(dir.path()).unwrap();
        assert!(!tar_bytes.is_empty());

        let mut archive = tar::Archive::new(tar_bytes.as_ref());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert!(names.iter().any(|name| name.contains("Dockerfile")));
    }
}
