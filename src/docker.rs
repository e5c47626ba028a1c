//! Container runtime interface and the Docker Engine API client.
//!
//! The package manager only needs a handful of engine verbs: list/inspect,
//! create, start, stop, remove, logs, pull image, remove image. They are
//! captured in the [`ContainerRuntime`] trait so the engine can be swapped
//! for a fake in tests.
//!
//! [`DockerRuntime`] is the real implementation. It speaks HTTP/1.1 to the
//! local engine socket, opening one connection per request: the request
//! volume here is tiny and per-request handshakes keep connection state out
//! of the client.

use crate::constants::{DEFAULT_DOCKER_SOCKET, DOCKER_API_VERSION};
use crate::error::{Error, Result};
use crate::ports::PortSpec;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Guidance shown when the engine socket cannot be reached.
const DOCKER_CONNECT_HELP: &str = "could not contact Docker daemon

Docker is required to be already installed and running. Please refer to the following pages for more information
about how to install Docker.

 * https://docs.docker.com/get-docker/
 * https://docs.docker.com/engine/install/

If Docker is already installed but the socket is not in a standard location, you can use the DOCKER_HOST environment
variable to point to it.";

// =============================================================================
// Service Types
// =============================================================================

/// Everything needed to create one service container.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Full container name (`{pkg}-{version}-{context}-{service}`).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// Command arguments.
    pub command: Vec<String>,
    /// Host bind mounts (`host:container[:opts]`).
    pub binds: Vec<String>,
    /// Port specs with host ports already decided (`[ip:][hp:]cp[/proto]`).
    pub ports: Vec<String>,
}

/// A container as reported by the engine.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Engine container ID.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Whether the container is currently running.
    pub running: bool,
    /// Bound ports as `ip:hp:cp` strings.
    pub ports: Vec<String>,
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// The engine verbs used by the package manager.
///
/// The real implementation is [`DockerRuntime`]; tests provide an in-memory
/// fake. All name arguments are exact container names.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verifies connectivity to the engine.
    async fn ping(&self) -> Result<()>;

    /// Looks up a container by exact name. `None` when it does not exist.
    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// Creates a container (image must already be pulled). Returns the ID.
    async fn create_container(&self, service: &ServiceConfig) -> Result<String>;

    /// Starts a container.
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stops a container with the given grace period.
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Removes a stopped container.
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Pulls an image, logging engine progress.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Removes an image.
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Streams a container's stdout/stderr to the process stdout/stderr.
    async fn logs(&self, name: &str, follow: bool, tail: Option<&str>) -> Result<()>;
}

// =============================================================================
// Docker Engine API Payloads
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateContainerBody {
    #[serde(rename = "Hostname")]
    hostname: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
    #[serde(rename = "Cmd", skip_serializing_if = "Vec::is_empty")]
    cmd: Vec<String>,
    #[serde(rename = "Env")]
    env: Vec<String>,
    #[serde(rename = "ExposedPorts")]
    exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "HostConfig")]
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
struct HostConfig {
    #[serde(rename = "RestartPolicy")]
    restart_policy: RestartPolicy,
    #[serde(rename = "Binds")]
    binds: Vec<String>,
    #[serde(rename = "PortBindings")]
    port_bindings: BTreeMap<String, Vec<PortBinding>>,
}

#[derive(Debug, Serialize)]
struct RestartPolicy {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Warnings", default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct PullStatusLine {
    #[serde(default)]
    status: String,
    #[serde(rename = "progressDetail", default)]
    progress_detail: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct EngineErrorBody {
    message: String,
}

/// Converts decided port specs into the engine's exposed-ports and
/// port-bindings maps.
fn port_maps(
    ports: &[String],
) -> Result<(
    BTreeMap<String, serde_json::Value>,
    BTreeMap<String, Vec<PortBinding>>,
)> {
    let mut exposed = BTreeMap::new();
    let mut bindings: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
    for port in ports {
        let spec = PortSpec::parse(port)?;
        if spec.container_port.is_empty() {
            continue;
        }
        let key = format!("{}/{}", spec.container_port, spec.protocol());
        exposed.insert(key.clone(), serde_json::json!({}));
        bindings.entry(key).or_default().push(PortBinding {
            host_ip: spec.host_ip.clone().unwrap_or_default(),
            host_port: spec.host_port.clone().unwrap_or_default(),
        });
    }
    Ok((exposed, bindings))
}

// =============================================================================
// Docker Runtime
// =============================================================================

/// Docker Engine API client over the local Unix socket.
pub struct DockerRuntime {
    socket_path: String,
}

impl DockerRuntime {
    /// Creates a client from `DOCKER_HOST` (a `unix://` URL) or the
    /// default engine socket.
    #[must_use]
    pub fn from_env() -> Self {
        let socket_path = match std::env::var("DOCKER_HOST") {
            Ok(host) => match host.strip_prefix("unix://") {
                Some(path) => path.to_string(),
                None => {
                    warn!("unsupported DOCKER_HOST {:?}, using default socket", host);
                    DEFAULT_DOCKER_SOCKET.to_string()
                }
            },
            Err(_) => DEFAULT_DOCKER_SOCKET.to_string(),
        };
        Self { socket_path }
    }

    /// Creates a client for a specific socket path.
    #[must_use]
    pub fn with_socket(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Opens a connection and sends one request, returning the streaming
    /// response.
    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> Result<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| Error::ContainerRuntime(DOCKER_CONNECT_HELP.to_string()))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::Builder::new()
            .handshake(io)
            .await
            .map_err(|e| Error::ContainerRuntime(format!("engine handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("engine connection ended: {}", e);
            }
        });
        let uri = format!("/{DOCKER_API_VERSION}{path_and_query}");
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| Error::ContainerRuntime(format!("failed to build request: {e}")))?;
        req.headers_mut()
            .insert(header::HOST, header::HeaderValue::from_static("docker"));
        req.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        sender
            .send_request(req)
            .await
            .map_err(|e| Error::ContainerRuntime(format!("engine request failed: {e}")))
    }

    /// Sends a request and collects the full response body.
    async fn send_collect(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> Result<(StatusCode, Bytes)> {
        let resp = self.send(method, path_and_query, body).await?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::ContainerRuntime(format!("failed to read response: {e}")))?
            .to_bytes();
        Ok((status, bytes))
    }
}

/// Extracts the engine's error message from a non-2xx response body.
fn engine_error(op: &str, status: StatusCode, body: &Bytes) -> Error {
    let message = serde_json::from_slice::<EngineErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    Error::ContainerRuntime(format!("{op}: {status}: {message}"))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let (status, body) = self.send_collect(Method::GET, "/_ping", None).await?;
        if !status.is_success() {
            return Err(engine_error("ping", status, &body));
        }
        Ok(())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let (status, body) = self
            .send_collect(Method::GET, &format!("/containers/{name}/json"), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(engine_error("inspect container", status, &body));
        }
        let inspect: InspectResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::ContainerRuntime(format!("bad inspect response: {e}")))?;
        let mut ports = Vec::new();
        for (port_key, bindings) in &inspect.network_settings.ports {
            // Skip exposed container ports without a host mapping
            let Some(bindings) = bindings else { continue };
            let Some(binding) = bindings.first() else { continue };
            let container_port = port_key.split('/').next().unwrap_or(port_key);
            ports.push(format!("0.0.0.0:{}:{}", binding.host_port, container_port));
        }
        Ok(Some(ContainerInfo {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            image: inspect.config.image,
            running: inspect.state.running,
            ports,
        }))
    }

    async fn create_container(&self, service: &ServiceConfig) -> Result<String> {
        let (exposed_ports, port_bindings) = port_maps(&service.ports)?;
        let env: Vec<String> = service
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let body = CreateContainerBody {
            hostname: service.name.clone(),
            image: service.image.clone(),
            entrypoint: service.entrypoint.clone(),
            cmd: service.command.clone(),
            env,
            exposed_ports,
            host_config: HostConfig {
                restart_policy: RestartPolicy {
                    name: crate::constants::CONTAINER_RESTART_POLICY.to_string(),
                },
                binds: service.binds.clone(),
                port_bindings,
            },
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| Error::ContainerRuntime(format!("failed to encode create: {e}")))?;
        debug!("creating container {}", service.name);
        let (status, resp_body) = self
            .send_collect(
                Method::POST,
                &format!("/containers/create?name={}", service.name),
                Some(Bytes::from(payload)),
            )
            .await?;
        if !status.is_success() {
            return Err(engine_error("create container", status, &resp_body));
        }
        let resp: CreateContainerResponse = serde_json::from_slice(&resp_body)
            .map_err(|e| Error::ContainerRuntime(format!("bad create response: {e}")))?;
        for warning in &resp.warnings {
            warn!("{}", warning);
        }
        Ok(resp.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        debug!("starting container {}", name);
        let (status, body) = self
            .send_collect(Method::POST, &format!("/containers/{name}/start"), None)
            .await?;
        // 304 means already started
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(engine_error("start container", status, &body));
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()> {
        debug!("stopping container {}", name);
        let (status, body) = self
            .send_collect(
                Method::POST,
                &format!("/containers/{name}/stop?t={}", timeout.as_secs()),
                None,
            )
            .await?;
        // 304 means already stopped
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(engine_error("stop container", status, &body));
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        debug!("removing container {}", name);
        let (status, body) = self
            .send_collect(Method::DELETE, &format!("/containers/{name}"), None)
            .await?;
        if !status.is_success() {
            return Err(engine_error("remove container", status, &body));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        let resp = self
            .send(
                Method::POST,
                &format!("/images/create?fromImage={image}"),
                None,
            )
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::ContainerRuntime(format!("failed to read response: {e}")))?
                .to_bytes();
            return Err(engine_error("pull image", status, &body));
        }
        // The engine streams NDJSON status updates for the duration of the
        // pull; surface the interesting ones and drop byte-progress noise.
        let mut body = resp.into_body();
        let mut pending = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let frame =
                frame.map_err(|e| Error::ContainerRuntime(format!("pull stream error: {e}")))?;
            if let Some(data) = frame.data_ref() {
                pending.extend_from_slice(data);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line = pending.split_to(pos + 1);
                    log_pull_status(&line);
                }
            }
        }
        if !pending.is_empty() {
            log_pull_status(&pending);
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        debug!("removing image {}", image);
        let (status, body) = self
            .send_collect(Method::DELETE, &format!("/images/{image}"), None)
            .await?;
        if !status.is_success() {
            return Err(engine_error("remove image", status, &body));
        }
        Ok(())
    }

    async fn logs(&self, name: &str, follow: bool, tail: Option<&str>) -> Result<()> {
        let mut query = format!("/containers/{name}/logs?stdout=1&stderr=1");
        if follow {
            query.push_str("&follow=1");
        }
        if let Some(tail) = tail {
            query.push_str("&tail=");
            query.push_str(tail);
        }
        let resp = self.send(Method::GET, &query, None).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::ContainerRuntime(format!("failed to read response: {e}")))?
                .to_bytes();
            return Err(engine_error("container logs", status, &body));
        }
        let mut body = resp.into_body();
        let mut pending = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let frame =
                frame.map_err(|e| Error::ContainerRuntime(format!("log stream error: {e}")))?;
            if let Some(data) = frame.data_ref() {
                pending.extend_from_slice(data);
                demux_log_frames(&mut pending)?;
            }
        }
        Ok(())
    }
}

/// Writes complete multiplexed log frames from `pending` to stdout/stderr.
///
/// Frame layout: 1 byte stream type, 3 bytes padding, 4 bytes big-endian
/// payload length, then the payload. Incomplete frames stay buffered.
fn demux_log_frames(pending: &mut BytesMut) -> Result<()> {
    loop {
        if pending.len() < 8 {
            return Ok(());
        }
        let stream_type = pending[0];
        let len = u32::from_be_bytes([pending[4], pending[5], pending[6], pending[7]]) as usize;
        if pending.len() < 8 + len {
            return Ok(());
        }
        pending.advance(8);
        let payload = pending.split_to(len);
        match stream_type {
            2 => {
                let mut err = std::io::stderr().lock();
                err.write_all(&payload)?;
                err.flush()?;
            }
            _ => {
                let mut out = std::io::stdout().lock();
                out.write_all(&payload)?;
                out.flush()?;
            }
        }
    }
}

fn log_pull_status(line: &[u8]) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<PullStatusLine>(line) {
        Ok(status) => {
            // Skip progress update lines
            if !status.progress_detail.is_empty() {
                return;
            }
            if status.id.is_empty() {
                info!("{}", status.status);
            } else {
                info!("{}: {}", status.id, status.status);
            }
        }
        Err(e) => {
            warn!("failed to decode image pull status update: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_maps() {
        let ports = vec!["8080:3001".to_string(), "53:53/udp".to_string()];
        let (exposed, bindings) = port_maps(&ports).unwrap();
        assert!(exposed.contains_key("3001/tcp"));
        assert!(exposed.contains_key("53/udp"));
        assert_eq!(bindings["3001/tcp"][0].host_port, "8080");
        assert_eq!(bindings["53/udp"][0].host_port, "53");
    }

    #[test]
    fn test_demux_log_frames_split_across_reads() {
        let mut pending = BytesMut::new();
        // Header arrives alone: nothing is emitted, nothing is lost
        pending.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        demux_log_frames(&mut pending).unwrap();
        assert_eq!(pending.len(), 8);
        pending.extend_from_slice(b"hello");
        demux_log_frames(&mut pending).unwrap();
        assert!(pending.is_empty());
    }
}
