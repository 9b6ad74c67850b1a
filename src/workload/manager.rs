//! Container lifecycle and the request forward path.
//!
//! The manager maps version hashes to running containers. A request for a URL
//! whose hash is already running is forwarded straight to it; anything else
//! goes through the start path under a per-hash gate: supersede the previous
//! revision of the same URL, download and load the image, create and start
//! the container on the sandbox network, wait for readiness, then forward.
//!
//! Host port bindings are published on `127.0.0.1` only; the node is the sole
//! caller of the published port. Sandboxed peers never dial it.

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::ImportImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::metrics::Metrics;
use crate::workload::envelope::{AgentReply, WorkloadRequest, parse_reply};
use crate::workload::version::{ProbeError, VersionHash, VersionProber};

/// Label carrying the version hash; startup cleanup keys on it.
pub const LABEL_VERSION_HASH: &str = "agent-host.version-hash";
/// Label carrying the source URL.
pub const LABEL_URL: &str = "agent-host.url";

/// Port the workload listens on inside its container.
const CONTAINER_PORT: &str = "80/tcp";
/// Published ports bind to loopback; only this process dials them.
const HOST_BIND_ADDR: &str = "127.0.0.1";

const READY_ATTEMPTS: u32 = 30;
const READY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const READY_SPACING: Duration = Duration::from_secs(1);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("docker operation failed: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("image transfer failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("image cache io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image load stream did not report an image name")]
    NoImageName,
    #[error("container for {url} not ready after {attempts} probes")]
    NotReady { url: String, attempts: u32 },
}

/// A container currently considered live for one version hash.
#[derive(Debug, Clone)]
pub struct ContainerInstance {
    pub version_hash: VersionHash,
    pub source_url: String,
    pub container_id: String,
    pub host_port: u16,
    pub image_name: String,
}

/// Static settings handed to the manager at startup.
#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub cache_dir: PathBuf,
    pub start_port: u16,
    pub runtime: Option<String>,
    pub network_name: String,
    /// `KEY=VALUE` pairs injected into every workload container.
    pub env: Vec<String>,
}

pub struct WorkloadManager {
    docker: Docker,
    settings: WorkloadSettings,
    http: reqwest::Client,
    prober: VersionProber,
    containers: Mutex<HashMap<String, ContainerInstance>>,
    start_gates: DashMap<String, Arc<Mutex<()>>>,
    next_port: StdMutex<u16>,
    metrics: Arc<Metrics>,
}

impl WorkloadManager {
    pub async fn new(
        docker: Docker,
        settings: WorkloadSettings,
        version_cache_ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, WorkloadError> {
        tokio::fs::create_dir_all(&settings.cache_dir).await?;
        let http = reqwest::Client::new();
        let prober = VersionProber::new(http.clone(), version_cache_ttl);
        let start_port = settings.start_port;
        Ok(Arc::new(Self {
            docker,
            settings,
            http,
            prober,
            containers: Mutex::new(HashMap::new()),
            start_gates: DashMap::new(),
            next_port: StdMutex::new(start_port),
            metrics,
        }))
    }

    /// Routes one request payload to the workload at `source_url`, starting or
    /// upgrading its container as needed.
    pub async fn forward(
        &self,
        source_url: &str,
        request_id: &str,
        payload: &[u8],
    ) -> Result<AgentReply, WorkloadError> {
        let (host_port, _) = self.ensure_running(source_url).await?;
        let envelope = WorkloadRequest::new(request_id, payload);
        let response = self
            .http
            .post(format!("http://{HOST_BIND_ADDR}:{host_port}/"))
            .header("X-Request-Id", request_id)
            .timeout(FORWARD_TIMEOUT)
            .json(&envelope)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            tracing::warn!(request_id, %status, "workload returned error status");
            return Ok(AgentReply {
                result: body.to_vec(),
                receipt: None,
            });
        }
        Ok(parse_reply(&envelope.request, &body))
    }

    /// Ensures a container serving the current revision of `source_url` is
    /// running. Returns its host port and whether this call started it.
    pub async fn ensure_running(&self, source_url: &str) -> Result<(u16, bool), WorkloadError> {
        let hash = self.prober.probe(source_url).await?;

        if let Some(port) = self.running_port(&hash).await {
            return Ok((port, false));
        }

        let gate = self
            .start_gates
            .entry(hash.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another task may have finished the start while we waited.
        if let Some(port) = self.running_port(&hash).await {
            return Ok((port, false));
        }

        self.supersede(source_url, &hash).await;

        let tar_path = self.download(source_url, &hash).await?;
        let image_name = self.load_image(&tar_path).await?;
        let host_port = self.allocate_port();
        let name = format!("agent-{hash}");

        // A previous run may have left a container under our target name.
        self.remove_existing(&name).await;

        let container_id = self
            .create_container(&name, &image_name, host_port, &hash, source_url)
            .await?;
        if let Err(error) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.destroy(&container_id).await;
            return Err(error.into());
        }
        self.stream_logs(&container_id, &hash, source_url);

        if let Err(error) = self.wait_ready(source_url, host_port).await {
            self.destroy(&container_id).await;
            return Err(error);
        }

        let instance = ContainerInstance {
            version_hash: hash.clone(),
            source_url: source_url.to_string(),
            container_id,
            host_port,
            image_name,
        };
        tracing::info!(url = source_url, version = %hash, port = host_port, "workload container ready");
        self.containers
            .lock()
            .await
            .insert(hash.as_str().to_string(), instance);
        self.metrics.containers_started.inc();
        Ok((host_port, true))
    }

    /// Stops and removes every mapped container. Called on shutdown.
    pub async fn cleanup(&self) {
        let drained: Vec<ContainerInstance> = {
            let mut containers = self.containers.lock().await;
            containers.drain().map(|(_, instance)| instance).collect()
        };
        for instance in drained {
            tracing::info!(url = %instance.source_url, version = %instance.version_hash, "reaping workload container");
            self.destroy(&instance.container_id).await;
            self.metrics.containers_reaped.inc();
        }
    }

    /// Removes every container carrying the version-hash label, running or
    /// not. Called by the startup checker before any work is accepted.
    /// Individual failures are warnings; the count of removed containers is
    /// returned.
    pub async fn reap_labeled(docker: &Docker) -> Result<usize, WorkloadError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_VERSION_HASH.to_string()]);
        let stale = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut reaped = 0;
        for summary in stale {
            let Some(id) = summary.id else { continue };
            if summary.state.as_deref() == Some("running") {
                if let Err(error) = docker
                    .stop_container(&id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
                    .await
                {
                    tracing::warn!(container = %id, %error, "failed to stop stale container");
                }
            }
            match docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => reaped += 1,
                Err(error) => {
                    tracing::warn!(container = %id, %error, "failed to remove stale container");
                }
            }
        }
        Ok(reaped)
    }

    /// Port of the mapped container for `hash`, if Docker confirms it is
    /// still running. A dead container is unmapped so the caller restarts it.
    async fn running_port(&self, hash: &VersionHash) -> Option<u16> {
        let instance = {
            let containers = self.containers.lock().await;
            containers.get(hash.as_str()).cloned()
        }?;
        let running = self
            .docker
            .inspect_container(&instance.container_id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|details| details.state)
            .and_then(|state| state.running)
            .unwrap_or(false);
        if running {
            Some(instance.host_port)
        } else {
            tracing::warn!(url = %instance.source_url, version = %hash, "mapped container is gone, will restart");
            self.containers.lock().await.remove(hash.as_str());
            None
        }
    }

    /// Stops and removes any container serving the same URL under a different
    /// version. Upgrades roll with zero version overlap.
    async fn supersede(&self, source_url: &str, new_hash: &VersionHash) {
        let outdated: Vec<ContainerInstance> = {
            let mut containers = self.containers.lock().await;
            let keys: Vec<String> = containers
                .values()
                .filter(|c| c.source_url == source_url && c.version_hash != *new_hash)
                .map(|c| c.version_hash.as_str().to_string())
                .collect();
            keys.iter().filter_map(|k| containers.remove(k)).collect()
        };
        for instance in outdated {
            tracing::info!(
                url = source_url,
                old = %instance.version_hash,
                new = %new_hash,
                "superseding workload container"
            );
            self.destroy(&instance.container_id).await;
            self.metrics.containers_reaped.inc();
            // The superseded tarball will never be loaded again.
            let stale_tar = self
                .settings
                .cache_dir
                .join(format!("{}.tar", instance.version_hash));
            if let Err(error) = tokio::fs::remove_file(&stale_tar).await {
                tracing::debug!(path = %stale_tar.display(), %error, "stale tarball not removed");
            }
        }
    }

    async fn download(&self, source_url: &str, hash: &VersionHash) -> Result<PathBuf, WorkloadError> {
        let path = self.settings.cache_dir.join(format!("{hash}.tar"));
        tracing::info!(url = source_url, path = %path.display(), "downloading workload image");
        let response = self
            .http
            .get(source_url)
            .send()
            .await?
            .error_for_status()?;
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(path)
    }

    /// Loads a tarball into Docker and returns the image name reported by the
    /// load stream.
    async fn load_image(&self, tar_path: &std::path::Path) -> Result<String, WorkloadError> {
        let contents = tokio::fs::read(tar_path).await?;
        let mut stream =
            self.docker
                .import_image(ImportImageOptions::default(), contents.into(), None);
        let mut image_name = None;
        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(line) = info.stream {
                if let Some(name) = parse_loaded_image(&line) {
                    image_name = Some(name);
                }
            }
        }
        image_name.ok_or(WorkloadError::NoImageName)
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        host_port: u16,
        hash: &VersionHash,
        source_url: &str,
    ) -> Result<String, WorkloadError> {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(CONTAINER_PORT.to_string(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some(HOST_BIND_ADDR.to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut labels = HashMap::new();
        labels.insert(LABEL_VERSION_HASH.to_string(), hash.as_str().to_string());
        labels.insert(LABEL_URL.to_string(), source_url.to_string());

        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(
            self.settings.network_name.clone(),
            EndpointSettings::default(),
        );

        let config = Config {
            image: Some(image.to_string()),
            env: Some(self.settings.env.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                runtime: self.settings.runtime.clone(),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(created.id)
    }

    /// Polls the container root until it answers HTTP. Any status counts as
    /// ready; workloads are free to 404 their root.
    async fn wait_ready(&self, source_url: &str, host_port: u16) -> Result<(), WorkloadError> {
        let url = format!("http://{HOST_BIND_ADDR}:{host_port}/");
        for attempt in 1..=READY_ATTEMPTS {
            match self
                .http
                .get(&url)
                .timeout(READY_ATTEMPT_TIMEOUT)
                .send()
                .await
            {
                Ok(_) => return Ok(()),
                Err(_) if attempt < READY_ATTEMPTS => {
                    tokio::time::sleep(READY_SPACING).await;
                }
                Err(error) => {
                    tracing::warn!(url = source_url, %error, "workload never became ready");
                }
            }
        }
        Err(WorkloadError::NotReady {
            url: source_url.to_string(),
            attempts: READY_ATTEMPTS,
        })
    }

    /// Pipes container stdout/stderr into the node's logs, tagged with the
    /// version and source URL. The task ends when the container does.
    fn stream_logs(&self, container_id: &str, hash: &VersionHash, source_url: &str) {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let version = hash.as_str().to_string();
        let url = source_url.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message })
                    | Ok(LogOutput::StdIn { message }) => {
                        let line = String::from_utf8_lossy(&message);
                        tracing::info!(target: "workload", version = %version, url = %url, "{}", line.trim_end());
                    }
                    Err(error) => {
                        tracing::debug!(target: "workload", version = %version, url = %url, %error, "log stream ended");
                        break;
                    }
                }
            }
        });
    }

    fn allocate_port(&self) -> u16 {
        let mut next = self.next_port.lock().expect("port counter lock poisoned");
        let port = *next;
        *next += 1;
        port
    }

    /// Force-removes a container by name, ignoring absence.
    async fn remove_existing(&self, name: &str) {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(container = name, "removed leftover container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(error) => {
                tracing::warn!(container = name, %error, "failed to remove leftover container");
            }
        }
    }

    /// Best-effort stop + remove; failures are logged, not propagated.
    async fn destroy(&self, container_id: &str) {
        if let Err(error) = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            tracing::debug!(container = container_id, %error, "stop failed");
        }
        if let Err(error) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!(container = container_id, %error, "remove failed");
        }
    }
}

/// Extracts the image name from a Docker load stream line. Handles both the
/// tagged and untagged report shapes.
fn parse_loaded_image(line: &str) -> Option<String> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("Loaded image:") {
        return Some(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("Loaded image ID:") {
        return Some(rest.trim().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_stream_tagged_format() {
        assert_eq!(
            parse_loaded_image("Loaded image: registry.test/echo:latest\n"),
            Some("registry.test/echo:latest".to_string())
        );
    }

    #[test]
    fn load_stream_id_format() {
        assert_eq!(
            parse_loaded_image("Loaded image ID: sha256:abcdef0123\n"),
            Some("sha256:abcdef0123".to_string())
        );
    }

    #[test]
    fn load_stream_other_lines_are_ignored() {
        assert_eq!(parse_loaded_image("Copying blob 1234"), None);
        assert_eq!(parse_loaded_image(""), None);
    }
}
