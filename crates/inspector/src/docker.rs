//! Docker API abstraction for testability.
//!
//! The [`DockerClient`] trait covers the calls the inspector makes against
//! the daemon. Production code uses [`BollardDockerClient`]; tests use
//! `MockDockerClient` (behind the `testing` feature).
//!
//! ```text
//!  ContainerInspector
//!          │
//!          ▼
//!   DockerClient (trait)
//!     │         │
//!     ▼         ▼
//!  Bollard     Mock
//!     │
//!     ▼
//!  Docker daemon
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use slimprobe_core::types::PortKey;

use crate::error::InspectorError;
use crate::launch::{ImageInfo, LaunchSpec, exposed_ports_from_history};

/// Capacity of the runtime event channel handed to the inspector.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Validates a container ID before it reaches the API.
///
/// Accepts full or short hex IDs as returned by container create.
fn validate_container_id(id: &str) -> Result<(), InspectorError> {
    if id.is_empty() || id.len() > 64 {
        return Err(InspectorError::DockerApi(format!(
            "invalid container ID: length {} (must be 1-64)",
            id.len()
        )));
    }
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(InspectorError::DockerApi(
            "invalid container ID: contains non-hex characters".to_owned(),
        ));
    }
    Ok(())
}

/// A host address a container port is published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host_ip: String,
    pub host_port: u16,
}

/// The parts of a container inspection the inspector uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub exit_code: i64,
    /// Default bridge IP, empty for host networking
    pub ip_address: String,
    pub network_mode: String,
    /// Per-network IP addresses
    pub networks: BTreeMap<String, String>,
    pub ports: BTreeMap<PortKey, Vec<HostPort>>,
}

impl ContainerDetails {
    pub fn is_host_network(&self) -> bool {
        self.network_mode == "host"
    }

    /// Best IP for reaching the container directly.
    pub fn reachable_ip(&self) -> Option<&str> {
        if !self.ip_address.is_empty() {
            return Some(&self.ip_address);
        }
        self.networks
            .values()
            .map(String::as_str)
            .find(|ip| !ip.is_empty())
    }
}

/// A container lifecycle event from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub action: String,
    pub container_id: String,
    pub exit_code: Option<i64>,
}

impl RuntimeEvent {
    pub fn is_die(&self) -> bool {
        self.action == "die"
    }
}

/// Reads the `exitCode` event attribute.
///
/// Missing or empty means the code is unknown. A value that is not a number
/// still reports a failed exit, as -1.
fn die_exit_code(attr: Option<&str>) -> Option<i64> {
    match attr.map(str::trim) {
        None | Some("") => None,
        Some(code) => Some(code.parse().unwrap_or(-1)),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Result of a command run inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout and stderr in arrival order
    pub output: Vec<u8>,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The container had already exited
    NotRunning,
}

/// Trait abstracting Docker API operations.
///
/// The trait is `Send + Sync + 'static` so a client can be shared with
/// the event watcher task.
///
/// # Error Handling
///
/// - **404 errors**: converted to `InspectorError::ContainerNotFound`
///   (or `ImageNotFound` for image calls)
/// - **everything else**: `InspectorError::DockerApi`
pub trait DockerClient: Send + Sync + 'static {
    /// Image config and `EXPOSE` history.
    fn image_info(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<ImageInfo, InspectorError>> + Send;

    /// Creates the container and returns its ID.
    fn create_container(
        &self,
        spec: &LaunchSpec,
    ) -> impl Future<Output = Result<String, InspectorError>> + Send;

    fn connect_network(
        &self,
        id: &str,
        network: &str,
    ) -> impl Future<Output = Result<(), InspectorError>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<(), InspectorError>> + Send;

    fn inspect_container(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ContainerDetails, InspectorError>> + Send;

    /// Subscribes to lifecycle events for one container.
    ///
    /// The channel closes when the daemon stream ends.
    fn container_events(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<RuntimeEvent>, InspectorError>> + Send;

    /// Stops with a grace period in seconds before SIGKILL.
    fn stop_container(
        &self,
        id: &str,
        grace_secs: i64,
    ) -> impl Future<Output = Result<StopOutcome, InspectorError>> + Send;

    /// Force-removes the container and its anonymous volumes.
    fn remove_container(&self, id: &str) -> impl Future<Output = Result<(), InspectorError>> + Send;

    fn kill_container(&self, id: &str) -> impl Future<Output = Result<(), InspectorError>> + Send;

    fn container_logs(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ContainerLogs, InspectorError>> + Send;

    /// Runs `argv` in the container, feeding `stdin` when given.
    fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> impl Future<Output = Result<ExecOutput, InspectorError>> + Send;
}

/// Production Docker client implementation using `bollard`.
///
/// - Connection timeout: 120 seconds
/// - API version: default (negotiated)
pub struct BollardDockerClient {
    docker: Arc<bollard::Docker>,
}

impl BollardDockerClient {
    /// Connects using `DOCKER_HOST` or the platform default socket.
    pub fn connect_local() -> Result<Self, InspectorError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            InspectorError::DockerConnection(format!("failed to connect to docker: {e}"))
        })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    pub fn connect_with_socket(socket_path: &str) -> Result<Self, InspectorError> {
        let docker =
            bollard::Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    InspectorError::DockerConnection(format!(
                        "failed to connect to docker at {socket_path}: {e}"
                    ))
                })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Empty socket path means local defaults.
    pub fn connect(socket_path: &str) -> Result<Self, InspectorError> {
        if socket_path.is_empty() {
            Self::connect_local()
        } else {
            Self::connect_with_socket(socket_path)
        }
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn container_error(id: &str, op: &str, err: bollard::errors::Error) -> InspectorError {
    if status_code(&err) == Some(404) {
        InspectorError::ContainerNotFound(id.to_owned())
    } else {
        InspectorError::DockerApi(format!("{op} failed: {e}", e = err))
    }
}

fn port_map_to_bollard(
    spec: &LaunchSpec,
) -> HashMap<String, Option<Vec<bollard::models::PortBinding>>> {
    spec.ports
        .bindings
        .iter()
        .map(|(key, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| bollard::models::PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: Some(b.host_port.map(|p| p.to_string()).unwrap_or_default()),
                })
                .collect();
            (key.to_string(), Some(bindings))
        })
        .collect()
}

fn ports_from_bollard(
    ports: Option<HashMap<String, Option<Vec<bollard::models::PortBinding>>>>,
) -> BTreeMap<PortKey, Vec<HostPort>> {
    let mut out = BTreeMap::new();
    for (key, bindings) in ports.unwrap_or_default() {
        let Ok(key) = key.parse::<PortKey>() else {
            continue;
        };
        let hosts = bindings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| {
                let host_port = b.host_port?.parse::<u16>().ok()?;
                Some(HostPort {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port,
                })
            })
            .collect();
        out.insert(key, hosts);
    }
    out
}

impl DockerClient for BollardDockerClient {
    async fn image_info(&self, image: &str) -> Result<ImageInfo, InspectorError> {
        let inspect = self.docker.inspect_image(image).await.map_err(|e| {
            if status_code(&e) == Some(404) {
                InspectorError::ImageNotFound(image.to_owned())
            } else {
                InspectorError::DockerApi(format!("inspect image failed: {e}"))
            }
        })?;
        let history = self
            .docker
            .image_history(image)
            .await
            .map_err(|e| InspectorError::DockerApi(format!("image history failed: {e}")))?;
        let created_by: Vec<String> = history.into_iter().map(|h| h.created_by).collect();

        let config = inspect.config.unwrap_or_default();
        let mut exposed_ports = exposed_ports_from_history(&created_by);
        let mut config_ports: Vec<PortKey> = config
            .exposed_ports
            .unwrap_or_default()
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect();
        config_ports.sort();
        for key in config_ports {
            if !exposed_ports.contains(&key) {
                exposed_ports.push(key);
            }
        }

        Ok(ImageInfo {
            reference: image.to_owned(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            workdir: config.working_dir.unwrap_or_default(),
            user: config.user.unwrap_or_default(),
            exposed_ports,
        })
    }

    async fn create_container(&self, spec: &LaunchSpec) -> Result<String, InspectorError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let exposed: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .exposed
            .iter()
            .map(|k| (k.to_string(), HashMap::new()))
            .collect();
        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.to_bind()).collect()),
            port_bindings: Some(port_map_to_bollard(spec)),
            publish_all_ports: Some(spec.ports.publish_all),
            network_mode: spec.network_mode.clone(),
            links: non_empty(&spec.links),
            extra_hosts: non_empty(&spec.extra_hosts),
            dns: non_empty(&spec.dns),
            dns_search: non_empty(&spec.dns_search),
            privileged: Some(spec.privileged),
            cap_add: non_empty(&spec.cap_add),
            userns_mode: spec.userns_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            cmd: Some(spec.cmd.clone()),
            user: Some(spec.user.clone()),
            env: non_empty(&spec.env),
            working_dir: spec.workdir.clone(),
            hostname: spec.hostname.clone(),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            exposed_ports: Some(exposed),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                if status_code(&e) == Some(404) {
                    InspectorError::ImageNotFound(spec.image.clone())
                } else {
                    InspectorError::DockerApi(format!("create container failed: {e}"))
                }
            })?;
        for warning in &created.warnings {
            warn!(container = %spec.name, warning = %warning, "docker create warning");
        }
        Ok(created.id)
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<(), InspectorError> {
        validate_container_id(id)?;
        use bollard::network::ConnectNetworkOptions;

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: id.to_owned(),
                    endpoint_config: Default::default(),
                },
            )
            .await
            .map_err(|e| {
                InspectorError::DockerApi(format!("network connect to '{network}' failed: {e}"))
            })
    }

    async fn start_container(&self, id: &str) -> Result<(), InspectorError> {
        validate_container_id(id)?;
        use bollard::container::StartContainerOptions;

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| container_error(id, "start container", e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, InspectorError> {
        validate_container_id(id)?;

        let details = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| container_error(id, "inspect container", e))?;

        let state = details.state.unwrap_or_default();
        let network = details.network_settings.unwrap_or_default();
        let networks = network
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(name, ep)| (name, ep.ip_address.unwrap_or_default()))
            .collect();

        Ok(ContainerDetails {
            id: details.id.unwrap_or_else(|| id.to_owned()),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            ip_address: network.ip_address.unwrap_or_default(),
            network_mode: details
                .host_config
                .and_then(|h| h.network_mode)
                .unwrap_or_default(),
            networks,
            ports: ports_from_bollard(network.ports),
        })
    }

    async fn container_events(
        &self,
        id: &str,
    ) -> Result<mpsc::Receiver<RuntimeEvent>, InspectorError> {
        validate_container_id(id)?;
        use bollard::system::EventsOptions;

        let filters = HashMap::from([
            ("type".to_owned(), vec!["container".to_owned()]),
            ("container".to_owned(), vec![id.to_owned()]),
        ]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let docker = Arc::clone(&self.docker);
        tokio::spawn(async move {
            let mut stream = Box::pin(docker.events(Some(options)));
            while let Some(item) = stream.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "docker event stream failed");
                        break;
                    }
                };
                let actor = message.actor.unwrap_or_default();
                let attributes = actor.attributes.unwrap_or_default();
                let event = RuntimeEvent {
                    action: message.action.unwrap_or_default(),
                    container_id: actor.id.unwrap_or_default(),
                    exit_code: die_exit_code(attributes.get("exitCode").map(String::as_str)),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("docker event stream closed");
        });
        Ok(rx)
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<StopOutcome, InspectorError> {
        validate_container_id(id)?;
        use bollard::container::StopContainerOptions;

        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
        {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(e) if status_code(&e) == Some(304) => Ok(StopOutcome::NotRunning),
            Err(e) => Err(container_error(id, "stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), InspectorError> {
        validate_container_id(id)?;
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| container_error(id, "remove container", e))
    }

    async fn kill_container(&self, id: &str) -> Result<(), InspectorError> {
        validate_container_id(id)?;
        use bollard::container::KillContainerOptions;

        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| container_error(id, "kill container", e))
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs, InspectorError> {
        validate_container_id(id)?;
        use bollard::container::{LogOutput, LogsOptions};

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = ContainerLogs::default();
        while let Some(item) = stream.next().await {
            match item.map_err(|e| container_error(id, "container logs", e))? {
                LogOutput::StdErr { message } => logs.stderr.extend_from_slice(&message),
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    logs.stdout.extend_from_slice(&message)
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(logs)
    }

    async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, InspectorError> {
        validate_container_id(id)?;
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| container_error(id, "create exec", e))?;

        let mut collected = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| InspectorError::Exec(format!("start exec failed: {e}")))?
        {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(data) = stdin {
                    input.write_all(&data).await?;
                    input.shutdown().await?;
                }
                drop(input);
                while let Some(chunk) = output.next().await {
                    let chunk =
                        chunk.map_err(|e| InspectorError::Exec(format!("exec output: {e}")))?;
                    collected.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| InspectorError::Exec(format!("inspect exec failed: {e}")))?;
        Ok(ExecOutput {
            output: collected,
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockDockerClient;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Container ID handed out by the mock.
    pub const MOCK_CONTAINER_ID: &str = "5eedc0ffee42";

    /// Mock Docker client with configurable responses.
    ///
    /// Records every call by name so tests can assert on ordering.
    pub struct MockDockerClient {
        image: Option<ImageInfo>,
        details: Mutex<ContainerDetails>,
        exec_result: ExecOutput,
        logs: ContainerLogs,
        die_on_start: Option<i64>,
        fail_create: bool,
        calls: Mutex<Vec<String>>,
        created: Mutex<Option<LaunchSpec>>,
        exec_calls: Mutex<Vec<(Vec<String>, Option<Vec<u8>>)>>,
        events: Mutex<Option<mpsc::Sender<RuntimeEvent>>>,
    }

    impl Default for MockDockerClient {
        fn default() -> Self {
            Self {
                image: Some(ImageInfo {
                    reference: "app:latest".to_owned(),
                    cmd: vec!["/app/server".to_owned()],
                    ..ImageInfo::default()
                }),
                details: Mutex::new(ContainerDetails {
                    id: MOCK_CONTAINER_ID.to_owned(),
                    running: true,
                    ip_address: "172.17.0.2".to_owned(),
                    network_mode: "bridge".to_owned(),
                    ..ContainerDetails::default()
                }),
                exec_result: ExecOutput::default(),
                logs: ContainerLogs::default(),
                die_on_start: None,
                fail_create: false,
                calls: Mutex::new(Vec::new()),
                created: Mutex::new(None),
                exec_calls: Mutex::new(Vec::new()),
                events: Mutex::new(None),
            }
        }
    }

    impl MockDockerClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_image(mut self, image: ImageInfo) -> Self {
            self.image = Some(image);
            self
        }

        /// Image lookups fail with `ImageNotFound`.
        pub fn without_image(mut self) -> Self {
            self.image = None;
            self
        }

        /// Publishes a container port on `127.0.0.1:host_port`.
        pub fn with_published_port(self, container: PortKey, host_port: u16) -> Self {
            if let Ok(mut details) = self.details.lock() {
                details.ports.insert(
                    container,
                    vec![HostPort {
                        host_ip: "127.0.0.1".to_owned(),
                        host_port,
                    }],
                );
            }
            self
        }

        pub fn with_network_mode(self, mode: &str, ip: &str) -> Self {
            if let Ok(mut details) = self.details.lock() {
                details.network_mode = mode.to_owned();
                details.ip_address = ip.to_owned();
            }
            self
        }

        pub fn with_exec_result(mut self, output: &str, exit_code: i64) -> Self {
            self.exec_result = ExecOutput {
                output: output.as_bytes().to_vec(),
                exit_code,
            };
            self
        }

        pub fn with_logs(mut self, stdout: &str, stderr: &str) -> Self {
            self.logs = ContainerLogs {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            };
            self
        }

        /// The container exits right after start.
        pub fn with_die_on_start(mut self, exit_code: i64) -> Self {
            self.die_on_start = Some(exit_code);
            self
        }

        pub fn with_failing_create(mut self) -> Self {
            self.fail_create = true;
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn call_count(&self, name: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == name).count()
        }

        pub fn created_spec(&self) -> Option<LaunchSpec> {
            self.created.lock().ok().and_then(|c| c.clone())
        }

        pub fn exec_calls(&self) -> Vec<(Vec<String>, Option<Vec<u8>>)> {
            self.exec_calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        /// Emits a `die` event and marks the container stopped.
        ///
        /// Returns false when nobody is subscribed.
        pub async fn emit_die(&self, exit_code: i64) -> bool {
            self.set_stopped(exit_code);
            self.send_die(Some(exit_code)).await
        }

        /// A `die` event that carries no `exitCode` attribute.
        pub async fn emit_die_without_code(&self) -> bool {
            self.send_die(None).await
        }

        /// Ends the event stream as a failed daemon subscription would.
        pub fn drop_event_stream(&self) {
            if let Ok(mut events) = self.events.lock() {
                events.take();
            }
        }

        async fn send_die(&self, exit_code: Option<i64>) -> bool {
            let sender = self.events.lock().ok().and_then(|s| s.clone());
            match sender {
                Some(tx) => tx
                    .send(RuntimeEvent {
                        action: "die".to_owned(),
                        container_id: MOCK_CONTAINER_ID.to_owned(),
                        exit_code,
                    })
                    .await
                    .is_ok(),
                None => false,
            }
        }

        fn set_stopped(&self, exit_code: i64) {
            if let Ok(mut details) = self.details.lock() {
                details.running = false;
                details.exit_code = exit_code;
            }
        }

        fn record(&self, name: &str) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(name.to_owned());
            }
        }

        fn check_id(&self, id: &str) -> Result<(), InspectorError> {
            validate_container_id(id)?;
            if id == MOCK_CONTAINER_ID {
                Ok(())
            } else {
                Err(InspectorError::ContainerNotFound(id.to_owned()))
            }
        }
    }

    impl DockerClient for MockDockerClient {
        async fn image_info(&self, image: &str) -> Result<ImageInfo, InspectorError> {
            self.record("image_info");
            self.image
                .clone()
                .ok_or_else(|| InspectorError::ImageNotFound(image.to_owned()))
        }

        async fn create_container(&self, spec: &LaunchSpec) -> Result<String, InspectorError> {
            self.record("create_container");
            if self.fail_create {
                return Err(InspectorError::DockerApi("mock create failure".to_owned()));
            }
            if let Ok(mut created) = self.created.lock() {
                *created = Some(spec.clone());
            }
            Ok(MOCK_CONTAINER_ID.to_owned())
        }

        async fn connect_network(&self, id: &str, _network: &str) -> Result<(), InspectorError> {
            self.record("connect_network");
            self.check_id(id)
        }

        async fn start_container(&self, id: &str) -> Result<(), InspectorError> {
            self.record("start_container");
            self.check_id(id)?;
            if let Some(code) = self.die_on_start {
                self.emit_die(code).await;
            }
            Ok(())
        }

        async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, InspectorError> {
            self.record("inspect_container");
            self.check_id(id)?;
            self.details
                .lock()
                .map(|d| d.clone())
                .map_err(|_| InspectorError::DockerApi("mock state poisoned".to_owned()))
        }

        async fn container_events(
            &self,
            id: &str,
        ) -> Result<mpsc::Receiver<RuntimeEvent>, InspectorError> {
            self.record("container_events");
            self.check_id(id)?;
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            if let Ok(mut events) = self.events.lock() {
                *events = Some(tx);
            }
            Ok(rx)
        }

        async fn stop_container(
            &self,
            id: &str,
            _grace_secs: i64,
        ) -> Result<StopOutcome, InspectorError> {
            self.record("stop_container");
            self.check_id(id)?;
            let was_running = self.details.lock().map(|d| d.running).unwrap_or(false);
            if was_running {
                self.set_stopped(137);
                Ok(StopOutcome::Stopped)
            } else {
                Ok(StopOutcome::NotRunning)
            }
        }

        async fn remove_container(&self, id: &str) -> Result<(), InspectorError> {
            self.record("remove_container");
            self.check_id(id)
        }

        async fn kill_container(&self, id: &str) -> Result<(), InspectorError> {
            self.record("kill_container");
            self.check_id(id)
        }

        async fn container_logs(&self, id: &str) -> Result<ContainerLogs, InspectorError> {
            self.record("container_logs");
            self.check_id(id)?;
            Ok(self.logs.clone())
        }

        async fn exec(
            &self,
            id: &str,
            argv: Vec<String>,
            stdin: Option<Vec<u8>>,
        ) -> Result<ExecOutput, InspectorError> {
            self.record("exec");
            self.check_id(id)?;
            if let Ok(mut calls) = self.exec_calls.lock() {
                calls.push((argv, stdin));
            }
            Ok(self.exec_result.clone())
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MOCK_CONTAINER_ID;

/// Host address for reaching published ports.
///
/// A `tcp://` `DOCKER_HOST` names a remote daemon whose published ports
/// live on that host; everything else is local.
pub fn docker_host_ip(docker_host: Option<&str>) -> String {
    let Some(rest) = docker_host.and_then(|h| h.strip_prefix("tcp://")) else {
        return "127.0.0.1".to_owned();
    };
    let host = if let Some(bracketed) = rest.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        rest.split([':', '/']).next().unwrap_or_default()
    };
    if host.is_empty() {
        "127.0.0.1".to_owned()
    } else {
        host.to_owned()
    }
}
