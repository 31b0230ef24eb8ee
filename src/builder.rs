use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, StartContainerOptions,
};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{PulsarContainer, SECRET_KEY_PATH, STARTUP_SCRIPT_PATH, TOKEN_SUBJECT};
use crate::docker::DockerContainer;
use crate::engine::ContainerEngine;
use crate::error::{FixtureError, Result};
use crate::types::{ExecOutput, PulsarConfig, Toggle, BROKER_PORT, WEB_SERVICE_PORT};

pub const DEFAULT_IMAGE: &str = "apachepulsar/pulsar";
pub const DEFAULT_TAG: &str = "3.0.6";

const TOKEN_AUTH_PLUGIN: &str = "org.apache.pulsar.client.impl.auth.AuthenticationToken";
const TOKEN_AUTH_PROVIDER: &str =
    "org.apache.pulsar.broker.authentication.AuthenticationProviderToken";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configures and starts a Pulsar standalone container.
#[derive(Debug, Clone)]
pub struct PulsarBuilder {
    image: String,
    config: PulsarConfig,
    env: Vec<(String, String)>,
    startup_timeout: Duration,
}

impl Default for PulsarBuilder {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            config: PulsarConfig::new(DEFAULT_TAG),
            env: Vec::new(),
            startup_timeout: Duration::from_secs(120),
        }
    }
}

impl PulsarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.image_tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_authentication(mut self, enabled: bool) -> Self {
        self.config.authentication = Toggle::from(enabled);
        self
    }

    #[must_use]
    pub fn with_functions_worker(mut self, enabled: bool) -> Self {
        self.config.functions_worker = Toggle::from(enabled);
        self
    }

    /// Extra environment variable passed to the container.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub const fn config(&self) -> &PulsarConfig {
        &self.config
    }

    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image, self.config.image_tag)
    }

    /// `KEY=value` pairs for the container, including the broker settings
    /// token authentication needs.
    pub fn environment(&self) -> Vec<String> {
        let mut env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        if self.config.authentication.is_enabled() {
            let secret_key = format!("file://{SECRET_KEY_PATH}");
            env.extend([
                "authenticationEnabled=true".to_string(),
                format!("authenticationProviders={TOKEN_AUTH_PROVIDER}"),
                "authorizationEnabled=true".to_string(),
                format!("tokenSecretKey={secret_key}"),
                format!("PULSAR_PREFIX_tokenSecretKey={secret_key}"),
                format!("superUserRoles={TOKEN_SUBJECT}"),
                format!("brokerClientAuthenticationPlugin={TOKEN_AUTH_PLUGIN}"),
                format!("CLIENT_PREFIX_authPlugin={TOKEN_AUTH_PLUGIN}"),
            ]);
        }

        env
    }

    /// Blocks until the startup script shows up, then runs it.
    pub fn entrypoint() -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "while [ ! -f {STARTUP_SCRIPT_PATH} ]; do sleep 0.1; done; {STARTUP_SCRIPT_PATH}"
            ),
        ]
    }

    fn create_body(&self) -> ContainerCreateBody {
        let ports = [BROKER_PORT, WEB_SERVICE_PORT].map(|port| format!("{port}/tcp"));

        let exposed_ports = ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let port_bindings = ports
            .iter()
            .map(|port| {
                (
                    port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(String::new()),
                    }]),
                )
            })
            .collect();

        ContainerCreateBody {
            image: Some(self.image_reference()),
            env: Some(self.environment()),
            entrypoint: Some(Self::entrypoint()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Creates and starts the container, installs the startup script and
    /// waits until the broker answers admin requests.
    ///
    /// The image is pulled first when it is not present locally. On failure
    /// after creation the container is removed again.
    pub async fn start(self, docker: Docker) -> Result<PulsarContainer<DockerContainer>> {
        self.ensure_image(&docker).await?;

        info!(
            "Creating container from {} (authentication {}, functions worker {})",
            self.image_reference(),
            self.config.authentication,
            self.config.functions_worker
        );
        let created = docker
            .create_container(None::<CreateContainerOptions>, self.create_body())
            .await?;
        for warning in &created.warnings {
            warn!("Docker: {}", warning);
        }

        let engine = DockerContainer::new(docker.clone(), created.id);
        let pulsar = PulsarContainer::new(self.config.clone(), engine);

        if let Err(e) = self.boot(&docker, &pulsar).await {
            if let Err(remove_err) = pulsar.engine().remove().await {
                warn!("Failed to remove container after error: {}", remove_err);
            }
            return Err(e);
        }

        Ok(pulsar)
    }

    async fn ensure_image(&self, docker: &Docker) -> Result<()> {
        let reference = self.image_reference();
        if docker.inspect_image(&reference).await.is_ok() {
            debug!("Image {} already present", reference);
            return Ok(());
        }

        info!("Pulling {}", reference);
        let mut progress = docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(self.image.clone()),
                tag: Some(self.config.image_tag.clone()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(update) = progress.next().await {
            let update = update?;
            if let Some(status) = update.status {
                debug!("{}: {}", reference, status);
            }
        }
        Ok(())
    }

    async fn boot(&self, docker: &Docker, pulsar: &PulsarContainer<DockerContainer>) -> Result<()> {
        let id = pulsar.engine().id();
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        info!("Started container {}", pulsar.engine().short_id());

        pulsar.install_startup_script().await?;
        wait_until_ready(pulsar, self.startup_timeout).await
    }
}

/// Admin command that must exit 0, optionally printing `expect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub argv: Vec<String>,
    pub expect: Option<&'static str>,
}

impl ReadinessProbe {
    fn admin(args: &[&str], expect: Option<&'static str>) -> Self {
        Self {
            argv: std::iter::once("bin/pulsar-admin")
                .chain(args.iter().copied())
                .map(ToString::to_string)
                .collect(),
            expect,
        }
    }

    fn passed(&self, output: &ExecOutput) -> bool {
        output.success() && self.expect.is_none_or(|e| output.stdout.contains(e))
    }
}

/// Probes that must pass before the fixture is usable.
pub fn readiness_probes(config: &PulsarConfig) -> Vec<ReadinessProbe> {
    let mut probes = vec![ReadinessProbe::admin(&["clusters", "list"], Some("standalone"))];
    if !config.functions_worker.is_disabled() {
        probes.push(ReadinessProbe::admin(&["functions-worker", "get-cluster"], None));
    }
    probes
}

/// Polls [`readiness_probes`] until each passes or `timeout` elapses.
///
/// Each exec is bounded by the deadline; engine errors before the deadline
/// count as a failed attempt.
pub async fn wait_until_ready<E: ContainerEngine>(
    pulsar: &PulsarContainer<E>,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let cancel = CancellationToken::new();

    for probe in readiness_probes(pulsar.config()) {
        loop {
            match timeout_at(deadline, pulsar.engine().exec(&probe.argv, &cancel)).await {
                Err(_elapsed) => {
                    cancel.cancel();
                    return Err(FixtureError::Timeout(timeout));
                }
                Ok(Err(FixtureError::Cancelled)) => return Err(FixtureError::Cancelled),
                Ok(Err(e)) => {
                    debug!("Probe {} errored: {}", probe.argv.join(" "), e);
                }
                Ok(Ok(output)) if probe.passed(&output) => {
                    debug!("Probe passed: {}", probe.argv.join(" "));
                    break;
                }
                Ok(Ok(_)) => {}
            }

            if Instant::now() >= deadline {
                return Err(FixtureError::Timeout(timeout));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    info!("Pulsar is ready");
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::engine::FakeContainerEngine;

    #[test]
    fn test_builder_defaults() {
        let builder = PulsarBuilder::new();
        assert_eq!(builder.image_reference(), "apachepulsar/pulsar:3.0.6");
        assert_eq!(builder.config().authentication, Toggle::Unspecified);
        assert_eq!(builder.config().functions_worker, Toggle::Unspecified);
        assert!(builder.environment().is_empty());
    }

    #[test]
    fn test_builder_sets_toggles_and_tag() {
        let builder = PulsarBuilder::new()
            .with_image("registry.local/pulsar")
            .with_tag("3.2.1")
            .with_authentication(true)
            .with_functions_worker(false);
        assert_eq!(builder.image_reference(), "registry.local/pulsar:3.2.1");
        assert_eq!(builder.config().authentication, Toggle::Enabled);
        assert_eq!(builder.config().functions_worker, Toggle::Disabled);
    }

    #[test]
    fn test_environment_with_authentication() {
        let env = PulsarBuilder::new()
            .with_env("PULSAR_MEM", "-Xms512m")
            .with_authentication(true)
            .environment();

        assert_eq!(env[0], "PULSAR_MEM=-Xms512m");
        for expected in [
            "authenticationEnabled=true",
            "authorizationEnabled=true",
            "tokenSecretKey=file:///pulsar/secret.key",
            "PULSAR_PREFIX_tokenSecretKey=file:///pulsar/secret.key",
            "superUserRoles=test-user",
            "brokerClientAuthenticationPlugin=org.apache.pulsar.client.impl.auth.AuthenticationToken",
            "CLIENT_PREFIX_authPlugin=org.apache.pulsar.client.impl.auth.AuthenticationToken",
        ] {
            assert!(env.iter().any(|e| e == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_environment_without_authentication() {
        let env = PulsarBuilder::new()
            .with_authentication(false)
            .environment();
        assert!(env.is_empty());
    }

    #[test]
    fn test_entrypoint_waits_for_script() {
        let entrypoint = PulsarBuilder::entrypoint();
        assert_eq!(entrypoint[0], "/bin/sh");
        assert_eq!(entrypoint[1], "-c");
        assert_eq!(
            entrypoint[2],
            "while [ ! -f /testcontainers.sh ]; do sleep 0.1; done; /testcontainers.sh"
        );
    }

    #[test]
    fn test_create_body_publishes_both_ports() {
        let body = PulsarBuilder::new().create_body();
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        assert!(bindings.contains_key("6650/tcp"));
        assert!(bindings.contains_key("8080/tcp"));
        assert_eq!(body.image.as_deref(), Some("apachepulsar/pulsar:3.0.6"));
    }

    #[test]
    fn test_readiness_probes_follow_functions_worker() {
        let mut config = PulsarConfig::new("3.0.6");
        assert_eq!(readiness_probes(&config).len(), 2);

        config.functions_worker = Toggle::Disabled;
        let probes = readiness_probes(&config);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].argv, vec!["bin/pulsar-admin", "clusters", "list"]);
        assert_eq!(probes[0].expect, Some("standalone"));
    }

    #[tokio::test]
    async fn test_wait_until_ready_passes_on_standalone_cluster() {
        let engine = FakeContainerEngine::new("localhost");
        engine.set_exec_output(0, "\"standalone\"\n", "");
        let mut config = PulsarConfig::new("3.0.6");
        config.functions_worker = Toggle::Disabled;
        let pulsar = PulsarContainer::new(config, engine);

        wait_until_ready(&pulsar, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pulsar.engine().exec_calls().len(), 1);
    }

    #[test]
    fn test_cluster_probe_requires_standalone_in_output() {
        let probe = &readiness_probes(&PulsarConfig::new("3.0.6"))[0];
        let mut output = ExecOutput {
            exit_code: 0,
            stdout: "\"other\"\n".to_string(),
            stderr: String::new(),
        };
        assert!(!probe.passed(&output));

        output.stdout = "\"standalone\"\n".to_string();
        assert!(probe.passed(&output));

        output.exit_code = 1;
        assert!(!probe.passed(&output));
    }

    #[tokio::test]
    async fn test_wait_until_ready_bounds_hung_exec() {
        let engine = FakeContainerEngine::new("localhost");
        engine.set_exec_delay(Duration::from_secs(30));
        let pulsar = PulsarContainer::new(PulsarConfig::new("3.0.6"), engine);

        let started = Instant::now();
        let err = wait_until_ready(&pulsar, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::Timeout(_)));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "hung exec outlived the startup timeout"
        );
    }

    #[tokio::test]
    async fn test_wait_until_ready_retries_engine_errors() {
        let engine = FakeContainerEngine::new("localhost");
        engine.set_exec_output(0, "\"standalone\"\n", "");
        engine.fail_next_execs(2);
        let mut config = PulsarConfig::new("3.0.6");
        config.functions_worker = Toggle::Disabled;
        let pulsar = PulsarContainer::new(config, engine);

        wait_until_ready(&pulsar, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(pulsar.engine().exec_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out() {
        let engine = FakeContainerEngine::new("localhost");
        engine.set_exec_output(1, "", "connection refused");
        let pulsar = PulsarContainer::new(PulsarConfig::new("3.0.6"), engine);

        let err = wait_until_ready(&pulsar, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, FixtureError::Timeout(_)));
    }
}
