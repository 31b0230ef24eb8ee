use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::error::{FixtureError, Result};
use crate::types::{PulsarConfig, BROKER_PORT, WEB_SERVICE_PORT};

/// Where the boot script lives inside the container.
pub const STARTUP_SCRIPT_PATH: &str = "/testcontainers.sh";

/// rwxr-xr-x
pub const STARTUP_SCRIPT_MODE: u32 = 0o755;

pub const SECRET_KEY_PATH: &str = "/pulsar/secret.key";

/// Subject tokens are minted for; also the configured superuser role.
pub const TOKEN_SUBJECT: &str = "test-user";

const SHEBANG: &str = "#!/bin/bash";

const AUTH_SETUP: [&str; 4] = [
    "bin/pulsar tokens create-secret-key --output /pulsar/secret.key",
    "export brokerClientAuthenticationParameters=token:$(bin/pulsar tokens create --secret-key $PULSAR_PREFIX_tokenSecretKey --subject $superUserRoles)",
    "export CLIENT_PREFIX_authParams=$brokerClientAuthenticationParameters",
    "bin/apply-config-from-env.py conf/standalone.conf && bin/apply-config-from-env-with-prefix.py CLIENT_PREFIX_ conf/client.conf",
];

const STANDALONE: &str = "bin/pulsar standalone";

/// Handle on a running Pulsar standalone instance.
pub struct PulsarContainer<E> {
    config: PulsarConfig,
    engine: E,
}

impl<E: ContainerEngine> PulsarContainer<E> {
    pub const fn new(config: PulsarConfig, engine: E) -> Self {
        Self { config, engine }
    }

    pub const fn config(&self) -> &PulsarConfig {
        &self.config
    }

    pub const fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// `pulsar://host:port` for client libraries.
    pub async fn broker_address(&self) -> Result<String> {
        let port = self.engine.mapped_public_port(BROKER_PORT).await?;
        Ok(format!("pulsar://{}:{}", self.engine.hostname(), port))
    }

    /// `http://host:port` for the admin REST API.
    pub async fn service_address(&self) -> Result<String> {
        let port = self.engine.mapped_public_port(WEB_SERVICE_PORT).await?;
        Ok(format!("http://{}:{}", self.engine.hostname(), port))
    }

    /// Mints a JWT for [`TOKEN_SUBJECT`] valid for `expire`.
    ///
    /// Fails without touching the container when authentication was
    /// explicitly turned off. The token is the command's stdout, unmodified.
    pub async fn create_authentication_token(
        &self,
        expire: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.config.authentication.is_disabled() {
            return Err(FixtureError::AuthDisabled);
        }

        let scale = self.config.token_expiry_scale();
        if scale != 1 {
            warn!(
                image_tag = %self.config.image_tag,
                "Pulsar 3.2 images treat --expiry-time as milliseconds; scaling the expiry by {}",
                scale
            );
        }

        let argv = token_command(scaled_expiry_seconds(expire, scale));
        debug!("Creating token: {}", argv.join(" "));

        let output = self.engine.exec(&argv, cancel).await?;
        if !output.success() {
            return Err(FixtureError::Command {
                stderr: output.stderr,
            });
        }

        Ok(output.stdout)
    }

    /// Shell script the container entrypoint waits for and then runs.
    pub fn startup_script(&self) -> Vec<u8> {
        build_startup_script(&self.config)
    }

    /// Copies the startup script to [`STARTUP_SCRIPT_PATH`], which releases
    /// the container's entrypoint.
    pub async fn install_startup_script(&self) -> Result<()> {
        let script = self.startup_script();
        self.engine
            .copy_to_container(&script, STARTUP_SCRIPT_PATH, STARTUP_SCRIPT_MODE)
            .await?;
        info!("Installed startup script at {}", STARTUP_SCRIPT_PATH);
        Ok(())
    }
}

/// Whole seconds of `expire * scale`; the fraction is dropped after scaling.
fn scaled_expiry_seconds(expire: Duration, scale: u64) -> u64 {
    let millis = expire.as_millis().saturating_mul(u128::from(scale)) / 1000;
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn token_command(expiry_seconds: u64) -> Vec<String> {
    [
        "bin/pulsar",
        "tokens",
        "create",
        "--secret-key",
        SECRET_KEY_PATH,
        "--subject",
        TOKEN_SUBJECT,
        "--expiry-time",
    ]
    .iter()
    .map(ToString::to_string)
    .chain(std::iter::once(format!("{expiry_seconds}s")))
    .collect()
}

/// Lines are joined with `\n` on every platform; the standalone command is
/// the last line and has no trailing newline.
pub fn build_startup_script(config: &PulsarConfig) -> Vec<u8> {
    let mut lines = vec![SHEBANG.to_string()];

    if config.authentication.is_enabled() {
        lines.extend(AUTH_SETUP.iter().map(ToString::to_string));
    }

    let mut standalone = STANDALONE.to_string();
    if config.functions_worker.is_disabled() {
        standalone.push_str(" --no-functions-worker --no-stream-storage");
    }
    lines.push(standalone);

    lines.join("\n").into_bytes()
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
    use crate::types::Toggle;

    fn container(tag: &str, authentication: Toggle) -> PulsarContainer<FakeContainerEngine> {
        let config = PulsarConfig {
            image_tag: tag.to_string(),
            authentication,
            functions_worker: Toggle::Unspecified,
        };
        let engine = FakeContainerEngine::new("docker.local")
            .with_port(BROKER_PORT, 49_153)
            .with_port(WEB_SERVICE_PORT, 49_154);
        PulsarContainer::new(config, engine)
    }

    fn expiry_arg(argv: &[String]) -> String {
        let idx = argv.iter().position(|a| a == "--expiry-time").unwrap();
        argv[idx + 1].clone()
    }

    #[tokio::test]
    async fn test_addresses_use_hostname_and_mapped_ports() {
        let pulsar = container("3.0.6", Toggle::Unspecified);
        assert_eq!(
            pulsar.broker_address().await.unwrap(),
            "pulsar://docker.local:49153"
        );
        assert_eq!(
            pulsar.service_address().await.unwrap(),
            "http://docker.local:49154"
        );
    }

    #[tokio::test]
    async fn test_address_fails_when_port_not_mapped() {
        let engine = FakeContainerEngine::new("localhost");
        let pulsar = PulsarContainer::new(PulsarConfig::new("3.0.6"), engine);
        let err = pulsar.broker_address().await.unwrap_err();
        assert!(matches!(err, FixtureError::PortNotMapped(BROKER_PORT)));
    }

    #[tokio::test]
    async fn test_token_refused_when_authentication_disabled() {
        let pulsar = container("3.0.6", Toggle::Disabled);
        let err = pulsar
            .create_authentication_token(Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::AuthDisabled));
        assert!(pulsar.engine().exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_token_command_line() {
        let pulsar = container("3.0.6", Toggle::Enabled);
        pulsar
            .create_authentication_token(Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        let calls = pulsar.engine().exec_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                "bin/pulsar",
                "tokens",
                "create",
                "--secret-key",
                "/pulsar/secret.key",
                "--subject",
                "test-user",
                "--expiry-time",
                "60s",
            ]
        );
    }

    #[tokio::test]
    async fn test_token_expiry_scaled_for_affected_tags() {
        for (tag, expected) in [
            ("3.2.1", "10000s"),
            ("latest-foo", "10000s"),
            ("latest", "10000s"),
            ("3.3.0", "10s"),
        ] {
            let pulsar = container(tag, Toggle::Unspecified);
            pulsar
                .create_authentication_token(Duration::from_secs(10), &CancellationToken::new())
                .await
                .unwrap();
            let calls = pulsar.engine().exec_calls();
            assert_eq!(expiry_arg(&calls[0]), expected, "tag {tag}");
        }
    }

    #[tokio::test]
    async fn test_token_expiry_scaled_before_truncation() {
        for (tag, expire, expected) in [
            ("3.2.1", Duration::from_millis(1500), "1500s"),
            ("latest", Duration::from_millis(250), "250s"),
            ("3.3.0", Duration::from_millis(1500), "1s"),
        ] {
            let pulsar = container(tag, Toggle::Unspecified);
            pulsar
                .create_authentication_token(expire, &CancellationToken::new())
                .await
                .unwrap();
            let calls = pulsar.engine().exec_calls();
            assert_eq!(expiry_arg(&calls[0]), expected, "tag {tag}");
        }
    }

    #[test]
    fn test_scaled_expiry_saturates() {
        assert_eq!(scaled_expiry_seconds(Duration::MAX, 1000), u64::MAX);
        assert_eq!(scaled_expiry_seconds(Duration::from_secs(10), 1), 10);
    }

    #[tokio::test]
    async fn test_token_is_stdout_verbatim() {
        let pulsar = container("3.0.6", Toggle::Enabled);
        pulsar.engine().set_exec_output(0, "abc.def.ghi", "");
        let token = pulsar
            .create_authentication_token(Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token, "abc.def.ghi");
    }

    #[tokio::test]
    async fn test_token_command_failure_reports_stderr() {
        let pulsar = container("3.0.6", Toggle::Enabled);
        pulsar.engine().set_exec_output(1, "", "boom");
        let err = pulsar
            .create_authentication_token(Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::Command { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_token_creation_cancelled() {
        let pulsar = container("3.0.6", Toggle::Enabled);
        pulsar.engine().set_exec_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = pulsar
            .create_authentication_token(Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::Cancelled));
    }

    #[test]
    fn test_startup_script_defaults() {
        let script = build_startup_script(&PulsarConfig::new("3.0.6"));
        assert_eq!(script, b"#!/bin/bash\nbin/pulsar standalone");
    }

    #[test]
    fn test_startup_script_with_auth_and_no_functions_worker() {
        let config = PulsarConfig {
            image_tag: "3.0.6".to_string(),
            authentication: Toggle::Enabled,
            functions_worker: Toggle::Disabled,
        };
        let script = String::from_utf8(build_startup_script(&config)).unwrap();
        let lines: Vec<&str> = script.split('\n').collect();

        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(&lines[1..5], &AUTH_SETUP[..]);
        assert_eq!(
            lines[5],
            "bin/pulsar standalone --no-functions-worker --no-stream-storage"
        );
        assert!(!script.ends_with('\n'));
        assert!(!script.contains('\r'));
    }

    #[test]
    fn test_startup_script_ignores_unset_and_negative_flags() {
        let config = PulsarConfig {
            image_tag: "3.0.6".to_string(),
            authentication: Toggle::Disabled,
            functions_worker: Toggle::Enabled,
        };
        assert_eq!(
            build_startup_script(&config),
            b"#!/bin/bash\nbin/pulsar standalone"
        );
    }

    #[tokio::test]
    async fn test_install_startup_script_copies_executable() {
        let pulsar = container("3.0.6", Toggle::Enabled);
        pulsar.install_startup_script().await.unwrap();

        let copies = pulsar.engine().copy_calls();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].path, "/testcontainers.sh");
        assert_eq!(copies[0].mode, 0o755);
        assert_eq!(copies[0].content, pulsar.startup_script());
    }
}
