use anyhow::{Context, Result};
use bollard::Docker;
use clap::Parser;
use colored::Colorize;
use pulsar_fixture::builder::{DEFAULT_IMAGE, DEFAULT_TAG};
use pulsar_fixture::{ContainerEngine, PulsarBuilder, PulsarConfig, PulsarContainer, Toggle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version = env!("GIT_VERSION"), about = "Pulsar Fixture - Run a disposable Apache Pulsar standalone container", long_about = None)]
struct Args {
    /// Image repository
    #[arg(short = 'i', long, env = "PULSAR_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Image tag
    #[arg(short = 't', long, env = "PULSAR_TAG", default_value = DEFAULT_TAG)]
    tag: String,

    /// Docker socket path
    #[arg(short = 's', long, env = "DOCKER_SOCKET", default_value = "unix:///var/run/docker.sock")]
    socket: String,

    /// Enable token authentication
    #[arg(long)]
    auth: bool,

    /// Start without the functions worker and stream storage
    #[arg(long)]
    no_functions_worker: bool,

    /// Mint a token valid for this many seconds (requires --auth)
    #[arg(long, value_name = "SECS")]
    token_expiry: Option<u64>,

    /// Seconds to wait for the broker to become ready
    #[arg(long, default_value_t = 120)]
    startup_timeout: u64,

    /// Print the startup script and exit without touching Docker
    #[arg(long)]
    print_script: bool,

    /// Write the startup script to this file and exit without touching Docker
    #[arg(long, value_name = "PATH")]
    script_out: Option<PathBuf>,

    /// Remove the container right after printing its addresses
    #[arg(long)]
    once: bool,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn builder(&self) -> PulsarBuilder {
        let mut builder = PulsarBuilder::new()
            .with_image(&self.image)
            .with_tag(&self.tag)
            .with_startup_timeout(Duration::from_secs(self.startup_timeout));
        if self.auth {
            builder = builder.with_authentication(true);
        }
        if self.no_functions_worker {
            builder = builder.with_functions_worker(false);
        }
        builder
    }
}

fn write_script(config: &PulsarConfig, path: &Path) -> Result<()> {
    fs::write(path, pulsar_fixture::build_startup_script(config))
        .with_context(|| format!("Failed to write startup script to {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        "pulsar_fixture=debug,bollard=info"
    } else {
        "pulsar_fixture=info,bollard=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();

    let builder = args.builder();

    if args.print_script {
        let script = pulsar_fixture::build_startup_script(builder.config());
        println!("{}", String::from_utf8_lossy(&script));
        return Ok(());
    }

    if let Some(path) = &args.script_out {
        write_script(builder.config(), path)?;
        info!("{} Wrote startup script to {}", "✓".bright_green(), path.display());
        return Ok(());
    }

    if args.token_expiry.is_some() && builder.config().authentication != Toggle::Enabled {
        return Err(anyhow::anyhow!("--token-expiry requires --auth"));
    }

    println!("{}", "Pulsar Fixture".bright_cyan().bold());
    println!("{}", "==============".bright_cyan());
    println!();

    // Connect to Docker
    info!("{} {}", "Connecting to Docker at".bright_blue(), args.socket.bright_white());
    let docker = Docker::connect_with_socket(&args.socket, 120, bollard::API_DEFAULT_VERSION)
        .context("Failed to connect to Docker socket")?;

    // Verify connection
    let version = docker.version().await.context("Failed to verify Docker connection")?;
    info!("{} Docker {}", "✓".bright_green(), version.version.unwrap_or_default().bright_white());
    println!();

    info!("{} {}", "Starting".bright_yellow(), builder.image_reference().bright_white());
    let pulsar = builder.start(docker).await.context("Failed to start Pulsar")?;
    info!(
        "{} Container {} ready",
        "✓".bright_green(),
        pulsar.engine().short_id().bright_black()
    );
    println!();

    // The container is removed whatever happens after it started
    let outcome = serve(&pulsar, &args).await;

    let removed = pulsar.engine().remove().await.context("Failed to remove container");
    match &removed {
        Ok(()) => info!("{} {}", "✓".bright_green(), "Container removed".bright_white()),
        Err(e) => error!("{} {:#}", "✗".bright_red(), e),
    }

    outcome.and(removed)
}

async fn serve<E: ContainerEngine>(pulsar: &PulsarContainer<E>, args: &Args) -> Result<()> {
    let broker = pulsar.broker_address().await.context("Failed to resolve broker address")?;
    let service = pulsar.service_address().await.context("Failed to resolve service address")?;
    println!("{} Broker:  {}", "→".bright_cyan(), broker.bright_white());
    println!("{} Service: {}", "→".bright_cyan(), service.bright_white());

    if let Some(secs) = args.token_expiry {
        let token = pulsar
            .create_authentication_token(Duration::from_secs(secs), &CancellationToken::new())
            .await
            .context("Failed to create authentication token")?;
        println!("{} Token:   {}", "→".bright_cyan(), token.trim().bright_white());
    }
    println!();

    if !args.once {
        info!("{}", "Press Ctrl-C to stop...".bright_yellow());
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pulsar_fixture::FakeContainerEngine;
    use tempfile::NamedTempFile;

    #[test]
    fn test_args_map_to_builder_toggles() {
        let args = Args::parse_from(["pulsar-fixture", "--tag", "3.2.1", "--auth", "--no-functions-worker"]);
        let builder = args.builder();
        assert_eq!(builder.image_reference(), "apachepulsar/pulsar:3.2.1");
        assert_eq!(builder.config().authentication, Toggle::Enabled);
        assert_eq!(builder.config().functions_worker, Toggle::Disabled);
    }

    #[test]
    fn test_args_leave_toggles_unspecified_by_default() {
        let args = Args::parse_from(["pulsar-fixture"]);
        let builder = args.builder();
        assert_eq!(builder.config().authentication, Toggle::Unspecified);
        assert_eq!(builder.config().functions_worker, Toggle::Unspecified);
    }

    #[tokio::test]
    async fn test_serve_surfaces_token_failure() {
        let engine = FakeContainerEngine::new("localhost")
            .with_port(pulsar_fixture::BROKER_PORT, 49_153)
            .with_port(pulsar_fixture::WEB_SERVICE_PORT, 49_154);
        engine.set_exec_output(1, "", "boom");
        let mut config = PulsarConfig::new("3.0.6");
        config.authentication = Toggle::Enabled;
        let pulsar = PulsarContainer::new(config, engine);

        let args = Args::parse_from(["pulsar-fixture", "--auth", "--token-expiry", "10", "--once"]);
        let err = serve(&pulsar, &args).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[tokio::test]
    async fn test_serve_once_returns_after_addresses() {
        let engine = FakeContainerEngine::new("localhost")
            .with_port(pulsar_fixture::BROKER_PORT, 49_153)
            .with_port(pulsar_fixture::WEB_SERVICE_PORT, 49_154);
        let pulsar = PulsarContainer::new(PulsarConfig::new("3.0.6"), engine);

        let args = Args::parse_from(["pulsar-fixture", "--once"]);
        serve(&pulsar, &args).await.unwrap();
        assert!(pulsar.engine().exec_calls().is_empty());
    }

    #[test]
    fn test_write_script_to_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        let mut config = PulsarConfig::new("3.0.6");
        config.functions_worker = Toggle::Disabled;
        write_script(&config, &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "#!/bin/bash\nbin/pulsar standalone --no-functions-worker --no-stream-storage"
        );
    }
}
