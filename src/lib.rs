//! Disposable Apache Pulsar standalone containers for integration tests.
//!
//! [`PulsarBuilder`] provisions the container through Docker and hands back a
//! [`PulsarContainer`], which knows the broker/admin addresses, can mint
//! authentication tokens and renders the script the container boots with.

pub mod builder;
pub mod container;
pub mod docker;
pub mod engine;
pub mod error;
pub mod types;

pub use builder::PulsarBuilder;
pub use container::{build_startup_script, PulsarContainer};
pub use docker::DockerContainer;
pub use engine::ContainerEngine;
#[cfg(any(test, feature = "test-support"))]
pub use engine::{CopyCall, FakeContainerEngine};
pub use error::{FixtureError, Result};
pub use types::{ExecOutput, PulsarConfig, Toggle, BROKER_PORT, WEB_SERVICE_PORT};
