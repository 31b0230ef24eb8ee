use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ExecOutput;

/// Operations the fixture needs from whatever runs the container.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Host name under which mapped ports are reachable.
    fn hostname(&self) -> &str;

    /// Host port that `container_port` (TCP) is published on.
    async fn mapped_public_port(&self, container_port: u16) -> Result<u16>;

    /// Run `argv` inside the container and collect its output.
    ///
    /// When `cancel` fires before the command finishes, the call returns
    /// [`FixtureError::Cancelled`](crate::FixtureError::Cancelled) and
    /// whatever the command produces afterwards is discarded.
    async fn exec(&self, argv: &[String], cancel: &CancellationToken) -> Result<ExecOutput>;

    /// Write `content` to `path` inside the container with the given mode.
    async fn copy_to_container(&self, content: &[u8], path: &str, mode: u32) -> Result<()>;
}

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::ContainerEngine;
    use crate::error::{FixtureError, Result};
    use crate::types::ExecOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Recorded file copy
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CopyCall {
        pub content: Vec<u8>,
        pub path: String,
        pub mode: u32,
    }

    #[derive(Default)]
    struct FakeEngineState {
        exec_calls: Vec<Vec<String>>,
        copy_calls: Vec<CopyCall>,
        exec_output: ExecOutput,
        exec_delay: Option<Duration>,
        exec_failures: usize,
    }

    /// In-memory engine for tests: fixed port map, scripted exec output.
    #[derive(Clone)]
    pub struct FakeContainerEngine {
        hostname: String,
        ports: HashMap<u16, u16>,
        inner: Arc<Mutex<FakeEngineState>>,
    }

    impl FakeContainerEngine {
        pub fn new(hostname: &str) -> Self {
            Self {
                hostname: hostname.to_string(),
                ports: HashMap::new(),
                inner: Arc::new(Mutex::new(FakeEngineState::default())),
            }
        }

        #[must_use]
        pub fn with_port(mut self, container_port: u16, host_port: u16) -> Self {
            self.ports.insert(container_port, host_port);
            self
        }

        /// Output every subsequent exec call returns
        pub fn set_exec_output(&self, exit_code: i64, stdout: &str, stderr: &str) {
            self.state().exec_output = ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            };
        }

        /// Make exec calls take `delay` before completing
        pub fn set_exec_delay(&self, delay: Duration) {
            self.state().exec_delay = Some(delay);
        }

        /// Make the next `count` exec calls fail with an engine error
        pub fn fail_next_execs(&self, count: usize) {
            self.state().exec_failures = count;
        }

        pub fn exec_calls(&self) -> Vec<Vec<String>> {
            self.state().exec_calls.clone()
        }

        pub fn copy_calls(&self) -> Vec<CopyCall> {
            self.state().copy_calls.clone()
        }

        fn state(&self) -> std::sync::MutexGuard<'_, FakeEngineState> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeContainerEngine {
        fn hostname(&self) -> &str {
            &self.hostname
        }

        async fn mapped_public_port(&self, container_port: u16) -> Result<u16> {
            self.ports
                .get(&container_port)
                .copied()
                .ok_or(FixtureError::PortNotMapped(container_port))
        }

        async fn exec(&self, argv: &[String], cancel: &CancellationToken) -> Result<ExecOutput> {
            let (output, delay) = {
                let mut state = self.state();
                state.exec_calls.push(argv.to_vec());
                if state.exec_failures > 0 {
                    state.exec_failures -= 1;
                    return Err(FixtureError::Archive(std::io::Error::other(
                        "engine unavailable",
                    )));
                }
                (state.exec_output.clone(), state.exec_delay)
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(FixtureError::Cancelled),
                () = tokio::time::sleep(delay.unwrap_or_default()) => Ok(output),
            }
        }

        async fn copy_to_container(&self, content: &[u8], path: &str, mode: u32) -> Result<()> {
            self.state().copy_calls.push(CopyCall {
                content: content.to_vec(),
                path: path.to_string(),
                mode,
            });
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::{CopyCall, FakeContainerEngine};
