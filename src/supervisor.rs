//! Launching the gateway and driving its lifecycle state.
//!
//! A launch runs the bootstrap steps in order (token, config file, port),
//! spawns the child, broadcasts `starting`, and leaves a background task
//! probing the port. The probe ends the attempt with `ready` or `failed`
//! unless `stop` got there first.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::error::LaunchError;
use crate::net::{self, Readiness};
use crate::output::{sanitize_text, TailBuffer};
use crate::process::{GatewayState, LaunchSpec, LOOPBACK_HOST};
use crate::runner::{self, GatewayChild};
use crate::state::StateHub;

/// Owns the gateway child and is the only writer of its `StateHub`.
#[derive(Debug)]
pub struct Supervisor {
    spec: LaunchSpec,
    hub: Arc<StateHub>,
    child: Mutex<Option<GatewayChild>>,
    cancelled: AtomicBool,
}

impl Supervisor {
    pub fn new(spec: LaunchSpec, hub: Arc<StateHub>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            hub,
            child: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn hub(&self) -> &Arc<StateHub> {
        &self.hub
    }

    /// Starts a launch attempt.
    ///
    /// Failures to get the gateway going are reported as a `failed` state,
    /// not as an error. On a successful spawn the readiness probe keeps
    /// running in the returned task. Errors only if a gateway is still live.
    pub async fn launch(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>, LaunchError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if child.try_exit_status().is_none() {
                return Err(LaunchError::AlreadyRunning {
                    pid: child.id().unwrap_or(0),
                });
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            debug!("supervisor stopped, not launching");
            return Ok(None);
        }
        let attempt = self.hub.reset();

        let spec = &self.spec;
        let (token, recovered) = bootstrap::resolve_token(&spec.config_path);
        debug!(recovered, "resolved gateway token");
        if let Err(err) = bootstrap::ensure_config_file(&spec.config_path, &token) {
            warn!(
                path = %spec.config_path.display(),
                error = %err,
                "failed to write gateway config, continuing"
            );
        }

        let port = match net::pick_port(spec.preferred_port, spec.port_span).await {
            Ok(port) => port,
            Err(err) => {
                self.fail_before_spawn(attempt, spec.preferred_port, token, &err);
                return Ok(None);
            }
        };

        let tail = TailBuffer::new(spec.tail_capacity);
        let child = match runner::spawn_gateway(spec, port, &token, &tail).await {
            Ok(child) => child,
            Err(err) => {
                self.fail_before_spawn(attempt, port, token, &err);
                return Ok(None);
            }
        };
        *slot = Some(child);
        self.hub.transition_for(
            attempt,
            GatewayState::starting(port, spec.logs_dir.clone(), token.clone()),
        );
        drop(slot);

        let this = Arc::clone(self);
        Ok(Some(tokio::spawn(async move {
            this.await_readiness(attempt, port, token, tail).await;
        })))
    }

    // Ends `attempt` with `ready` or `failed`. A later launch supersedes the
    // attempt, and the hub then drops whatever this probe reports.
    async fn await_readiness(&self, attempt: u64, port: u16, token: String, tail: TailBuffer) {
        let spec = &self.spec;
        let readiness = net::wait_for_port_open(
            LOOPBACK_HOST,
            port,
            spec.ready_timeout,
            spec.probe_interval,
            &self.cancelled,
        )
        .await;

        match readiness {
            Readiness::Open => {
                info!(port, "gateway is reachable");
                self.hub.transition_for(
                    attempt,
                    GatewayState::ready(port, spec.logs_dir.clone(), token),
                );
            }
            Readiness::TimedOut => {
                if self.hub.attempt() != attempt {
                    debug!(attempt, port, "readiness probe outlived its attempt");
                    return;
                }
                let exit = match self.child.lock().await.as_mut() {
                    Some(child) => child.try_exit_status(),
                    None => None,
                };
                let headline = LaunchError::ReadinessTimeout {
                    after: spec.ready_timeout,
                }
                .to_string();
                warn!(port, ?exit, "gateway did not become reachable");
                let details = failure_details(&headline, spec, Some(describe_exit(exit)), &tail);
                self.hub.transition_for(
                    attempt,
                    GatewayState::failed(port, spec.logs_dir.clone(), token, details),
                );
            }
            Readiness::Cancelled => debug!(port, "readiness probe cancelled"),
        }
    }

    // Broadcasts the whole attempt at once when the child never started, so
    // observers still see `starting` before `failed`.
    fn fail_before_spawn(&self, attempt: u64, port: u16, token: String, err: &LaunchError) {
        warn!(error = %err, "gateway launch failed");
        let spec = &self.spec;
        let details = failure_details(&err.to_string(), spec, None, &TailBuffer::new(0));
        self.hub.transition_for(
            attempt,
            GatewayState::starting(port, spec.logs_dir.clone(), token.clone()),
        );
        self.hub.transition_for(
            attempt,
            GatewayState::failed(port, spec.logs_dir.clone(), token, details),
        );
    }

    /// Stops broadcasting, cancels any pending probe, and terminates the
    /// gateway.
    ///
    /// Safe to call any number of times, with or without a running child.
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.hub.close();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            info!(pid = child.id(), "stopping gateway");
            child.stop(self.spec.stop_grace).await;
        }
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    match exit {
        Some(status) => format!("exited ({})", status),
        None => "still running".to_string(),
    }
}

/// Human-readable report attached to a `failed` state.
pub fn failure_details(
    headline: &str,
    spec: &LaunchSpec,
    exit: Option<String>,
    stderr_tail: &TailBuffer,
) -> String {
    let tail = sanitize_text(&stderr_tail.read());
    let tail = tail.trim();
    let mut lines = vec![
        headline.to_string(),
        String::new(),
        format!("backendDir: {}", spec.backend_dir.display()),
        format!("runtimeBin: {}", spec.runtime_bin.display()),
    ];
    if let Some(exit) = exit {
        lines.push(format!("process: {}", exit));
    }
    lines.push("stderr (tail):".to_string());
    lines.push(if tail.is_empty() { "<empty>" } else { tail }.to_string());
    lines.push(String::new());
    lines.push(format!("See logs in: {}", spec.logs_dir.display()));
    lines.join("\n")
}
