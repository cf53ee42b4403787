//! Data structures describing the gateway and its lifecycle.
//!
//! `LaunchSpec` is everything needed to start the gateway child; `GatewayState`
//! is the lifecycle state broadcast to the UI.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Loopback address the gateway is bound to and probed on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Specification for launching the gateway.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Runtime binary that executes the gateway (e.g. `node`).
    pub runtime_bin: PathBuf,
    /// Arguments placed before the gateway subcommand, usually the entry script.
    pub entry_args: Vec<String>,
    /// Backend installation directory; the child's working directory.
    pub backend_dir: PathBuf,
    /// Auxiliary tool whose directory is prepended to `PATH`.
    pub aux_bin: Option<PathBuf>,
    /// Directory holding gateway state.
    pub state_dir: PathBuf,
    /// Directory receiving `gateway.stdout.log` and `gateway.stderr.log`.
    pub logs_dir: PathBuf,
    /// Gateway config file.
    pub config_path: PathBuf,
    /// Value for `--bind`.
    pub bind: String,
    /// First port tried by the allocator.
    pub preferred_port: u16,
    /// Number of ports the allocator may try.
    pub port_span: u16,
    /// How long to wait for the port to accept connections.
    pub ready_timeout: Duration,
    /// Delay between readiness attempts.
    pub probe_interval: Duration,
    /// How long a graceful stop may take before the child is killed.
    pub stop_grace: Duration,
    /// Characters of stderr retained for diagnostics.
    pub tail_capacity: usize,
}

/// Lifecycle state of one gateway launch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GatewayState {
    /// Spawned; the port is not reachable yet.
    #[serde(rename_all = "camelCase")]
    Starting {
        port: u16,
        logs_dir: PathBuf,
        token: String,
    },
    /// The port accepted a TCP connection.
    #[serde(rename_all = "camelCase")]
    Ready {
        port: u16,
        logs_dir: PathBuf,
        token: String,
        url: String,
    },
    /// The launch could not complete.
    #[serde(rename_all = "camelCase")]
    Failed {
        port: u16,
        logs_dir: PathBuf,
        token: String,
        details: String,
    },
}

impl GatewayState {
    pub fn starting(port: u16, logs_dir: PathBuf, token: String) -> Self {
        GatewayState::Starting {
            port,
            logs_dir,
            token,
        }
    }

    pub fn ready(port: u16, logs_dir: PathBuf, token: String) -> Self {
        GatewayState::Ready {
            port,
            logs_dir,
            token,
            url: gateway_url(port),
        }
    }

    pub fn failed(port: u16, logs_dir: PathBuf, token: String, details: String) -> Self {
        GatewayState::Failed {
            port,
            logs_dir,
            token,
            details,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayState::Starting { .. } => "starting",
            GatewayState::Ready { .. } => "ready",
            GatewayState::Failed { .. } => "failed",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            GatewayState::Starting { port, .. }
            | GatewayState::Ready { port, .. }
            | GatewayState::Failed { port, .. } => *port,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            GatewayState::Starting { token, .. }
            | GatewayState::Ready { token, .. }
            | GatewayState::Failed { token, .. } => token,
        }
    }

    pub fn logs_dir(&self) -> &PathBuf {
        match self {
            GatewayState::Starting { logs_dir, .. }
            | GatewayState::Ready { logs_dir, .. }
            | GatewayState::Failed { logs_dir, .. } => logs_dir,
        }
    }

    /// `ready` and `failed` end a launch attempt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GatewayState::Starting { .. })
    }

    /// Whether `next` may follow `current` within one launch attempt.
    ///
    /// An attempt begins at `starting` and ends at `ready` or `failed`.
    pub fn can_transition_to(current: Option<&GatewayState>, next: &GatewayState) -> bool {
        match (current, next) {
            (None, GatewayState::Starting { .. }) => true,
            (Some(GatewayState::Starting { .. }), GatewayState::Ready { .. }) => true,
            (Some(GatewayState::Starting { .. }), GatewayState::Failed { .. }) => true,
            _ => false,
        }
    }
}

/// URL the UI loads once the gateway is reachable.
pub fn gateway_url(port: u16) -> String {
    format!("http://{}:{}/", LOOPBACK_HOST, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn starting() -> GatewayState {
        GatewayState::starting(18789, PathBuf::from("/tmp/logs"), "tok".into())
    }

    #[test]
    fn ready_url_is_loopback() {
        let state = GatewayState::ready(18790, PathBuf::from("/tmp/logs"), "tok".into());
        match state {
            GatewayState::Ready { url, .. } => assert_eq!(url, "http://127.0.0.1:18790/"),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn transitions_are_monotonic() {
        let ready = GatewayState::ready(18789, PathBuf::from("/tmp/logs"), "tok".into());
        let failed =
            GatewayState::failed(18789, PathBuf::from("/tmp/logs"), "tok".into(), "x".into());

        assert!(GatewayState::can_transition_to(None, &starting()));
        assert!(GatewayState::can_transition_to(Some(&starting()), &ready));
        assert!(GatewayState::can_transition_to(Some(&starting()), &failed));

        assert!(!GatewayState::can_transition_to(None, &ready));
        assert!(!GatewayState::can_transition_to(None, &failed));
        assert!(!GatewayState::can_transition_to(Some(&starting()), &starting()));
        assert!(!GatewayState::can_transition_to(Some(&ready), &failed));
        assert!(!GatewayState::can_transition_to(Some(&ready), &ready));
        assert!(!GatewayState::can_transition_to(Some(&failed), &ready));
        assert!(!GatewayState::can_transition_to(Some(&failed), &starting()));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let value = serde_json::to_value(starting()).unwrap();
        assert_eq!(value["kind"], "starting");
        assert_eq!(value["port"], 18789);
        assert_eq!(value["logsDir"], "/tmp/logs");
        assert_eq!(value["token"], "tok");
    }
}
