//! The interface the presentation layer uses to follow the gateway.
//!
//! `Shell` exposes the current state, state subscriptions and a full
//! relaunch. The console front end in `main` drives it through
//! `AppAction`s parsed from typed commands.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::process::GatewayState;
use crate::state::{Subscription, Unsubscribe};
use crate::supervisor::Supervisor;

/// Actions resulting from console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// Nothing to do (blank line).
    None,
    /// Print the current gateway state.
    Status,
    /// Tear everything down and start a fresh shell process.
    Retry,
    /// Exit the shell.
    Quit,
    /// Show the command list.
    Help,
    /// Unrecognised input.
    Unknown(String),
}

/// Maps a console line to an action.
pub fn parse_command(line: &str) -> AppAction {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => AppAction::None,
        "status" | "s" => AppAction::Status,
        "retry" | "r" | "relaunch" => AppAction::Retry,
        "quit" | "q" | "exit" => AppAction::Quit,
        "help" | "h" | "?" => AppAction::Help,
        _ => AppAction::Unknown(line.trim().to_string()),
    }
}

/// Starts a replacement shell process.
pub trait Relaunch: Send + Sync {
    fn relaunch(&self) -> Result<()>;
}

/// Re-executes the current binary with the arguments it was started with.
#[derive(Debug, Clone)]
pub struct ReexecRelaunch {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl ReexecRelaunch {
    pub fn current() -> Result<Self> {
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self {
            exe,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

impl Relaunch for ReexecRelaunch {
    fn relaunch(&self) -> Result<()> {
        std::process::Command::new(&self.exe)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to relaunch {}", self.exe.display()))?;
        Ok(())
    }
}

/// Handle given to the presentation layer.
pub struct Shell {
    supervisor: Arc<Supervisor>,
    relauncher: Box<dyn Relaunch>,
}

impl Shell {
    pub fn new(supervisor: Arc<Supervisor>, relauncher: Box<dyn Relaunch>) -> Self {
        Self {
            supervisor,
            relauncher,
        }
    }

    /// Current gateway state; `None` before the first launch.
    pub fn get_state(&self) -> Option<GatewayState> {
        self.supervisor.hub().current()
    }

    pub fn subscribe(&self) -> Subscription {
        self.supervisor.hub().subscribe()
    }

    /// Calls `callback` for every future transition until the handle drops.
    pub fn on_state_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&GatewayState) + Send + 'static,
    {
        self.supervisor.hub().on_state_change(callback)
    }

    pub fn logs_dir(&self) -> &Path {
        &self.supervisor.spec().logs_dir
    }

    /// Stops the gateway and starts a fresh shell process.
    ///
    /// The caller should exit once this returns.
    pub async fn retry_launch(&self) -> Result<()> {
        info!("relaunching shell");
        self.supervisor.stop().await;
        self.relauncher.relaunch()
    }

    /// Stops the gateway; further state changes are not broadcast.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
    }
}
