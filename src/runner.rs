//! Spawning and terminating the gateway child process.
//!
//! `spawn_gateway` starts the backend with an isolated environment and wires
//! its output to append-only log files and the stderr tail buffer.
//! `GatewayChild::stop` asks it to exit and escalates to a kill after the
//! grace period.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::output::{StreamKind, TailBuffer};
use crate::process::LaunchSpec;

/// Flag accepted by the gateway that lets it start without a finished setup.
pub const ALLOW_UNCONFIGURED_FLAG: &str = "--allow-unconfigured";

/// A running gateway process.
///
/// Owned by the supervisor; nothing else signals or reaps it.
#[derive(Debug)]
pub struct GatewayChild {
    child: Child,
    pid: Option<u32>,
}

impl GatewayChild {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Requests a graceful exit, then kills the process group if it is
    /// still alive after `grace`.
    ///
    /// If the gateway already exited, whatever it left running in its group
    /// is killed. Signal failures mean the process is already gone and are
    /// ignored.
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exit_status() {
            debug!(pid = self.pid, %status, "gateway already exited");
            if let Some(pid) = self.pid {
                kill_orphaned_group(pid);
            }
            return Some(status);
        }

        if let Some(pid) = self.pid {
            debug!(pid, "sending terminate to gateway");
            send_terminate(pid);
        }
        match wait_for_exit(&mut self.child, grace).await {
            Ok(Some(status)) => {
                info!(pid = self.pid, %status, "gateway exited");
                return Some(status);
            }
            Ok(None) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "gateway still running after grace period, killing"
                );
            }
            Err(err) => debug!(pid = self.pid, error = %err, "waiting for gateway failed"),
        }

        if let Some(pid) = self.pid {
            send_kill(pid);
        }
        if let Err(err) = self.child.start_kill() {
            debug!(pid = self.pid, error = %err, "kill failed");
        }
        match self.child.wait().await {
            Ok(status) => {
                info!(pid = self.pid, %status, "gateway killed");
                Some(status)
            }
            Err(err) => {
                debug!(pid = self.pid, error = %err, "reaping gateway failed");
                None
            }
        }
    }
}

/// Starts the gateway child for `port`, creating the state and log
/// directories first.
///
/// Does not wait for readiness.
pub async fn spawn_gateway(
    spec: &LaunchSpec,
    port: u16,
    token: &str,
    stderr_tail: &TailBuffer,
) -> Result<GatewayChild, LaunchError> {
    for dir in [&spec.logs_dir, &spec.state_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| LaunchError::io(format!("failed to create {}", dir.display()), err))?;
    }
    let stdout_log = open_log(&spec.logs_dir, StreamKind::Stdout).await?;
    let stderr_log = open_log(&spec.logs_dir, StreamKind::Stderr).await?;

    let mut command = Command::new(&spec.runtime_bin);
    command
        .args(gateway_args(spec, port))
        .envs(gateway_env(spec, port, token))
        .current_dir(&spec.backend_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.runtime_bin.clone(),
        source,
    })?;
    let pid = child.id();
    info!(
        pid,
        port,
        runtime = %spec.runtime_bin.display(),
        cwd = %spec.backend_dir.display(),
        "spawned gateway"
    );

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(copy_stream(StreamKind::Stdout, stdout, stdout_log, None));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(copy_stream(
            StreamKind::Stderr,
            stderr,
            stderr_log,
            Some(stderr_tail.clone()),
        ));
    }

    Ok(GatewayChild { child, pid })
}

/// Command-line arguments passed to the runtime binary.
pub fn gateway_args(spec: &LaunchSpec, port: u16) -> Vec<String> {
    let mut args = spec.entry_args.clone();
    args.extend([
        "gateway".to_string(),
        "--bind".to_string(),
        spec.bind.clone(),
        "--port".to_string(),
        port.to_string(),
        ALLOW_UNCONFIGURED_FLAG.to_string(),
    ]);
    args
}

/// Variables layered over the inherited environment.
pub fn gateway_env(spec: &LaunchSpec, port: u16, token: &str) -> Vec<(OsString, OsString)> {
    let mut env = vec![
        // A runtime that can also host the desktop shell must run as a plain
        // script interpreter here.
        ("ELECTRON_RUN_AS_NODE".into(), "1".into()),
        ("OPENCLAW_STATE_DIR".into(), spec.state_dir.clone().into()),
        ("OPENCLAW_CONFIG_PATH".into(), spec.config_path.clone().into()),
        ("OPENCLAW_GATEWAY_PORT".into(), port.to_string().into()),
        ("OPENCLAW_GATEWAY_TOKEN".into(), token.into()),
        ("NO_COLOR".into(), "1".into()),
        ("FORCE_COLOR".into(), "0".into()),
    ];
    if let Some(path) = merged_path(spec.aux_bin.as_deref(), std::env::var_os("PATH")) {
        env.push(("PATH".into(), path));
    }
    env
}

/// `PATH` with the auxiliary binary's directory in front.
///
/// Returns `None` when there is nothing to prepend or the result cannot be
/// represented, leaving the inherited `PATH` as is.
fn merged_path(aux_bin: Option<&Path>, current: Option<OsString>) -> Option<OsString> {
    let dir = aux_bin?.parent().filter(|dir| !dir.as_os_str().is_empty())?;
    let mut dirs: Vec<PathBuf> = vec![dir.to_path_buf()];
    if let Some(current) = current {
        dirs.extend(std::env::split_paths(&current));
    }
    match std::env::join_paths(dirs) {
        Ok(joined) => Some(joined),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot add auxiliary tool to PATH");
            None
        }
    }
}

async fn open_log(logs_dir: &Path, stream: StreamKind) -> Result<File, LaunchError> {
    let path = logs_dir.join(stream.log_file_name());
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|err| LaunchError::io(format!("failed to open {}", path.display()), err))
}

// Copy one child stream into its log file (and the tail buffer for stderr)
// until EOF. A failing log file never stops the draining, or the child would
// block on a full pipe.
async fn copy_stream<R>(stream: StreamKind, mut reader: R, mut log: File, tail: Option<TailBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut log_ok = true;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(stream = stream.as_str(), error = %err, "gateway stream closed");
                break;
            }
        };
        if let Some(tail) = &tail {
            tail.push_bytes(&buf[..n]);
        }
        if log_ok {
            let written = match log.write_all(&buf[..n]).await {
                Ok(()) => log.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                warn!(stream = stream.as_str(), error = %err, "failed to write gateway log");
                log_ok = false;
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        // The child leads its own process group; reach its descendants too.
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

// The leader is reaped, so its pid may belong to someone else by now; only
// the group is signalled.
#[cfg(unix)]
fn kill_orphaned_group(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        let _ = libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn send_terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK to the process group is the closest.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(windows)]
fn send_kill(_pid: u32) {}

#[cfg(not(unix))]
fn kill_orphaned_group(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_terminate(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_kill(_pid: u32) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

/// A `LaunchSpec` that runs `script` under `/bin/sh` inside `dir`.
///
/// The gateway arguments land in `$0` and `$@`.
#[cfg(all(test, unix))]
pub(crate) fn stub_spec(dir: &Path, script: &str) -> LaunchSpec {
    use crate::bootstrap::config_path;

    let state_dir = dir.join("state");
    LaunchSpec {
        runtime_bin: PathBuf::from("/bin/sh"),
        entry_args: vec!["-c".to_string(), script.to_string()],
        backend_dir: dir.to_path_buf(),
        aux_bin: None,
        config_path: config_path(&state_dir),
        state_dir,
        logs_dir: dir.join("logs"),
        bind: "loopback".to_string(),
        preferred_port: crate::net::DEFAULT_PORT,
        port_span: crate::net::DEFAULT_PORT_SPAN,
        ready_timeout: Duration::from_secs(2),
        probe_interval: Duration::from_millis(50),
        stop_grace: Duration::from_millis(500),
        tail_capacity: 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            runtime_bin: PathBuf::from("/opt/node/bin/node"),
            entry_args: vec!["/opt/openclaw/openclaw.mjs".to_string()],
            backend_dir: PathBuf::from("/opt/openclaw"),
            aux_bin: Some(PathBuf::from("/opt/gog/bin/gog")),
            state_dir: PathBuf::from("/data/openclaw"),
            logs_dir: PathBuf::from("/data/logs"),
            config_path: PathBuf::from("/data/openclaw/openclaw.json"),
            bind: "loopback".to_string(),
            preferred_port: 18789,
            port_span: 10,
            ready_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(250),
            stop_grace: Duration::from_millis(1500),
            tail_capacity: 24_000,
        }
    }

    fn env_value(env: &[(OsString, OsString)], key: &str) -> Option<String> {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string_lossy().into_owned())
    }

    #[test]
    fn args_follow_entry_script() {
        let args = gateway_args(&spec(), 18790);
        assert_eq!(
            args,
            vec![
                "/opt/openclaw/openclaw.mjs",
                "gateway",
                "--bind",
                "loopback",
                "--port",
                "18790",
                "--allow-unconfigured",
            ]
        );
    }

    #[test]
    fn env_carries_gateway_settings() {
        let env = gateway_env(&spec(), 18790, "secret");
        assert_eq!(env_value(&env, "ELECTRON_RUN_AS_NODE").as_deref(), Some("1"));
        assert_eq!(
            env_value(&env, "OPENCLAW_STATE_DIR").as_deref(),
            Some("/data/openclaw")
        );
        assert_eq!(
            env_value(&env, "OPENCLAW_CONFIG_PATH").as_deref(),
            Some("/data/openclaw/openclaw.json")
        );
        assert_eq!(env_value(&env, "OPENCLAW_GATEWAY_PORT").as_deref(), Some("18790"));
        assert_eq!(env_value(&env, "OPENCLAW_GATEWAY_TOKEN").as_deref(), Some("secret"));
        assert_eq!(env_value(&env, "NO_COLOR").as_deref(), Some("1"));
        assert_eq!(env_value(&env, "FORCE_COLOR").as_deref(), Some("0"));
    }

    #[cfg(unix)]
    #[test]
    fn aux_dir_is_prepended_to_path() {
        let merged = merged_path(
            Some(Path::new("/opt/gog/bin/gog")),
            Some(OsString::from("/usr/bin:/bin")),
        );
        assert_eq!(merged, Some(OsString::from("/opt/gog/bin:/usr/bin:/bin")));
        assert_eq!(merged_path(None, Some(OsString::from("/usr/bin"))), None);
        assert_eq!(
            merged_path(Some(Path::new("/opt/gog/gog")), None),
            Some(OsString::from("/opt/gog"))
        );
    }

    #[cfg(unix)]
    async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_wires_logs_tail_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo "port=$OPENCLAW_GATEWAY_PORT token=$OPENCLAW_GATEWAY_TOKEN color=$NO_COLOR node=$ELECTRON_RUN_AS_NODE"; echo "argv=$0 $*"; echo "cwd=$(pwd)"; echo "oops" >&2"#;
        let spec = stub_spec(dir.path(), script);
        let tail = TailBuffer::new(64);

        let mut child = spawn_gateway(&spec, 4321, "tok", &tail).await.unwrap();
        assert!(child.id().is_some());
        assert!(spec.state_dir.is_dir());

        let stdout_path = spec.logs_dir.join("gateway.stdout.log");
        let stderr_path = spec.logs_dir.join("gateway.stderr.log");
        assert!(wait_until(|| tail.read().contains("oops")).await);
        assert!(
            wait_until(|| std::fs::read_to_string(&stdout_path)
                .map(|text| text.contains("cwd="))
                .unwrap_or(false))
            .await
        );
        assert!(
            wait_until(|| std::fs::read_to_string(&stderr_path)
                .map(|text| text.contains("oops"))
                .unwrap_or(false))
            .await
        );

        let stdout = std::fs::read_to_string(&stdout_path).unwrap();
        assert!(stdout.contains("port=4321 token=tok color=1 node=1"), "{}", stdout);
        assert!(
            stdout.contains("argv=gateway --bind loopback --port 4321 --allow-unconfigured"),
            "{}",
            stdout
        );
        let cwd = dir.path().canonicalize().unwrap();
        assert!(stdout.contains(&format!("cwd={}", cwd.display())), "{}", stdout);
        assert!(!tail.read().contains("port="));

        child.stop(Duration::from_millis(500)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn logs_are_appended_across_launches() {
        let dir = tempfile::tempdir().unwrap();
        let tail = TailBuffer::new(64);
        let stdout_path = dir.path().join("logs").join("gateway.stdout.log");

        for word in ["first", "second"] {
            let spec = stub_spec(dir.path(), &format!("echo {}", word));
            let mut child = spawn_gateway(&spec, 1, "tok", &tail).await.unwrap();
            assert!(
                wait_until(|| std::fs::read_to_string(&stdout_path)
                    .map(|text| text.contains(word))
                    .unwrap_or(false))
                .await
            );
            child.stop(Duration::from_millis(200)).await;
        }
        let text = std::fs::read_to_string(&stdout_path).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_runtime_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = stub_spec(dir.path(), "true");
        spec.runtime_bin = dir.path().join("no-such-runtime");
        let err = spawn_gateway(&spec, 1, "tok", &TailBuffer::new(8))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let spec = stub_spec(dir.path(), "sleep 30");
        let mut child = spawn_gateway(&spec, 1, "tok", &TailBuffer::new(8))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let status = child.stop(Duration::from_secs(3)).await;
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let spec = stub_spec(dir.path(), r#"trap "" TERM; echo armed; while true; do sleep 1; done"#);
        let mut child = spawn_gateway(&spec, 1, "tok", &TailBuffer::new(8))
            .await
            .unwrap();
        let stdout_path = spec.logs_dir.join("gateway.stdout.log");
        assert!(
            wait_until(|| std::fs::read_to_string(&stdout_path)
                .map(|text| text.contains("armed"))
                .unwrap_or(false))
            .await
        );

        let started = std::time::Instant::now();
        let status = child.stop(Duration::from_millis(300)).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_after_exit_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let spec = stub_spec(dir.path(), "exit 3");
        let mut child = spawn_gateway(&spec, 1, "tok", &TailBuffer::new(8))
            .await
            .unwrap();
        assert!(wait_until(|| child.try_exit_status().is_some()).await);
        let status = child.stop(Duration::from_millis(100)).await;
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        assert_eq!(child.stop(Duration::from_millis(100)).await.and_then(|s| s.code()), Some(3));
    }

    // Zombies count as gone: the orphan is reparented and reaped elsewhere.
    #[cfg(target_os = "linux")]
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_after_exit_kills_leftover_group_members() {
        let dir = tempfile::tempdir().unwrap();
        let spec = stub_spec(dir.path(), "sleep 30 & echo $! > orphan.pid; exit 0");
        let mut child = spawn_gateway(&spec, 1, "tok", &TailBuffer::new(8))
            .await
            .unwrap();
        assert!(wait_until(|| child.try_exit_status().is_some()).await);
        let orphan: i32 = std::fs::read_to_string(dir.path().join("orphan.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process_gone(orphan));

        child.stop(Duration::from_millis(100)).await;
        assert!(wait_until(|| process_gone(orphan)).await);
    }
}
