//! clawhost: a desktop shell that supervises the local OpenClaw gateway.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, launches the gateway and runs the event
//! loop that reports gateway state and reacts to console commands and
//! signals until the shell exits.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use clawhost::app::{parse_command, AppAction, ReexecRelaunch, Shell};
use clawhost::config::{self, Config};
use clawhost::events::{Event, ProcessSignal};
use clawhost::output::DEFAULT_TAIL_CAPACITY;
use clawhost::process::{GatewayState, LaunchSpec};
use clawhost::state::StateHub;
use clawhost::supervisor::Supervisor;
use clawhost::{bootstrap, net};

const DEFAULT_RUNTIME_BIN: &str = "node";
const DEFAULT_ENTRY_SCRIPT: &str = "openclaw.mjs";
const DEFAULT_BIND: &str = "loopback";
const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 250;
const DEFAULT_STOP_GRACE_MS: u64 = 1_500;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "clawhost",
    version,
    about = "Launches and supervises the local OpenClaw gateway",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to clawhost.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any clawhost.toml found in the default locations.
    #[arg(long)]
    no_config: bool,
    /// Root directory for gateway state and logs.
    #[arg(long)]
    user_data_dir: Option<PathBuf>,
    /// Gateway state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Directory for gateway log files.
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Gateway installation directory.
    #[arg(long)]
    backend_dir: Option<PathBuf>,
    /// Runtime binary that executes the gateway.
    #[arg(long)]
    runtime_bin: Option<PathBuf>,
    /// Extra runtime arguments placed before the entry script.
    #[arg(long, allow_hyphen_values = true)]
    runtime_args: Option<String>,
    /// Gateway entry script relative to the backend dir ("" for none).
    #[arg(long)]
    entry_script: Option<String>,
    /// Auxiliary tool whose directory is prepended to the gateway's PATH.
    #[arg(long)]
    aux_bin: Option<PathBuf>,
    /// Preferred gateway port.
    #[arg(long)]
    port: Option<u16>,
    /// Number of ports to try from the preferred one upward.
    #[arg(long)]
    port_span: Option<u16>,
    /// Time to wait for the gateway port to open (ms).
    #[arg(long)]
    ready_timeout_ms: Option<u64>,
    /// Time to wait after asking the gateway to exit before killing it (ms).
    #[arg(long)]
    stop_grace_ms: Option<u64>,
    /// Print state changes as JSON lines.
    #[arg(long)]
    json: bool,
    /// Do not read console commands from stdin.
    #[arg(long)]
    no_input: bool,
    /// Log filter (overrides RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the gateway under supervision (default).
    Run,
    /// Print the resolved gateway paths and exit.
    Paths,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_settings(&cli)?;
    init_tracing(&cli, &config);

    match cli.command {
        Some(Commands::Version) => {
            println!("clawhost {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::Paths) => {
            let spec = resolve_spec(&cli, &config)?;
            print_paths(&spec);
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let spec = resolve_spec(&cli, &config)?;
    run(spec, cli.json, !cli.no_input).await
}

async fn run(spec: LaunchSpec, json: bool, input_enabled: bool) -> Result<()> {
    let supervisor = Supervisor::new(spec, StateHub::new());
    let shell = Shell::new(
        supervisor.clone(),
        Box::new(ReexecRelaunch::current()?),
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let forwarder = shell.on_state_change(forward_states(event_tx.clone()));
    spawn_signal_listener(event_tx.clone());
    if input_enabled {
        spawn_stdin_listener(event_tx.clone());
    }
    drop(event_tx);

    info!(logs_dir = %shell.logs_dir().display(), "launching gateway");
    if let Err(err) = supervisor.launch().await {
        error!(error = %err, "gateway launch refused");
    }

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::State(state) => println!("{}", format_state(&state, json)),
            Event::Command(line) => match parse_command(&line) {
                AppAction::None => {}
                AppAction::Status => match shell.get_state() {
                    Some(state) => println!("{}", format_state(&state, json)),
                    None => println!("gateway not started"),
                },
                AppAction::Retry => {
                    if let Err(err) = shell.retry_launch().await {
                        error!(error = %format!("{:#}", err), "relaunch failed");
                    }
                    break;
                }
                AppAction::Quit => break,
                AppAction::Help => print_console_help(),
                AppAction::Unknown(command) => {
                    println!("unknown command: {} (type \"help\")", command)
                }
            },
            Event::InputClosed => debug!("stdin closed, console commands disabled"),
            Event::Shutdown { signal } => {
                info!(?signal, "shutting down");
                break;
            }
        }
    }

    shell.shutdown().await;
    forwarder.unsubscribe();
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

fn init_tracing(cli: &Cli, config: &Config) {
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.log_level.as_deref().unwrap_or("info"))
        }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Merges command-line flags over `clawhost.toml` over built-in defaults.
fn resolve_spec(cli: &Cli, config: &Config) -> Result<LaunchSpec> {
    let user_data_dir = cli
        .user_data_dir
        .clone()
        .or_else(|| config.user_data_dir.clone())
        .or_else(config::default_user_data_dir)
        .ok_or_else(|| anyhow!("cannot determine a data directory; pass --user-data-dir"))?;
    let state_dir = cli
        .state_dir
        .clone()
        .or_else(|| config.state_dir.clone())
        .unwrap_or_else(|| user_data_dir.join("openclaw"));
    let logs_dir = cli
        .logs_dir
        .clone()
        .or_else(|| config.logs_dir.clone())
        .unwrap_or_else(|| user_data_dir.join("logs"));
    let backend_dir = match cli.backend_dir.clone().or_else(|| config.backend_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    let runtime_bin = cli
        .runtime_bin
        .clone()
        .or_else(|| config.runtime_bin.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_BIN));

    let mut entry_args = match cli.runtime_args.as_deref().or(config.runtime_args.as_deref()) {
        Some(raw) => shell_words::split(raw).context("failed to parse runtime_args")?,
        None => Vec::new(),
    };
    let entry_script = cli
        .entry_script
        .as_deref()
        .or(config.entry_script.as_deref())
        .unwrap_or(DEFAULT_ENTRY_SCRIPT);
    if !entry_script.is_empty() {
        entry_args.push(backend_dir.join(entry_script).to_string_lossy().into_owned());
    }

    let ms = |cli: Option<u64>, file: Option<u64>, default: u64| {
        Duration::from_millis(cli.or(file).unwrap_or(default))
    };

    Ok(LaunchSpec {
        runtime_bin,
        entry_args,
        aux_bin: cli.aux_bin.clone().or_else(|| config.aux_bin.clone()),
        config_path: bootstrap::config_path(&state_dir),
        state_dir,
        logs_dir,
        backend_dir,
        bind: config.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string()),
        preferred_port: cli.port.or(config.port).unwrap_or(net::DEFAULT_PORT),
        port_span: cli
            .port_span
            .or(config.port_span)
            .unwrap_or(net::DEFAULT_PORT_SPAN)
            .max(1),
        ready_timeout: ms(
            cli.ready_timeout_ms,
            config.ready_timeout_ms,
            DEFAULT_READY_TIMEOUT_MS,
        ),
        probe_interval: ms(None, config.probe_interval_ms, DEFAULT_PROBE_INTERVAL_MS),
        stop_grace: ms(cli.stop_grace_ms, config.stop_grace_ms, DEFAULT_STOP_GRACE_MS),
        tail_capacity: config.tail_capacity.unwrap_or(DEFAULT_TAIL_CAPACITY),
    })
}

// Every transition reaches the console; the channel is unbounded so a busy
// event loop never drops `ready` or `failed`.
fn forward_states(tx: mpsc::UnboundedSender<Event>) -> impl Fn(&GatewayState) + Send + 'static {
    move |state| {
        if tx.send(Event::State(state.clone())).is_err() {
            debug!(state = state.kind(), "event loop gone, state change not shown");
        }
    }
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigInt });
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigTerm });
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown {
                signal: ProcessSignal::SigInt,
            });
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(Event::Command(line)).is_err() {
                return;
            }
        }
        let _ = tx.send(Event::InputClosed);
    });
}

fn format_state(state: &GatewayState, json: bool) -> String {
    if json {
        return serde_json::to_string(state).unwrap_or_else(|err| {
            format!("{{\"kind\":\"error\",\"details\":\"{}\"}}", err)
        });
    }
    match state {
        GatewayState::Starting { port, logs_dir, .. } => format!(
            "gateway starting on port {} (logs: {})",
            port,
            logs_dir.display()
        ),
        GatewayState::Ready { url, token, .. } => {
            format!("gateway ready at {}\ntoken: {}", url, token)
        }
        GatewayState::Failed { details, .. } => format!("gateway failed\n{}", details),
    }
}

fn print_paths(spec: &LaunchSpec) {
    println!("state dir:   {}", spec.state_dir.display());
    println!("config file: {}", spec.config_path.display());
    println!("logs dir:    {}", spec.logs_dir.display());
    println!("backend dir: {}", spec.backend_dir.display());
    println!("runtime:     {}", spec.runtime_bin.display());
    if let Some(aux) = &spec.aux_bin {
        println!("aux tool:    {}", aux.display());
    }
}

fn print_console_help() {
    println!("commands:");
    println!("  status  show the gateway state");
    println!("  retry   restart the shell and gateway");
    println!("  quit    stop the gateway and exit");
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["clawhost"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_derive_from_user_data_dir() {
        let cli = cli(&["--user-data-dir", "/data/clawhost", "--backend-dir", "/opt/openclaw"]);
        let spec = resolve_spec(&cli, &Config::default()).unwrap();
        assert_eq!(spec.state_dir, PathBuf::from("/data/clawhost/openclaw"));
        assert_eq!(spec.logs_dir, PathBuf::from("/data/clawhost/logs"));
        assert_eq!(
            spec.config_path,
            PathBuf::from("/data/clawhost/openclaw/openclaw.json")
        );
        assert_eq!(spec.runtime_bin, PathBuf::from("node"));
        assert_eq!(spec.entry_args, vec!["/opt/openclaw/openclaw.mjs"]);
        assert_eq!(spec.bind, "loopback");
        assert_eq!(spec.preferred_port, 18789);
        assert_eq!(spec.ready_timeout, Duration::from_secs(30));
        assert_eq!(spec.stop_grace, Duration::from_millis(1500));
        assert_eq!(spec.tail_capacity, 24_000);
    }

    #[test]
    fn cli_overrides_config_file() {
        let config: Config = toml::from_str(
            r#"
user_data_dir = "/data/from-file"
backend_dir = "/opt/openclaw"
runtime_args = "--no-warnings --max-old-space-size=512"
port = 19000
stop_grace_ms = 3000
"#,
        )
        .unwrap();
        let cli = cli(&["--port", "19100", "--entry-script", "", "--aux-bin", "/opt/gog/gog"]);
        let spec = resolve_spec(&cli, &config).unwrap();
        assert_eq!(spec.preferred_port, 19100);
        assert_eq!(spec.logs_dir, PathBuf::from("/data/from-file/logs"));
        assert_eq!(
            spec.entry_args,
            vec!["--no-warnings", "--max-old-space-size=512"]
        );
        assert_eq!(spec.aux_bin, Some(PathBuf::from("/opt/gog/gog")));
        assert_eq!(spec.stop_grace, Duration::from_secs(3));
    }

    #[test]
    fn port_span_is_at_least_one() {
        let cli = cli(&["--user-data-dir", "/d", "--backend-dir", "/b", "--port-span", "0"]);
        let spec = resolve_spec(&cli, &Config::default()).unwrap();
        assert_eq!(spec.port_span, 1);
    }

    #[test]
    fn forwarder_keeps_every_state_while_the_loop_is_busy() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = forward_states(tx);
        let starting = GatewayState::starting(18789, PathBuf::from("/logs"), "tok".into());
        for _ in 0..200 {
            forward(&starting);
        }
        let ready = GatewayState::ready(18789, PathBuf::from("/logs"), "tok".into());
        forward(&ready);

        let mut received = Vec::new();
        while let Ok(Event::State(state)) = rx.try_recv() {
            received.push(state);
        }
        assert_eq!(received.len(), 201);
        assert_eq!(received.last(), Some(&ready));
    }

    #[test]
    fn formats_states_for_the_console() {
        let ready = GatewayState::ready(18789, PathBuf::from("/logs"), "tok".into());
        assert_eq!(
            format_state(&ready, false),
            "gateway ready at http://127.0.0.1:18789/\ntoken: tok"
        );
        let json: serde_json::Value =
            serde_json::from_str(&format_state(&ready, true)).unwrap();
        assert_eq!(json["kind"], "ready");
        assert_eq!(json["url"], "http://127.0.0.1:18789/");
    }
}
