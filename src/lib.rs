//! Supervision of the local OpenClaw gateway for the desktop shell.
//!
//! The shell picks a port, makes sure the gateway has a config file with an
//! auth token, spawns the gateway with an isolated environment, and reports
//! its lifecycle (`starting`, then `ready` or `failed`) to whatever UI is
//! attached. On exit the gateway is stopped, gracefully if possible.
//!
//! [`supervisor::Supervisor`] drives a launch; [`state::StateHub`] holds the
//! current [`process::GatewayState`]; [`app::Shell`] is the handle the
//! presentation layer talks to.

pub mod app;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod output;
pub mod process;
pub mod runner;
pub mod state;
pub mod supervisor;
