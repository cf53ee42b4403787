//! First-run bootstrapping of the gateway config file.
//!
//! The gateway reads `openclaw.json` from its state directory. On first
//! launch the file does not exist yet, so a minimal one is written that binds
//! to loopback and requires a token. Once written it belongs to the user: it
//! is never rewritten, and its token is reused on every later launch.
//!
//! The gateway accepts JSON5 (comments, unquoted keys, trailing commas), so
//! the file is read as JSON5. It is written as plain JSON, which is valid
//! JSON5 too.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the gateway config inside the state directory.
pub const CONFIG_FILE_NAME: &str = "openclaw.json";

const TOKEN_BYTES: usize = 24;

/// An existing config file that could not be used to recover a token.
#[derive(Debug, Error)]
pub enum ConfigUnreadable {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse { path: PathBuf, source: json5::Error },
}

#[derive(Debug, Serialize)]
struct GatewayConfigFile<'a> {
    gateway: GatewaySection<'a>,
}

#[derive(Debug, Serialize)]
struct GatewaySection<'a> {
    mode: &'a str,
    bind: &'a str,
    auth: AuthSection<'a>,
}

#[derive(Debug, Serialize)]
struct AuthSection<'a> {
    mode: &'a str,
    token: &'a str,
}

/// Loose view used when reading: every level is optional and unknown keys
/// are ignored, because the user or the gateway may have edited the file.
#[derive(Debug, Default, Deserialize)]
struct ExistingConfig {
    #[serde(default)]
    gateway: Option<ExistingGateway>,
}

#[derive(Debug, Default, Deserialize)]
struct ExistingGateway {
    #[serde(default)]
    auth: Option<ExistingAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct ExistingAuth {
    #[serde(default)]
    token: Option<serde_json::Value>,
}

/// Path of the gateway config inside `state_dir`.
pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE_NAME)
}

/// Returns the token stored at `gateway.auth.token`, if there is a usable one.
///
/// A missing file is the normal first-run case. Anything else that prevents
/// reading a non-empty string token is logged and treated the same way; the
/// file itself is left alone.
pub fn read_token(path: &Path) -> Option<String> {
    match load_token(path) {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable gateway config");
            None
        }
    }
}

fn load_token(path: &Path) -> Result<Option<String>, ConfigUnreadable> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigUnreadable::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        debug!(path = %path.display(), "gateway config is empty");
        return Ok(None);
    }
    let value: serde_json::Value =
        json5::from_str(&text).map_err(|source| ConfigUnreadable::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if !value.is_object() {
        debug!(path = %path.display(), "gateway config is not an object");
        return Ok(None);
    }
    // A wrong shape below the root (e.g. `"gateway": 3`) just means no token.
    let config: ExistingConfig = serde_json::from_value(value).unwrap_or_default();
    let token = config
        .gateway
        .and_then(|gateway| gateway.auth)
        .and_then(|auth| auth.token)
        .and_then(|token| token.as_str().map(str::trim).map(str::to_string))
        .filter(|token| !token.is_empty());
    Ok(token)
}

/// Writes a minimal local-only, token-authenticated config if none exists.
///
/// An existing file is never touched, whatever its contents.
pub fn ensure_config_file(path: &Path, token: &str) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let minimal = GatewayConfigFile {
        gateway: GatewaySection {
            mode: "local",
            bind: "loopback",
            auth: AuthSection {
                mode: "token",
                token,
            },
        },
    };
    let mut text = serde_json::to_string_pretty(&minimal).map_err(io::Error::other)?;
    text.push('\n');
    fs::write(path, text)?;
    info!(path = %path.display(), "wrote initial gateway config");
    Ok(())
}

/// A fresh random gateway token: 24 bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The token to launch with and whether it came from the existing config.
pub fn resolve_token(path: &Path) -> (String, bool) {
    match read_token(path) {
        Some(token) => (token, true),
        None => (generate_token(), false),
    }
}
