use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::cipher::{Cipher, Mode};
use crate::socks::FailurePolicy;

pub const DEFAULT_PATH: &str = "server.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalAddr {
    pub ip: String,
    pub port: u16,
}

/// On-disk form of the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    pub local_addr: LocalAddr,
    pub mode: String,
    /// Base64 key. Generated and written back when missing.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reply_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Runtime settings derived from [`ServerConf`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub local_addr: LocalAddr,
    pub cipher: Cipher,
    pub handshake_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub log_level: slog::Level,
}

pub struct Loaded {
    pub settings: Settings,
    /// True when the password was missing and has been written back.
    pub generated_password: bool,
}

pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Loaded> {
    let path = path.as_ref();
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut conf: ServerConf = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;

    let mode: Mode = conf.mode.parse()?;
    let generated_password = conf.password.is_empty();
    let key = if generated_password {
        let key = mode.generate_key();
        conf.password = STANDARD.encode(&key);
        let data = serde_json::to_vec_pretty(&conf)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write password back to {}", path.display()))?;
        key
    } else {
        STANDARD
            .decode(conf.password.as_bytes())
            .context("password is not valid base64")?
    };

    let settings = conf.into_settings(Cipher::new(mode, key)?)?;
    Ok(Loaded {
        settings,
        generated_password,
    })
}

impl ServerConf {
    fn into_settings(self, cipher: Cipher) -> anyhow::Result<Settings> {
        let log_level = match self.log_level.as_deref() {
            None => slog::Level::Info,
            Some(s) => s
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown log level: {s}"))?,
        };
        let failure_policy = if self.reply_on_error {
            FailurePolicy::Reply
        } else {
            FailurePolicy::Silent
        };
        Ok(Settings {
            local_addr: self.local_addr,
            cipher,
            handshake_timeout: self.handshake_timeout_secs.map(Duration::from_secs),
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            failure_policy,
            log_level,
        })
    }
}
