// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the connection core.
///
/// Loaded once at process startup (`Config::load_from_file`) and cloned into
/// every `Connection` that is opened afterwards; nothing here is mutated at
/// runtime.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Buffering / framing defaults applied to newly opened connections.
    pub connection: ConnectionDefaults,
    /// Client and server TLS material, only required if `open_ssl` /
    /// `wrap_fd(.., ssl = true)` is ever used.
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionDefaults {
    /// Minimum queued octets before an opportunistic send is attempted.
    /// Spec default: 0 (unbuffered).
    #[serde(default)]
    pub output_buffering: usize,

    /// Wall-clock timeout for `open_tcp` / `open_tcp_nb` to reach the
    /// *established* state once registered.
    #[serde(with = "humantime_secs", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// How often an `FdSet`'s background task re-checks an idle connection's
    /// interest bits when neither POLLIN nor POLLOUT is currently wanted.
    /// Purely a liveness safety net; not part of the wire protocol.
    #[serde(with = "humantime_secs", default = "default_idle_interval")]
    pub idle_poll_interval: Duration,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            output_buffering: 0,
            connect_timeout: default_connect_timeout(),
            idle_poll_interval: default_idle_interval(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_interval() -> Duration {
    Duration::from_millis(200)
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM certificate chain used for outbound (client) handshakes, e.g. for
    /// mutual-TLS gateways. Optional: a client without a client certificate
    /// still verifies the server. Must be set together with
    /// `client_key_file`.
    #[serde(default)]
    pub client_cert_file: Option<String>,
    /// PEM private key matching `client_cert_file`.
    #[serde(default)]
    pub client_key_file: Option<String>,
    /// PEM CA bundle used to verify server certificates on outbound
    /// connections. Required for `open_ssl` if not using the system roots.
    #[serde(default)]
    pub client_ca_file: Option<String>,

    /// PEM certificate chain presented by `wrap_fd(.., ssl = true)`.
    #[serde(default)]
    pub server_cert_file: Option<String>,
    /// PEM private key matching `server_cert_file`.
    #[serde(default)]
    pub server_key_file: Option<String>,

    /// Wall-clock bound on the handshake loop (§4.5: 30s for the client
    /// side; reused here for both directions).
    #[serde(with = "humantime_secs", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path:?}"))?;
        let cfg: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {path:?}"))?;
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionDefaults::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// `serde_with`-style helper (kept local to avoid an extra dependency) for
/// (de)serializing a `Duration` as a plain number of seconds.
mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
