//! Configuration loading from `.env` files and the process environment.

use std::{env, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::keys::{KeyError, SecretKeySigner};
use crate::publish::PublishOptions;
use crate::qc::QcOptions;

pub const DEFAULT_RELAY: &str = "wss://thecitadel.nostr1.com";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Secret key as given (hex or `nsec`); decoded by [`Settings::signer`].
    pub secret_key: Option<String>,
    /// Relay to publish to and query.
    pub relay: String,
    /// Relay hint written into address tags.
    pub relay_hint: String,
    /// Output directory for compiled and signed records.
    pub out_dir: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub publish: PublishOptions,
    pub qc: QcOptions,
}

impl Settings {
    /// Load settings, reading `path` first when it exists.
    pub fn from_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path).context("reading env file")?;
        }
        let secret_key = non_empty("SCRIPTORIUM_KEY");
        let relay = non_empty("SCRIPTORIUM_RELAY").unwrap_or_else(|| DEFAULT_RELAY.into());
        let relay_hint = non_empty("SCRIPTORIUM_RELAY_HINT").unwrap_or_else(|| relay.clone());
        let out_dir = PathBuf::from(non_empty("SCRIPTORIUM_OUT").unwrap_or_else(|| "out".into()));
        let tor_socks = non_empty("TOR_SOCKS");

        let defaults = PublishOptions::default();
        let publish = PublishOptions {
            pause_every: parse_or("SCRIPTORIUM_PAUSE_EVERY", defaults.pause_every)?,
            pause: Duration::from_millis(parse_or("SCRIPTORIUM_PAUSE_MS", 250)?),
            long_pause_every: parse_or("SCRIPTORIUM_LONG_PAUSE_EVERY", defaults.long_pause_every)?,
            long_pause: Duration::from_millis(parse_or("SCRIPTORIUM_LONG_PAUSE_MS", 2000)?),
            settle: Duration::from_secs(parse_or("SCRIPTORIUM_SETTLE_SECS", 30)?),
            query_timeout: Duration::from_secs(parse_or("SCRIPTORIUM_QUERY_TIMEOUT_SECS", 20)?),
            ..defaults
        };
        let qc = QcOptions {
            chunk: parse_or("SCRIPTORIUM_QC_CHUNK", 100)?,
            query_timeout: publish.query_timeout,
        };

        Ok(Self {
            secret_key,
            relay,
            relay_hint,
            out_dir,
            tor_socks,
            publish,
            qc,
        })
    }

    /// Decode the configured key. Called before any connection is opened.
    pub fn signer(&self) -> Result<SecretKeySigner, KeyError> {
        let key = self.secret_key.as_deref().ok_or(KeyError::Missing)?;
        SecretKeySigner::parse(key)
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name}: invalid value '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 12] = [
        "SCRIPTORIUM_KEY",
        "SCRIPTORIUM_RELAY",
        "SCRIPTORIUM_RELAY_HINT",
        "SCRIPTORIUM_OUT",
        "TOR_SOCKS",
        "SCRIPTORIUM_PAUSE_EVERY",
        "SCRIPTORIUM_PAUSE_MS",
        "SCRIPTORIUM_LONG_PAUSE_EVERY",
        "SCRIPTORIUM_LONG_PAUSE_MS",
        "SCRIPTORIUM_SETTLE_SECS",
        "SCRIPTORIUM_QUERY_TIMEOUT_SECS",
        "SCRIPTORIUM_QC_CHUNK",
    ];

    fn clear() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "SCRIPTORIUM_KEY=67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa\n",
                "SCRIPTORIUM_RELAY=ws://127.0.0.1:7777\n",
                "SCRIPTORIUM_OUT=/tmp/pub\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
                "SCRIPTORIUM_PAUSE_EVERY=10\n",
                "SCRIPTORIUM_SETTLE_SECS=5\n",
                "SCRIPTORIUM_QC_CHUNK=25\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relay, "ws://127.0.0.1:7777");
        assert_eq!(cfg.relay_hint, "ws://127.0.0.1:7777");
        assert_eq!(cfg.out_dir, PathBuf::from("/tmp/pub"));
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
        assert_eq!(cfg.publish.pause_every, 10);
        assert_eq!(cfg.publish.long_pause_every, 500);
        assert_eq!(cfg.publish.settle, Duration::from_secs(5));
        assert_eq!(cfg.qc.chunk, 25);
        assert!(cfg.signer().is_ok());
        clear();
    }

    #[test]
    fn defaults_when_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear();
        let dir = tempdir().unwrap();
        let cfg = Settings::from_env(dir.path().join("missing.env").to_str().unwrap()).unwrap();
        assert_eq!(cfg.relay, DEFAULT_RELAY);
        assert_eq!(cfg.relay_hint, DEFAULT_RELAY);
        assert_eq!(cfg.out_dir, PathBuf::from("out"));
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.publish.pause, Duration::from_millis(250));
        assert_eq!(cfg.publish.long_pause, Duration::from_millis(2000));
        assert_eq!(cfg.qc.chunk, 100);
        assert_eq!(cfg.qc.query_timeout, Duration::from_secs(20));
        assert_eq!(cfg.signer().err(), Some(KeyError::Missing));
    }

    #[test]
    fn explicit_hint_and_bad_numbers() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            "SCRIPTORIUM_RELAY_HINT=wss://hint.example\nSCRIPTORIUM_KEY=nsec1bogus\n",
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relay_hint, "wss://hint.example");
        assert!(matches!(cfg.signer(), Err(KeyError::Bech32(_))));

        env::set_var("SCRIPTORIUM_QC_CHUNK", "lots");
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("SCRIPTORIUM_QC_CHUNK"));
        clear();
    }
}
