use config::{Config, Environment, File};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Cfg {
    pub log: CfgLog,
    pub store: CfgStore,
    pub whitelist: CfgWhitelist,
    pub greylist: CfgGreylist,
    pub dialback: CfgDialback,
    pub comeagain: CfgComeagain,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgLog {
    pub level: String,
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Backend shared by every filter's stores.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgStore {
    /// `file`, `memory`, `sqlite`, `postgres` or `mysql`.
    pub backend: String,
    /// Directory holding the state of the `file` and `sqlite` backends.
    pub path: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Default for CfgStore {
    fn default() -> Self {
        CfgStore {
            backend: "file".to_string(),
            path: "/var/lib/mailgate".to_string(),
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgWhitelist {
    pub enabled: bool,
    pub ttl: u64,
    pub purge_interval: u64,
}

impl Default for CfgWhitelist {
    fn default() -> Self {
        CfgWhitelist {
            enabled: true,
            ttl: 30 * DAY,
            purge_interval: 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgGreylist {
    pub enabled: bool,
    /// Seconds a new triplet must wait before it is accepted.
    pub delay: u64,
    pub not_passed_ttl: u64,
    pub passed_ttl: u64,
    pub purge_interval: u64,
}

impl Default for CfgGreylist {
    fn default() -> Self {
        CfgGreylist {
            enabled: true,
            delay: 5 * 60,
            not_passed_ttl: DAY,
            passed_ttl: 36 * DAY,
            purge_interval: 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgDialback {
    pub enabled: bool,
    pub good_ttl: u64,
    pub bad_ttl: u64,
    pub purge_interval: u64,
    /// Bound on one whole SMTP conversation, in seconds.
    pub smtp_timeout: u64,
    pub dns_timeout: u64,
    pub smtp_port: u16,
    /// Name announced in `HELO`. Defaults to the system host name.
    pub helo_name: Option<String>,
    /// Reverse path used for probes. Defaults to `postmaster@<helo_name>`;
    /// an empty string sends the null reverse path.
    pub probe_from: Option<String>,
}

impl Default for CfgDialback {
    fn default() -> Self {
        CfgDialback {
            enabled: true,
            good_ttl: 7 * DAY,
            bad_ttl: DAY,
            purge_interval: 60 * 60,
            smtp_timeout: 60,
            dns_timeout: 10,
            smtp_port: 25,
            helo_name: None,
            probe_from: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgComeagain {
    pub enabled: bool,
    pub ttl: u64,
    pub purge_interval: u64,
}

impl Default for CfgComeagain {
    fn default() -> Self {
        CfgComeagain {
            enabled: false,
            ttl: 7 * DAY,
            purge_interval: 60 * 60,
        }
    }
}

impl Cfg {
    /// Loads `cfg_path` and applies `MAILGATE__SECTION__KEY` environment overrides.
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .add_source(
                Environment::with_prefix("MAILGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Cfg::default();
        assert_eq!(cfg.store.backend, "file");
        assert_eq!(cfg.whitelist.ttl, 30 * DAY);
        assert_eq!(cfg.greylist.delay, 300);
        assert_eq!(cfg.greylist.not_passed_ttl, DAY);
        assert_eq!(cfg.greylist.passed_ttl, 36 * DAY);
        assert_eq!(cfg.dialback.smtp_timeout, 60);
        assert!(!cfg.comeagain.enabled);
        assert_eq!(cfg.log.format, LogFormat::Text);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[log]
format = "json"

[store]
backend = "sqlite"
path = "/tmp/mailgate"

[greylist]
delay = 600

[dialback]
probe_from = ""
"#
        )
        .unwrap();

        let cfg = Cfg::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.store.backend, "sqlite");
        assert_eq!(cfg.greylist.delay, 600);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.greylist.passed_ttl, 36 * DAY);
        assert_eq!(cfg.dialback.probe_from.as_deref(), Some(""));
        assert!(cfg.whitelist.enabled);
    }
}
