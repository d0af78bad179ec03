use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::patterns::BackendKind;

/// Replay tool configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "riskcore")]
#[command(about = "Real-time transaction risk scoring core")]
pub struct Config {
    /// Path to the rule configuration (JSON or YAML)
    #[arg(long, default_value = "rules.json", env = "RISKCORE_RULES_PATH")]
    pub rules_path: PathBuf,

    /// Path to the blacklist pattern file (optional, no patterns if not set)
    #[arg(long, env = "RISKCORE_BLACKLIST_PATH")]
    pub blacklist_path: Option<PathBuf>,

    /// Path to the whitelist pattern file (optional)
    #[arg(long, env = "RISKCORE_WHITELIST_PATH")]
    pub whitelist_path: Option<PathBuf>,

    /// Pattern matching backend (auto, accelerated, fallback)
    #[arg(long, default_value = "auto", env = "RISKCORE_PATTERN_BACKEND")]
    pub backend: BackendKind,

    /// Rule hot-reload poll interval in milliseconds, 0 disables
    #[arg(long, default_value = "1000", env = "RISKCORE_HOT_RELOAD_MS")]
    pub hot_reload_ms: u64,

    /// JSON-lines transaction input, `-` for stdin
    #[arg(long, default_value = "-", env = "RISKCORE_INPUT")]
    pub input: String,

    /// Version label stamped on decisions for the supplied model scores
    #[arg(long, default_value = "none", env = "RISKCORE_MODEL_VERSION")]
    pub model_version: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false", env = "RISKCORE_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Hot-reload interval, or `None` when disabled.
    pub fn hot_reload_interval(&self) -> Option<Duration> {
        (self.hot_reload_ms > 0).then(|| Duration::from_millis(self.hot_reload_ms))
    }

    /// Whether transactions are read from stdin.
    pub fn reads_stdin(&self) -> bool {
        self.input == "-"
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rules_path: PathBuf::from("rules.json"),
            blacklist_path: None,
            whitelist_path: None,
            backend: BackendKind::Auto,
            hot_reload_ms: 1000,
            input: "-".to_string(),
            model_version: "none".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.rules_path, PathBuf::from("rules.json"));
        assert_eq!(config.backend, BackendKind::Auto);
        assert!(config.reads_stdin());
        assert!(config.blacklist_path.is_none());
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config {
            hot_reload_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.hot_reload_interval(), Some(Duration::from_millis(250)));

        let disabled = Config {
            hot_reload_ms: 0,
            ..Default::default()
        };
        assert_eq!(disabled.hot_reload_interval(), None);
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "riskcore",
            "--rules-path",
            "/etc/riskcore/rules.yaml",
            "--blacklist-path",
            "black.txt",
            "--backend",
            "fallback",
            "--hot-reload-ms",
            "0",
            "--input",
            "tx.jsonl",
        ])
        .unwrap();

        assert_eq!(config.rules_path, PathBuf::from("/etc/riskcore/rules.yaml"));
        assert_eq!(config.blacklist_path, Some(PathBuf::from("black.txt")));
        assert_eq!(config.backend, BackendKind::Fallback);
        assert_eq!(config.hot_reload_interval(), None);
        assert!(!config.reads_stdin());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Config::try_parse_from(["riskcore", "--backend", "gpu"]).is_err());
    }
}
