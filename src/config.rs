//! Process-wide configuration, read once at startup.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_KEY: &str = "default-api-key";

/// Immutable service configuration.
///
/// Built from CLI flags (with environment fallbacks) and shared behind an
/// `Arc` by every component.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Shared secret expected in the `x-api-key` header
    #[arg(long, env = "CODE_API_KEY", default_value = DEFAULT_API_KEY, hide_env_values = true)]
    pub api_key: String,

    /// Root directory for raw uploads used by staging
    #[arg(long, env = "CODE_UPLOADS_DIR", default_value = "/tmp/code-exec/uploads")]
    pub uploads_dir: PathBuf,

    /// Root directory holding one workspace per session
    #[arg(long, env = "CODE_SESSIONS_DIR", default_value = "/tmp/code-exec/sessions")]
    pub sessions_dir: PathBuf,

    /// Maximum size of a single uploaded file in bytes
    #[arg(long, env = "CODE_MAX_FILE_SIZE", default_value = "104857600")]
    pub max_file_size: u64,

    /// Wall-clock limit for a whole execution (compile + run) in milliseconds
    #[arg(long, env = "CODE_TIMEOUT_MS", default_value = "30000")]
    pub timeout_ms: u64,

    /// Cap on captured bytes per output stream
    #[arg(long, env = "CODE_MAX_OUTPUT_BYTES", default_value = "1048576")]
    pub max_output_bytes: usize,
}

impl Config {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Config rooted at `root`, with default limits. Used by the CLI runner
    /// and tests.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            uploads_dir: root.join("uploads"),
            sessions_dir: root.join("sessions"),
            ..Self::default()
        }
    }

    /// Prefix of the secret that is safe to log.
    pub fn api_key_hint(&self) -> &str {
        let end = self
            .api_key
            .char_indices()
            .nth(5)
            .map(|(i, _)| i)
            .unwrap_or(self.api_key.len());
        &self.api_key[..end]
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
            uploads_dir: PathBuf::from("/tmp/code-exec/uploads"),
            sessions_dir: PathBuf::from("/tmp/code-exec/sessions"),
            max_file_size: 100 * 1024 * 1024,
            timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "codebox",
            "--api-key",
            "s3cret-value",
            "--timeout-ms",
            "500",
            "--sessions-dir",
            "/srv/sessions",
        ]);
        assert_eq!(cli.config.api_key, "s3cret-value");
        assert_eq!(cli.config.exec_timeout(), Duration::from_millis(500));
        assert_eq!(cli.config.sessions_dir, PathBuf::from("/srv/sessions"));
        assert_eq!(cli.config.max_file_size, 100 * 1024 * 1024);
    }

    #[test]
    fn api_key_hint_is_a_prefix() {
        let config = Config {
            api_key: "abcdefghij".into(),
            ..Config::default()
        };
        assert_eq!(config.api_key_hint(), "abcde");

        let short = Config {
            api_key: "ab".into(),
            ..Config::default()
        };
        assert_eq!(short.api_key_hint(), "ab");
    }

    #[test]
    fn rooted_config_keeps_roots_apart() {
        let config = Config::rooted_at("/data");
        assert_eq!(config.uploads_dir, PathBuf::from("/data/uploads"));
        assert_eq!(config.sessions_dir, PathBuf::from("/data/sessions"));
        assert_eq!(config.timeout_ms, 30_000);
    }
}
