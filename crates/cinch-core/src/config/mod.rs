mod database;

pub use database::DatabaseConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CinchError, Result};

/// Root configuration for the Cinch server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CinchConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// HTTP/WebSocket server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Security configuration (encryption, token hashing).
    pub security: SecurityConfig,

    /// Per-forge OAuth app credentials, keyed by forge type.
    #[serde(default)]
    pub forges: ForgesConfig,

    /// LogStore configuration.
    #[serde(default)]
    pub log_store: LogStoreConfig,
}

impl CinchConfig {
    /// Load configuration from a TOML file, substituting `${VAR}` references
    /// against the process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CinchError::Config(format!("failed to read config file: {e}")))?;
        Self::parse_toml(&content)
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);
        toml::from_str(&content).map_err(|e| CinchError::Config(format!("failed to parse config: {e}")))
    }
}

/// HTTP/WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `:8080` or `0.0.0.0:8080`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory for the LogStore when using the filesystem backend, and for
    /// any other on-disk state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Base URL used in user-facing links (e.g. job page links posted to
    /// forges as `target_url`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// WebSocket base URL, may differ from `base_url` for split traffic.
    #[serde(default)]
    pub ws_base_url: Option<String>,

    /// CORS origins allowed to call the `/api/*` surface.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            base_url: default_base_url(),
            ws_base_url: None,
            cors_origins: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

/// Security configuration: keys used for at-rest encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Primary secret key (32 raw bytes, base64/hex encoded) used for
    /// encrypting secrets at rest and hashing tokens.
    pub secret_key: String,

    /// Optional secondary key, tried as a decrypt fallback during key
    /// rotation.
    #[serde(default)]
    pub secondary_key: Option<String>,
}

/// Per-forge-type OAuth application credentials, all optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgesConfig {
    #[serde(default)]
    pub github: Option<ForgeAppConfig>,
    #[serde(default)]
    pub gitlab: Option<ForgeAppConfig>,
    #[serde(default)]
    pub forgejo: Option<ForgeAppConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeAppConfig {
    pub app_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// LogStore backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Object-store credentials, only used if the deployment opts into an
    /// object-store LogStore backend instead of the filesystem default.
    #[serde(default)]
    pub object_store_bucket: Option<String>,
    #[serde(default)]
    pub object_store_access_key: Option<String>,
    #[serde(default)]
    pub object_store_secret_key: Option<String>,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            object_store_bucket: None,
            object_store_access_key: None,
            object_store_secret_key: None,
        }
    }
}

/// Substitute `${VAR_NAME}` references in `content` from the process
/// environment, leaving unresolved references untouched.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            [database]
            url = "postgres://localhost/cinch"

            [security]
            secret_key = "0123456789abcdef0123456789abcdef"
        "#;

        let config = CinchConfig::parse_toml(toml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/cinch");
        assert_eq!(config.server.listen_addr, ":8080");
    }

    #[test]
    fn substitutes_env_vars() {
        std::env::set_var("CINCH_TEST_DB_URL", "postgres://test@localhost/cinch");

        let toml = r#"
            [database]
            url = "${CINCH_TEST_DB_URL}"

            [security]
            secret_key = "0123456789abcdef0123456789abcdef"
        "#;

        let config = CinchConfig::parse_toml(toml).unwrap();
        assert_eq!(config.database.url, "postgres://test@localhost/cinch");

        std::env::remove_var("CINCH_TEST_DB_URL");
    }

    #[test]
    fn missing_secret_key_is_a_parse_error() {
        let toml = r#"
            [database]
            url = "postgres://localhost/cinch"
        "#;

        assert!(CinchConfig::parse_toml(toml).is_err());
    }
}
