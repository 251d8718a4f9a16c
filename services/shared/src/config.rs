// Configuration management for thand services

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::{Role, WorkflowPolicy};

/// Sentinel value for an unconfigured login server. The setup gate refuses to
/// serve elevation traffic while this is in effect.
pub const DEFAULT_LOGIN_SERVER: &str = "https://login.thand.local";

/// Sentinel for a server secret that has not been rotated away from the
/// shipped default.
pub const DEFAULT_SERVER_SECRET: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Central login server endpoint the agent and client talk to.
    #[serde(default = "default_login_server")]
    pub login_server: String,
    /// Process secret used to derive cookies and CSRF material. Must be
    /// rotated away from the default before the server will serve traffic.
    #[serde(default = "default_server_secret")]
    pub server_secret: String,
    /// Base64 encoded 32-byte encryption key. Generated and persisted under
    /// the data directory on first run when unset.
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub saml: SamlConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Provider instances keyed by name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Role catalog keyed by role name.
    #[serde(default)]
    pub roles: HashMap<String, Role>,
    /// Approval workflow policies keyed by name.
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used for redirect URIs and ACS URLs.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8440,
            public_url: "http://localhost:8440".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8441,
        }
    }
}

impl AgentConfig {
    /// Loopback URL the agent advertises to local clients.
    pub fn local_server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Accepted origins. Entries may carry a single `*.` wildcard prefix,
    /// e.g. `https://*.example.com`.
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlConfig {
    /// Token bucket refill rate per client IP, requests per second.
    pub rate_per_second: f64,
    pub burst: u32,
    /// Replay cache TTL, matching the SAML assertion validity window.
    pub replay_ttl_secs: u64,
    /// Buckets idle longer than this are swept.
    pub bucket_idle_secs: u64,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 5.0,
            burst: 10,
            replay_ttl_secs: 300,
            bucket_idle_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// One configured provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Registered implementation to instantiate (`oauth2`, `saml`, `gcp`, ...).
    pub kind: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_login_server() -> String {
    DEFAULT_LOGIN_SERVER.to_string()
}

fn default_server_secret() -> String {
    DEFAULT_SERVER_SECRET.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".thand")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            login_server: default_login_server(),
            server_secret: default_server_secret(),
            encryption_key: None,
            data_dir: default_data_dir(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
            saml: SamlConfig::default(),
            llm: LlmConfig::default(),
            providers: HashMap::new(),
            roles: HashMap::new(),
            workflows: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration by layering defaults, the YAML config file and
    /// `THAND_`-prefixed environment variables, in increasing precedence.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        let default_file = default_data_dir().join("config.yaml");
        let path = config_path.map(PathBuf::from).unwrap_or(default_file);
        if path.exists() {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("THAND")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;

        // Role maps keyed by name; backfill the name field when omitted.
        for (name, role) in cfg.roles.iter_mut() {
            if role.name.is_empty() {
                role.name = name.clone();
            }
        }
        for (name, wf) in cfg.workflows.iter_mut() {
            if wf.name.is_empty() {
                wf.name = name.clone();
            }
        }

        Ok(cfg)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    pub fn secret_key_path(&self) -> PathBuf {
        self.data_dir.join("secret.key")
    }

    /// True once the operator has pointed the install at a real login server.
    pub fn login_server_configured(&self) -> bool {
        !self.login_server.is_empty() && self.login_server != DEFAULT_LOGIN_SERVER
    }

    /// True once the shipped default secret has been rotated.
    pub fn server_secret_configured(&self) -> bool {
        !self.server_secret.is_empty() && self.server_secret != DEFAULT_SERVER_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8440);
        assert_eq!(config.agent.port, 8441);
        assert!(!config.login_server_configured());
        assert!(!config.server_secret_configured());
        assert_eq!(config.saml.burst, 10);
        assert!((config.saml.rate_per_second - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_configured_predicates() {
        let mut config = AppConfig::default();
        config.login_server = "https://login.corp.example.com".to_string();
        config.server_secret = "rotated-secret".to_string();
        assert!(config.login_server_configured());
        assert!(config.server_secret_configured());
    }

    #[test]
    fn test_yaml_role_catalog() {
        let yaml = r#"
login_server: https://login.corp.example.com
roles:
  readonly:
    description: Read-only access
    providers: [gcp-prod]
    inherits: ["roles/viewer"]
    workflows: [default-approval]
workflows:
  default-approval:
    approvers: [secops@example.com]
"#;
        let mut cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        for (name, role) in cfg.roles.iter_mut() {
            if role.name.is_empty() {
                role.name = name.clone();
            }
        }
        let role = cfg.roles.get("readonly").unwrap();
        assert_eq!(role.name, "readonly");
        assert_eq!(role.inherits, vec!["roles/viewer"]);
        assert!(role.require_approval);
    }

    #[test]
    fn test_agent_local_server_url() {
        let config = AppConfig::default();
        assert_eq!(config.agent.local_server_url(), "http://127.0.0.1:8441");
    }
}
