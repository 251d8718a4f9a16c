// Agent service container

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thand_shared::auth::BootstrapCode;
use thand_shared::crypto::EncryptionService;
use thand_shared::sessions::SessionStore;
use thand_shared::{AppConfig, Result};

/// Lifetime of one-time bootstrap codes handed to local clients.
pub const BOOTSTRAP_CODE_TTL_SECS: u64 = 300;

pub struct AgentServices {
    pub config: AppConfig,
    pub store: Arc<SessionStore>,
    pub encryption: Arc<EncryptionService>,
    /// Outstanding one-time bootstrap codes, keyed by code value.
    pub pending_codes: Mutex<HashMap<String, BootstrapCode>>,
}

pub type AgentState = Arc<AgentServices>;

impl AgentServices {
    pub fn build(config: AppConfig) -> Result<AgentState> {
        let encryption = Arc::new(EncryptionService::load_or_generate(
            &config.secret_key_path(),
        )?);
        let store = Arc::new(SessionStore::new(config.sessions_dir()));

        Ok(Arc::new(Self {
            config,
            store,
            encryption,
            pending_codes: Mutex::new(HashMap::new()),
        }))
    }

    /// Host key under which sessions for the configured login server are
    /// stored.
    pub fn login_server_host(&self) -> String {
        let url = &self.config.login_server;
        match url.split_once("://") {
            Some((_, rest)) => rest.split('/').next().unwrap_or(rest).to_string(),
            None => url.clone(),
        }
    }

    /// The loopback URL this agent advertises to local clients.
    pub fn local_server_url(&self) -> String {
        self.config.agent.local_server_url()
    }

    pub fn postflight_url(&self) -> String {
        format!("{}/postflight", self.local_server_url())
    }

    pub fn issue_code(&self) -> (String, BootstrapCode) {
        let value = thand_shared::crypto::generate_token(24);
        let code = BootstrapCode::new(self.postflight_url(), BOOTSTRAP_CODE_TTL_SECS);
        self.pending_codes
            .lock()
            .unwrap()
            .insert(value.clone(), code.clone());
        (value, code)
    }

    /// Consume a one-time code; valid only if unexpired and issued for this
    /// agent's postflight URL.
    pub fn consume_code(&self, value: &str) -> bool {
        let mut codes = self.pending_codes.lock().unwrap();
        match codes.remove(value) {
            Some(code) => code.is_valid(&self.postflight_url()),
            None => false,
        }
    }
}
