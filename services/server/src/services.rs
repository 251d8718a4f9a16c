// Explicit service wiring: no hidden singletons

use std::sync::Arc;
use std::time::Duration;

use thand_shared::crypto::EncryptionService;
use thand_shared::workflow::WorkflowRuntime;
use thand_shared::{AppConfig, Result};

use crate::elevation::{ElevationActivities, ElevationWorkflow, RoleCatalog};
use crate::llm::LlmService;
use crate::metrics::Metrics;
use crate::middleware::rate_limit::TokenBucketLimiter;
use crate::providers::ProviderRegistry;
use crate::saml::{CsrfStore, ReplayCache};

const CSRF_TTL: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The server's service container, passed into every handler through axum
/// state.
pub struct Services {
    pub config: AppConfig,
    pub encryption: Arc<EncryptionService>,
    pub runtime: Arc<WorkflowRuntime>,
    pub registry: Arc<ProviderRegistry>,
    pub catalog: Arc<RoleCatalog>,
    pub replay_cache: Arc<ReplayCache>,
    pub csrf: Arc<CsrfStore>,
    pub saml_limiter: Arc<TokenBucketLimiter>,
    pub llm: Option<Arc<LlmService>>,
    pub metrics: Arc<Metrics>,
}

pub type AppState = Arc<Services>;

impl Services {
    /// Wire all services from configuration, register workflow definitions
    /// and replay unfinished executions from their journals.
    pub async fn build(config: AppConfig) -> Result<AppState> {
        let encryption = Arc::new(match &config.encryption_key {
            Some(key) => EncryptionService::from_encoded_key(key)?,
            None => EncryptionService::load_or_generate(&config.secret_key_path())?,
        });
        tracing::info!(
            fingerprint = %encryption.fingerprint(),
            "Encryption service ready"
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| thand_shared::ServiceError::Internal(e.to_string()))?;

        let replay_cache = Arc::new(ReplayCache::new(Duration::from_secs(
            config.saml.replay_ttl_secs,
        )));
        let csrf = Arc::new(CsrfStore::new(CSRF_TTL));
        let saml_limiter = Arc::new(TokenBucketLimiter::new(
            config.saml.rate_per_second,
            config.saml.burst,
            Duration::from_secs(config.saml.bucket_idle_secs),
        ));

        let registry = Arc::new(ProviderRegistry::from_settings(
            &config.providers,
            http.clone(),
            Arc::clone(&replay_cache),
        )?);
        let catalog = Arc::new(RoleCatalog::new(
            config.roles.clone(),
            config.workflows.clone(),
        ));

        let runtime = Arc::new(WorkflowRuntime::new(config.workflows_dir()));
        let activities = Arc::new(ElevationActivities::new(
            Arc::clone(&registry),
            Arc::clone(&encryption),
            config.server.public_url.clone(),
        ));
        runtime.register(Arc::new(ElevationWorkflow::new(activities)));

        let recovered = runtime.recover().map_err(thand_shared::ServiceError::from)?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered workflows from journals");
        }

        let llm = if config.llm.enabled {
            Some(Arc::new(LlmService::new(config.llm.clone(), http)))
        } else {
            None
        };

        let services = Arc::new(Self {
            config,
            encryption,
            runtime,
            registry,
            catalog,
            replay_cache,
            csrf,
            saml_limiter,
            llm,
            metrics: Arc::new(Metrics::new()),
        });
        services.spawn_sweepers();
        Ok(services)
    }

    /// Boot preconditions: login endpoint configured, server secret rotated,
    /// encryption service present. The setup gate intercepts traffic until
    /// all three hold.
    pub fn setup_complete(&self) -> bool {
        self.config.login_server_configured() && self.config.server_secret_configured()
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        let services = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                services.replay_cache.sweep();
                services.csrf.sweep();
                services.saml_limiter.sweep();
            }
        });
    }
}
