// File-backed per-user session store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::auth::LocalSession;
use crate::error::{Result, ServiceError};

pub const STORE_VERSION: u32 = 1;

/// Sessions held for one login server, keyed by provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginServerSessions {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub providers: HashMap<String, LocalSession>,
}

impl Default for LoginServerSessions {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            providers: HashMap::new(),
        }
    }
}

struct HostBucket {
    sessions: Mutex<LoginServerSessions>,
    path: PathBuf,
}

/// Process-wide registry of `{login server -> {provider -> LocalSession}}`,
/// persisted as one JSON file per login-server host. Writers are serialized
/// per host; mutations wake any registered refresh waiters.
pub struct SessionStore {
    dir: PathBuf,
    buckets: Mutex<HashMap<String, Arc<HostBucket>>>,
    refresh_tx: watch::Sender<u64>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (refresh_tx, _) = watch::channel(0);
        Self {
            dir: dir.into(),
            buckets: Mutex::new(HashMap::new()),
            refresh_tx,
        }
    }

    fn host_file(&self, host: &str) -> PathBuf {
        let safe: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    async fn bucket(&self, host: &str) -> Arc<HostBucket> {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(host) {
            return Arc::clone(bucket);
        }

        let path = self.host_file(host);
        let sessions = read_host_file(&path).unwrap_or_default();
        let bucket = Arc::new(HostBucket {
            sessions: Mutex::new(sessions),
            path,
        });
        buckets.insert(host.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Idempotent read of the persisted sessions for a login server.
    pub async fn load(&self, host: &str) -> LoginServerSessions {
        let bucket = self.bucket(host).await;
        let sessions = bucket.sessions.lock().await;
        sessions.clone()
    }

    pub async fn get_session(&self, host: &str, provider: &str) -> Option<LocalSession> {
        let bucket = self.bucket(host).await;
        let sessions = bucket.sessions.lock().await;
        sessions.providers.get(provider).cloned()
    }

    /// Add or overwrite a provider session and persist the bucket.
    pub async fn add_session(
        &self,
        host: &str,
        provider: &str,
        session: LocalSession,
    ) -> Result<()> {
        let bucket = self.bucket(host).await;
        {
            let mut sessions = bucket.sessions.lock().await;
            sessions.providers.insert(provider.to_string(), session);
            sessions.updated_at = Utc::now();
            write_host_file(&bucket.path, &sessions)?;
        }
        self.refresh_tx.send_modify(|v| *v += 1);
        tracing::debug!(host = %host, provider = %provider, "Session stored");
        Ok(())
    }

    pub async fn remove_session(&self, host: &str, provider: &str) -> Result<()> {
        let bucket = self.bucket(host).await;
        {
            let mut sessions = bucket.sessions.lock().await;
            sessions.providers.remove(provider);
            sessions.updated_at = Utc::now();
            write_host_file(&bucket.path, &sessions)?;
        }
        self.refresh_tx.send_modify(|v| *v += 1);
        Ok(())
    }

    pub async fn remove_all(&self, host: &str) -> Result<()> {
        let bucket = self.bucket(host).await;
        {
            let mut sessions = bucket.sessions.lock().await;
            sessions.providers.clear();
            sessions.updated_at = Utc::now();
            write_host_file(&bucket.path, &sessions)?;
        }
        self.refresh_tx.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Block until any session under `host` is updated, or `cancel` fires.
    /// Returns the fresh snapshot, or `None` on cancellation.
    pub async fn await_refresh(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Option<LoginServerSessions> {
        let baseline = self.load(host).await.updated_at;
        let mut rx = self.refresh_tx.subscribe();

        loop {
            let current = self.load(host).await;
            if current.updated_at > baseline {
                return Some(current);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Block until `provider` under `host` gains a new or newer session, or
    /// `cancel` fires.
    pub async fn await_provider_refresh(
        &self,
        host: &str,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Option<LocalSession> {
        let baseline = self
            .get_session(host, provider)
            .await
            .map(|s| s.expires_at);
        let mut rx = self.refresh_tx.subscribe();

        loop {
            if let Some(session) = self.get_session(host, provider).await {
                let newer = match baseline {
                    Some(expiry) => session.expires_at > expiry,
                    None => true,
                };
                if newer {
                    return Some(session);
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

fn read_host_file(path: &Path) -> Option<LoginServerSessions> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Atomic replace: write to a temp file in the same directory, then rename.
fn write_host_file(path: &Path, sessions: &LoginServerSessions) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ServiceError::Internal("session file has no parent".to_string()))?;
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(sessions)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
