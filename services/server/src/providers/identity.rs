// Directory identity provider with a background-built token index

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thand_shared::{BasicConfig, Result};

use super::{Identity, IdentityKind, IdentityProvider};

/// Static directory of users and groups from provider configuration. The
/// token index is built off-thread; lookups fall back to substring filtering
/// until it is ready.
pub struct DirectoryProvider {
    name: String,
    identities: Arc<Vec<Identity>>,
    index: Arc<RwLock<HashMap<String, Vec<usize>>>>,
    index_ready: Arc<AtomicBool>,
}

impl DirectoryProvider {
    pub fn new(name: &str, config: &BasicConfig) -> Self {
        let mut identities = Vec::new();
        for entry in config.get_list("users") {
            if let Some(identity) = parse_entry(&entry, IdentityKind::User) {
                identities.push(identity);
            }
        }
        for entry in config.get_list("groups") {
            if let Some(identity) = parse_entry(&entry, IdentityKind::Group) {
                identities.push(identity);
            }
        }

        let provider = Self {
            name: name.to_string(),
            identities: Arc::new(identities),
            index: Arc::new(RwLock::new(HashMap::new())),
            index_ready: Arc::new(AtomicBool::new(false)),
        };
        provider.build_index_off_thread();
        provider
    }

    fn build_index_off_thread(&self) {
        let identities = Arc::clone(&self.identities);
        let index = Arc::clone(&self.index);
        let ready = Arc::clone(&self.index_ready);
        let name = self.name.clone();

        std::thread::spawn(move || {
            let mut built: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, identity) in identities.iter().enumerate() {
                for token in tokenize(identity) {
                    built.entry(token).or_default().push(i);
                }
            }
            let token_count = built.len();
            *index.write().unwrap() = built;
            ready.store(true, Ordering::Release);
            tracing::debug!(
                provider = %name,
                identities = identities.len(),
                tokens = token_count,
                "Identity index built"
            );
        });
    }

    pub fn index_ready(&self) -> bool {
        self.index_ready.load(Ordering::Acquire)
    }

    fn filtered(&self, filter: &str) -> Vec<Identity> {
        let needle = filter.to_lowercase();

        if self.index_ready() {
            let index = self.index.read().unwrap();
            let mut hits: Vec<usize> = index
                .iter()
                .filter(|(token, _)| token.starts_with(&needle))
                .flat_map(|(_, indices)| indices.iter().copied())
                .collect();
            hits.sort_unstable();
            hits.dedup();
            return hits
                .into_iter()
                .map(|i| self.identities[i].clone())
                .collect();
        }

        // Index still warming up: substring scan.
        self.identities
            .iter()
            .filter(|identity| {
                identity.email.to_lowercase().contains(&needle)
                    || identity.name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IdentityProvider for DirectoryProvider {
    async fn list_identities(&self, filter: Option<&str>) -> Result<Vec<Identity>> {
        Ok(match filter {
            Some(f) if !f.is_empty() => self.filtered(f),
            _ => self.identities.as_ref().clone(),
        })
    }
}

/// Entries are `email` or `email:Display Name`.
fn parse_entry(entry: &str, kind: IdentityKind) -> Option<Identity> {
    let (email, name) = match entry.split_once(':') {
        Some((email, name)) => (email.trim(), name.trim()),
        None => (entry.trim(), ""),
    };
    if email.is_empty() {
        return None;
    }
    Some(Identity {
        id: email.to_string(),
        kind,
        email: email.to_string(),
        name: name.to_string(),
    })
}

fn tokenize(identity: &Identity) -> Vec<String> {
    let mut tokens = Vec::new();
    let email = identity.email.to_lowercase();
    tokens.push(email.clone());
    if let Some((local, domain)) = email.split_once('@') {
        tokens.push(local.to_string());
        tokens.push(domain.to_string());
    }
    for word in identity.name.to_lowercase().split_whitespace() {
        tokens.push(word.to_string());
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn provider() -> DirectoryProvider {
        let config = BasicConfig(StdHashMap::from([
            (
                "users".to_string(),
                "alice@example.com:Alice Anderson, bob@example.com:Bob Brown".to_string(),
            ),
            (
                "groups".to_string(),
                "engineering@example.com:Engineering".to_string(),
            ),
        ]));
        DirectoryProvider::new("corp-directory", &config)
    }

    #[tokio::test]
    async fn test_list_all_identities() {
        let provider = provider();
        let identities = provider.list_identities(None).await.unwrap();
        assert_eq!(identities.len(), 3);
        assert!(identities.iter().any(|i| i.kind == IdentityKind::Group));
    }

    #[tokio::test]
    async fn test_filter_matches_name_and_email() {
        let provider = provider();
        // Works whether the index is warm or still building.
        let by_name = provider.list_identities(Some("alice")).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].email, "alice@example.com");

        let by_group = provider.list_identities(Some("engineering")).await.unwrap();
        assert_eq!(by_group.len(), 1);
        assert_eq!(by_group[0].kind, IdentityKind::Group);
    }

    #[tokio::test]
    async fn test_indexed_lookup_after_warmup() {
        let provider = provider();
        for _ in 0..100 {
            if provider.index_ready() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(provider.index_ready());

        let hits = provider.list_identities(Some("bob")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].email, "bob@example.com");
    }
}
