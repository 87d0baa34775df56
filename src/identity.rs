//! Identity assignment.
//!
//! Candidates come from an external identity pool in batches and are checked
//! against an identity oracle before use. When the configured number of
//! batches is exhausted (or no pool is configured) the service falls back to
//! generated names built from the agent-type prefix and a persisted
//! monotonic counter. Active assignments stay in bijection with the live
//! population; the assignment history is persisted so a uuid is never reused
//! for a different name across restarts.

use crate::config::IdentityConfig;
use crate::memory::MemoryStore;
use anyhow::Result;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityCandidate {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OracleVerdict {
    valid: bool,
}

pub struct IdentityService {
    config: IdentityConfig,
    http: reqwest::Client,
    store: Arc<MemoryStore>,
    pool: Mutex<VecDeque<IdentityCandidate>>,
    in_use: Mutex<HashSet<String>>,
    rejected: Mutex<HashSet<String>>,
}

impl IdentityService {
    pub fn new(config: IdentityConfig, store: Arc<MemoryStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            store,
            pool: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Assigns a unique identity for a new agent of the given type. Pool
    /// candidates are preferred; generated identities are the bounded-effort
    /// fallback, never an error.
    pub async fn acquire(&self, type_prefix: &str) -> IdentityCandidate {
        let mut batches_fetched = 0usize;
        loop {
            let candidate = self.pool.lock().await.pop_front();
            match candidate {
                Some(candidate) => {
                    if self.usable(&candidate).await {
                        self.commit(&candidate).await;
                        return candidate;
                    }
                    self.rejected.lock().await.insert(candidate.uuid);
                }
                None => {
                    if batches_fetched >= self.config.max_batches
                        || self.config.pool_url.is_empty()
                    {
                        let generated = self.generate(type_prefix).await;
                        self.commit(&generated).await;
                        return generated;
                    }
                    batches_fetched += 1;
                    match self.fetch_batch().await {
                        Ok(batch) => {
                            debug!("Fetched {} identity candidates", batch.len());
                            self.pool.lock().await.extend(batch);
                        }
                        Err(e) => {
                            warn!("Identity pool fetch failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Returns an identity to circulation bookkeeping on agent death. The
    /// name→uuid history remains persisted.
    pub async fn release(&self, name: &str) {
        self.in_use.lock().await.remove(name);
    }

    pub async fn active_count(&self) -> usize {
        self.in_use.lock().await.len()
    }

    async fn usable(&self, candidate: &IdentityCandidate) -> bool {
        if candidate.name.is_empty() || candidate.uuid.is_empty() {
            return false;
        }
        if self.rejected.lock().await.contains(&candidate.uuid) {
            return false;
        }
        if self.in_use.lock().await.contains(&candidate.name) {
            return false;
        }
        // A name that already has a different uuid on record would break the
        // no-reuse invariant.
        if let Some(existing) = self.store.uuid_for_name(&candidate.name) {
            if existing != candidate.uuid {
                return false;
            }
        }
        self.validate(candidate).await
    }

    async fn validate(&self, candidate: &IdentityCandidate) -> bool {
        if self.config.oracle_url.is_empty() {
            return true;
        }
        let url = format!(
            "{}/{}",
            self.config.oracle_url.trim_end_matches('/'),
            candidate.uuid
        );
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<OracleVerdict>().await {
                Ok(verdict) => verdict.valid,
                Err(e) => {
                    debug!("Oracle verdict parse failed for {}: {e}", candidate.name);
                    false
                }
            },
            Ok(resp) => {
                debug!("Oracle rejected {} ({})", candidate.name, resp.status());
                false
            }
            Err(e) => {
                debug!("Oracle unreachable for {}: {e}", candidate.name);
                false
            }
        }
    }

    async fn fetch_batch(&self) -> Result<Vec<IdentityCandidate>> {
        let url = format!(
            "{}?count={}",
            self.config.pool_url.trim_end_matches('/'),
            self.config.batch_size
        );
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("identity pool error ({status})");
        }
        Ok(resp.json().await?)
    }

    async fn generate(&self, type_prefix: &str) -> IdentityCandidate {
        let counter = self
            .store
            .next_name_counter(type_prefix)
            .unwrap_or_else(|_| crate::util::now_ts_millis());
        let mut name = format!("{type_prefix}_{counter}");
        // The persisted counter makes collisions unlikely; the in-use check
        // closes the rest.
        let in_use = self.in_use.lock().await;
        while in_use.contains(&name) {
            name.push('x');
        }
        IdentityCandidate {
            uuid: Uuid::new_v4().to_string(),
            name,
        }
    }

    async fn commit(&self, candidate: &IdentityCandidate) {
        self.in_use.lock().await.insert(candidate.name.clone());
        if let Err(e) = self.store.record_identity(&candidate.name, &candidate.uuid) {
            warn!("Failed to persist identity {}: {e}", candidate.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service() -> (IdentityService, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = MemoryStore::open(
            &dir.path().join("memory.redb"),
            &dir.path().join("knowledge.redb"),
            0.99,
            0.05,
        )
        .expect("open");
        (
            IdentityService::new(IdentityConfig::default(), store),
            dir,
        )
    }

    #[tokio::test]
    async fn fallback_names_are_prefixed_and_monotonic() {
        let (service, _dir) = service();
        let a = service.acquire("miner").await;
        let b = service.acquire("miner").await;
        let c = service.acquire("farmer").await;
        assert_eq!(a.name, "miner_1");
        assert_eq!(b.name, "miner_2");
        assert_eq!(c.name, "farmer_1");
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(service.active_count().await, 3);
    }

    #[tokio::test]
    async fn release_shrinks_the_active_set() {
        let (service, _dir) = service();
        let a = service.acquire("guard").await;
        assert_eq!(service.active_count().await, 1);
        service.release(&a.name).await;
        assert_eq!(service.active_count().await, 0);
    }

    #[tokio::test]
    async fn assignments_are_persisted() {
        let (service, _dir) = service();
        let a = service.acquire("scout").await;
        assert_eq!(service.store.uuid_for_name(&a.name), Some(a.uuid.clone()));
    }

    #[tokio::test]
    async fn pool_candidate_with_conflicting_uuid_is_skipped() {
        let (service, _dir) = service();
        service
            .store
            .record_identity("taken_name", "original-uuid")
            .expect("record");
        service.pool.lock().await.push_back(IdentityCandidate {
            uuid: "different-uuid".to_string(),
            name: "taken_name".to_string(),
        });
        let got = service.acquire("miner").await;
        // The conflicting candidate must be skipped in favor of a fallback.
        assert_ne!(got.name, "taken_name");
    }
}
