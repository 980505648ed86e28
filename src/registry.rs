// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-owned set of caches.
//!
//! Caches of different payload types are held behind [`ManagedCache`] and
//! started in dependency order: a cache never starts before a cache it
//! directly depends on, and independent caches keep registration order.
//! Shutdown walks the same order in reverse.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::admin::{PurgeGuard, PurgeRejection};
use crate::cache::{Cache, CacheState};
use crate::config::PayloadConfig;
use crate::error::CacheError;
use crate::payload::Payload;

/// Type-erased lifecycle surface of a [`Cache`].
#[async_trait]
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;
    fn dependencies(&self) -> &[String];
    fn state(&self) -> CacheState;

    /// Start, given the names of caches already running.
    async fn start_with(&self, running: &[String]) -> Result<(), CacheError>;

    /// Returns the number of payloads that failed to save.
    async fn shutdown(&self) -> Result<usize, CacheError>;

    async fn purge(&self) -> Result<u64, CacheError>;
}

#[async_trait]
impl<P: Payload> ManagedCache for Cache<P> {
    fn name(&self) -> &str {
        Cache::name(self)
    }

    fn dependencies(&self) -> &[String] {
        Cache::dependencies(self)
    }

    fn state(&self) -> CacheState {
        Cache::state(self)
    }

    async fn start_with(&self, running: &[String]) -> Result<(), CacheError> {
        let dependency_running = |name: &str| running.iter().any(|r| r == name);
        Cache::start_with(self, &dependency_running).await
    }

    async fn shutdown(&self) -> Result<usize, CacheError> {
        Cache::shutdown(self).await
    }

    async fn purge(&self) -> Result<u64, CacheError> {
        Cache::purge(self).await
    }
}

/// Order `items` so that no item precedes one of its direct dependencies.
///
/// `items` are `(name, dependencies)` pairs; the result holds indices into
/// `items`. Items that are free to go keep their original relative order.
/// Dependencies on names not in `items` are ignored. Members of a cycle are
/// appended in original order.
pub fn sort_by_dependencies(items: &[(String, Vec<String>)]) -> Vec<usize> {
    let present = |name: &str| items.iter().any(|(n, _)| n == name);
    let mut placed = vec![false; items.len()];
    let mut order = Vec::with_capacity(items.len());

    while order.len() < items.len() {
        let ready = (0..items.len()).find(|&i| {
            !placed[i]
                && items[i].1.iter().all(|dep| {
                    !present(dep) || items.iter().enumerate().all(|(j, (n, _))| n != dep || placed[j])
                })
        });
        match ready {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let stuck: Vec<usize> = (0..items.len()).filter(|&i| !placed[i]).collect();
                warn!(
                    caches = ?stuck.iter().map(|&i| items[i].0.as_str()).collect::<Vec<_>>(),
                    "Dependency cycle between caches; keeping registration order"
                );
                order.extend(stuck);
            }
        }
    }
    order
}

/// What a confirmed purge did.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub deleted: u64,
    pub purged: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub enum PurgeOutcome {
    /// Nothing was pending for the sender; nothing was deleted. Echo the
    /// code within the TTL to go ahead.
    CodeIssued(String),
    Rejected(PurgeRejection),
    Completed(PurgeReport),
}

pub struct CacheRegistry {
    caches: RwLock<Vec<Arc<dyn ManagedCache>>>,
    purge_guard: PurgeGuard,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::with_purge_code_ttl(PayloadConfig::default().purge_code_ttl())
    }

    pub fn with_purge_code_ttl(ttl: Duration) -> Self {
        Self {
            caches: RwLock::new(Vec::new()),
            purge_guard: PurgeGuard::new(ttl),
        }
    }

    pub fn register<C: ManagedCache + 'static>(&self, cache: C) -> Result<(), CacheError> {
        let mut caches = self.caches.write();
        if caches.iter().any(|c| c.name() == cache.name()) {
            return Err(CacheError::DuplicateCache(cache.name().to_string()));
        }
        caches.push(Arc::new(cache));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.caches.read().iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.caches.read().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).map(|c| c.state() == CacheState::Running).unwrap_or(false)
    }

    /// Caches in dependency order.
    pub fn sorted(&self) -> Vec<Arc<dyn ManagedCache>> {
        let caches = self.caches.read().clone();
        let items: Vec<(String, Vec<String>)> = caches
            .iter()
            .map(|c| (c.name().to_string(), c.dependencies().to_vec()))
            .collect();
        sort_by_dependencies(&items)
            .into_iter()
            .map(|i| Arc::clone(&caches[i]))
            .collect()
    }

    /// Start every cache in dependency order; stops at the first failure.
    #[tracing::instrument(skip(self))]
    pub async fn start_all(&self) -> Result<(), CacheError> {
        for cache in self.sorted() {
            if cache.state() == CacheState::Running {
                continue;
            }
            let running: Vec<String> = self
                .caches
                .read()
                .iter()
                .filter(|c| c.state() == CacheState::Running)
                .map(|c| c.name().to_string())
                .collect();
            cache.start_with(&running).await?;
        }
        info!(caches = self.len(), "All caches started");
        Ok(())
    }

    /// Shut down in reverse dependency order; returns total save failures.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_all(&self) -> usize {
        let mut failures = 0;
        for cache in self.sorted().into_iter().rev() {
            match cache.shutdown().await {
                Ok(n) => failures += n,
                Err(CacheError::NotRunning(_)) => {}
                Err(e) => error!(cache = cache.name(), error = %e, "Cache shutdown failed"),
            }
        }
        if failures > 0 {
            warn!(failures, "Payloads failed to save during shutdown");
        }
        failures
    }

    /// Hand `sender` a confirmation code without attempting a purge.
    pub fn request_purge(&self, sender: &str) -> String {
        self.purge_guard.issue(sender)
    }

    /// Purge every cache not named in `ignore`, given `sender`'s pending code.
    ///
    /// With no code pending for `sender`, nothing is deleted and a fresh code
    /// is issued instead. A wrong or expired code consumes the pending one.
    pub async fn purge_all(&self, sender: &str, code: &str, ignore: &[&str]) -> PurgeOutcome {
        match self.purge_guard.confirm(sender, code) {
            Ok(()) => {}
            Err(PurgeRejection::NoPendingCode) => {
                return PurgeOutcome::CodeIssued(self.purge_guard.issue(sender));
            }
            Err(rejection) => return PurgeOutcome::Rejected(rejection),
        }

        let mut report = PurgeReport::default();
        for cache in self.sorted().into_iter().rev() {
            let name = cache.name().to_string();
            if ignore.iter().any(|i| i.eq_ignore_ascii_case(&name)) {
                report.skipped.push(name);
                continue;
            }
            match cache.purge().await {
                Ok(n) => {
                    report.deleted += n;
                    report.purged.push(name);
                }
                Err(e) => {
                    error!(cache = %name, error = %e, "Purge failed");
                    report.failed.push(name);
                }
            }
        }
        warn!(sender, deleted = report.deleted, caches = report.purged.len(), "Purged caches");
        PurgeOutcome::Completed(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::cache::CacheBuilder;
    use crate::database::Database;
    use crate::payload::new_ref;
    use crate::payload::test_support::Account;
    use crate::storage::MemoryDocumentBackend;

    fn items(graph: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        graph.iter()
            .map(|(n, d)| (n.to_string(), d.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn names(items: &[(String, Vec<String>)], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| items[i].0.clone()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let it = items(&[("members", &["guilds", "accounts"]), ("guilds", &["accounts"]), ("accounts", &[])]);
        assert_eq!(names(&it, &sort_by_dependencies(&it)), vec!["accounts", "guilds", "members"]);
    }

    #[test]
    fn test_independent_keep_order() {
        let it = items(&[("c", &[]), ("a", &[]), ("b", &["x-not-registered"])]);
        assert_eq!(names(&it, &sort_by_dependencies(&it)), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_cycle_is_appended() {
        let it = items(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        assert_eq!(names(&it, &sort_by_dependencies(&it)), vec!["c", "a", "b"]);
    }

    async fn database(dev: bool) -> Arc<Database> {
        let mut config = PayloadConfig::for_tests("hub");
        config.development_mode = dev;
        let db = Database::with_backends(config, Arc::new(MemoryDocumentBackend::new()), Arc::new(MemoryBus::new()));
        db.start().await.unwrap();
        db
    }

    fn cache(db: &Arc<Database>, name: &str, deps: &[&str]) -> Cache<Account> {
        let mut builder = CacheBuilder::new(name, db.clone()).instantiator(|id: &String| Account::new(id, 0));
        for dep in deps {
            builder = builder.depends_on(*dep);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let db = database(true).await;
        let registry = CacheRegistry::new();
        registry.register(cache(&db, "accounts", &[])).unwrap();
        assert!(matches!(
            registry.register(cache(&db, "accounts", &[])),
            Err(CacheError::DuplicateCache(name)) if name == "accounts"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_start_all_follows_dependencies() {
        let db = database(true).await;
        let registry = CacheRegistry::new();
        registry.register(cache(&db, "members", &["guilds"])).unwrap();
        registry.register(cache(&db, "guilds", &[])).unwrap();

        registry.start_all().await.unwrap();
        assert!(registry.is_running("members"));
        assert!(registry.is_running("guilds"));
        assert_eq!(registry.shutdown_all().await, 0);
        assert!(!registry.is_running("guilds"));
    }

    #[tokio::test]
    async fn test_unregistered_dependency_blocks_start() {
        let db = database(true).await;
        let registry = CacheRegistry::new();
        registry.register(cache(&db, "members", &["guilds"])).unwrap();
        assert!(matches!(
            registry.start_all().await,
            Err(CacheError::DependencyNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_requires_confirmation() {
        let db = database(true).await;
        let registry = CacheRegistry::new();
        let accounts = cache(&db, "accounts", &[]);
        let ledger: Cache<Account> = CacheBuilder::new("ledger", db.clone())
            .instantiator(|id: &String| Account::new(id, 0))
            .build()
            .unwrap();
        accounts.save(&new_ref(Account::new("a", 1))).await;
        registry.register(accounts.clone()).unwrap();
        registry.register(ledger).unwrap();

        let code = registry.request_purge("ops");
        let wrong = if code == "zzzzzz" { "yyyyyy" } else { "zzzzzz" };
        assert!(matches!(
            registry.purge_all("ops", wrong, &[]).await,
            PurgeOutcome::Rejected(PurgeRejection::WrongCode)
        ));
        assert!(accounts.is_cached(&"a".to_string()));

        // The wrong attempt consumed the code, so the old one earns a new code
        let code = match registry.purge_all("ops", &code, &[]).await {
            PurgeOutcome::CodeIssued(code) => code,
            other => panic!("unexpected {:?}", other),
        };
        assert!(accounts.is_cached(&"a".to_string()));

        match registry.purge_all("ops", &code, &["LEDGER"]).await {
            PurgeOutcome::Completed(report) => {
                assert_eq!(report.deleted, 1);
                assert_eq!(report.purged, vec!["accounts"]);
                assert_eq!(report.skipped, vec!["ledger"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!accounts.is_cached(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_unconfirmed_purge_issues_code() {
        let db = database(true).await;
        let registry = CacheRegistry::new();
        let accounts = cache(&db, "accounts", &[]);
        accounts.save(&new_ref(Account::new("a", 1))).await;
        registry.register(accounts.clone()).unwrap();

        let code = match registry.purge_all("ops", "abcdef", &[]).await {
            PurgeOutcome::CodeIssued(code) => code,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(code.len(), 6);
        assert!(accounts.is_cached(&"a".to_string()));

        // Another sender's code does not carry over
        assert!(matches!(
            registry.purge_all("someone-else", &code, &[]).await,
            PurgeOutcome::CodeIssued(_)
        ));
        assert!(accounts.is_cached(&"a".to_string()));

        match registry.purge_all("ops", &code, &[]).await {
            PurgeOutcome::Completed(report) => assert_eq!(report.purged, vec!["accounts"]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!accounts.is_cached(&"a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_code_is_rejected_then_reissued() {
        let db = database(true).await;
        let registry = CacheRegistry::with_purge_code_ttl(Duration::from_secs(5));
        registry.register(cache(&db, "accounts", &[])).unwrap();

        let code = registry.request_purge("ops");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            registry.purge_all("ops", &code, &[]).await,
            PurgeOutcome::Rejected(PurgeRejection::Expired)
        ));
        assert!(matches!(registry.purge_all("ops", &code, &[]).await, PurgeOutcome::CodeIssued(_)));
    }

    #[tokio::test]
    async fn test_purge_outside_development_mode_fails_per_cache() {
        let db = database(false).await;
        let registry = CacheRegistry::new();
        registry.register(cache(&db, "accounts", &[])).unwrap();
        let code = registry.request_purge("ops");
        match registry.purge_all("ops", &code, &[]).await {
            PurgeOutcome::Completed(report) => assert_eq!(report.failed, vec!["accounts"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
