//! Start/shutdown and the background listeners.
//!
//! Every listener holds a `Weak` to the cache's inner state and exits when
//! the stop signal flips, its subscription closes, or the cache is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Cache, CacheInner, CacheKind, CacheState};
use crate::bus::Subscription;
use crate::error::CacheError;
use crate::handoff::{HandoffPacket, InboundHandoff};
use crate::metrics;
use crate::payload::Payload;
use crate::update::UpdateAction;

impl<P: Payload> Cache<P> {
    pub fn state(&self) -> CacheState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CacheState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CacheState::Running
    }

    fn set_state(&self, state: CacheState) {
        self.inner.state.send_replace(state);
        metrics::set_cache_state(&self.inner.name, state.as_str());
    }

    /// Start without dependency checks; [`CacheRegistry::start_all`]
    /// verifies dependencies before calling in.
    ///
    /// [`CacheRegistry::start_all`]: crate::registry::CacheRegistry::start_all
    pub async fn start(&self) -> Result<(), CacheError> {
        self.start_with(&|_: &str| true).await
    }

    /// Start, requiring `dependency_running` to hold for every declared dependency.
    #[tracing::instrument(skip(self, dependency_running), fields(cache = %self.inner.name))]
    pub async fn start_with(
        &self,
        dependency_running: &(dyn Fn(&str) -> bool + Sync),
    ) -> Result<(), CacheError> {
        if matches!(self.state(), CacheState::Starting | CacheState::Running) {
            return Err(CacheError::AlreadyRunning(self.inner.name.clone()));
        }
        if !self.inner.database.is_running() {
            return Err(CacheError::DatabaseNotRunning(self.inner.database.name().to_string()));
        }
        if let Some(missing) = self.inner.dependencies.iter().find(|d| !dependency_running(d.as_str())) {
            return Err(CacheError::DependencyNotRunning {
                cache: self.inner.name.clone(),
                dependency: missing.clone(),
            });
        }

        let previous = self.state();
        self.set_state(CacheState::Starting);
        self.inner.stop.send_replace(false);

        match self.spawn_listeners().await {
            Ok(tasks) => {
                let count = tasks.len();
                self.inner.tasks.lock().extend(tasks);
                self.set_state(CacheState::Running);
                info!(
                    mode = ?self.inner.settings.mode,
                    kind = ?self.inner.kind,
                    listeners = count,
                    "Cache started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.stop.send_replace(true);
                self.set_state(previous);
                Err(e)
            }
        }
    }

    async fn spawn_listeners(&self) -> Result<Vec<JoinHandle<()>>, CacheError> {
        let mut tasks = Vec::new();

        if self.inner.updater.is_enabled() {
            match self.inner.updater.subscribe().await {
                Ok(sub) => tasks.push(self.spawn_subscription(sub, on_update_message::<P>)),
                Err(e) => return Err(e.into()),
            }
        }

        if self.coordinates_handoff() {
            match self.inner.handoff.subscribe().await {
                Ok(sub) => tasks.push(self.spawn_subscription(sub, on_handoff_packet::<P>)),
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return Err(e.into());
                }
            }
            let interval = self.inner.database.config().heartbeat_interval();
            tasks.push(self.spawn_interval(interval, "heartbeat", |cache| async move {
                let beats = cache.heartbeat_all().await;
                debug!(cache = %cache.name(), beats, "Presence heartbeat");
            }));
        }

        if let Some(interval) = self.inner.settings.auto_save_interval() {
            tasks.push(self.spawn_interval(interval, "auto-save", |cache| async move {
                let failures = cache.save_all().await;
                if failures > 0 {
                    warn!(cache = %cache.name(), failures, "Auto-save had failures");
                }
            }));
        }

        Ok(tasks)
    }

    fn spawn_subscription(
        &self,
        mut subscription: Subscription,
        handle: fn(Cache<P>, String),
    ) -> JoinHandle<()> {
        let weak: Weak<CacheInner<P>> = Arc::downgrade(&self.inner);
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = subscription.recv() => {
                        let Some(msg) = msg else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        handle(Cache { inner }, msg.payload);
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_interval<F, Fut>(&self, period: Duration, label: &'static str, tick: F) -> JoinHandle<()>
    where
        F: Fn(Cache<P>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<CacheInner<P>> = Arc::downgrade(&self.inner);
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        tick(Cache { inner }).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = label, "Cache task stopped");
        })
    }

    /// Stop listeners, optionally mark mobile payloads offline, save everything.
    ///
    /// Returns the number of payloads that failed to save.
    #[tracing::instrument(skip(self), fields(cache = %self.inner.name))]
    pub async fn shutdown(&self) -> Result<usize, CacheError> {
        if self.state() != CacheState::Running {
            return Err(CacheError::NotRunning(self.inner.name.clone()));
        }
        self.set_state(CacheState::ShuttingDown);
        self.inner.stop.send_replace(true);

        let drain = self.inner.database.config().shutdown_drain();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                warn!("Cache listener did not stop in time; aborting");
                task.abort();
            }
        }

        if self.coordinates_handoff() && self.inner.settings.set_offline_on_shutdown {
            self.mark_all_offline().await;
        }

        let failures = self.save_all().await;
        if failures > 0 {
            self.inner
                .errors
                .capture(&format!("{} payloads failed to save during shutdown", failures));
        }

        self.inner.controllers.clear();
        self.inner.active.clear();
        self.set_state(CacheState::Stopped);
        info!(failures, "Cache stopped");
        Ok(failures)
    }

    pub(super) fn coordinates_handoff(&self) -> bool {
        self.inner.kind == CacheKind::Mobile && self.is_network()
    }

    /// Apply one inbound update message. Refreshes run on the worker pool.
    pub(crate) fn apply_update(&self, raw: &str) -> UpdateAction<P::Key> {
        let local = Arc::clone(&self.inner.local);
        let action = self.inner.updater.interpret(raw, |k| local.contains(k));
        match &action {
            UpdateAction::Ignore(_) => {}
            UpdateAction::Uncache(key) => {
                if let Some((_, controller)) = self.inner.controllers.remove(key) {
                    controller.forget();
                }
                self.inner.local.take(key);
                metrics::set_cached_items(&self.inner.name, self.inner.local.len());
            }
            UpdateAction::Refresh { key, forced } => {
                let cache = self.clone();
                let queued_key = key.clone();
                let forced = *forced;
                let queued = self.inner.database.pool().spawn(async move {
                    cache.receive_update(&queued_key, forced).await;
                });
                if !queued {
                    self.inner.errors.debug(&format!(
                        "worker pool closed; dropped {} refresh of '{}'",
                        if forced { "forced" } else { "unforced" },
                        key
                    ));
                }
            }
        }
        action
    }

    /// Merge the durable copy of `key` into the resident instance, then run
    /// the payload's update hook.
    pub async fn receive_update(&self, key: &P::Key, forced: bool) -> bool {
        match self.refresh_from_database(key, forced).await {
            Some(handle) => {
                handle.write().on_receive_update();
                metrics::set_cached_items(&self.inner.name, self.inner.local.len());
                true
            }
            None => false,
        }
    }

    async fn respond_to_handoff(&self, key: P::Key, request: HandoffPacket) {
        let saved = match self.inner.local.peek(&key) {
            Some(handle) => {
                handle.write().meta_mut().start_handshake();
                self.save_no_cache(&handle).await
            }
            None => false,
        };
        debug!(
            cache = %self.inner.name,
            key = %key,
            requester = %request.sender_server,
            saved,
            "Answering handoff request"
        );
        self.inner.handoff.reply(&request, saved).await;
    }
}

fn on_update_message<P: Payload>(cache: Cache<P>, raw: String) {
    cache.apply_update(&raw);
}

fn on_handoff_packet<P: Payload>(cache: Cache<P>, raw: String) {
    if let InboundHandoff::Respond { key, request } = cache.inner.handoff.handle(&raw) {
        let responder = cache.clone();
        let queued = cache.inner.database.pool().spawn(async move {
            responder.respond_to_handoff(key, request).await;
        });
        if !queued {
            cache.inner.errors.debug("worker pool closed; handoff request left unanswered");
        }
    }
}
