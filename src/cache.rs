//! Per-application facades, built lazily and shared between requests.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::{
    config::{AgentConfig, OverrideStoreConfig},
    events::{Event, EventDispatcher, NoopEventDispatcher},
    facade::DecisionFacade,
    override_store::{ForcedVariationStore, InMemoryOverrideStore},
    poller::PolledConfigSource,
    redis_store::RedisOverrideStore,
    Error, Result,
};

/// Builds the facade for an application identifier.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, app_id: &str) -> Result<DecisionFacade>;
}

/// Builds facades from an [`AgentConfig`]: a polled datafile keyed by `app_id` (the SDK key) and
/// the configured override store.
pub struct DefaultClientFactory {
    config: AgentConfig,
    dispatcher: Arc<dyn EventDispatcher + Send + Sync>,
}

impl DefaultClientFactory {
    pub fn new(config: AgentConfig) -> DefaultClientFactory {
        DefaultClientFactory {
            config,
            dispatcher: Arc::new(NoopEventDispatcher),
        }
    }

    /// Send impressions and conversions of every built facade to `dispatcher`.
    pub fn with_dispatcher(
        mut self,
        dispatcher: impl EventDispatcher + Send + Sync + 'static,
    ) -> DefaultClientFactory {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    async fn override_store(&self, app_id: &str) -> Result<Arc<dyn ForcedVariationStore>> {
        Ok(match &self.config.override_store {
            OverrideStoreConfig::InMemory => Arc::new(InMemoryOverrideStore::new()),
            OverrideStoreConfig::Redis {
                url,
                key_prefix,
                response_timeout_ms,
            } => Arc::new(
                RedisOverrideStore::connect(
                    url,
                    format!("{key_prefix}:{app_id}"),
                    response_timeout_ms.map(Duration::from_millis),
                )
                .await?,
            ),
        })
    }
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn build(&self, app_id: &str) -> Result<DecisionFacade> {
        let overrides = self.override_store(app_id).await?;

        let fetcher_config = self.config.fetcher_config(app_id);
        let poller_config = self.config.poller_config();
        // Starting the poller and waiting for the first datafile blocks.
        let source = tokio::task::spawn_blocking(move || {
            let source = PolledConfigSource::start(fetcher_config, poller_config)?;
            // Dropping the source on failure stops its poller.
            source.wait_for_configuration()?;
            Ok::<_, Error>(source)
        })
        .await
        .map_err(|_| Error::PollerThreadPanicked)??;

        let dispatcher = self.dispatcher.clone();
        let facade = DecisionFacade::with_bucketing_engine(
            Arc::new(source),
            overrides,
            move |event: Event| dispatcher.dispatch(event),
        )
        .overrides_enabled(self.config.enable_overrides);

        log::debug!(target: "decision_agent", app_id; "built decision facade");
        Ok(facade)
    }
}

/// Outcome of one construction attempt, shared by every caller that waited on it.
type Slot = Arc<OnceCell<Result<Arc<DecisionFacade>>>>;

/// Maps application identifiers to live facades.
///
/// Concurrent first requests for the same identifier share one construction attempt and all
/// receive its outcome. A failed attempt is not remembered: the next request tries again.
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn ClientFactory>) -> ClientCache {
        ClientCache {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the facade for `app_id`, building it if needed.
    pub async fn get(&self, app_id: &str) -> Result<Arc<DecisionFacade>> {
        let slot = self
            .entries()
            .entry(app_id.to_owned())
            .or_default()
            .clone();

        let result = slot
            .get_or_init(|| async {
                log::debug!(target: "decision_agent", app_id; "building decision facade");
                let result = self.factory.build(app_id).await.map(Arc::new);
                if let Err(err) = &result {
                    log::warn!(target: "decision_agent", app_id; "failed to build decision facade: {}", err);
                    self.remove_slot(app_id, &slot);
                }
                result
            })
            .await;

        result.clone()
    }

    /// Remove and close the facade for `app_id`. The next `get` builds a new one.
    pub fn invalidate(&self, app_id: &str) {
        let removed = self.entries().remove(app_id);
        if let Some(Ok(facade)) = removed.as_ref().and_then(|slot| slot.get()) {
            log::debug!(target: "decision_agent", app_id; "closing decision facade");
            facade.close();
        }
    }

    /// Notification that the configuration of `app_id` changed upstream.
    pub fn on_config_update(&self, app_id: &str) {
        self.invalidate(app_id);
    }

    /// Close every cached facade.
    pub fn shutdown(&self) {
        let entries: Vec<_> = self.entries().drain().collect();
        for (_, slot) in entries {
            if let Some(Ok(facade)) = slot.get() {
                facade.close();
            }
        }
    }

    /// Number of cached (or currently building) entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `slot` from the map unless it has already been replaced.
    fn remove_slot(&self, app_id: &str, slot: &Slot) {
        let mut entries = self.entries();
        if entries
            .get(app_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            entries.remove(app_id);
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{ClientCache, ClientFactory, DefaultClientFactory};
    use crate::{
        config::AgentConfig, config_source::ConfigSource, facade::DecisionFacade,
        override_store::InMemoryOverrideStore, project_config::ProjectConfig,
        test_utils::RecordingDispatcher, Error, Result,
    };

    #[derive(Default)]
    struct ClosableSource {
        closed: AtomicBool,
    }

    impl ConfigSource for ClosableSource {
        fn get_config(&self) -> Result<Arc<ProjectConfig>> {
            Ok(Arc::new(ProjectConfig::new("1", vec![], vec![], vec![], vec![])))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Counts builds; fails the first `failures` of them.
    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        failures: usize,
        source: Arc<ClosableSource>,
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn build(&self, _app_id: &str) -> Result<DecisionFacade> {
            let attempt = self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;

            if attempt < self.failures {
                return Err(Error::Configuration("origin unreachable".into()));
            }

            Ok(DecisionFacade::with_bucketing_engine(
                self.source.clone(),
                Arc::new(InMemoryOverrideStore::new()),
                RecordingDispatcher::new(),
            ))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_share_one_construction() {
        let factory = Arc::new(CountingFactory::default());
        let cache = Arc::new(ClientCache::new(factory.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("app").await.unwrap() })
            })
            .collect();

        let mut facades = Vec::new();
        for handle in handles {
            facades.push(handle.await.unwrap());
        }

        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert!(facades.iter().all(|f| Arc::ptr_eq(f, &facades[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let factory = Arc::new(CountingFactory {
            failures: 1,
            ..Default::default()
        });
        let cache = ClientCache::new(factory.clone());

        let err = cache.get("app").await.unwrap_err();
        assert_eq!(err.to_string(), "origin unreachable");
        assert!(cache.is_empty());

        cache.get("app").await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_failed_construction() {
        let factory = Arc::new(CountingFactory {
            failures: 1,
            ..Default::default()
        });
        let cache = ClientCache::new(factory.clone());

        let (a, b, c, d) = tokio::join!(
            cache.get("app"),
            cache.get("app"),
            cache.get("app"),
            cache.get("app")
        );

        for result in [a, b, c, d] {
            let Err(err) = result else {
                panic!("expected the shared construction failure");
            };
            assert_eq!(err.to_string(), "origin unreachable");
        }
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        let (a, b) = tokio::join!(cache.get("app"), cache.get("app"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);

        let later = cache.get("app").await.unwrap();
        assert!(Arc::ptr_eq(&a, &later));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_closes_and_rebuilds() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone());

        let first = cache.get("app").await.unwrap();
        cache.on_config_update("app");
        assert!(factory.source.closed.load(Ordering::SeqCst));
        assert!(cache.is_empty());

        let second = cache.get("app").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_every_facade() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ClientCache::new(factory.clone());

        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.shutdown();
        assert!(cache.is_empty());
        assert!(factory.source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn default_factory_reports_unreachable_origin() {
        let mut config = AgentConfig::default();
        // Nothing listens on port 1.
        config.base_url("http://127.0.0.1:1");
        let cache = ClientCache::new(Arc::new(DefaultClientFactory::new(config)));

        assert!(matches!(cache.get("sdk-key").await, Err(Error::Network(_))));
        assert!(cache.is_empty());
    }
}
