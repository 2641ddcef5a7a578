use crate::{
    broker::{Broker, BrokerSettings, PlatformQueues},
    marketplace::Marketplace,
    media::PictureFetcher,
    models::Platform,
    picture_cache::PictureCache,
    publisher::Publisher,
    storage::Storage,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub dispatch_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_in_flight: 8,
            dispatch_timeout: Duration::from_secs(2),
        }
    }
}

/// Wires storage and registered marketplaces into a [`Broker`] plus one
/// publisher per platform.
pub struct Manager {
    storage: Storage,
    fetcher: Arc<dyn PictureFetcher>,
    settings: WorkerSettings,
    cache: Option<PictureCache>,
    marketplaces: Vec<(Platform, Arc<dyn Marketplace>)>,
}

impl Manager {
    pub fn new(storage: Storage, fetcher: Arc<dyn PictureFetcher>, settings: WorkerSettings) -> Self {
        Self {
            storage,
            fetcher,
            settings,
            cache: None,
            marketplaces: Vec::new(),
        }
    }

    pub fn with_picture_cache(mut self, cache: PictureCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Registering a platform twice replaces the earlier marketplace.
    pub fn register(&mut self, platform: Platform, marketplace: Arc<dyn Marketplace>) -> &mut Self {
        self.marketplaces.retain(|(existing, _)| *existing != platform);
        self.marketplaces.push((platform, marketplace));
        self
    }

    /// Creates the queues, spawns every publisher loop and hands back the
    /// intake side.
    pub fn start(self) -> (Broker, RunningManager) {
        let tracker = TaskTracker::new();
        let capacity = self.settings.queue_capacity.max(1);
        let mut queues = HashMap::with_capacity(self.marketplaces.len());

        for (platform, marketplace) in self.marketplaces {
            let (add_tx, add_rx) = mpsc::channel(capacity);
            let (delete_tx, delete_rx) = mpsc::channel(capacity);
            let publisher = Arc::new(Publisher::new(
                platform,
                marketplace,
                self.fetcher.clone(),
                self.storage.clone(),
                self.settings.max_in_flight,
                tracker.clone(),
            ));
            tracker.spawn(publisher.clone().run_add_loop(add_rx));
            tracker.spawn(publisher.run_delete_loop(delete_rx));
            queues.insert(
                platform,
                PlatformQueues {
                    add: add_tx,
                    delete: delete_tx,
                },
            );
            info!(target = "relay.publisher", %platform, capacity, "publisher started");
        }

        let broker = Broker::new(
            self.storage,
            queues,
            tracker.clone(),
            self.cache,
            BrokerSettings {
                dispatch_timeout: self.settings.dispatch_timeout,
            },
        );
        (broker, RunningManager { tracker })
    }
}

/// Handle on the background work started by [`Manager::start`].
pub struct RunningManager {
    tracker: TaskTracker,
}

impl RunningManager {
    /// Waits for in-flight work once every [`Broker`] clone is gone. Returns
    /// `false` when the grace period ran out first.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!(target = "relay.publisher", "publishers drained");
                true
            }
            Err(_) => {
                warn!(
                    target = "relay.publisher",
                    remaining = self.tracker.len(),
                    "shutdown grace period elapsed with work in flight"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        marketplace::fake::FakeMarketplace,
        media::fake::FakeFetcher,
        models::{PlatformState, fixtures::product},
        storage::testing::temp_storage,
    };

    async fn wait_for(storage: &Storage, id: i64, done: impl Fn(&PlatformState) -> bool) -> PlatformState {
        for _ in 0..200 {
            let state = storage.platform_state(id, Platform::Vk).await.unwrap();
            if done(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("product {id} never reached the expected state");
    }

    #[tokio::test]
    async fn publish_then_retract_end_to_end() {
        let (storage, _dir) = temp_storage().await;
        let fetcher = FakeFetcher::default().with("https://cdn.example.com/m1.jpg", b"main");
        let marketplace = Arc::new(FakeMarketplace {
            listing_id: Some("555".into()),
            ..Default::default()
        });
        let mut manager = Manager::new(storage.clone(), Arc::new(fetcher), WorkerSettings::default());
        manager.register(Platform::Vk, marketplace.clone());
        let (broker, running) = manager.start();
        assert_eq!(broker.platforms(), vec![Platform::Vk]);

        let id = broker.enqueue(product("Red Chair", "m1")).await.unwrap();
        let state = wait_for(&storage, id, |s| matches!(s, PlatformState::Published { .. })).await;
        assert_eq!(
            state,
            PlatformState::Published {
                external_id: "555".into()
            }
        );

        let page = storage.search("red", 0, 10).await.unwrap();
        assert_eq!(page.total, 1);

        broker.enqueue_delete(id, None).await.unwrap();
        wait_for(&storage, id, |s| matches!(s, PlatformState::Deleted { .. })).await;
        assert_eq!(*marketplace.deletions.lock().unwrap(), vec!["555".to_string()]);

        drop(broker);
        assert!(running.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items() {
        let (storage, _dir) = temp_storage().await;
        let fetcher = FakeFetcher::default()
            .with("https://cdn.example.com/a.jpg", b"a")
            .with("https://cdn.example.com/b.jpg", b"b");
        let marketplace = Arc::new(FakeMarketplace::default());
        let mut manager = Manager::new(storage.clone(), Arc::new(fetcher), WorkerSettings::default());
        manager.register(Platform::Vk, marketplace.clone());
        let (broker, running) = manager.start();

        let a = broker.enqueue(product("Lamp", "a")).await.unwrap();
        let b = broker.enqueue(product("Desk", "b")).await.unwrap();
        drop(broker);
        assert!(running.shutdown(Duration::from_secs(2)).await);

        assert_eq!(marketplace.listings.lock().unwrap().len(), 2);
        for id in [a, b] {
            assert!(matches!(
                storage.platform_state(id, Platform::Vk).await.unwrap(),
                PlatformState::Published { .. }
            ));
        }
    }

    #[tokio::test]
    async fn register_replaces_existing_platform() {
        let (storage, _dir) = temp_storage().await;
        let mut manager = Manager::new(
            storage,
            Arc::new(FakeFetcher::default()),
            WorkerSettings::default(),
        );
        manager
            .register(Platform::Vk, Arc::new(FakeMarketplace::default()))
            .register(Platform::Vk, Arc::new(FakeMarketplace::default()));
        assert_eq!(manager.marketplaces.len(), 1);
    }
}
