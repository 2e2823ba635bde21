use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::serde_json::{self, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::k8s::descriptor::WatchDescriptor;
use crate::k8s::resource::QualifiedName;
use crate::k8s::sync::config::DEFAULT_PAGE_LIMIT;
use crate::k8s::sync::fetcher::{ListFetcher, ResourceLister};
use crate::k8s::sync::store::{Action, CacheEntry, SyncStore, WatchEventItem};
use crate::net::channel::{ChannelOptions, ChannelRegistry, MessageFrame, SocketConnector};

/// Builds the transport connector for one query's live watch, started at
/// the resourceVersion its list run settled on.
pub trait WatchConnectorFactory: Send + Sync {
    fn connector(
        &self,
        query: &WatchDescriptor,
        resource_version: &str,
    ) -> Arc<dyn SocketConnector>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub page_limit: u32,
    pub channel_options: ChannelOptions,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            channel_options: ChannelOptions::default(),
        }
    }
}

/// Opaque proof of one subscription. Consumed by `unsubscribe`, so a
/// subscription cannot be released twice.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    key: String,
    descriptor: WatchDescriptor,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn descriptor(&self) -> &WatchDescriptor {
        &self.descriptor
    }
}

struct ActiveSub {
    refs: usize,
    cancel: CancellationToken,
}

// A poisoned lock means a driver task panicked; recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps declarative queries onto shared cache entries and transport
/// channels. The first subscriber for a key pays for the list-then-watch
/// setup; everyone after shares it through a reference count, and the last
/// unsubscribe tears the whole thing down.
pub struct SubscriptionCoordinator {
    store: Arc<SyncStore>,
    registry: Arc<ChannelRegistry>,
    lister: Arc<dyn ResourceLister>,
    connectors: Arc<dyn WatchConnectorFactory>,
    config: CoordinatorConfig,
    subs: Mutex<HashMap<String, ActiveSub>>,
}

impl SubscriptionCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<SyncStore>,
        registry: Arc<ChannelRegistry>,
        lister: Arc<dyn ResourceLister>,
        connectors: Arc<dyn WatchConnectorFactory>,
    ) -> Self {
        Self::with_config(store, registry, lister, connectors, CoordinatorConfig::default())
    }

    #[must_use]
    pub fn with_config(
        store: Arc<SyncStore>,
        registry: Arc<ChannelRegistry>,
        lister: Arc<dyn ResourceLister>,
        connectors: Arc<dyn WatchConnectorFactory>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            lister,
            connectors,
            config,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in a query. Structurally equal descriptors share
    /// one cache entry and one channel; only the first subscriber triggers
    /// the list run and watch.
    pub fn subscribe(self: &Arc<Self>, descriptor: &WatchDescriptor) -> SubscriptionHandle {
        let key = descriptor.key();
        let mut subs = lock(&self.subs);
        if let Some(active) = subs.get_mut(&key) {
            active.refs += 1;
            debug!(key = %key, refs = active.refs, "joined existing subscription");
        } else {
            let cancel = CancellationToken::new();
            subs.insert(
                key.clone(),
                ActiveSub {
                    refs: 1,
                    cancel: cancel.clone(),
                },
            );
            self.store.dispatch(Action::BeginWatch { id: key.clone() });
            info!(key = %key, "🔭 starting subscription");
            let coordinator = Arc::clone(self);
            let drive_descriptor = descriptor.clone();
            let drive_key = key.clone();
            tokio::spawn(async move {
                coordinator.drive(drive_descriptor, drive_key, cancel).await;
            });
        }
        SubscriptionHandle {
            id: Uuid::new_v4(),
            key,
            descriptor: descriptor.clone(),
        }
    }

    /// Release one subscription. The last release for a key cancels any
    /// in-flight list run, deletes the cache entry, and destroys the
    /// channel.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = lock(&self.subs);
        let Some(active) = subs.get_mut(&handle.key) else {
            warn!(key = %handle.key, "unsubscribe for an unknown key");
            return;
        };
        active.refs -= 1;
        if active.refs > 0 {
            debug!(key = %handle.key, refs = active.refs, "subscriber left");
            return;
        }
        let Some(active) = subs.remove(&handle.key) else {
            return;
        };
        drop(subs);
        info!(key = %handle.key, "🧹 last subscriber left, tearing down");
        active.cancel.cancel();
        self.store.dispatch(Action::EndWatch {
            id: handle.key.clone(),
        });
        self.registry.destroy(&handle.key);
    }

    /// Tear down `handle` and subscribe afresh under `descriptor`. This is
    /// how a namespace-context change is handled: no cache state carries
    /// over to the new key.
    pub fn resubscribe(
        self: &Arc<Self>,
        handle: SubscriptionHandle,
        descriptor: &WatchDescriptor,
    ) -> SubscriptionHandle {
        self.unsubscribe(handle);
        self.subscribe(descriptor)
    }

    /// Read-only snapshot of the handle's cache entry.
    #[must_use]
    pub fn snapshot(&self, handle: &SubscriptionHandle) -> Option<CacheEntry> {
        self.store.entry(&handle.key)
    }

    pub fn set_filter(&self, handle: &SubscriptionHandle, name: &str, value: Value) {
        self.store.dispatch(Action::SetFilter {
            id: handle.key.clone(),
            name: name.to_owned(),
            value,
        });
    }

    pub fn select(&self, handle: &SubscriptionHandle, name: Option<QualifiedName>) {
        self.store.dispatch(Action::Select {
            id: handle.key.clone(),
            name,
        });
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.subs).get(key).map_or(0, |active| active.refs)
    }

    #[must_use]
    pub fn store(&self) -> Arc<SyncStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.store.changed()
    }

    fn is_registered(&self, key: &str) -> bool {
        lock(&self.subs).contains_key(key)
    }

    async fn drive(
        self: Arc<Self>,
        descriptor: WatchDescriptor,
        key: String,
        cancel: CancellationToken,
    ) {
        let fetcher = ListFetcher::new(Arc::clone(&self.lister), self.config.page_limit);
        let page_store = Arc::clone(&self.store);
        let page_key = key.clone();
        let outcome = fetcher
            .fetch_all(&descriptor, &cancel, |page| {
                page_store.dispatch(Action::BulkAdd {
                    id: page_key.clone(),
                    resources: page,
                });
            })
            .await;
        match outcome {
            Ok(outcome) => {
                if cancel.is_cancelled() || !self.is_registered(&key) {
                    return;
                }
                self.store.dispatch(Action::ListLoaded {
                    id: key.clone(),
                    resources: outcome.resources,
                });
                info!(
                    key = %key,
                    resource_version = %outcome.resource_version,
                    pages = outcome.pages,
                    "📡 list settled, opening watch"
                );
                self.open_watch(&descriptor, &key, &outcome.resource_version);
            }
            Err(Error::Cancelled) => {
                debug!(key = %key, "list run cancelled");
            }
            Err(e) => {
                // No settled resourceVersion means no gap-free point to
                // start a watch from; stay errored until resubscribed.
                if self.is_registered(&key) {
                    warn!(key = %key, error = %e, "list run failed");
                    self.store.dispatch(Action::Errored {
                        id: key,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn open_watch(&self, descriptor: &WatchDescriptor, key: &str, resource_version: &str) {
        let connector = self.connectors.connector(descriptor, resource_version);
        let url = descriptor.watch_path(resource_version);
        let channel =
            self.registry
                .open(key, &url, self.config.channel_options.clone(), connector);

        let store = Arc::clone(&self.store);
        let id = key.to_owned();
        channel.on_open(move || {
            store.dispatch(Action::Opened { id: id.clone() });
        });

        let store = Arc::clone(&self.store);
        let id = key.to_owned();
        channel.on_error(move |message| {
            store.dispatch(Action::Errored {
                id: id.clone(),
                error: message.to_owned(),
            });
        });

        let store = Arc::clone(&self.store);
        let id = key.to_owned();
        channel.on_message(move |frame| {
            let event = match frame {
                MessageFrame::Json(value) => WatchEventItem::from_frame(value),
                MessageFrame::Raw(raw) => serde_json::from_str::<Value>(raw)
                    .ok()
                    .as_ref()
                    .and_then(WatchEventItem::from_frame),
            };
            if let Some(event) = event {
                store.dispatch(Action::WatchEvents {
                    id: id.clone(),
                    events: vec![event],
                });
            }
        });

        // The last subscriber may have left while the channel was being
        // wired up; don't leave an orphan running.
        if !self.is_registered(key) {
            self.registry.destroy(key);
        }
    }
}
