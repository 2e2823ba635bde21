pub mod config;
pub mod coordinator;
pub mod fetcher;
pub mod store;

pub use coordinator::{
    CoordinatorConfig, SubscriptionCoordinator, SubscriptionHandle, WatchConnectorFactory,
};
pub use fetcher::{ListFetcher, ListOutcome, ResourceLister, ResourceListPage};
pub use store::{
    Action, CacheEntry, CacheMap, SyncStore, WatchEventItem, WatchEventKind, reduce,
};
