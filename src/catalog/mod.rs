pub mod service;
pub mod subscriptions;

pub use service::{ActiveSet, CatalogDiff, CatalogService};
pub use subscriptions::SubscriptionManager;
