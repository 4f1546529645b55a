pub mod api;
pub mod app;
pub mod integrations;
pub mod jobs;
pub mod mask;
pub mod notifier;
pub mod shortid;
pub mod store;
