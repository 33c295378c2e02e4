pub mod api;
pub mod events;
pub mod executor;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod metrics;
pub mod model;
pub mod recorder;
pub mod service;
pub mod stream;
