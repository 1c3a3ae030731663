pub mod backoff;
pub mod batches;
pub mod engine;
pub mod executor;
pub mod fs;
pub mod ignore;
pub mod index;
pub mod local_watcher;
pub mod lock;
pub mod model;
pub mod paths;
pub mod registry;
pub mod remote;
pub mod staging;
pub mod store;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;
