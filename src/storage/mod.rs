//! Storage module for address persistence

pub mod persistence;

pub use persistence::{EndpointStore, FileStore, StorageError, ADDRESS_FILE, STORE_VERSION};
