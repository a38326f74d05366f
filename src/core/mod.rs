pub mod asset;
pub mod cache;
pub mod cancel;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod events;
pub mod extractor;
pub mod fingerprint;
pub mod index;
pub mod keeper;
pub mod selection;
pub mod store;
