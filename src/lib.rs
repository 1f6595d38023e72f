//! Shared git caches and exact working copies for build agents.
//!
//! A [`cache::CacheDirectoryRegistry`] maps repository identities to slot
//! directories, [`fetch::FetchEngine`] keeps their history current,
//! [`checkout::CheckoutEngine`] materializes revisions into working
//! directories and [`changes::ChangeSetExtractor`] reports what changed
//! between two builds.

pub mod cache;
pub mod changes;
pub mod checkout;
pub mod config;
pub mod error;
pub mod fetch;
pub mod git;
pub mod sink;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::SyncError;
