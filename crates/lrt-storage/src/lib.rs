//! Persistence and fetch utilities for LRT: the CSV entity store, an
//! immutable snapshot archive, and the HTTP fetcher.

pub mod archive;
pub mod fetch;
pub mod records;

pub use archive::{ArchivedSnapshot, SnapshotArchive};
pub use fetch::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use records::{load_records, parse_active, save_records, StoreFormatError};
pub use reqwest::Url;

pub const CRATE_NAME: &str = "lrt-storage";
