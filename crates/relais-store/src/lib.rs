//! # relais-store
//!
//! Durable local storage for the sync engine, backed by SQLite.
//!
//! Entities are stored as JSON documents keyed by their primary key, with the
//! columns needed for status-filtered queries (`sync_status`, `cid`) pulled
//! out next to the document. The synchronous [`Database`] handle carries the
//! typed CRUD helpers; [`SqliteRepository`] exposes them through the async
//! [`Repository`] trait, and [`CachedRepository`] layers bounded LRU caches
//! on top.

pub mod cache;
pub mod channels;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod query_specs;
pub mod reactions;
pub mod repository;
pub mod sync_state;

mod error;

pub use cache::{CachedRepository, LruCache};
pub use database::Database;
pub use error::{Result, StoreError};
pub use repository::{Repository, SqliteRepository};
