//! Mailbox ingestion pipeline.
//!
//! New messages are pulled from each account's mailbox, stored once per user,
//! and announced on an in-process event bus. Listeners queue AI analysis and
//! keep per-sender contact statistics.

pub mod analysis;
pub mod config;
pub mod contacts;
pub mod credentials;
pub mod db;
pub mod error;
pub mod events;
pub mod ingest;
pub mod mail;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod schema;
pub mod store;
pub mod sync;
