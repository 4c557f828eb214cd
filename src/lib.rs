#![forbid(unsafe_code)]

//! Subtitle acquisition and indexing for YouTube channels and playlists.
//!
//! The crate resolves a channel reference, figures out which videos are not
//! yet indexed, downloads their caption streams through a bounded worker
//! pool, collapses the roll-up caption format into clean timestamped
//! segments, and commits everything to a local SQLite database with a
//! full-text index over the segment text. Search, export, and chat layers
//! consume the database read-only; this crate is the only writer.

pub mod captions;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod reconcile;
pub mod security;
pub mod store;
