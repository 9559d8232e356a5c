#![deny(missing_docs)]
//! iCord bot manager library.
//!
//! Keeps one live Discord connection per active character and routes
//! incoming messages through consent, rate limiting and reply generation.

/// Per-character connection lifecycle and message pipeline.
pub mod bot;
/// Character records and change-feed events.
pub mod character;
/// Configuration management.
pub mod config;
/// End-user consent records and their store.
pub mod consent;
/// Chat gateway abstraction and the Discord implementation.
pub mod gateway;
/// Generative-text providers and the reply generator.
pub mod llm;
/// Connection registry driven by the character change feed.
pub mod manager;
/// Health-check HTTP server.
pub mod server;
/// Storage layer (R2/S3).
pub mod storage;
/// Retention sweeper for stale consent records.
pub mod sweeper;
/// Utility functions.
pub mod utils;
