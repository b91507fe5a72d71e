//! Plex now-playing relay
//!
//! Receives Plex webhooks, keeps the one current playback state on disk, and
//! pushes it to always-on display clients over a WebSocket.
//!
//! This library provides:
//! - Webhook ingestion (JSON and multipart encodings)
//! - A single-slot persistent state store
//! - A broadcast hub with heartbeat pruning
//! - A Plex API client with retry/backoff for startup seeding
//! - An artwork proxy with an on-disk cache
//! - A reconnecting push client for displays

pub mod adapters;
pub mod api;
pub mod artwork;
pub mod client;
pub mod config;
pub mod hub;
pub mod protocol;
pub mod state;
pub mod webhook;
