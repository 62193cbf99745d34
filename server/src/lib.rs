//! Blob arena server library.
//!
//! This module exposes the server components for use in tests and binaries.

pub mod broadcast;
pub mod config;
pub mod credential;
pub mod game_loop;
pub mod policy;
pub mod scheduler;
pub mod sessions;
pub mod spatial;
pub mod timers;
pub mod world;
pub mod ws;
