//! Types shared between the blob arena server and its clients.

pub mod config;
pub mod frame;
pub mod interpolation;
pub mod protocol;
pub mod types;
pub mod vec2;
