#![forbid(unsafe_code)]

// voxroom - token-gated signaling core for a small voice-chat SFU

pub mod auth;
pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
