#![forbid(unsafe_code)]

// Auth module - single-use connection tokens

pub mod token;

pub use token::{Expect, TokenClaims, TokenCodec, TokenError};
