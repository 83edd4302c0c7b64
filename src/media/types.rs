#![forbid(unsafe_code)]

// Shared types and error mapping for the media engine adapter

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the media engine. These become `ok:false` responses
/// at the dispatcher boundary; they never terminate a connection.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("worker error: {0}")]
    Worker(String),

    #[error("router error: {0}")]
    Router(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("producer error: {0}")]
    Producer(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("observer error: {0}")]
    Observer(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Transport parameters handed to the client after createTransport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}
