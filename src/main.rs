#![forbid(unsafe_code)]

use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxroom::auth::token::TokenCodec;
use voxroom::media::{MediaConfig, MediaEngine};
use voxroom::metrics::ServerMetrics;
use voxroom::signaling::SignalingServer;

/// Placeholder secret for local development only.
const DEV_TOKEN_SECRET: &str = "voxroom-dev-secret";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxroom=debug,mediasoup=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("voxroom - starting signaling server");

    let mut media_config = MediaConfig::default();

    // Announced IP for ICE candidates when running behind NAT
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid ANNOUNCE_IP: {ip}"))?;
        info!("announcing {} in ICE candidates", addr);
        media_config.transport = media_config.transport.with_announced_ip(addr);
    }
    if let Some(min_port) = env_port("RTC_MIN_PORT") {
        media_config.worker.rtc_min_port = min_port;
    }
    if let Some(max_port) = env_port("RTC_MAX_PORT") {
        media_config.worker.rtc_max_port = max_port;
    }
    if let Ok(n) = std::env::var("NUM_WORKERS") {
        if let Ok(n) = n.parse::<usize>() {
            if n > 0 {
                media_config.worker.num_workers = n;
            }
        }
    }

    let secret = match std::env::var("SFU_TOKEN_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            tracing::warn!(
                "SFU_TOKEN_SECRET not set, using the dev secret - override it in production"
            );
            DEV_TOKEN_SECRET.to_string()
        }
    };

    let engine = Arc::new(MediaEngine::new(media_config).await?);
    info!("media engine initialized ({} workers)", engine.worker_count());

    let tokens = Arc::new(TokenCodec::new(secret.into_bytes()));
    let metrics = ServerMetrics::new();
    let server = SignalingServer::new(engine, tokens, metrics);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3001);

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    info!("server shutdown complete");
    Ok(())
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
