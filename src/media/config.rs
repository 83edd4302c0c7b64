#![forbid(unsafe_code)]

// Engine configuration: worker pool, router codec table, transport listen options

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Top-level media engine configuration.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
            ],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl WorkerConfig {
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Router codec capabilities. Voice rooms carry Opus only.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus at 48 kHz stereo with in-band FEC.
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        }]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport listen configuration: all interfaces, UDP and TCP with
/// UDP preferred.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            announced_address: None,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl TransportConfig {
    /// Sets the address announced in ICE candidates (for NAT deployments).
    pub fn with_announced_ip(mut self, ip: IpAddr) -> Self {
        self.announced_address = Some(ip.to_string());
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let listen_infos = WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp))
            .insert(self.listen_info(Protocol::Tcp));
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}
