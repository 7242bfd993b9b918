//! Media fixtures for tests.
//!
//! Codec lists and RTP parameters that the loopback engine accepts, plus
//! ready-made command arguments built from them.

use common::types::SimpleMap;
use common::wire::commands::{ConsumeArgs, ProduceArgs, RouterCreateArgs};
use common::wire::{
    MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncoding, RtpParameters,
};

/// Opus, stereo, 48kHz.
pub fn opus_capability() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Audio,
        mime_type: "audio/opus".to_string(),
        clock_rate: 48_000,
        channels: Some(2),
        parameters: None,
        rtcp_feedback: None,
        preferred_payload_type: Some(100),
    }
}

/// VP8 with NACK and PLI feedback.
pub fn vp8_capability() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/VP8".to_string(),
        clock_rate: 90_000,
        channels: None,
        parameters: None,
        rtcp_feedback: Some(vec![
            RtcpFeedback {
                feedback_type: "nack".to_string(),
                parameter: None,
            },
            RtcpFeedback {
                feedback_type: "nack".to_string(),
                parameter: Some("pli".to_string()),
            },
        ]),
        preferred_payload_type: Some(101),
    }
}

/// Router arguments with opus and VP8.
pub fn router_args() -> RouterCreateArgs {
    RouterCreateArgs {
        media_codecs: vec![opus_capability(), vp8_capability()],
        app_data: None,
    }
}

/// Router arguments carrying application metadata.
pub fn router_args_with_app_data(app_data: SimpleMap) -> RouterCreateArgs {
    RouterCreateArgs {
        app_data: Some(app_data),
        ..router_args()
    }
}

/// Single-stream opus parameters.
pub fn audio_rtp_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: None,
            rtcp_feedback: None,
        }],
        mid: Some("0".to_string()),
        header_extensions: None,
        encodings: Some(vec![RtpEncoding {
            ssrc: Some(1111),
            ..RtpEncoding::default()
        }]),
        rtcp: None,
    }
}

/// VP8 with three simulcast layers.
pub fn simulcast_rtp_parameters() -> RtpParameters {
    let layer = |rid: &str| RtpEncoding {
        rid: Some(rid.to_string()),
        ..RtpEncoding::default()
    };
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90_000,
            channels: None,
            parameters: None,
            rtcp_feedback: None,
        }],
        mid: Some("1".to_string()),
        header_extensions: None,
        encodings: Some(vec![layer("r0"), layer("r1"), layer("r2")]),
        rtcp: None,
    }
}

pub fn audio_produce_args() -> ProduceArgs {
    ProduceArgs {
        kind: MediaKind::Audio,
        rtp_parameters: audio_rtp_parameters(),
        paused: None,
        key_frame_request_delay: None,
        app_data: None,
    }
}

pub fn video_produce_args() -> ProduceArgs {
    ProduceArgs {
        kind: MediaKind::Video,
        rtp_parameters: simulcast_rtp_parameters(),
        paused: None,
        key_frame_request_delay: Some(1000),
        app_data: None,
    }
}

/// Receive capabilities covering both fixture codecs.
pub fn consume_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: Some(vec![opus_capability(), vp8_capability()]),
        header_extensions: None,
        fec_mechanisms: None,
    }
}

pub fn consume_args() -> ConsumeArgs {
    ConsumeArgs {
        rtp_capabilities: Some(consume_capabilities()),
        ..ConsumeArgs::default()
    }
}
