//! Shared helpers: synthesize small transport streams to split.

use streamfork::clock::ClockTime;
use streamfork::elements::mux::{TsMux, TsMuxConfig, TsMuxTrack};
use streamfork::format::StreamCodec;

pub const VIDEO_PID: u16 = 256;
pub const AUDIO_PID: u16 = 257;

/// One ADTS frame (no CRC): 48 kHz, stereo, AAC-LC.
pub fn adts_frame(payload: &[u8]) -> Vec<u8> {
    let frame_len = payload.len() + 7;
    let freq_index = 3u8; // 48000 Hz
    let channels = 2u8;
    let mut out = vec![
        0xFF,
        0xF1,
        (1u8 << 6) | (freq_index << 2) | ((channels >> 2) & 0x01),
        ((channels & 0x03) << 6) | (((frame_len >> 11) & 0x03) as u8),
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ];
    out.extend_from_slice(payload);
    out
}

/// One Annex-B access unit; IDR slice when `idr` is set.
pub fn annexb_frame(idr: bool, filler: usize) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 1, 0x09, 0xF0]; // access unit delimiter
    if idr {
        out.extend_from_slice(&[0, 0, 0, 1, 0x65]);
    } else {
        out.extend_from_slice(&[0, 0, 0, 1, 0x41]);
    }
    out.extend(std::iter::repeat(0xA5).take(filler));
    out
}

/// Transport stream with an H.264 video track and an AAC audio track.
pub fn synth_ts_av(frames: usize) -> Vec<u8> {
    let config = TsMuxConfig::new()
        .add_track(TsMuxTrack::new(VIDEO_PID, StreamCodec::H264))
        .add_track(TsMuxTrack::new(AUDIO_PID, StreamCodec::AacAdts));
    let mut mux = TsMux::new(config);

    let mut out = Vec::new();
    for i in 0..frames {
        let video = annexb_frame(i % 5 == 0, 600);
        out.extend(
            mux.write_pes(
                VIDEO_PID,
                &video,
                Some(ClockTime::from_millis(i as u64 * 40)),
                None,
            )
            .unwrap(),
        );

        let audio = adts_frame(&vec![0x55u8; 128]);
        out.extend(
            mux.write_pes(
                AUDIO_PID,
                &audio,
                Some(ClockTime::from_millis(i as u64 * 21)),
                None,
            )
            .unwrap(),
        );
    }
    out
}

/// Transport stream with only a video track.
pub fn synth_ts_video_only(frames: usize) -> Vec<u8> {
    let config = TsMuxConfig::new().add_track(TsMuxTrack::new(VIDEO_PID, StreamCodec::H264));
    let mut mux = TsMux::new(config);

    let mut out = Vec::new();
    for i in 0..frames {
        let video = annexb_frame(i % 5 == 0, 600);
        out.extend(
            mux.write_pes(
                VIDEO_PID,
                &video,
                Some(ClockTime::from_millis(i as u64 * 40)),
                None,
            )
            .unwrap(),
        );
    }
    out
}

/// Transport stream with only an audio track.
pub fn synth_ts_audio_only(frames: usize) -> Vec<u8> {
    let config = TsMuxConfig::new().add_track(TsMuxTrack::new(AUDIO_PID, StreamCodec::AacAdts));
    let mut mux = TsMux::new(config);

    let mut out = Vec::new();
    for i in 0..frames {
        let audio = adts_frame(&vec![0x55u8; 128]);
        out.extend(
            mux.write_pes(
                AUDIO_PID,
                &audio,
                Some(ClockTime::from_millis(i as u64 * 21)),
                None,
            )
            .unwrap(),
        );
    }
    out
}

/// Whether `data` contains the 4-byte big-endian start code.
pub fn contains_code(data: &[u8], code: u32) -> bool {
    let needle = code.to_be_bytes();
    data.windows(4).any(|w| w == needle)
}
