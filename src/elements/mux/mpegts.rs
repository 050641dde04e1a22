//! MPEG Transport Stream multiplexer.
//!
//! Combines elementary streams into transport stream packets with PSI
//! table generation (PAT, PMT) and periodic PCR insertion.

use crate::buffer::Buffer;
use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::format::StreamCodec;

use super::{crc32_mpeg, encode_timestamp, pes_stream_id};

use std::collections::HashMap;

/// Size of a single MPEG-TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte for TS packets.
const SYNC_BYTE: u8 = 0x47;

/// Maximum payload size in a TS packet (no adaptation field).
const MAX_PAYLOAD_SIZE: usize = 184;

/// PMT default PID.
const PMT_PID_DEFAULT: u16 = 0x1000;

/// Default PCR interval.
const PCR_INTERVAL_MS: u64 = 40;

/// 27MHz clock for PCR.
const CLOCK_27MHZ: u64 = 27_000_000;

// ============================================================================
// Track Configuration
// ============================================================================

/// Configuration for a track in the mux.
#[derive(Debug, Clone)]
pub struct TsMuxTrack {
    /// Elementary stream PID (13-bit, 0x0010-0x1FFE).
    pub pid: u16,
    /// Stream codec (determines the PMT stream type code).
    pub codec: StreamCodec,
    /// Stream ID for the PES header.
    pub stream_id: u8,
    /// Whether this track carries PCR.
    pub is_pcr_pid: bool,
}

impl TsMuxTrack {
    /// Create a new track; video tracks carry PCR by default.
    pub fn new(pid: u16, codec: StreamCodec) -> Self {
        Self {
            pid,
            codec,
            stream_id: pes_stream_id(codec),
            is_pcr_pid: codec.is_video(),
        }
    }

    /// Set custom stream ID.
    pub fn with_stream_id(mut self, stream_id: u8) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Set this track as the PCR PID.
    pub fn with_pcr(mut self) -> Self {
        self.is_pcr_pid = true;
        self
    }
}

// ============================================================================
// Mux Configuration
// ============================================================================

/// Configuration for the TS muxer.
#[derive(Debug, Clone)]
pub struct TsMuxConfig {
    /// Program number (default: 1).
    pub program_number: u16,
    /// PMT PID (default: 0x1000).
    pub pmt_pid: u16,
    /// Tracks in this program.
    pub tracks: Vec<TsMuxTrack>,
    /// PCR interval in milliseconds (default: 40ms).
    pub pcr_interval_ms: u64,
    /// Transport stream ID (default: 1).
    pub ts_id: u16,
    /// Include PSI at start (PAT/PMT).
    pub include_psi: bool,
}

impl Default for TsMuxConfig {
    fn default() -> Self {
        Self {
            program_number: 1,
            pmt_pid: PMT_PID_DEFAULT,
            tracks: Vec::new(),
            pcr_interval_ms: PCR_INTERVAL_MS,
            ts_id: 1,
            include_psi: true,
        }
    }
}

impl TsMuxConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track to the configuration.
    pub fn add_track(mut self, track: TsMuxTrack) -> Self {
        self.tracks.push(track);
        self
    }

    /// Get the PCR PID (first track with is_pcr_pid set, or first video
    /// track).
    pub fn pcr_pid(&self) -> Option<u16> {
        self.tracks
            .iter()
            .find(|t| t.is_pcr_pid)
            .or_else(|| self.tracks.iter().find(|t| t.codec.is_video()))
            .map(|t| t.pid)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for the TS muxer.
#[derive(Debug, Clone, Default)]
pub struct TsMuxStats {
    /// Total TS packets written.
    pub packets_written: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// PES packets written.
    pub pes_packets: u64,
    /// PAT packets written.
    pub pat_packets: u64,
    /// PMT packets written.
    pub pmt_packets: u64,
    /// PCR count.
    pub pcr_count: u64,
}

#[derive(Debug, Default)]
struct TrackState {
    continuity_counter: u8,
}

// ============================================================================
// TS Muxer
// ============================================================================

/// MPEG Transport Stream multiplexer.
pub struct TsMux {
    config: TsMuxConfig,
    track_states: HashMap<u16, TrackState>,
    pat_cc: u8,
    pmt_cc: u8,
    stats: TsMuxStats,
    last_pcr: Option<u64>,
    psi_written: bool,
}

impl TsMux {
    /// Create a new TS muxer with the given configuration.
    pub fn new(config: TsMuxConfig) -> Self {
        let mut track_states = HashMap::new();
        for track in &config.tracks {
            track_states.insert(track.pid, TrackState::default());
        }

        Self {
            config,
            track_states,
            pat_cc: 0,
            pmt_cc: 0,
            stats: TsMuxStats::default(),
            last_pcr: None,
            psi_written: false,
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> &TsMuxStats {
        &self.stats
    }

    /// Get the configuration.
    pub fn config(&self) -> &TsMuxConfig {
        &self.config
    }

    /// Generate PSI tables (PAT + PMT).
    pub fn write_psi(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        output.extend(self.write_pat());
        output.extend(self.write_pmt());
        self.psi_written = true;
        output
    }

    fn write_pat(&mut self) -> Vec<u8> {
        let mut packet = [0u8; TS_PACKET_SIZE];

        packet[0] = SYNC_BYTE;
        packet[1] = 0x40; // PUSI, PID 0 (PAT)
        packet[2] = 0x00;
        packet[3] = 0x10 | (self.pat_cc & 0x0F);
        self.pat_cc = (self.pat_cc + 1) & 0x0F;

        // Pointer field
        packet[4] = 0x00;

        let mut section = Vec::new();
        section.push(0x00); // table_id = PAT

        let section_length_pos = section.len();
        section.push(0x00);
        section.push(0x00);

        section.push((self.config.ts_id >> 8) as u8);
        section.push((self.config.ts_id & 0xFF) as u8);

        section.push(0xC1); // version=0, current_next=1
        section.push(0x00); // section number
        section.push(0x00); // last section number

        section.push((self.config.program_number >> 8) as u8);
        section.push((self.config.program_number & 0xFF) as u8);
        section.push(0xE0 | ((self.config.pmt_pid >> 8) as u8 & 0x1F));
        section.push((self.config.pmt_pid & 0xFF) as u8);

        let section_length = section.len() - 3 + 4;
        section[section_length_pos] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
        section[section_length_pos + 1] = (section_length & 0xFF) as u8;

        let crc = crc32_mpeg(&section);
        section.push((crc >> 24) as u8);
        section.push((crc >> 16) as u8);
        section.push((crc >> 8) as u8);
        section.push((crc & 0xFF) as u8);

        let payload_start = 5;
        let section_len = section.len().min(TS_PACKET_SIZE - payload_start);
        packet[payload_start..payload_start + section_len].copy_from_slice(&section[..section_len]);
        for byte in packet.iter_mut().skip(payload_start + section_len) {
            *byte = 0xFF;
        }

        self.stats.pat_packets += 1;
        self.stats.packets_written += 1;
        self.stats.bytes_written += TS_PACKET_SIZE as u64;

        packet.to_vec()
    }

    fn write_pmt(&mut self) -> Vec<u8> {
        let mut packet = [0u8; TS_PACKET_SIZE];

        packet[0] = SYNC_BYTE;
        packet[1] = 0x40 | ((self.config.pmt_pid >> 8) as u8 & 0x1F);
        packet[2] = (self.config.pmt_pid & 0xFF) as u8;
        packet[3] = 0x10 | (self.pmt_cc & 0x0F);
        self.pmt_cc = (self.pmt_cc + 1) & 0x0F;

        packet[4] = 0x00;

        let mut section = Vec::new();
        section.push(0x02); // table_id = PMT

        let section_length_pos = section.len();
        section.push(0x00);
        section.push(0x00);

        section.push((self.config.program_number >> 8) as u8);
        section.push((self.config.program_number & 0xFF) as u8);

        section.push(0xC1);
        section.push(0x00);
        section.push(0x00);

        let pcr_pid = self.config.pcr_pid().unwrap_or(0x1FFF);
        section.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
        section.push((pcr_pid & 0xFF) as u8);

        // Program info length (no program descriptors)
        section.push(0xF0);
        section.push(0x00);

        for track in &self.config.tracks {
            section.push(track.codec.stream_type_code());
            section.push(0xE0 | ((track.pid >> 8) as u8 & 0x1F));
            section.push((track.pid & 0xFF) as u8);
            // ES info length (no descriptors)
            section.push(0xF0);
            section.push(0x00);
        }

        let section_length = section.len() - 3 + 4;
        section[section_length_pos] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
        section[section_length_pos + 1] = (section_length & 0xFF) as u8;

        let crc = crc32_mpeg(&section);
        section.push((crc >> 24) as u8);
        section.push((crc >> 16) as u8);
        section.push((crc >> 8) as u8);
        section.push((crc & 0xFF) as u8);

        let payload_start = 5;
        let section_len = section.len().min(TS_PACKET_SIZE - payload_start);
        packet[payload_start..payload_start + section_len].copy_from_slice(&section[..section_len]);
        for byte in packet.iter_mut().skip(payload_start + section_len) {
            *byte = 0xFF;
        }

        self.stats.pmt_packets += 1;
        self.stats.packets_written += 1;
        self.stats.bytes_written += TS_PACKET_SIZE as u64;

        packet.to_vec()
    }

    /// Write a PES packet for a given PID, returning TS packet data.
    pub fn write_pes(
        &mut self,
        pid: u16,
        data: &[u8],
        pts: Option<ClockTime>,
        dts: Option<ClockTime>,
    ) -> Result<Vec<u8>> {
        let track = self
            .config
            .tracks
            .iter()
            .find(|t| t.pid == pid)
            .ok_or_else(|| Error::Container(format!("unknown PID: {pid}")))?
            .clone();

        self.track_states.entry(pid).or_default();

        let mut output = Vec::new();

        if self.config.include_psi && !self.psi_written {
            output.extend(self.write_psi());
        }

        let pes_packet = self.build_pes_packet(&track, data, pts, dts);
        let need_pcr = track.is_pcr_pid && self.should_write_pcr(pts);
        output.extend(self.packetize_pes(pid, &pes_packet, need_pcr, pts));

        self.stats.pes_packets += 1;
        Ok(output)
    }

    /// Write a frame as PES data, taking PTS/DTS from its metadata.
    pub fn write_buffer(&mut self, pid: u16, buffer: &Buffer) -> Result<Vec<u8>> {
        let meta = buffer.metadata();
        self.write_pes(pid, buffer.as_bytes(), meta.pts, meta.dts)
    }

    fn build_pes_packet(
        &self,
        track: &TsMuxTrack,
        data: &[u8],
        pts: Option<ClockTime>,
        dts: Option<ClockTime>,
    ) -> Vec<u8> {
        let mut pes = Vec::with_capacity(data.len() + 19);

        // PES start code
        pes.push(0x00);
        pes.push(0x00);
        pes.push(0x01);
        pes.push(track.stream_id);

        let has_pts = pts.is_some();
        let has_dts = dts.is_some() && has_pts;
        let header_data_length: usize = if has_pts && has_dts {
            10
        } else if has_pts {
            5
        } else {
            0
        };

        // PES packet length (0 = unbounded for video)
        let pes_packet_length = if track.codec.is_video() {
            0
        } else {
            let len = 3 + header_data_length + data.len();
            if len > 65535 {
                0
            } else {
                len as u16
            }
        };
        pes.push((pes_packet_length >> 8) as u8);
        pes.push((pes_packet_length & 0xFF) as u8);

        pes.push(0x80); // marker, no scrambling

        let pts_dts_flags = if has_pts && has_dts {
            0xC0
        } else if has_pts {
            0x80
        } else {
            0x00
        };
        pes.push(pts_dts_flags);
        pes.push(header_data_length as u8);

        if let Some(pts_time) = pts {
            let marker = if has_dts { 0x03 } else { 0x02 };
            pes.extend(encode_timestamp(pts_time.as_90khz(), marker));
        }
        if has_dts {
            if let Some(dts_time) = dts {
                pes.extend(encode_timestamp(dts_time.as_90khz(), 0x01));
            }
        }

        pes.extend_from_slice(data);
        pes
    }

    fn packetize_pes(
        &mut self,
        pid: u16,
        pes_data: &[u8],
        include_pcr: bool,
        pts: Option<ClockTime>,
    ) -> Vec<u8> {
        let mut output = Vec::new();
        let mut offset = 0;
        let mut first_packet = true;

        while offset < pes_data.len() {
            let mut packet = [0u8; TS_PACKET_SIZE];

            let state = self.track_states.entry(pid).or_default();
            let cc = state.continuity_counter;
            state.continuity_counter = (state.continuity_counter + 1) & 0x0F;

            packet[0] = SYNC_BYTE;
            let pusi = if first_packet { 0x40 } else { 0x00 };
            packet[1] = pusi | ((pid >> 8) as u8 & 0x1F);
            packet[2] = (pid & 0xFF) as u8;

            let remaining = pes_data.len() - offset;
            let need_adaptation = include_pcr && first_packet;

            let payload_start = if need_adaptation {
                let pcr_time = pts
                    .map(|t| t.nanos() * CLOCK_27MHZ / 1_000_000_000)
                    .unwrap_or(0);

                // 1 flags byte + 6 bytes PCR, grown with stuffing when
                // the payload would not fill the packet.
                let af_len = 7usize.max(183usize.saturating_sub(remaining));
                packet[3] = 0x30 | (cc & 0x0F);
                packet[4] = af_len as u8;
                packet[5] = 0x10; // PCR flag

                let pcr_base = pcr_time / 300;
                let pcr_ext = (pcr_time % 300) as u16;
                packet[6] = (pcr_base >> 25) as u8;
                packet[7] = (pcr_base >> 17) as u8;
                packet[8] = (pcr_base >> 9) as u8;
                packet[9] = (pcr_base >> 1) as u8;
                packet[10] = ((pcr_base & 0x01) << 7) as u8 | 0x7E | ((pcr_ext >> 8) as u8 & 0x01);
                packet[11] = (pcr_ext & 0xFF) as u8;
                for byte in packet.iter_mut().take(5 + af_len).skip(12) {
                    *byte = 0xFF;
                }

                self.stats.pcr_count += 1;
                self.last_pcr = Some(pts.map(|t| t.nanos()).unwrap_or(0));
                5 + af_len
            } else if remaining < MAX_PAYLOAD_SIZE {
                // Stuff with an adaptation field so the packet fills.
                let stuffing_needed = MAX_PAYLOAD_SIZE - remaining;
                packet[3] = 0x30 | (cc & 0x0F);
                if stuffing_needed == 1 {
                    packet[4] = 0;
                    5
                } else {
                    packet[4] = (stuffing_needed - 1) as u8;
                    packet[5] = 0x00;
                    for byte in packet.iter_mut().take(4 + stuffing_needed).skip(6) {
                        *byte = 0xFF;
                    }
                    4 + stuffing_needed
                }
            } else {
                packet[3] = 0x10 | (cc & 0x0F);
                4
            };

            let payload_space = TS_PACKET_SIZE - payload_start;
            let copy_len = remaining.min(payload_space);
            packet[payload_start..payload_start + copy_len]
                .copy_from_slice(&pes_data[offset..offset + copy_len]);
            for byte in packet.iter_mut().skip(payload_start + copy_len) {
                *byte = 0xFF;
            }

            output.extend_from_slice(&packet);
            offset += copy_len;
            first_packet = false;

            self.stats.packets_written += 1;
            self.stats.bytes_written += TS_PACKET_SIZE as u64;
        }

        output
    }

    fn should_write_pcr(&self, pts: Option<ClockTime>) -> bool {
        match (self.last_pcr, pts) {
            (Some(last), Some(current)) => {
                let elapsed_ns = current.nanos().saturating_sub(last);
                elapsed_ns >= self.config.pcr_interval_ms * 1_000_000
            }
            (None, Some(_)) => true,
            _ => false,
        }
    }
}
