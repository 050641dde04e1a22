//! MPEG Program Stream multiplexer.
//!
//! Combines elementary streams into MPEG-PS (ISO/IEC 13818-1 program
//! stream): pack headers with SCR, a system header, a program stream
//! map listing the stream type codes, bounded PES packets, and the
//! program end code. Streams can be registered while muxing; each
//! registration re-emits the map with a bumped version.

use crate::buffer::Buffer;
use crate::element::Sink;
use crate::elements::file::FileSink;
use crate::error::{Error, Result};
use crate::format::StreamCodec;

use super::{crc32_mpeg, encode_timestamp};

use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Pack header start code.
const PACK_START_CODE: u32 = 0x0000_01BA;

/// System header start code.
const SYSTEM_HEADER_START_CODE: u32 = 0x0000_01BB;

/// Program stream map start code.
const PSM_START_CODE: u32 = 0x0000_01BC;

/// Program end code.
const PROGRAM_END_CODE: u32 = 0x0000_01B9;

/// Largest PES payload chunk: 65535 minus the 3 flag bytes and a
/// 10-byte PTS/DTS extension, rounded down a little.
const MAX_PES_PAYLOAD: usize = 65500;

/// Nominal program mux rate in units of 50 bytes/s (10 Mbit/s).
const DEFAULT_MUX_RATE: u32 = 25_000;

fn push_start_code(out: &mut Vec<u8>, code: u32) {
    out.extend_from_slice(&code.to_be_bytes());
}

#[derive(Debug, Clone)]
struct PsTrack {
    stream_id: u8,
    codec: StreamCodec,
}

/// Statistics for the PS muxer.
#[derive(Debug, Clone, Default)]
pub struct PsMuxStats {
    /// Pack headers written.
    pub packs_written: u64,
    /// PES packets written.
    pub pes_packets: u64,
    /// Stream map versions emitted.
    pub psm_versions: u64,
    /// Total bytes produced.
    pub bytes_written: u64,
}

/// MPEG Program Stream multiplexer.
pub struct PsMux {
    tracks: Vec<PsTrack>,
    next_video_id: u8,
    next_audio_id: u8,
    psm_version: u8,
    system_header_written: bool,
    last_scr: u64,
    stats: PsMuxStats,
}

impl PsMux {
    /// Create an empty PS muxer.
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_video_id: 0xE0,
            next_audio_id: 0xC0,
            psm_version: 0,
            system_header_written: false,
            last_scr: 0,
            stats: PsMuxStats::default(),
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> &PsMuxStats {
        &self.stats
    }

    /// Register an elementary stream, returning its PES stream ID and
    /// the header bytes that must precede its first frame.
    pub fn add_stream(&mut self, codec: StreamCodec) -> Result<(u8, Vec<u8>)> {
        let stream_id = if codec.is_video() {
            let id = self.next_video_id;
            if id > 0xEF {
                return Err(Error::Container("too many video streams".to_string()));
            }
            self.next_video_id += 1;
            id
        } else if codec.is_audio() {
            let id = self.next_audio_id;
            if id > 0xDF {
                return Err(Error::Container("too many audio streams".to_string()));
            }
            self.next_audio_id += 1;
            id
        } else {
            return Err(Error::Container(format!(
                "codec {codec:?} cannot be carried in a program stream"
            )));
        };

        self.tracks.push(PsTrack { stream_id, codec });
        debug!(stream_id, ?codec, "program stream track added");

        let mut header = Vec::new();
        header.extend(self.write_pack_header(self.last_scr));
        if !self.system_header_written {
            header.extend(self.write_system_header());
            self.system_header_written = true;
        }
        header.extend(self.write_psm());

        Ok((stream_id, header))
    }

    /// Write one frame as bounded PES packets preceded by a pack
    /// header.
    pub fn write_frame(
        &mut self,
        stream_id: u8,
        data: &[u8],
        pts: Option<u64>,
        dts: Option<u64>,
    ) -> Result<Vec<u8>> {
        if !self.tracks.iter().any(|t| t.stream_id == stream_id) {
            return Err(Error::Container(format!(
                "unknown PES stream ID {stream_id:#04x}"
            )));
        }

        if let Some(pts) = pts {
            self.last_scr = pts;
        }

        let mut out = self.write_pack_header(self.last_scr);

        let mut offset = 0;
        let mut first = true;
        while offset < data.len() || first {
            let chunk_len = (data.len() - offset).min(MAX_PES_PAYLOAD);
            let chunk = &data[offset..offset + chunk_len];

            // Timestamps go on the first chunk only.
            let (chunk_pts, chunk_dts) = if first { (pts, dts) } else { (None, None) };
            out.extend(build_pes(stream_id, chunk, chunk_pts, chunk_dts));
            self.stats.pes_packets += 1;

            offset += chunk_len;
            first = false;
        }

        self.stats.bytes_written += out.len() as u64;
        Ok(out)
    }

    /// Produce the program end code.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        push_start_code(&mut out, PROGRAM_END_CODE);
        self.stats.bytes_written += out.len() as u64;
        out
    }

    fn write_pack_header(&mut self, scr_90khz: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        push_start_code(&mut out, PACK_START_CODE);

        let s = scr_90khz & 0x1_FFFF_FFFF;
        let e: u64 = 0; // SCR extension

        // '01' + SCR base/ext with marker bits
        out.push(0x44 | (((s >> 30) & 0x07) as u8) << 3 | ((s >> 28) & 0x03) as u8);
        out.push(((s >> 20) & 0xFF) as u8);
        out.push(0x04 | (((s >> 15) & 0x1F) as u8) << 3 | ((s >> 13) & 0x03) as u8);
        out.push(((s >> 5) & 0xFF) as u8);
        out.push(0x04 | ((s & 0x1F) as u8) << 3 | ((e >> 7) & 0x03) as u8);
        out.push(((e & 0x7F) as u8) << 1 | 0x01);

        // Program mux rate with trailing marker bits
        let rate = DEFAULT_MUX_RATE;
        out.push(((rate >> 14) & 0xFF) as u8);
        out.push(((rate >> 6) & 0xFF) as u8);
        out.push(((rate & 0x3F) as u8) << 2 | 0x03);

        // Reserved + no stuffing
        out.push(0xF8);

        self.stats.packs_written += 1;
        out
    }

    fn write_system_header(&mut self) -> Vec<u8> {
        let audio_bound = self.tracks.iter().filter(|t| t.codec.is_audio()).count() as u8;
        let video_bound = self.tracks.iter().filter(|t| t.codec.is_video()).count() as u8;

        let mut body = Vec::new();

        // rate_bound with marker bits
        let rate = DEFAULT_MUX_RATE;
        body.push(0x80 | ((rate >> 15) & 0x7F) as u8);
        body.push(((rate >> 7) & 0xFF) as u8);
        body.push(((rate & 0x7F) as u8) << 1 | 0x01);

        body.push(audio_bound << 2);
        body.push(0xE0 | (video_bound & 0x1F));
        body.push(0x7F);

        // P-STD buffer bounds per stream
        for track in &self.tracks {
            body.push(track.stream_id);
            if track.codec.is_video() {
                // scale=1, bound in units of 1024 bytes
                let size: u16 = 400;
                body.push(0xE0 | ((size >> 8) & 0x1F) as u8);
                body.push((size & 0xFF) as u8);
            } else {
                // scale=0, bound in units of 128 bytes
                let size: u16 = 32;
                body.push(0xC0 | ((size >> 8) & 0x1F) as u8);
                body.push((size & 0xFF) as u8);
            }
        }

        let mut out = Vec::with_capacity(body.len() + 6);
        push_start_code(&mut out, SYSTEM_HEADER_START_CODE);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Program stream map: stream type code and PES stream ID for every
    /// registered track, protected by a CRC.
    fn write_psm(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        push_start_code(&mut out, PSM_START_CODE);

        let es_map_length = self.tracks.len() * 4;
        // version bump on every emission; length = 2 flag bytes +
        // program info length + es map length + map + CRC
        let psm_length = 2 + 2 + 2 + es_map_length + 4;
        out.extend_from_slice(&(psm_length as u16).to_be_bytes());

        // current_next=1, reserved, version
        out.push(0xE0 | (self.psm_version & 0x1F));
        out.push(0xFF);
        self.psm_version = (self.psm_version + 1) & 0x1F;

        // program_stream_info_length = 0
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(es_map_length as u16).to_be_bytes());

        for track in &self.tracks {
            out.push(track.codec.stream_type_code());
            out.push(track.stream_id);
            out.extend_from_slice(&0u16.to_be_bytes());
        }

        let crc = crc32_mpeg(&out);
        out.extend_from_slice(&crc.to_be_bytes());

        self.stats.psm_versions += 1;
        out
    }
}

impl Default for PsMux {
    fn default() -> Self {
        Self::new()
    }
}

/// Build one bounded PES packet.
fn build_pes(stream_id: u8, data: &[u8], pts: Option<u64>, dts: Option<u64>) -> Vec<u8> {
    let has_pts = pts.is_some();
    let has_dts = dts.is_some() && has_pts;
    let header_data_length: usize = if has_dts {
        10
    } else if has_pts {
        5
    } else {
        0
    };

    let mut pes = Vec::with_capacity(data.len() + 9 + header_data_length);
    pes.push(0x00);
    pes.push(0x00);
    pes.push(0x01);
    pes.push(stream_id);

    let pes_packet_length = 3 + header_data_length + data.len();
    pes.extend_from_slice(&(pes_packet_length as u16).to_be_bytes());

    pes.push(0x80); // marker, no scrambling
    let pts_dts_flags = if has_dts {
        0xC0
    } else if has_pts {
        0x80
    } else {
        0x00
    };
    pes.push(pts_dts_flags);
    pes.push(header_data_length as u8);

    if let Some(pts) = pts {
        let marker = if has_dts { 0x03 } else { 0x02 };
        pes.extend(encode_timestamp(pts, marker));
    }
    if has_dts {
        if let Some(dts) = dts {
            pes.extend(encode_timestamp(dts, 0x01));
        }
    }

    pes.extend_from_slice(data);
    pes
}

// ============================================================================
// Sink wrapper
// ============================================================================

/// Writes frames from any number of elementary streams into one MPEG-PS
/// file.
///
/// Streams are registered lazily from each frame's caps the first time
/// its PID appears, so the sink can serve streams linked at different
/// points during playback.
pub struct PsMuxSink {
    mux: PsMux,
    file: FileSink,
    streams: HashMap<u16, u8>,
    finished: bool,
}

impl PsMuxSink {
    /// Create a PS mux writing to the given path.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            mux: PsMux::new(),
            file: FileSink::create(path)?,
            streams: HashMap::new(),
            finished: false,
        })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn stream_id_for(&mut self, buffer: &Buffer) -> Result<u8> {
        let pid = buffer
            .metadata()
            .stream_id
            .ok_or_else(|| Error::Container("frame carries no stream id".to_string()))?;
        if let Some(&id) = self.streams.get(&pid) {
            return Ok(id);
        }

        let codec = buffer
            .metadata()
            .caps
            .ok_or_else(|| Error::Container(format!("stream {pid} has no caps")))?
            .codec;
        let (id, header) = self.mux.add_stream(codec)?;
        self.file.write_bytes(&header)?;
        self.streams.insert(pid, id);
        Ok(id)
    }
}

impl Sink for PsMuxSink {
    fn consume(&mut self, buffer: Buffer) -> Result<()> {
        let stream_id = self.stream_id_for(&buffer)?;
        let meta = buffer.metadata();
        let pts = meta.pts.map(|t| t.as_90khz());
        let dts = meta.dts.map(|t| t.as_90khz());

        let bytes = self.mux.write_frame(stream_id, buffer.as_bytes(), pts, dts)?;
        self.file.write_bytes(&bytes)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let end = self.mux.finish();
        self.file.write_bytes(&end)?;
        self.file.finish()?;
        self.finished = true;
        debug!(path = %self.file.path().display(), "program stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockTime;
    use crate::format::StreamCaps;
    use crate::metadata::Metadata;
    use tempfile::tempdir;

    fn contains_code(data: &[u8], code: u32) -> bool {
        let needle = code.to_be_bytes();
        data.windows(4).any(|w| w == needle)
    }

    #[test]
    fn test_add_stream_emits_headers() {
        let mut mux = PsMux::new();
        let (id, header) = mux.add_stream(StreamCodec::AacAdts).unwrap();
        assert_eq!(id, 0xC0);
        assert!(contains_code(&header, PACK_START_CODE));
        assert!(contains_code(&header, SYSTEM_HEADER_START_CODE));
        assert!(contains_code(&header, PSM_START_CODE));
    }

    #[test]
    fn test_second_stream_bumps_psm_only() {
        let mut mux = PsMux::new();
        mux.add_stream(StreamCodec::AacAdts).unwrap();
        let (id, header) = mux.add_stream(StreamCodec::H264).unwrap();
        assert_eq!(id, 0xE0);
        assert!(contains_code(&header, PSM_START_CODE));
        assert!(!contains_code(&header, SYSTEM_HEADER_START_CODE));
        assert_eq!(mux.stats().psm_versions, 2);
    }

    #[test]
    fn test_psm_lists_stream_types() {
        let mut mux = PsMux::new();
        let (_, h1) = mux.add_stream(StreamCodec::H264).unwrap();
        assert!(h1.contains(&0x1B));
        let (_, h2) = mux.add_stream(StreamCodec::AacAdts).unwrap();
        assert!(h2.contains(&0x0F));
    }

    #[test]
    fn test_write_frame_bounded_pes() {
        let mut mux = PsMux::new();
        let (id, _) = mux.add_stream(StreamCodec::H264).unwrap();

        // Larger than a single bounded PES payload
        let data = vec![0x55u8; MAX_PES_PAYLOAD + 100];
        let out = mux.write_frame(id, &data, Some(90_000), None).unwrap();
        assert_eq!(mux.stats().pes_packets, 2);
        assert!(contains_code(&out, PACK_START_CODE));
    }

    #[test]
    fn test_write_frame_unknown_stream() {
        let mut mux = PsMux::new();
        assert!(mux.write_frame(0xE0, &[0u8; 4], None, None).is_err());
    }

    #[test]
    fn test_finish_emits_end_code() {
        let mut mux = PsMux::new();
        let end = mux.finish();
        assert_eq!(end, PROGRAM_END_CODE.to_be_bytes());
    }

    #[test]
    fn test_sink_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mps");

        let mut sink = PsMuxSink::create(&path).unwrap();
        let metadata = Metadata::new()
            .with_stream_id(257)
            .with_caps(StreamCaps::new(StreamCodec::AacAdts))
            .with_pts(ClockTime::from_millis(10));
        sink.consume(Buffer::from_vec(vec![0xAA; 64], metadata))
            .unwrap();
        sink.finish().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert!(contains_code(&written, PACK_START_CODE));
        assert!(contains_code(&written, PSM_START_CODE));
        assert!(contains_code(&written, PROGRAM_END_CODE));
        // Ends with the program end code
        assert_eq!(&written[written.len() - 4..], PROGRAM_END_CODE.to_be_bytes());
    }

    #[test]
    fn test_sink_rejects_frame_without_caps() {
        let dir = tempdir().unwrap();
        let mut sink = PsMuxSink::create(dir.path().join("out.mps")).unwrap();
        let buffer = Buffer::from_vec(vec![0u8; 8], Metadata::new().with_stream_id(300));
        assert!(sink.consume(buffer).is_err());
    }
}
