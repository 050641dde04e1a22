//! Elementary stream parsers.
//!
//! These sit between the demuxer and a mux, reshaping frames into the
//! form the container needs: the ADTS parser strips transport headers
//! and recovers the audio parameters, the H.264 parser tags keyframes
//! so the mux can align its segment headers.

use crate::buffer::Buffer;
use crate::element::{Output, Transform};
use crate::error::{Error, Result};
use crate::format::AudioParams;

use smallvec::SmallVec;
use tracing::{debug, trace};

/// ADTS sampling frequency table, indexed by the header's frequency
/// index field.
const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Splits ADTS transport frames into raw AAC access units.
///
/// Each output buffer is one AAC frame with the 7 or 9 byte ADTS header
/// removed and the decoded [`AudioParams`] attached to its caps. Input
/// that does not start on an ADTS sync word is rejected, since it means
/// the stream was misclassified upstream.
pub struct AdtsParser {
    params: Option<AudioParams>,
    frames_parsed: u64,
}

impl AdtsParser {
    /// Create a new ADTS parser.
    pub fn new() -> Self {
        Self {
            params: None,
            frames_parsed: 0,
        }
    }

    /// Audio parameters decoded from the first frame header, if any.
    pub fn params(&self) -> Option<AudioParams> {
        self.params
    }

    fn parse_header(&mut self, data: &[u8]) -> Result<(usize, usize)> {
        if data.len() < 7 {
            return Err(Error::Container(format!(
                "truncated ADTS header: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0xFF || (data[1] & 0xF0) != 0xF0 {
            return Err(Error::Container("missing ADTS sync word".to_string()));
        }

        let protection_absent = data[1] & 0x01 != 0;
        let profile = (data[2] >> 6) & 0x03;
        let freq_index = ((data[2] >> 2) & 0x0F) as usize;
        let channels = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] >> 5) as usize);

        let sample_rate = *ADTS_SAMPLE_RATES.get(freq_index).ok_or_else(|| {
            Error::Container(format!("reserved ADTS frequency index {freq_index}"))
        })?;
        if frame_len < 7 || frame_len > data.len() {
            return Err(Error::Container(format!(
                "ADTS frame length {frame_len} out of range for {} bytes",
                data.len()
            )));
        }

        let header_len = if protection_absent { 7 } else { 9 };
        if self.params.is_none() {
            let params = AudioParams {
                sample_rate,
                channels,
                object_type: profile + 1,
            };
            debug!(?params, "ADTS stream parameters");
            self.params = Some(params);
        }

        Ok((header_len, frame_len))
    }
}

impl Default for AdtsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for AdtsParser {
    fn transform(&mut self, buffer: Buffer) -> Result<Output> {
        let data = buffer.as_bytes();
        let mut frames: SmallVec<[Buffer; 4]> = SmallVec::new();
        let mut offset = 0;

        while offset < data.len() {
            let (header_len, frame_len) = self.parse_header(&data[offset..])?;
            if frame_len <= header_len {
                return Err(Error::Container(
                    "ADTS frame shorter than its header".to_string(),
                ));
            }

            let mut frame = buffer.slice(offset + header_len, frame_len - header_len);
            let metadata = frame.metadata_mut();
            metadata.flags.sync_point = true;
            if let Some(caps) = metadata.caps.as_mut() {
                caps.audio = self.params;
            }
            frames.push(frame);

            offset += frame_len;
            self.frames_parsed += 1;
        }

        trace!(frames = frames.len(), "ADTS frames extracted");
        match frames.len() {
            0 => Ok(Output::None),
            1 => Ok(Output::Single(frames.remove(0))),
            _ => Ok(Output::Multiple(frames)),
        }
    }
}

/// Tags H.264 Annex-B access units that contain an IDR slice as sync
/// points. Frame data passes through unchanged.
pub struct H264Parser {
    keyframes: u64,
}

impl H264Parser {
    /// Create a new H.264 parser.
    pub fn new() -> Self {
        Self { keyframes: 0 }
    }

    /// Number of keyframes seen.
    pub fn keyframes(&self) -> u64 {
        self.keyframes
    }

    fn contains_idr(data: &[u8]) -> bool {
        // Scan for 00 00 01 start codes and check the NAL unit type.
        let mut i = 0;
        while i + 3 < data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                let nal_type = data[i + 3] & 0x1F;
                if nal_type == 5 {
                    return true;
                }
                i += 3;
            } else {
                i += 1;
            }
        }
        false
    }
}

impl Default for H264Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for H264Parser {
    fn transform(&mut self, mut buffer: Buffer) -> Result<Output> {
        if Self::contains_idr(buffer.as_bytes()) {
            buffer.metadata_mut().flags.sync_point = true;
            self.keyframes += 1;
        }
        Ok(Output::Single(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{StreamCaps, StreamCodec};
    use crate::metadata::Metadata;

    /// Build one ADTS frame (no CRC) wrapping the given payload.
    fn adts_frame(payload: &[u8], freq_index: u8, channels: u8) -> Vec<u8> {
        let frame_len = payload.len() + 7;
        let mut out = vec![
            0xFF,
            0xF1,
            ((1u8) << 6) | (freq_index << 2) | ((channels >> 2) & 0x01),
            ((channels & 0x03) << 6) | (((frame_len >> 11) & 0x03) as u8),
            ((frame_len >> 3) & 0xFF) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ];
        out.extend_from_slice(payload);
        out
    }

    fn aac_metadata() -> Metadata {
        Metadata::new()
            .with_stream_id(257)
            .with_caps(StreamCaps::new(StreamCodec::AacAdts))
    }

    #[test]
    fn test_adts_strips_header() {
        let mut parser = AdtsParser::new();
        let frame = adts_frame(&[0xAA, 0xBB, 0xCC], 4, 2);
        let buffer = Buffer::from_vec(frame, aac_metadata());

        let output = parser.transform(buffer).unwrap().into_vec();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].as_bytes(), &[0xAA, 0xBB, 0xCC]);
        assert!(output[0].metadata().flags.sync_point);
    }

    #[test]
    fn test_adts_recovers_params() {
        let mut parser = AdtsParser::new();
        let frame = adts_frame(&[0u8; 16], 3, 2);
        parser
            .transform(Buffer::from_vec(frame, aac_metadata()))
            .unwrap();

        let params = parser.params().unwrap();
        assert_eq!(params.sample_rate, 48000);
        assert_eq!(params.channels, 2);
        assert_eq!(params.object_type, 2);
    }

    #[test]
    fn test_adts_multiple_frames_in_one_buffer() {
        let mut parser = AdtsParser::new();
        let mut data = adts_frame(&[1, 2], 4, 2);
        data.extend_from_slice(&adts_frame(&[3, 4, 5], 4, 2));
        let output = parser
            .transform(Buffer::from_vec(data, aac_metadata()))
            .unwrap()
            .into_vec();

        assert_eq!(output.len(), 2);
        assert_eq!(output[0].as_bytes(), &[1, 2]);
        assert_eq!(output[1].as_bytes(), &[3, 4, 5]);
    }

    #[test]
    fn test_adts_rejects_garbage() {
        let mut parser = AdtsParser::new();
        let buffer = Buffer::from_vec(vec![0x00; 32], aac_metadata());
        assert!(parser.transform(buffer).is_err());
    }

    #[test]
    fn test_h264_tags_idr() {
        let mut parser = H264Parser::new();

        // Access unit: AUD + IDR slice
        let data = vec![0, 0, 0, 1, 0x09, 0xF0, 0, 0, 0, 1, 0x65, 0x88, 0x80];
        let output = parser
            .transform(Buffer::from_vec(data, Metadata::new()))
            .unwrap()
            .into_vec();
        assert!(output[0].metadata().flags.sync_point);
        assert_eq!(parser.keyframes(), 1);
    }

    #[test]
    fn test_h264_non_idr_untagged() {
        let mut parser = H264Parser::new();

        // Non-IDR slice (type 1)
        let data = vec![0, 0, 0, 1, 0x41, 0x9A, 0x00];
        let output = parser
            .transform(Buffer::from_vec(data, Metadata::new()))
            .unwrap()
            .into_vec();
        assert!(!output[0].metadata().flags.sync_point);
    }
}
