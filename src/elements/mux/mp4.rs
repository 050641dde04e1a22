//! MP4 container muxer.
//!
//! Writes raw AAC access units into an MP4 file using the `mp4` crate.
//! The audio track is created lazily from the [`AudioParams`] carried
//! in the first frame's caps, so no out-of-band configuration is
//! needed. Video frames are rejected; this container branch only
//! accepts audio.

use crate::buffer::Buffer;
use crate::element::Sink;
use crate::error::{Error, Result};
use crate::format::AudioParams;

use mp4::{
    AacConfig, AudioObjectType, ChannelConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer,
    SampleFreqIndex, TrackConfig,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Statistics for the MP4 muxer.
#[derive(Debug, Clone, Default)]
pub struct Mp4MuxStats {
    /// Samples written.
    pub samples_written: u64,
    /// Total payload bytes written.
    pub bytes_written: u64,
}

/// Writes an AAC elementary stream into an MP4 file.
pub struct Mp4MuxSink {
    path: PathBuf,
    writer: Option<Mp4Writer<BufWriter<File>>>,
    track_id: Option<u32>,
    stats: Mp4MuxStats,
}

impl Mp4MuxSink {
    /// Create an MP4 mux writing to the given path.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        let config = Mp4Config {
            major_brand: "isom"
                .parse()
                .map_err(|_| Error::Container("invalid major brand".to_string()))?,
            minor_version: 512,
            compatible_brands: ["isom", "iso2", "mp41"]
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            timescale: 1000,
        };
        let writer = Mp4Writer::write_start(BufWriter::new(file), &config)
            .map_err(|e| Error::Container(format!("failed to start MP4: {e}")))?;

        Ok(Self {
            path,
            writer: Some(writer),
            track_id: None,
            stats: Mp4MuxStats::default(),
        })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current statistics.
    pub fn stats(&self) -> &Mp4MuxStats {
        &self.stats
    }

    fn ensure_track(&mut self, params: AudioParams) -> Result<u32> {
        if let Some(id) = self.track_id {
            return Ok(id);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Container("MP4 file already finalized".to_string()))?;

        let media_config = MediaConfig::AacConfig(AacConfig {
            bitrate: 0,
            profile: object_type_to_profile(params.object_type),
            freq_index: sample_rate_to_index(params.sample_rate)?,
            chan_conf: channels_to_config(params.channels)?,
        });
        writer
            .add_track(&TrackConfig::from(media_config))
            .map_err(|e| Error::Container(format!("failed to add audio track: {e}")))?;

        debug!(?params, "MP4 audio track created");
        self.track_id = Some(1);
        Ok(1)
    }
}

impl Sink for Mp4MuxSink {
    fn consume(&mut self, buffer: Buffer) -> Result<()> {
        let meta = buffer.metadata();
        let caps = meta
            .caps
            .ok_or_else(|| Error::Container("frame has no caps".to_string()))?;
        if caps.codec.is_video() {
            return Err(Error::Container(
                "MP4 branch only accepts audio streams".to_string(),
            ));
        }
        let params = caps.audio.ok_or_else(|| {
            Error::Container("audio frame carries no decoded parameters".to_string())
        })?;

        let track_id = self.ensure_track(params)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Container("MP4 file already finalized".to_string()))?;

        let pts_ms = meta.pts.map(|t| t.millis()).unwrap_or(0);
        let sample = Mp4Sample {
            start_time: pts_ms,
            duration: 0,
            rendering_offset: 0,
            is_sync: true,
            bytes: buffer.payload().clone(),
        };
        writer
            .write_sample(track_id, &sample)
            .map_err(|e| Error::Container(format!("failed to write sample: {e}")))?;

        self.stats.samples_written += 1;
        self.stats.bytes_written += buffer.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .write_end()
            .map_err(|e| Error::Container(format!("failed to finalize MP4: {e}")))?;
        debug!(path = %self.path.display(), samples = self.stats.samples_written, "MP4 closed");
        Ok(())
    }
}

fn sample_rate_to_index(sample_rate: u32) -> Result<SampleFreqIndex> {
    Ok(match sample_rate {
        96000 => SampleFreqIndex::Freq96000,
        88200 => SampleFreqIndex::Freq88200,
        64000 => SampleFreqIndex::Freq64000,
        48000 => SampleFreqIndex::Freq48000,
        44100 => SampleFreqIndex::Freq44100,
        32000 => SampleFreqIndex::Freq32000,
        24000 => SampleFreqIndex::Freq24000,
        22050 => SampleFreqIndex::Freq22050,
        16000 => SampleFreqIndex::Freq16000,
        12000 => SampleFreqIndex::Freq12000,
        11025 => SampleFreqIndex::Freq11025,
        8000 => SampleFreqIndex::Freq8000,
        7350 => SampleFreqIndex::Freq7350,
        other => {
            return Err(Error::Container(format!(
                "unsupported AAC sample rate {other}"
            )))
        }
    })
}

fn channels_to_config(channels: u8) -> Result<ChannelConfig> {
    Ok(match channels {
        1 => ChannelConfig::Mono,
        2 => ChannelConfig::Stereo,
        3 => ChannelConfig::Three,
        4 => ChannelConfig::Four,
        5 => ChannelConfig::Five,
        6 => ChannelConfig::FiveOne,
        8 => ChannelConfig::SevenOne,
        other => {
            return Err(Error::Container(format!(
                "unsupported channel count {other}"
            )))
        }
    })
}

fn object_type_to_profile(object_type: u8) -> AudioObjectType {
    match object_type {
        1 => AudioObjectType::AacMain,
        2 => AudioObjectType::AacLowComplexity,
        3 => AudioObjectType::AacScalableSampleRate,
        4 => AudioObjectType::AacLongTermPrediction,
        5 => AudioObjectType::SpectralBandReplication,
        _ => AudioObjectType::AacLowComplexity,
    }
}
