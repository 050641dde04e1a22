//! MPEG Transport Stream demultiplexer.
//!
//! Extracts elementary stream frames from transport stream data and
//! announces each stream as it is discovered in the program tables.
//! Frame buffers carry the stream PID, timestamps converted from the
//! 90 kHz clock, and the stream caps, so downstream branches can
//! configure themselves from the data path alone.

use crate::buffer::Buffer;
use crate::clock::ClockTime;
use crate::error::Result;
use crate::format::{StreamCaps, StreamCodec, StreamPad};
use crate::link::LocalSender;
use crate::metadata::Metadata;

use mpeg2ts_reader::demultiplex::{
    self, DemuxContext, FilterChangeset, FilterRequest, NullPacketFilter, PacketFilter,
    PatPacketFilter, PmtPacketFilter,
};
use mpeg2ts_reader::pes::{self, ElementaryStreamConsumer, PesContents, PesHeader};
use mpeg2ts_reader::psi::pat::PAT_PID;
use mpeg2ts_reader::StreamType;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Size of a single MPEG-TS packet.
pub const TS_PACKET_SIZE: usize = 188;

impl From<StreamType> for StreamCodec {
    fn from(st: StreamType) -> Self {
        match st {
            StreamType::H264 => StreamCodec::H264,
            StreamType::H265 => StreamCodec::H265,
            StreamType::H262 => StreamCodec::Mpeg2Video,
            StreamType::Adts => StreamCodec::AacAdts,
            StreamType::Iso11172Audio | StreamType::Iso138183Audio => StreamCodec::MpegAudio,
            other => StreamCodec::Other(other.into()),
        }
    }
}

// ============================================================================
// Demux statistics
// ============================================================================

/// Statistics for the TS demuxer.
#[derive(Debug, Clone, Default)]
pub struct TsDemuxStats {
    /// Total TS packets processed.
    pub packets_processed: u64,
    /// Total bytes processed.
    pub bytes_processed: u64,
    /// Elementary stream frames extracted.
    pub frames: u64,
    /// Sync errors (input not aligned on a sync byte).
    pub sync_errors: u64,
}

type OutputQueue = Rc<RefCell<VecDeque<Buffer>>>;
type AnnouncedPads = Rc<RefCell<Vec<StreamPad>>>;
type SharedStats = Rc<RefCell<TsDemuxStats>>;

// ============================================================================
// Elementary stream consumer
// ============================================================================

/// Collects PES payload data into whole frames.
pub struct FrameCollector {
    pid: u16,
    caps: StreamCaps,
    output: OutputQueue,
    stats: SharedStats,
    current_data: Vec<u8>,
    current_pts: Option<u64>,
    current_dts: Option<u64>,
    sequence: u64,
}

impl FrameCollector {
    fn new(pid: u16, caps: StreamCaps, output: OutputQueue, stats: SharedStats) -> Self {
        Self {
            pid,
            caps,
            output,
            stats,
            current_data: Vec::new(),
            current_pts: None,
            current_dts: None,
            sequence: 0,
        }
    }

    fn flush_frame(&mut self) {
        if self.current_data.is_empty() {
            return;
        }

        let mut metadata = Metadata::with_sequence(self.sequence)
            .with_stream_id(self.pid)
            .with_caps(self.caps);
        metadata.pts = self.current_pts.map(ClockTime::from_90khz);
        metadata.dts = self.current_dts.map(ClockTime::from_90khz);
        self.sequence += 1;

        let data = std::mem::take(&mut self.current_data);
        self.output
            .borrow_mut()
            .push_back(Buffer::from_vec(data, metadata));
        self.stats.borrow_mut().frames += 1;

        self.current_pts = None;
        self.current_dts = None;
    }
}

impl<Ctx: DemuxContext> ElementaryStreamConsumer<Ctx> for FrameCollector {
    fn start_stream(&mut self, _ctx: &mut Ctx) {
        self.current_data.clear();
        self.current_pts = None;
        self.current_dts = None;
    }

    fn begin_packet(&mut self, _ctx: &mut Ctx, header: PesHeader<'_>) {
        self.flush_frame();

        match header.contents() {
            PesContents::Parsed(Some(parsed)) => {
                if let Ok(pts_dts) = parsed.pts_dts() {
                    match pts_dts {
                        pes::PtsDts::PtsOnly(Ok(pts)) => {
                            self.current_pts = Some(pts.value());
                        }
                        pes::PtsDts::Both {
                            pts: Ok(pts),
                            dts: Ok(dts),
                        } => {
                            self.current_pts = Some(pts.value());
                            self.current_dts = Some(dts.value());
                        }
                        _ => {}
                    }
                }
                self.current_data.extend_from_slice(parsed.payload());
            }
            PesContents::Parsed(None) => {}
            PesContents::Payload(payload) => {
                self.current_data.extend_from_slice(payload);
            }
        }
    }

    fn continue_packet(&mut self, _ctx: &mut Ctx, data: &[u8]) {
        self.current_data.extend_from_slice(data);
    }

    fn end_packet(&mut self, _ctx: &mut Ctx) {
        self.flush_frame();
    }

    fn continuity_error(&mut self, _ctx: &mut Ctx) {
        // Discard the partial frame.
        self.current_data.clear();
        self.current_pts = None;
        self.current_dts = None;
    }
}

// ============================================================================
// Packet filter switch
// ============================================================================

/// Packet filter dispatch for the PID types we handle.
pub enum TsPacketFilter {
    /// PAT filter.
    Pat(PatPacketFilter<TsDemuxContext>),
    /// PMT filter.
    Pmt(PmtPacketFilter<TsDemuxContext>),
    /// PES filter for elementary streams.
    Pes(pes::PesPacketFilter<TsDemuxContext, FrameCollector>),
    /// Null filter for ignored PIDs.
    Null(NullPacketFilter<TsDemuxContext>),
}

impl PacketFilter for TsPacketFilter {
    type Ctx = TsDemuxContext;

    fn consume(&mut self, ctx: &mut Self::Ctx, pk: &mpeg2ts_reader::packet::Packet<'_>) {
        match self {
            TsPacketFilter::Pat(f) => f.consume(ctx, pk),
            TsPacketFilter::Pmt(f) => f.consume(ctx, pk),
            TsPacketFilter::Pes(f) => f.consume(ctx, pk),
            TsPacketFilter::Null(f) => f.consume(ctx, pk),
        }
    }
}

// ============================================================================
// Demux context
// ============================================================================

/// Context wiring the table parsers to frame collectors.
pub struct TsDemuxContext {
    output: OutputQueue,
    announced: AnnouncedPads,
    stats: SharedStats,
    changeset: FilterChangeset<TsPacketFilter>,
}

impl TsDemuxContext {
    fn new(output: OutputQueue, announced: AnnouncedPads, stats: SharedStats) -> Self {
        Self {
            output,
            announced,
            stats,
            changeset: FilterChangeset::default(),
        }
    }
}

impl DemuxContext for TsDemuxContext {
    type F = TsPacketFilter;

    fn filter_changeset(&mut self) -> &mut FilterChangeset<Self::F> {
        &mut self.changeset
    }

    fn construct(&mut self, req: FilterRequest<'_, '_>) -> Self::F {
        match req {
            FilterRequest::ByPid(PAT_PID) => TsPacketFilter::Pat(PatPacketFilter::default()),
            FilterRequest::ByPid(_) => TsPacketFilter::Null(NullPacketFilter::default()),
            FilterRequest::ByStream {
                stream_type,
                stream_info,
                ..
            } => {
                let codec: StreamCodec = stream_type.into();
                let pid: u16 = stream_info.elementary_pid().into();
                let caps = StreamCaps::new(codec);

                // The PMT entry is the discovery point: announce the
                // stream before any of its frames can surface.
                self.announced.borrow_mut().push(StreamPad { pid, caps });

                let collector =
                    FrameCollector::new(pid, caps, self.output.clone(), self.stats.clone());
                TsPacketFilter::Pes(pes::PesPacketFilter::new(collector))
            }
            FilterRequest::Pmt {
                pid,
                program_number,
            } => TsPacketFilter::Pmt(PmtPacketFilter::new(pid, program_number)),
            FilterRequest::Nit { .. } => TsPacketFilter::Null(NullPacketFilter::default()),
        }
    }
}

// ============================================================================
// TsDemux
// ============================================================================

/// MPEG Transport Stream demultiplexer.
pub struct TsDemux {
    demux: demultiplex::Demultiplex<TsDemuxContext>,
    ctx: TsDemuxContext,
    output: OutputQueue,
    announced: AnnouncedPads,
    stats: SharedStats,
    partial_packet: Vec<u8>,
}

impl TsDemux {
    /// Create a new TS demuxer.
    pub fn new() -> Self {
        let output = Rc::new(RefCell::new(VecDeque::new()));
        let announced = Rc::new(RefCell::new(Vec::new()));
        let stats = Rc::new(RefCell::new(TsDemuxStats::default()));
        let mut ctx = TsDemuxContext::new(output.clone(), announced.clone(), stats.clone());
        let demux = demultiplex::Demultiplex::new(&mut ctx);

        Self {
            demux,
            ctx,
            output,
            announced,
            stats,
            partial_packet: Vec::new(),
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> TsDemuxStats {
        self.stats.borrow().clone()
    }

    /// Push TS data into the demuxer, returning completed frames.
    ///
    /// Input can be any size; packet boundary alignment is handled
    /// internally.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Buffer>> {
        let to_process = if self.partial_packet.is_empty() {
            data.to_vec()
        } else {
            let mut combined = std::mem::take(&mut self.partial_packet);
            combined.extend_from_slice(data);
            combined
        };

        // Skip to the first sync byte.
        let start = to_process
            .iter()
            .position(|&b| b == 0x47)
            .unwrap_or(to_process.len());
        if start > 0 {
            self.stats.borrow_mut().sync_errors += 1;
        }
        let aligned = &to_process[start..];

        let complete_packets = aligned.len() / TS_PACKET_SIZE;
        let complete_bytes = complete_packets * TS_PACKET_SIZE;

        if complete_bytes > 0 {
            self.demux.push(&mut self.ctx, &aligned[..complete_bytes]);
            let mut stats = self.stats.borrow_mut();
            stats.packets_processed += complete_packets as u64;
            stats.bytes_processed += complete_bytes as u64;
        }

        if complete_bytes < aligned.len() {
            self.partial_packet = aligned[complete_bytes..].to_vec();
        }

        Ok(self.output.borrow_mut().drain(..).collect())
    }

    /// Take the streams announced since the last call.
    pub fn take_announced(&mut self) -> Vec<StreamPad> {
        std::mem::take(&mut *self.announced.borrow_mut())
    }
}

impl Default for TsDemux {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dynamic output routing
// ============================================================================

/// Routing table from elementary stream PID to the branch that consumes
/// it.
///
/// The router registers a sender per stream from the discovery callback;
/// the demux node routes every frame through this table. Frames for
/// unregistered streams are dropped and counted.
#[derive(Default)]
pub struct DemuxOutputs {
    routes: Mutex<HashMap<u16, LocalSender>>,
    dropped: Mutex<u64>,
}

impl DemuxOutputs {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the consumer for a stream.
    ///
    /// Returns false if the stream already had a consumer (the existing
    /// registration wins).
    pub fn register(&self, pid: u16, sender: LocalSender) -> bool {
        let mut routes = self.routes.lock().expect("route table poisoned");
        if routes.contains_key(&pid) {
            return false;
        }
        routes.insert(pid, sender);
        true
    }

    /// Whether a stream has a registered consumer.
    pub fn is_registered(&self, pid: u16) -> bool {
        self.routes
            .lock()
            .expect("route table poisoned")
            .contains_key(&pid)
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.routes.lock().expect("route table poisoned").len()
    }

    /// Whether no stream is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames dropped for lack of a consumer.
    pub fn dropped(&self) -> u64 {
        *self.dropped.lock().expect("drop counter poisoned")
    }

    /// Route a frame to its stream's consumer.
    pub fn route(&self, frame: Buffer) {
        let pid = match frame.metadata().stream_id {
            Some(pid) => pid,
            None => {
                debug!("frame without stream id dropped");
                *self.dropped.lock().expect("drop counter poisoned") += 1;
                return;
            }
        };
        let mut routes = self.routes.lock().expect("route table poisoned");
        match routes.get(&pid) {
            Some(sender) => {
                if sender.send(frame).is_err() {
                    warn!(pid, "branch for stream went away, unrouting");
                    routes.remove(&pid);
                }
            }
            None => {
                *self.dropped.lock().expect("drop counter poisoned") += 1;
            }
        }
    }

    /// Drop every registered sender, signalling EOS to all branches.
    pub fn close(&self) {
        self.routes.lock().expect("route table poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LocalLink;

    #[test]
    fn test_ts_demux_creation() {
        let demux = TsDemux::new();
        assert_eq!(demux.stats().packets_processed, 0);
    }

    #[test]
    fn test_sync_error_handling() {
        let mut demux = TsDemux::new();

        // No sync byte anywhere
        let frames = demux.push(&[0x00; 188]).unwrap();
        assert!(frames.is_empty());
        assert!(demux.stats().sync_errors > 0);
    }

    #[test]
    fn test_partial_packet_held_back() {
        let mut demux = TsDemux::new();

        let mut partial = vec![0x47];
        partial.extend_from_slice(&[0x00; 99]);
        let frames = demux.push(&partial).unwrap();

        assert!(frames.is_empty());
        assert_eq!(demux.stats().packets_processed, 0);
    }

    #[test]
    fn test_stream_type_mapping() {
        let codec: StreamCodec = StreamType::H264.into();
        assert_eq!(codec, StreamCodec::H264);

        let codec: StreamCodec = StreamType::Adts.into();
        assert_eq!(codec, StreamCodec::AacAdts);
    }

    #[test]
    fn test_outputs_register_once() {
        let outputs = DemuxOutputs::new();
        let (tx, _rx) = LocalLink::bounded(4);
        let (tx2, _rx2) = LocalLink::bounded(4);

        assert!(outputs.register(256, tx));
        assert!(!outputs.register(256, tx2));
        assert!(outputs.is_registered(256));
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_outputs_drop_unrouted() {
        use crate::metadata::Metadata;

        let outputs = DemuxOutputs::new();
        let frame = Buffer::from_vec(vec![1, 2, 3], Metadata::new().with_stream_id(300));
        outputs.route(frame);
        assert_eq!(outputs.dropped(), 1);
    }

    #[test]
    fn test_outputs_close_signals_eos() {
        let outputs = DemuxOutputs::new();
        let (tx, rx) = LocalLink::bounded(4);
        outputs.register(256, tx);
        outputs.close();
        assert!(rx.recv().is_none());
    }
}
