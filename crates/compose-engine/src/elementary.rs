//! Access-unit framing for encoder output.
//!
//! The encoder processes write raw elementary streams (H.264 Annex B, AAC
//! ADTS) to a pipe that hands them back in arbitrary slices. The splitters
//! here reassemble whole access units (one coded picture, one ADTS frame) and
//! stamp each with its own presentation time. Video times follow the constant
//! frame rate; the baseline profile has no B-frames, so decode order is
//! presentation order. Audio times follow the samples carried so far.

use synthcast_common::clock::RecordingClock;
use synthcast_media_model::{EncodedFrame, TrackKind};

/// Sample frames per AAC raw data block.
const AAC_FRAME_SAMPLES: u64 = 1024;

const ADTS_HEADER_BYTES: usize = 7;

/// Splits one encoder's output stream into timestamped access units.
#[derive(Debug)]
pub(crate) enum AccessUnitSplitter {
    AnnexB(AnnexBSplitter),
    Adts(AdtsSplitter),
}

impl AccessUnitSplitter {
    pub(crate) fn h264(frame_rate: u32) -> Self {
        Self::AnnexB(AnnexBSplitter::new(frame_rate))
    }

    pub(crate) fn aac(sample_rate: u32) -> Self {
        Self::Adts(AdtsSplitter::new(sample_rate))
    }

    /// Feed the next slice of output; returns the units it completed.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<EncodedFrame> {
        match self {
            Self::AnnexB(splitter) => splitter.push(bytes),
            Self::Adts(splitter) => splitter.push(bytes),
        }
    }

    /// End of stream: returns whatever unit is still buffered.
    pub(crate) fn finish(&mut self) -> Vec<EncodedFrame> {
        match self {
            Self::AnnexB(splitter) => splitter.finish(),
            Self::Adts(splitter) => splitter.finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalKind {
    /// A coded slice; `first_slice` when `first_mb_in_slice` is zero.
    Slice { first_slice: bool },
    /// AUD, SEI, SPS, PPS and the other NAL types that may only open an
    /// access unit.
    Prefix,
    Other,
}

fn nal_kind(nal: &[u8]) -> NalKind {
    let Some(header_at) = nal.iter().position(|&b| b != 0) else {
        return NalKind::Other;
    };
    if nal[header_at] != 1 {
        return NalKind::Other;
    }
    let Some(header) = nal.get(header_at + 1) else {
        return NalKind::Other;
    };
    match header & 0x1f {
        1..=5 => NalKind::Slice {
            // first_mb_in_slice is ue(v); zero is the single bit '1'.
            first_slice: nal.get(header_at + 2).is_some_and(|b| b & 0x80 != 0),
        },
        6..=9 | 14..=18 => NalKind::Prefix,
        _ => NalKind::Other,
    }
}

/// Offset of the next `00 00 01` start code at or after `from`, widened to
/// include a leading zero of the four-byte form.
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 2 < buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            return Some(if i > 0 && buf[i - 1] == 0 { i - 1 } else { i });
        }
        i += 1;
    }
    None
}

/// H.264 Annex B: one unit per coded picture.
#[derive(Debug)]
pub(crate) struct AnnexBSplitter {
    frame_rate: u32,
    pictures: u64,
    /// The NAL being read, from its start code on.
    nal: Vec<u8>,
    /// Bytes of `nal` already searched for the next start code.
    scanned: usize,
    unit: Vec<u8>,
    unit_has_picture: bool,
}

impl AnnexBSplitter {
    fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            pictures: 0,
            nal: Vec::new(),
            scanned: 0,
            unit: Vec::new(),
            unit_has_picture: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<EncodedFrame> {
        self.nal.extend_from_slice(bytes);
        let mut units = Vec::new();
        // The current NAL's own start code and header occupy the first four
        // bytes at most.
        while let Some(next) = find_start_code(&self.nal, self.scanned.max(4)) {
            let rest = self.nal.split_off(next);
            let nal = std::mem::replace(&mut self.nal, rest);
            self.scanned = 0;
            self.take_nal(&nal, &mut units);
        }
        self.scanned = self.nal.len().saturating_sub(2);
        units
    }

    fn finish(&mut self) -> Vec<EncodedFrame> {
        let mut units = Vec::new();
        if !self.nal.is_empty() {
            let nal = std::mem::take(&mut self.nal);
            self.take_nal(&nal, &mut units);
        }
        self.scanned = 0;
        if !self.unit.is_empty() {
            units.push(self.emit());
        }
        units
    }

    fn take_nal(&mut self, nal: &[u8], units: &mut Vec<EncodedFrame>) {
        let kind = nal_kind(nal);
        let opens_unit = matches!(
            kind,
            NalKind::Prefix | NalKind::Slice { first_slice: true }
        );
        if opens_unit && self.unit_has_picture {
            units.push(self.emit());
        }
        if matches!(kind, NalKind::Slice { .. }) {
            self.unit_has_picture = true;
        }
        self.unit.extend_from_slice(nal);
    }

    fn emit(&mut self) -> EncodedFrame {
        let timestamp = RecordingClock::frame_timestamp_micros(self.pictures, self.frame_rate);
        if self.unit_has_picture {
            self.pictures += 1;
        }
        self.unit_has_picture = false;
        EncodedFrame::new(TrackKind::Video, timestamp, std::mem::take(&mut self.unit))
    }
}

/// AAC in ADTS: one unit per ADTS frame.
#[derive(Debug)]
pub(crate) struct AdtsSplitter {
    sample_rate: u32,
    samples: u64,
    pending: Vec<u8>,
}

impl AdtsSplitter {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: 0,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<EncodedFrame> {
        self.pending.extend_from_slice(bytes);
        let mut units = Vec::new();
        let mut offset = 0;
        while let Some(header) = self.pending.get(offset..offset + ADTS_HEADER_BYTES) {
            let length = adts_frame_length(header);
            if length < ADTS_HEADER_BYTES {
                let skipped = self.pending[offset + 1..]
                    .iter()
                    .position(|&b| b == 0xff)
                    .map_or(self.pending.len() - offset, |p| p + 1);
                tracing::warn!(skipped, "Discarding encoder output outside ADTS frames");
                offset += skipped;
                continue;
            }
            if offset + length > self.pending.len() {
                break;
            }

            let blocks = u64::from(header[6] & 0x03) + 1;
            let timestamp = RecordingClock::sample_timestamp_micros(self.samples, self.sample_rate);
            self.samples += blocks * AAC_FRAME_SAMPLES;
            units.push(EncodedFrame::new(
                TrackKind::Audio,
                timestamp,
                self.pending[offset..offset + length].to_vec(),
            ));
            offset += length;
        }
        self.pending.drain(..offset);
        units
    }

    fn finish(&mut self) -> Vec<EncodedFrame> {
        if !self.pending.is_empty() {
            tracing::warn!(
                bytes = self.pending.len(),
                "Encoder output ended inside an ADTS frame; dropping it"
            );
            self.pending.clear();
        }
        Vec::new()
    }
}

/// The 13-bit `frame_length` of an ADTS header, or 0 without a sync word.
fn adts_frame_length(header: &[u8]) -> usize {
    if header.len() < ADTS_HEADER_BYTES || header[0] != 0xff || header[1] & 0xf0 != 0xf0 {
        return 0;
    }
    (usize::from(header[3] & 0x03) << 11)
        | (usize::from(header[4]) << 3)
        | (usize::from(header[5]) >> 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: u8, body: &[u8]) -> Vec<u8> {
        let mut nal = vec![0, 0, 0, 1, header];
        nal.extend_from_slice(body);
        nal
    }

    /// SPS, PPS and an IDR picture, then `p_frames` single-slice pictures
    /// and one picture coded as two slices.
    fn h264_stream(p_frames: usize) -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(nal(0x67, &[0x42, 0x00, 0x1f, 0xe9]));
        stream.extend(nal(0x68, &[0xce, 0x38, 0x80]));
        stream.extend(nal(0x65, &[0x88, 0x84, 0x00, 0x00, 0x03, 0x01]));
        for i in 0..p_frames {
            stream.extend(nal(0x41, &[0x9a, i as u8, 0x10]));
        }
        stream.extend(nal(0x41, &[0x9a, 0x77]));
        // first_mb_in_slice = 40, so the picture continues.
        stream.extend(&[0, 0, 1, 0x41, 0x05, 0x48, 0x22]);
        stream
    }

    fn adts_frame(payload_len: usize, fill: u8) -> Vec<u8> {
        let length = ADTS_HEADER_BYTES + payload_len;
        let mut frame = vec![
            0xff,
            0xf1,
            0x50,
            0x80 | ((length >> 11) & 0x03) as u8,
            ((length >> 3) & 0xff) as u8,
            (((length & 0x07) << 5) | 0x1f) as u8,
            0xfc,
        ];
        frame.extend(std::iter::repeat(fill).take(payload_len));
        frame
    }

    fn split_in_slices(
        mut splitter: AccessUnitSplitter,
        stream: &[u8],
        slice: usize,
    ) -> Vec<EncodedFrame> {
        let mut units: Vec<EncodedFrame> = stream
            .chunks(slice)
            .flat_map(|chunk| splitter.push(chunk))
            .collect();
        units.extend(splitter.finish());
        units
    }

    #[test]
    fn test_h264_units_are_pictures_at_frame_rate() {
        let stream = h264_stream(4);
        for slice in [1, 2, 3, 7, 64 * 1024] {
            let units = split_in_slices(AccessUnitSplitter::h264(60), &stream, slice);
            assert_eq!(units.len(), 6, "slice size {slice}");

            let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp_micros()).collect();
            assert_eq!(timestamps, [0, 16_666, 33_333, 50_000, 66_666, 83_333]);
            assert!(units.iter().all(|u| u.track() == TrackKind::Video));

            let rejoined: Vec<u8> = units.iter().flat_map(|u| u.payload().to_vec()).collect();
            assert_eq!(rejoined, stream);
        }
    }

    #[test]
    fn test_h264_parameter_sets_travel_with_their_picture() {
        let units = split_in_slices(AccessUnitSplitter::h264(30), &h264_stream(0), 5);
        let first = units[0].payload();
        assert_eq!(&first[..5], &[0, 0, 0, 1, 0x67]);
        assert!(first.windows(5).any(|w| w == [0, 0, 0, 1, 0x65]));
        // The two-slice picture stays in one unit.
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].payload().iter().filter(|b| **b == 0x41).count(), 2);
    }

    #[test]
    fn test_adts_units_follow_sample_count() {
        let mut stream = Vec::new();
        for i in 0..5 {
            stream.extend(adts_frame(100 + i * 37, i as u8));
        }
        for slice in [1, 6, 13, 4096] {
            let units = split_in_slices(AccessUnitSplitter::aac(44_100), &stream, slice);
            assert_eq!(units.len(), 5, "slice size {slice}");

            let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp_micros()).collect();
            assert_eq!(timestamps, [0, 23_219, 46_439, 69_659, 92_879]);
            assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(units[3].payload().len(), ADTS_HEADER_BYTES + 100 + 3 * 37);
        }
    }

    #[test]
    fn test_adts_resyncs_after_garbage() {
        let mut stream = vec![0x00, 0x12, 0x34];
        stream.extend(adts_frame(20, 0xaa));
        stream.extend(adts_frame(20, 0xbb));
        let units = split_in_slices(AccessUnitSplitter::aac(48_000), &stream, 8);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].payload()[..2], [0xff, 0xf1]);
        assert_eq!(units[1].timestamp_micros(), 21_333);
    }

    #[test]
    fn test_adts_truncated_tail_is_dropped() {
        let mut stream = adts_frame(50, 1);
        stream.extend(&adts_frame(50, 2)[..30]);
        let units = split_in_slices(AccessUnitSplitter::aac(44_100), &stream, 16);
        assert_eq!(units.len(), 1);
    }
}
