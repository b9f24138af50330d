//! Access-unit assembly.
//!
//! Converts the transcoder's Annex-B byte stream into access units that each
//! begin with a picture NAL and, for IDR frames, carry the cached SPS/PPS in
//! front. Chunks may split NAL units (and start codes) at arbitrary byte
//! positions; the scanner holds the trailing NAL until the next start code
//! confirms its end.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::distributor::AccessUnit;
use crate::nal::{find_start_code, NalUnit, NalUnitType};

/// Upper bound on the working scan buffer.
const MAX_BUFFER: usize = 512 * 1024;
/// Tail kept when the working buffer overflows.
const KEEP_TAIL: usize = 256 * 1024;
/// Finalisation attempts a frame may be withheld while waiting for the first
/// SPS/PPS pair.
const WARMUP_ATTEMPTS: u32 = 5;

/// Latest SPS and PPS, with their Annex-B start codes. Either empty or
/// holding exactly one of each; a newly observed parameter set replaces the
/// previous one.
#[derive(Debug, Default)]
pub struct ParameterSetCache {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    concatenated: Bytes,
}

impl ParameterSetCache {
    fn observe(&mut self, nal_type: NalUnitType, nal: &[u8]) {
        match nal_type {
            NalUnitType::Sps => self.sps = Some(Bytes::copy_from_slice(nal)),
            NalUnitType::Pps => self.pps = Some(Bytes::copy_from_slice(nal)),
            _ => return,
        }
        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            let mut combined = BytesMut::with_capacity(sps.len() + pps.len());
            combined.extend_from_slice(sps);
            combined.extend_from_slice(pps);
            self.concatenated = combined.freeze();
        }
    }

    pub fn is_populated(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    pub fn concatenated(&self) -> &[u8] {
        &self.concatenated
    }
}

#[derive(Debug)]
pub struct AccessUnitAssembler {
    buffer: BytesMut,
    cache: ParameterSetCache,
    /// Non-picture NAL units seen before a frame was open; they ride in
    /// front of the next frame.
    leading: Vec<u8>,
    current_frame: Vec<u8>,
    current_has_idr: bool,
    withheld: Option<Vec<u8>>,
    warmup_attempts: u32,
    frame_duration: Duration,
    emitted: u64,
}

impl AccessUnitAssembler {
    pub fn new(frame_duration: Duration) -> Self {
        AccessUnitAssembler {
            buffer: BytesMut::with_capacity(128 * 1024),
            cache: ParameterSetCache::default(),
            leading: Vec::new(),
            current_frame: Vec::with_capacity(64 * 1024),
            current_has_idr: false,
            withheld: None,
            warmup_attempts: 0,
            frame_duration,
            emitted: 0,
        }
    }

    /// Updates the nominal duration stamped on subsequently emitted units.
    pub fn set_frame_duration(&mut self, duration: Duration) {
        self.frame_duration = duration;
    }

    pub fn cache(&self) -> &ParameterSetCache {
        &self.cache
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Appends a chunk of the transcoder byte stream and returns every access
    /// unit completed by it, in source order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some((first, _)) = find_start_code(&self.buffer, 0) else {
                break;
            };
            // The NAL beginning at `first` ends at the next start code; until
            // one is seen it stays in the buffer.
            let Some((next, _)) = find_start_code(&self.buffer, first + 3) else {
                if first > 0 {
                    let _ = self.buffer.split_to(first);
                }
                break;
            };
            let nal = NalUnit::new(self.buffer.split_to(next).split_off(first).freeze());
            self.handle_nal(&nal, &mut out);
        }

        if self.buffer.len() > MAX_BUFFER {
            // Keep the tail: new start codes arrive there, the head is a
            // partial NAL we can no longer frame anyway.
            let cut = self.buffer.len() - KEEP_TAIL;
            let _ = self.buffer.split_to(cut);
            tracing::warn!("scan buffer exceeded {} bytes, truncated head", MAX_BUFFER);
        }

        out
    }

    fn handle_nal(&mut self, nal: &NalUnit, out: &mut Vec<AccessUnit>) {
        let Some(nal_type) = nal.nal_type() else {
            return;
        };
        if nal.payload().is_empty() {
            return;
        }

        match nal_type {
            NalUnitType::Sps | NalUnitType::Pps => {
                let was_populated = self.cache.is_populated();
                self.cache.observe(nal_type, nal.bytes());
                if !was_populated && self.cache.is_populated() {
                    tracing::info!(
                        "cached parameter sets ({} bytes)",
                        self.cache.concatenated().len()
                    );
                    // A frame withheld during warm-up can go out now, with
                    // the parameter sets in front.
                    if let Some(frame) = self.withheld.take() {
                        self.emit_with_cache(frame, true, out);
                    }
                }
            }
            NalUnitType::Aud => {
                // Delimiter only: finalises the open frame, never emitted.
                self.finalise_current(out);
            }
            NalUnitType::Idr | NalUnitType::NonIdr => {
                self.finalise_current(out);
                if !self.leading.is_empty() {
                    self.current_frame.append(&mut self.leading);
                }
                self.current_frame.extend_from_slice(nal.bytes());
                if nal_type == NalUnitType::Idr {
                    self.current_has_idr = true;
                }
            }
            _ => {
                if self.current_frame.is_empty() {
                    self.leading.extend_from_slice(nal.bytes());
                } else {
                    self.current_frame.extend_from_slice(nal.bytes());
                }
            }
        }
    }

    fn finalise_current(&mut self, out: &mut Vec<AccessUnit>) {
        if self.current_frame.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.current_frame);
        let has_idr = self.current_has_idr;
        self.current_has_idr = false;

        if self.emitted == 0 && !self.cache.is_populated() {
            self.warmup_attempts += 1;
            if self.warmup_attempts > WARMUP_ATTEMPTS {
                tracing::warn!(
                    "no SPS/PPS after {} frames, emitting without parameter sets",
                    WARMUP_ATTEMPTS
                );
                if let Some(withheld) = self.withheld.take() {
                    self.emit_with_cache(withheld, true, out);
                }
                self.emit_with_cache(frame, has_idr, out);
            } else if has_idr {
                // Hold the keyframe: the parameter sets it needs may still
                // be on their way.
                if let Some(old) = self.withheld.replace(frame) {
                    tracing::debug!("replaced withheld keyframe ({} bytes)", old.len());
                }
            } else {
                tracing::debug!(
                    "dropping pre-warmup frame without parameter sets ({} bytes)",
                    frame.len()
                );
            }
            return;
        }

        if let Some(withheld) = self.withheld.take() {
            self.emit_with_cache(withheld, true, out);
        }
        self.emit_with_cache(frame, has_idr, out);
    }

    fn emit_with_cache(&mut self, frame: Vec<u8>, has_idr: bool, out: &mut Vec<AccessUnit>) {
        let data = if has_idr && self.cache.is_populated() {
            let concatenated = self.cache.concatenated();
            let mut prefixed = Vec::with_capacity(concatenated.len() + frame.len());
            prefixed.extend_from_slice(concatenated);
            prefixed.extend_from_slice(&frame);
            Bytes::from(prefixed)
        } else {
            Bytes::from(frame)
        };
        self.emitted += 1;
        if self.emitted <= 5 {
            tracing::debug!("assembled access unit #{}: {} bytes", self.emitted, data.len());
        }
        out.push(AccessUnit {
            data,
            duration: self.frame_duration,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F, 0xAC];
    const PPS: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x68, 0xEF, 0x38, 0x80];
    const IDR: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21, 0xA0];
    const NON_IDR: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x24, 0x6C];
    const AUD: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
    const SEI: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x06, 0x05, 0x04];

    fn assembler() -> AccessUnitAssembler {
        AccessUnitAssembler::new(Duration::from_millis(33))
    }

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    // The scanner holds the trailing NAL until the next start code arrives,
    // so test streams end with a second delimiter to flush the first.

    #[test]
    fn test_idr_emitted_with_parameter_sets() {
        let mut asm = assembler();
        let mut out = asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        assert_eq!(out.len(), 1);
        let unit = out.remove(0);
        let expected = stream(&[SPS, PPS, IDR]);
        assert_eq!(&unit.data[..], &expected[..]);
    }

    #[test]
    fn test_non_idr_emitted_verbatim() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let out = asm.push_chunk(&stream(&[NON_IDR, AUD, AUD]));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], NON_IDR);
    }

    #[test]
    fn test_picture_nal_finalises_previous_frame() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        // Two successive slices, no delimiter between them: the second
        // finalises the first, which is emitted untouched.
        let out = asm.push_chunk(&stream(&[NON_IDR, NON_IDR, AUD]));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], NON_IDR);
    }

    #[test]
    fn test_aud_is_discarded() {
        let mut asm = assembler();
        let out = asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, NON_IDR, AUD, AUD]));
        assert_eq!(out.len(), 2);
        for unit in &out {
            assert!(!crate::nal::contains_type(&unit.data, 9));
        }
    }

    #[test]
    fn test_sei_rides_with_next_frame() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let out = asm.push_chunk(&stream(&[SEI, NON_IDR, AUD, AUD]));
        assert_eq!(out.len(), 1);
        let expected = stream(&[SEI, NON_IDR]);
        assert_eq!(&out[0].data[..], &expected[..]);
    }

    #[test]
    fn test_sei_inside_frame_is_appended() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let out = asm.push_chunk(&stream(&[NON_IDR, SEI, AUD, AUD]));
        assert_eq!(out.len(), 1);
        let expected = stream(&[NON_IDR, SEI]);
        assert_eq!(&out[0].data[..], &expected[..]);
    }

    #[test]
    fn test_sps_split_across_chunks_caches_parameter_sets() {
        let mut asm = assembler();
        let full = stream(&[SPS, PPS, IDR]);
        // Split in the middle of the SPS payload.
        let (head, tail) = full.split_at(6);
        let mut emitted = asm.push_chunk(head);
        emitted.extend(asm.push_chunk(tail));
        assert!(emitted.is_empty());
        assert!(asm.cache().is_populated());
        assert_eq!(&asm.cache().sps().unwrap()[..], SPS);
        assert_eq!(&asm.cache().pps().unwrap()[..], PPS);
    }

    #[test]
    fn test_start_code_split_across_chunks() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let frame = stream(&[NON_IDR, AUD, AUD]);
        // Break inside the first AUD's start code.
        let (head, tail) = frame.split_at(NON_IDR.len() + 2);
        let mut out = asm.push_chunk(head);
        out.extend(asm.push_chunk(tail));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], NON_IDR);
    }

    #[test]
    fn test_three_byte_code_after_zero_payload_byte() {
        // A payload ending in 0x00 followed by a 3-byte start code: the
        // zero belongs to the start code, which must scan as the 4-byte form.
        let slice_ending_in_zero: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00];
        let three_byte_aud: &[u8] = &[0x00, 0x00, 0x01, 0x09, 0xF0];
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let out = asm.push_chunk(&stream(&[slice_ending_in_zero, three_byte_aud, AUD]));
        assert_eq!(out.len(), 1);
        // The trailing zero was consumed by the start code of the delimiter.
        assert_eq!(&out[0].data[..], &slice_ending_in_zero[..6]);
    }

    #[test]
    fn test_keyframe_withheld_until_parameter_sets_arrive() {
        let mut asm = assembler();
        // IDR finalised before any SPS/PPS: withheld, not emitted.
        let out = asm.push_chunk(&stream(&[IDR, AUD]));
        assert!(out.is_empty());
        // Parameter sets arrive: the withheld keyframe goes out with them
        // prepended.
        let out = asm.push_chunk(&stream(&[SPS, PPS, NON_IDR]));
        assert_eq!(out.len(), 1);
        let expected = stream(&[SPS, PPS, IDR]);
        assert_eq!(&out[0].data[..], &expected[..]);
    }

    #[test]
    fn test_warmup_expires_and_emits_bare() {
        let mut asm = assembler();
        let mut out = Vec::new();
        // Enough finalised frames without any parameter sets for warm-up to
        // run out: frames flow without the prefix instead of deadlocking.
        for _ in 0..8 {
            out.extend(asm.push_chunk(&stream(&[NON_IDR, AUD])));
        }
        assert!(!out.is_empty());
        assert_eq!(&out[0].data[..], NON_IDR);
        // Streaming has started: later frames are no longer withheld.
        let out = asm.push_chunk(&stream(&[NON_IDR, AUD, AUD]));
        assert!(!out.is_empty());
    }

    #[test]
    fn test_new_parameter_sets_replace_cache() {
        let mut asm = assembler();
        asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        let new_sps: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x28, 0xB0];
        let out = asm.push_chunk(&stream(&[new_sps, IDR, AUD, AUD]));
        assert_eq!(out.len(), 1);
        let expected = stream(&[new_sps, PPS, IDR]);
        assert_eq!(&out[0].data[..], &expected[..]);
        assert_eq!(&asm.cache().sps().unwrap()[..], new_sps);
    }

    #[test]
    fn test_every_unit_begins_with_start_code() {
        let mut asm = assembler();
        let out = asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, NON_IDR, AUD, NON_IDR, AUD]));
        assert!(!out.is_empty());
        for unit in &out {
            assert_eq!(&unit.data[..4], &[0x00, 0x00, 0x00, 0x01]);
        }
    }

    #[test]
    fn test_buffer_overflow_keeps_tail() {
        let mut asm = assembler();
        // A giant headless blob with no start codes, larger than the cap.
        let garbage = vec![0xFFu8; MAX_BUFFER + 1024];
        let out = asm.push_chunk(&garbage);
        assert!(out.is_empty());
        // A full sequence arriving afterwards must still parse.
        asm.push_chunk(&stream(&[SPS, PPS]));
        let out = asm.push_chunk(&stream(&[IDR, AUD, AUD]));
        assert_eq!(out.len(), 1);
        let expected = stream(&[SPS, PPS, IDR]);
        assert_eq!(&out[0].data[..], &expected[..]);
    }

    #[test]
    fn test_duration_follows_frame_rate() {
        let mut asm = assembler();
        asm.set_frame_duration(Duration::from_millis(40));
        let out = asm.push_chunk(&stream(&[SPS, PPS, IDR, AUD, AUD]));
        assert_eq!(out[0].duration, Duration::from_millis(40));
    }
}
