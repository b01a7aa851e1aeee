//! fMP4 box parsing and segment classification
//!
//! The encoder emits a strict sequence of length-prefixed boxes:
//! `ftyp`, `moov`, then (`moof`, `mdat`)* . The parser slices the byte
//! stream into complete boxes without inspecting bodies; the classifier
//! splits them into the init segment, live media, and snapshot-worthy
//! keyframe fragments.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{AppError, Result};

/// Box header: 32-bit big-endian size + 4-byte type
pub const BOX_HEADER_LEN: usize = 8;

/// Fragment sizes tracked for the keyframe heuristic
const SIZE_WINDOW: usize = 20;
/// Early-session fragments larger than this are assumed keyframes
const EARLY_KEYFRAME_FLOOR: usize = 300 * 1024;
/// Fragments below this count are in the early-session phase
const EARLY_FRAGMENT_COUNT: u64 = 5;

/// Four-character box type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const MOOV: FourCc = FourCc(*b"moov");
    pub const MOOF: FourCc = FourCc(*b"moof");
    pub const MDAT: FourCc = FourCc(*b"mdat");
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// One complete box, header included
#[derive(Debug, Clone)]
pub struct Mp4Box {
    pub kind: FourCc,
    pub data: Bytes,
}

impl Mp4Box {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Incremental box parser over an append-only buffer
///
/// Feed arbitrary chunks with [`push`](Self::push) and drain complete
/// boxes with [`next_box`](Self::next_box). A declared size below the
/// header length violates the encoder contract and is a fatal error.
#[derive(Default)]
pub struct BoxParser {
    buf: BytesMut,
}

impl BoxParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw encoder output
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Slice off the next complete box, if buffered
    pub fn next_box(&mut self) -> Result<Option<Mp4Box>> {
        if self.buf.len() < BOX_HEADER_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if size < BOX_HEADER_LEN {
            return Err(AppError::Mp4Parse(format!(
                "box size {} below header length",
                size
            )));
        }
        if self.buf.len() < size {
            return Ok(None);
        }

        let kind = FourCc([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let data = self.buf.split_to(size).freeze();
        Ok(Some(Mp4Box { kind, data }))
    }

    /// Bytes currently buffered (incomplete box tail)
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Classified output of the segmenter
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// `ftyp` + `moov` captured; emitted once per encoder session
    InitSegment(Bytes),
    /// Live box for the fan-out hub, in arrival order
    Media(Mp4Box),
    /// Likely-keyframe fragment, prefixed with the init segment so it
    /// decodes standalone
    KeyframeFragment(Bytes),
}

/// Splits the box sequence into init segment, live media, and snapshot
/// candidates
///
/// Keyframe detection is a size heuristic: without parsing sample flags,
/// a fragment is tagged when it is early in the session and over the
/// 300 KiB floor, or at least 70% of the largest fragment in the recent
/// window.
pub struct SegmentClassifier {
    ftyp: Option<Bytes>,
    init: Option<Bytes>,
    candidate: Option<BytesMut>,
    recent_sizes: VecDeque<usize>,
    fragments_seen: u64,
}

impl SegmentClassifier {
    pub fn new() -> Self {
        Self {
            ftyp: None,
            init: None,
            candidate: None,
            recent_sizes: VecDeque::with_capacity(SIZE_WINDOW),
            fragments_seen: 0,
        }
    }

    /// Completed init segment, once captured
    pub fn init_segment(&self) -> Option<Bytes> {
        self.init.clone()
    }

    /// Classify one box, appending resulting items to `out`
    pub fn accept(&mut self, bx: Mp4Box, out: &mut Vec<StreamItem>) {
        if self.init.is_none() {
            match bx.kind {
                FourCc::FTYP if self.ftyp.is_none() => {
                    self.ftyp = Some(bx.data);
                    return;
                }
                FourCc::MOOV if self.ftyp.is_some() => {
                    let ftyp = self.ftyp.take().unwrap_or_default();
                    let mut init = BytesMut::with_capacity(ftyp.len() + bx.data.len());
                    init.extend_from_slice(&ftyp);
                    init.extend_from_slice(&bx.data);
                    let init = init.freeze();
                    self.init = Some(init.clone());
                    out.push(StreamItem::InitSegment(init));
                    return;
                }
                _ => {
                    // Unexpected pre-init box: forward as media, nobody
                    // is init-gated open yet anyway
                    out.push(StreamItem::Media(bx));
                    return;
                }
            }
        }

        match bx.kind {
            FourCc::MOOF => {
                if self.candidate.is_some() {
                    tracing::debug!("moof without mdat, resetting snapshot candidate");
                }
                self.candidate = Some(BytesMut::from(&bx.data[..]));
                self.fragments_seen += 1;
            }
            FourCc::MDAT => {
                if let Some(mut candidate) = self.candidate.take() {
                    candidate.extend_from_slice(&bx.data);
                    let size = candidate.len();
                    // Judge against the window before this fragment joins
                    // it, so the early-session floor stays meaningful
                    let likely = self.is_likely_keyframe(size);
                    if self.recent_sizes.len() == SIZE_WINDOW {
                        self.recent_sizes.pop_front();
                    }
                    self.recent_sizes.push_back(size);

                    if likely {
                        if let Some(ref init) = self.init {
                            let mut seed = BytesMut::with_capacity(init.len() + size);
                            seed.extend_from_slice(init);
                            seed.extend_from_slice(&candidate);
                            out.push(StreamItem::KeyframeFragment(seed.freeze()));
                        }
                    }
                }
                // Orphan mdat: live delivery only
            }
            _ => {}
        }

        out.push(StreamItem::Media(bx));
    }

    fn is_likely_keyframe(&self, size: usize) -> bool {
        if self.fragments_seen < EARLY_FRAGMENT_COUNT && size > EARLY_KEYFRAME_FLOOR {
            return true;
        }
        let largest = self.recent_sizes.iter().copied().max().unwrap_or(0);
        largest > 0 && size * 10 >= largest * 7
    }
}

impl Default for SegmentClassifier {
    fn default() -> Self {
        Self::new()
    }
}
