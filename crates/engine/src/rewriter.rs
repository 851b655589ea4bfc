// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Matroska rewriting: turning a publisher's raw byte stream into a frozen
//! init segment plus a sequence of [`ClusterRecord`]s, and retiming each
//! Cluster per subscriber.
//!
//! The publisher side never buffers more than one Cluster at a time. The
//! header blob (everything up to and including Tracks, with SeekHead and
//! Cues stripped and Segment's size rewritten to unknown) is frozen once
//! and cloned cheaply into every subscriber's stream.

use std::ops::Range;

use bytes::{Bytes, BytesMut};

use webmcast_core::error::{EngineError, Result};

use crate::ebml::{self, ids, tokenizer::Size, Event, Tokenizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectHeader,
    InHeader,
    InBody,
    Done,
    /// A new publisher has reclaimed the channel after the previous one
    /// finished. The frozen `header_blob` is kept as-is; everything the
    /// new publisher sends up to its own first Cluster (EBML Header,
    /// Segment, SeekHead/Info/Tracks) is parsed only to track structure
    /// and then discarded, since existing and new subscribers alike keep
    /// seeing the original header.
    Reclaiming,
}

/// A fully-assembled Cluster: its complete raw bytes (Cluster id+size
/// header plus every child, verbatim from the publisher) plus the bits of
/// metadata needed to retime and fan it out.
#[derive(Debug, Clone)]
pub struct ClusterRecord {
    pub bytes: Bytes,
    pub timecode: u64,
    pub is_keyframe: bool,
    header_len: usize,
    declared_size: Size,
    timecode_span: Range<usize>,
}

pub struct PublisherRewriter {
    tokenizer: Tokenizer,
    max_element_size: u64,
    state: State,
    header: BytesMut,
    segment_header_span: Option<Range<usize>>,
    seen_tracks: bool,
    header_blob: Option<Bytes>,
    current: Option<PartialCluster>,
}

struct PartialCluster {
    bytes: BytesMut,
    header_len: usize,
    declared_size: Size,
    child_count: usize,
    timecode: Option<u64>,
    timecode_span: Option<Range<usize>>,
    first_block_keyframe: Option<bool>,
}

impl PartialCluster {
    fn new(header: Bytes, declared_size: Size) -> Self {
        let mut bytes = BytesMut::with_capacity(header.len());
        let header_len = header.len();
        bytes.extend_from_slice(&header);
        Self {
            bytes,
            header_len,
            declared_size,
            child_count: 0,
            timecode: None,
            timecode_span: None,
            first_block_keyframe: None,
        }
    }

    fn push_raw(&mut self, raw: &[u8]) {
        self.bytes.extend_from_slice(raw);
    }

    fn observe_leaf(&mut self, id: ebml::ElementId, header_len: usize, raw: &Bytes) -> Result<()> {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(raw);

        if self.child_count == 0 {
            if id != ids::ID_TIMECODE {
                return Err(EngineError::MalformedEbml(
                    "Cluster did not start with a Timecode element".into(),
                ));
            }
            self.timecode = Some(ebml::encode::decode_uint(&raw[header_len..]));
            self.timecode_span = Some(start..start + raw.len());
        } else if self.first_block_keyframe.is_none() && id == ids::ID_SIMPLE_BLOCK {
            self.first_block_keyframe = Some(simple_block_is_track1_keyframe(&raw[header_len..]));
        }
        self.child_count += 1;
        Ok(())
    }

    fn finish(self) -> Result<ClusterRecord> {
        let timecode = self
            .timecode
            .ok_or_else(|| EngineError::MalformedEbml("Cluster had no children".into()))?;
        let timecode_span = self.timecode_span.expect("set alongside timecode");
        Ok(ClusterRecord {
            bytes: self.bytes.freeze(),
            timecode,
            is_keyframe: self.first_block_keyframe.unwrap_or(false),
            header_len: self.header_len,
            declared_size: self.declared_size,
            timecode_span,
        })
    }
}

/// Reads the track number and keyframe flag out of a SimpleBlock body
/// (track-number VINT, 2-byte relative timecode, flags byte, frame data).
fn simple_block_is_track1_keyframe(body: &[u8]) -> bool {
    let Some((track, keyframe)) = (|| {
        let track_len = ebml::vint::vint_length(*body.first()?)?;
        let track_num = ebml::vint::decode_size(&body[..track_len])?.unwrap_or(u64::MAX);
        let flags = *body.get(track_len + 2)?;
        Some((track_num, flags & 0x80 != 0))
    })() else {
        return false;
    };
    track == 1 && keyframe
}

impl PublisherRewriter {
    pub fn new(max_element_size: u64) -> Self {
        Self {
            tokenizer: Tokenizer::new(max_element_size),
            max_element_size,
            state: State::ExpectHeader,
            header: BytesMut::new(),
            segment_header_span: None,
            seen_tracks: false,
            header_blob: None,
            current: None,
        }
    }

    /// The frozen header blob, available once the first Cluster has begun.
    pub fn header_blob(&self) -> Option<&Bytes> {
        self.header_blob.as_ref()
    }

    /// Prepares the rewriter for a new publisher reclaiming the channel.
    /// The frozen `header_blob` (if any) is preserved untouched; parsing
    /// state is reset so the new publisher's own EBML Header/Segment/Tracks
    /// are consumed and discarded up to its first Cluster, at which point
    /// Clusters resume flowing to existing slots under the original header.
    pub fn reset_for_reclaim(&mut self) {
        self.tokenizer = Tokenizer::new(self.max_element_size);
        self.state = if self.header_blob.is_some() {
            State::Reclaiming
        } else {
            State::ExpectHeader
        };
        self.header.clear();
        self.segment_header_span = None;
        self.seen_tracks = false;
        self.current = None;
    }

    /// Feeds a chunk of publisher bytes through the tokenizer and the
    /// rewriter's own state machine, returning every Cluster that became
    /// complete as a result.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ClusterRecord>> {
        self.tokenizer.feed(chunk);
        let mut out = Vec::new();
        while let Some(event) = self.tokenizer.next_event()? {
            self.handle_event(event, &mut out)?;
        }
        Ok(out)
    }

    /// Signals clean end of publisher input: flushes the tokenizer and any
    /// in-flight Cluster (a live stream's final Cluster is very often still
    /// open, with unknown length, when the connection ends).
    pub fn finish(&mut self) -> Result<Vec<ClusterRecord>> {
        self.tokenizer.finish();
        let mut out = Vec::new();
        while let Some(event) = self.tokenizer.next_event()? {
            self.handle_event(event, &mut out)?;
        }
        if let Some(partial) = self.current.take() {
            out.push(partial.finish()?);
        }
        self.state = State::Done;
        Ok(out)
    }

    fn handle_event(&mut self, event: Event, out: &mut Vec<ClusterRecord>) -> Result<()> {
        match self.state {
            State::ExpectHeader => self.handle_expect_header(event),
            State::InHeader => self.handle_in_header(event),
            State::InBody => self.handle_body_event(event, out),
            State::Done => Ok(()),
            State::Reclaiming => self.handle_reclaiming_event(event),
        }
    }

    /// Consumes a reclaiming publisher's re-sent init segment without
    /// writing it into `header_blob`, then switches to `InBody` the moment
    /// its first Cluster begins.
    fn handle_reclaiming_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Leaf { id, .. } if id == ids::ID_EBML_HEADER => Ok(()),
            Event::MasterStart { id, .. } if id == ids::ID_SEGMENT => Ok(()),
            Event::MasterStart { id, header, size } if id == ids::ID_CLUSTER => {
                self.state = State::InBody;
                self.current = Some(PartialCluster::new(header, size));
                Ok(())
            }
            Event::MasterStart { id, .. } => Err(EngineError::MalformedEbml(format!(
                "unexpected nested master {id:#x} before any Cluster"
            ))),
            Event::MasterEnd { id } if id == ids::ID_SEGMENT => Err(EngineError::MalformedEbml(
                "Segment ended before any Cluster was published".into(),
            )),
            Event::MasterEnd { .. } => Ok(()),
            Event::Leaf { .. } => Ok(()),
        }
    }

    fn handle_expect_header(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Leaf { id, raw, .. } if id == ids::ID_EBML_HEADER => {
                self.header.extend_from_slice(&raw);
                self.state = State::InHeader;
                Ok(())
            }
            _ => Err(EngineError::MalformedEbml(
                "stream did not start with an EBML Header".into(),
            )),
        }
    }

    fn handle_in_header(&mut self, event: Event) -> Result<()> {
        match event {
            Event::MasterStart { id, header, .. } if id == ids::ID_SEGMENT => {
                self.segment_header_span = Some(self.header.len()..self.header.len() + header.len());
                self.header.extend_from_slice(&header);
                Ok(())
            }
            Event::MasterStart { id, size, header } if id == ids::ID_CLUSTER => {
                self.freeze_header()?;
                self.state = State::InBody;
                self.current = Some(PartialCluster::new(header, size));
                Ok(())
            }
            Event::MasterStart { id, .. } => Err(EngineError::MalformedEbml(format!(
                "unexpected nested master {id:#x} before any Cluster"
            ))),
            Event::MasterEnd { id } if id == ids::ID_SEGMENT => Err(EngineError::MalformedEbml(
                "Segment ended before any Cluster was published".into(),
            )),
            Event::MasterEnd { .. } => Ok(()),
            Event::Leaf { id, raw, .. } => {
                if id == ids::ID_TRACKS {
                    self.seen_tracks = true;
                }
                if id == ids::ID_SEEK_HEAD || id == ids::ID_CUES {
                    // Stripped: byte offsets they reference are no longer valid
                    // once the Segment size is rewritten to unknown.
                } else {
                    self.header.extend_from_slice(&raw);
                }
                Ok(())
            }
        }
    }

    fn handle_body_event(&mut self, event: Event, out: &mut Vec<ClusterRecord>) -> Result<()> {
        match event {
            Event::MasterStart { id, header, size } if id == ids::ID_CLUSTER => {
                self.current = Some(PartialCluster::new(header, size));
                Ok(())
            }
            Event::MasterStart { id, header, .. } if id == ids::ID_BLOCK_GROUP => {
                let cur = self.current_mut()?;
                cur.push_raw(&header);
                Ok(())
            }
            Event::MasterEnd { id } if id == ids::ID_BLOCK_GROUP => {
                self.current_mut().map(|_| ())
            }
            Event::MasterEnd { id } if id == ids::ID_CLUSTER => {
                let partial = self
                    .current
                    .take()
                    .ok_or_else(|| EngineError::MalformedEbml("Cluster close without open".into()))?;
                out.push(partial.finish()?);
                Ok(())
            }
            Event::MasterEnd { id } => Err(EngineError::MalformedEbml(format!(
                "unexpected master end for {id:#x} inside Segment body"
            ))),
            Event::Leaf { id, header_len, raw } => {
                let cur = self.current_mut()?;
                cur.observe_leaf(id, header_len, &raw)
            }
            Event::MasterStart { id, .. } => Err(EngineError::MalformedEbml(format!(
                "unexpected master {id:#x} inside Segment body"
            ))),
        }
    }

    fn current_mut(&mut self) -> Result<&mut PartialCluster> {
        self.current
            .as_mut()
            .ok_or_else(|| EngineError::MalformedEbml("element outside any Cluster".into()))
    }

    fn freeze_header(&mut self) -> Result<()> {
        if !self.seen_tracks {
            return Err(EngineError::MalformedEbml(
                "publisher sent a Cluster before Tracks".into(),
            ));
        }
        let span = self
            .segment_header_span
            .clone()
            .ok_or_else(|| EngineError::MalformedEbml("Cluster arrived before Segment".into()))?;

        let unknown_header = ebml::encode::segment_header_unknown_length();
        let mut rebuilt = BytesMut::with_capacity(self.header.len());
        rebuilt.extend_from_slice(&self.header[..span.start]);
        rebuilt.extend_from_slice(&unknown_header);
        rebuilt.extend_from_slice(&self.header[span.end..]);
        self.header_blob = Some(rebuilt.freeze());
        Ok(())
    }
}

/// Produces the bytes a subscriber should receive for `record`, with its
/// Timecode shifted by `offset` (saturating: a reclaimed stream's first
/// post-takeover Cluster is not guaranteed to have a larger timecode than
/// what preceded it) and, if necessary, the Cluster's own declared size
/// patched to match the new byte length.
pub fn retimed_cluster(record: &ClusterRecord, offset: u64) -> Bytes {
    let new_tc = record.timecode.saturating_sub(offset);
    let new_tc_elem = ebml::encode::encode_uint_element(ids::ID_TIMECODE, new_tc);
    let old_tc_len = record.timecode_span.end - record.timecode_span.start;
    let delta = new_tc_elem.len() as i64 - old_tc_len as i64;

    let new_header: Vec<u8> = match record.declared_size {
        Size::Known(old_size) => {
            let new_size = (old_size as i64 + delta).max(0) as u64;
            let mut h = ebml::vint::encode_id(ids::ID_CLUSTER);
            h.extend(ebml::vint::encode_size(new_size));
            h
        }
        Size::Unknown => record.bytes[..record.header_len].to_vec(),
    };

    let mut out = BytesMut::with_capacity((record.bytes.len() as i64 + delta).max(0) as usize);
    out.extend_from_slice(&new_header);
    out.extend_from_slice(&record.bytes[record.header_len..record.timecode_span.start]);
    out.extend_from_slice(&new_tc_elem);
    out.extend_from_slice(&record.bytes[record.timecode_span.end..]);
    out.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberState {
    NeedsHeader,
    WaitKeyframe,
    Streaming { timecode_offset: u64 },
}

/// Per-subscriber half of the rewriter: decides when a newly-attached slot
/// starts receiving Clusters (on the next keyframe) and retimes every
/// Cluster it forwards so its stream starts at timecode zero.
pub struct SubscriberRewriter {
    state: SubscriberState,
}

impl SubscriberRewriter {
    pub fn new() -> Self {
        Self {
            state: SubscriberState::NeedsHeader,
        }
    }

    /// Attempts to deliver the header blob. A subscriber that joins before
    /// any publisher data has arrived stays in `NeedsHeader` (so the
    /// channel can retry this once a header is actually frozen) instead of
    /// silently skipping straight to `WaitKeyframe` with nothing sent.
    pub fn on_attach(&mut self, header_blob: Option<&Bytes>) -> Option<Bytes> {
        if self.state != SubscriberState::NeedsHeader {
            return None;
        }
        let header = header_blob?;
        self.state = SubscriberState::WaitKeyframe;
        Some(header.clone())
    }

    /// Feeds one newly-published Cluster through this slot's state
    /// machine. Returns the bytes to send for it, if any.
    pub fn on_cluster(&mut self, record: &ClusterRecord) -> Option<Bytes> {
        match self.state {
            SubscriberState::NeedsHeader => None,
            SubscriberState::WaitKeyframe => {
                if record.is_keyframe {
                    self.state = SubscriberState::Streaming {
                        timecode_offset: record.timecode,
                    };
                    Some(retimed_cluster(record, record.timecode))
                } else {
                    None
                }
            }
            SubscriberState::Streaming { timecode_offset } => {
                Some(retimed_cluster(record, timecode_offset))
            }
        }
    }

    /// Drops back to waiting for the next keyframe, e.g. after this slot's
    /// queue force-dropped a Cluster and needs to resynchronize.
    pub fn reset_to_wait_keyframe(&mut self) {
        if self.state != SubscriberState::NeedsHeader {
            self.state = SubscriberState::WaitKeyframe;
        }
    }
}

impl Default for SubscriberRewriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::vint;

    fn leaf(id: u64, body: &[u8]) -> Vec<u8> {
        let mut out = vint::encode_id(id);
        out.extend(vint::encode_size(body.len() as u64));
        out.extend_from_slice(body);
        out
    }

    fn simple_block(track: u8, keyframe: bool) -> Vec<u8> {
        let flags = if keyframe { 0x80 } else { 0x00 };
        leaf(ids::ID_SIMPLE_BLOCK, &[0x80 | track, 0x00, 0x00, flags])
    }

    fn sample_stream() -> Vec<u8> {
        let mut cluster1 = vint::encode_id(ids::ID_CLUSTER);
        cluster1.extend(vint::unknown_size());
        cluster1.extend(leaf(ids::ID_TIMECODE, &[10]));
        cluster1.extend(simple_block(1, false));

        let mut cluster2 = vint::encode_id(ids::ID_CLUSTER);
        cluster2.extend(vint::unknown_size());
        cluster2.extend(leaf(ids::ID_TIMECODE, &[20]));
        cluster2.extend(simple_block(1, true));

        let mut segment = vint::encode_id(ids::ID_SEGMENT);
        segment.extend(vint::unknown_size());
        segment.extend(leaf(ids::ID_SEEK_HEAD, b"seek"));
        segment.extend(leaf(ids::ID_INFO, b"info"));
        segment.extend(leaf(ids::ID_TRACKS, b"tracks"));
        segment.extend(cluster1);
        segment.extend(cluster2);

        let mut stream = leaf(ids::ID_EBML_HEADER, b"ebml");
        stream.extend(segment);
        stream
    }

    #[test]
    fn header_blob_excludes_seek_head_and_rewrites_segment_size() {
        let mut rw = PublisherRewriter::new(ebml::DEFAULT_MAX_ELEMENT_SIZE);
        let clusters = rw.feed(&sample_stream()).unwrap();
        assert_eq!(clusters.len(), 2);

        let header = rw.header_blob().unwrap();
        assert!(!header.windows(4).any(|w| w == b"seek"));
        assert!(header.windows(4).any(|w| w == b"info"));
        assert!(header.windows(6).any(|w| w == b"tracks"));

        // Segment size should now decode as unknown.
        let id_len = vint::vint_length(header[0]).unwrap();
        let size_bytes = &header[id_len..id_len + 8];
        assert_eq!(vint::decode_size(size_bytes), Some(None));
    }

    #[test]
    fn keyframe_detection_and_subscriber_retiming() {
        let mut rw = PublisherRewriter::new(ebml::DEFAULT_MAX_ELEMENT_SIZE);
        let clusters = rw.feed(&sample_stream()).unwrap();
        assert!(!clusters[0].is_keyframe);
        assert!(clusters[1].is_keyframe);

        let mut sub = SubscriberRewriter::new();
        assert!(sub.on_attach(rw.header_blob()).is_some());
        // Not a keyframe: subscriber stays silent.
        assert!(sub.on_cluster(&clusters[0]).is_none());
        // Keyframe: subscriber starts here, retimed to zero.
        let bytes = sub.on_cluster(&clusters[1]).unwrap();
        assert!(bytes.windows(2).any(|w| w == [0xE7, 0x81]));
    }

    #[test]
    fn clean_eof_flushes_the_trailing_open_cluster() {
        let stream = sample_stream();
        let (head, tail) = stream.split_at(stream.len() - 3);
        let mut rw = PublisherRewriter::new(ebml::DEFAULT_MAX_ELEMENT_SIZE);
        let mut clusters = rw.feed(head).unwrap();
        assert_eq!(clusters.len(), 1);
        clusters.extend(rw.feed(tail).unwrap());
        let flushed = rw.finish().unwrap();
        assert_eq!(clusters.len() + flushed.len(), 2);
    }

    #[test]
    fn cluster_before_tracks_is_rejected() {
        let mut segment = vint::encode_id(ids::ID_SEGMENT);
        segment.extend(vint::unknown_size());
        let mut cluster = vint::encode_id(ids::ID_CLUSTER);
        cluster.extend(vint::unknown_size());
        cluster.extend(leaf(ids::ID_TIMECODE, &[0]));
        segment.extend(cluster);

        let mut stream = leaf(ids::ID_EBML_HEADER, b"ebml");
        stream.extend(segment);

        let mut rw = PublisherRewriter::new(ebml::DEFAULT_MAX_ELEMENT_SIZE);
        assert!(matches!(rw.feed(&stream), Err(EngineError::MalformedEbml(_))));
    }
}
