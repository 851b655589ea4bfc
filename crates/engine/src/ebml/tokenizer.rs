// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Push-based, incremental EBML tokenizer.
//!
//! Bytes arrive in arbitrary-sized chunks via [`Tokenizer::feed`]; each
//! call to [`Tokenizer::next_event`] returns the next fully-buffered
//! [`Event`] or `Ok(None)` if more input is needed. The tokenizer never
//! blocks and never looks ahead past what has actually been fed.

use bytes::{Bytes, BytesMut};

use webmcast_core::error::EngineError;

use super::ids::{self, ElementClass, ElementId};
use super::vint;

/// Default cap on a single buffered leaf element (a Cluster's SimpleBlock,
/// most commonly). Chosen generously above any single video frame a live
/// encoder should plausibly produce.
pub const DEFAULT_MAX_ELEMENT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Known(u64),
    Unknown,
}

/// One parsed unit of input. `header` / `raw` slices are zero-copy views
/// into the tokenizer's internal buffer (via [`bytes::Bytes`] refcounting).
#[derive(Debug, Clone)]
pub enum Event {
    MasterStart {
        id: ElementId,
        size: Size,
        header: Bytes,
    },
    MasterEnd {
        id: ElementId,
    },
    /// A complete opaque element: `raw` is the full id+size+body encoding;
    /// `header_len` marks where the body starts within it.
    Leaf {
        id: ElementId,
        header_len: usize,
        raw: Bytes,
    },
}

struct OpenMaster {
    id: ElementId,
    size: Size,
    header_len: u64,
    consumed: u64,
}

pub struct Tokenizer {
    buf: BytesMut,
    stack: Vec<OpenMaster>,
    max_element_size: u64,
    eof: bool,
}

impl Tokenizer {
    pub fn new(max_element_size: u64) -> Self {
        Self {
            buf: BytesMut::new(),
            stack: Vec::new(),
            max_element_size,
            eof: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Signals that no more input will ever arrive. Any element left
    /// partially buffered after this is a truncation error.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Returns the next fully-buffered event, or `Ok(None)` if more input
    /// is required to make progress.
    pub fn next_event(&mut self) -> Result<Option<Event>, EngineError> {
        loop {
            if let Some(top) = self.stack.last() {
                if let Size::Known(size) = top.size {
                    if top.consumed >= size {
                        let closed = self.close_top();
                        return Ok(Some(Event::MasterEnd { id: closed.id }));
                    }
                }
            }

            let Some((id, header_len, size)) = self.peek_header()? else {
                if self.eof && !self.buf.is_empty() {
                    return Err(EngineError::MalformedEbml(
                        "truncated element header at end of stream".into(),
                    ));
                }
                return Ok(None);
            };

            if let Some(top) = self.stack.last() {
                if top.size == Size::Unknown && !ids::is_valid_child(top.id, id) {
                    let closed = self.close_top();
                    return Ok(Some(Event::MasterEnd { id: closed.id }));
                }
            }

            match ids::classify(id) {
                ElementClass::Master => {
                    let header = self.buf.split_to(header_len).freeze();
                    self.bump_top(header_len as u64);
                    self.stack.push(OpenMaster {
                        id,
                        size,
                        header_len: header_len as u64,
                        consumed: 0,
                    });
                    return Ok(Some(Event::MasterStart { id, size, header }));
                }
                ElementClass::Leaf => {
                    let Size::Known(body_len) = size else {
                        return Err(EngineError::MalformedEbml(format!(
                            "leaf element {id:#x} declared unknown length"
                        )));
                    };
                    if body_len > self.max_element_size {
                        return Err(EngineError::MalformedEbml(format!(
                            "element {id:#x} size {body_len} exceeds cap {}",
                            self.max_element_size
                        )));
                    }
                    let total = header_len as u64 + body_len;
                    if (self.buf.len() as u64) < total {
                        if self.eof {
                            return Err(EngineError::MalformedEbml(
                                "truncated element body at end of stream".into(),
                            ));
                        }
                        return Ok(None);
                    }
                    let raw = self.buf.split_to(total as usize).freeze();
                    self.bump_top(total);
                    return Ok(Some(Event::Leaf {
                        id,
                        header_len,
                        raw,
                    }));
                }
            }
        }
    }

    fn bump_top(&mut self, n: u64) {
        if let Some(top) = self.stack.last_mut() {
            top.consumed += n;
        }
    }

    fn close_top(&mut self) -> OpenMaster {
        let closed = self.stack.pop().expect("caller already checked stack.last()");
        self.bump_top(closed.header_len + closed.consumed);
        closed
    }

    /// Peeks the next element's (id, header length, size) without
    /// consuming anything. `None` means not enough bytes are buffered yet.
    fn peek_header(&self) -> Result<Option<(ElementId, usize, Size)>, EngineError> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };
        let Some(id_len) = vint::vint_length(first) else {
            return Err(EngineError::MalformedEbml("invalid element id VINT".into()));
        };
        if self.buf.len() < id_len {
            return Ok(None);
        }
        let Some(id) = vint::decode_id(&self.buf[..id_len]) else {
            return Ok(None);
        };

        let Some(&size_first) = self.buf.get(id_len) else {
            return Ok(None);
        };
        let Some(size_len) = vint::vint_length(size_first) else {
            return Err(EngineError::MalformedEbml("invalid element size VINT".into()));
        };
        let header_len = id_len + size_len;
        if self.buf.len() < header_len {
            return Ok(None);
        }
        let Some(size) = vint::decode_size(&self.buf[id_len..header_len]) else {
            return Ok(None);
        };
        let size = match size {
            Some(n) => Size::Known(n),
            None => Size::Unknown,
        };
        Ok(Some((id, header_len, size)))
    }
}
