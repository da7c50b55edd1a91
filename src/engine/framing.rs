//! Message framing over byte streams.
//!
//! Two policies are supported. Length-prefixed messages carry their size in a
//! fixed header and are either complete in the available bytes or the caller is
//! told exactly how many more bytes to gather and where to resume. Payload
//! carryover tracks a message body that continues into later packets, so the next
//! packet starts with leftover payload before any new header.

use super::cursor::{Cursor, Endian};
use super::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Complete { message_len: usize },
    NeedMoreBytes { resume_at: u64, additional: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentController {
    max_message_len: usize,
}

impl SegmentController {
    pub fn new(max_message_len: usize) -> Self {
        Self { max_message_len }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Whether a message of `declared_len` bytes starting at the beginning of the
    /// buffer is fully present.
    pub fn need(&self, buffer_len: usize, declared_len: usize) -> Result<Need, DecodeError> {
        self.need_at(0, buffer_len, declared_len)
    }

    /// As [`need`](Self::need), for a message starting at absolute stream offset `resume_at`.
    pub fn need_at(
        &self,
        resume_at: u64,
        buffer_len: usize,
        declared_len: usize,
    ) -> Result<Need, DecodeError> {
        if declared_len > self.max_message_len {
            return Err(DecodeError::Oversized {
                declared: declared_len,
                limit: self.max_message_len,
            });
        }
        if buffer_len >= declared_len {
            return Ok(Need::Complete {
                message_len: declared_len,
            });
        }
        Ok(Need::NeedMoreBytes {
            resume_at,
            additional: declared_len - buffer_len,
        })
    }
}

/// Layout of a fixed-size header whose length field gives the message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefixed {
    pub header_len: usize,
    pub length_offset: usize,
    /// Width of the length field in bytes, 1 to 4.
    pub length_width: usize,
    pub endian: Endian,
    pub length_mask: u32,
    /// The length field counts the header itself.
    pub includes_header: bool,
}

impl LengthPrefixed {
    /// Total message length (header included) declared by `header`.
    pub fn declared_len(&self, header: &[u8]) -> Result<usize, DecodeError> {
        let cursor = Cursor::new(header);
        let field = cursor.peek_exact(self.length_offset, self.length_width)?;
        let mut raw = 0u32;
        match self.endian {
            Endian::Big => field.iter().for_each(|b| raw = (raw << 8) | u32::from(*b)),
            Endian::Little => field
                .iter()
                .rev()
                .for_each(|b| raw = (raw << 8) | u32::from(*b)),
        }
        let body = (raw & self.length_mask) as usize;
        if self.includes_header {
            if body < self.header_len {
                return Err(DecodeError::malformed(
                    "framing",
                    "declared length shorter than header",
                ));
            }
            Ok(body)
        } else {
            Ok(body.saturating_add(self.header_len))
        }
    }

    /// Frames the message at the start of `buf`, which begins at `stream_offset`.
    pub fn frame(
        &self,
        controller: &SegmentController,
        buf: &[u8],
        stream_offset: u64,
    ) -> Result<Need, DecodeError> {
        if buf.len() < self.header_len {
            return Ok(Need::NeedMoreBytes {
                resume_at: stream_offset,
                additional: self.header_len - buf.len(),
            });
        }
        let declared = self.declared_len(buf)?;
        controller.need_at(stream_offset, buf.len(), declared)
    }

    /// Splits `buf` into every complete message it holds.
    pub fn split<'a>(
        &self,
        controller: &SegmentController,
        buf: &'a [u8],
        stream_offset: u64,
    ) -> Split<'a> {
        let mut messages = Vec::new();
        let mut offset = 0usize;

        while offset < buf.len() {
            let rest = &buf[offset..];
            match self.frame(controller, rest, stream_offset + offset as u64) {
                Ok(Need::Complete { message_len }) => {
                    messages.push((offset, &rest[..message_len]));
                    offset += message_len;
                }
                Ok(Need::NeedMoreBytes {
                    resume_at,
                    additional,
                }) => {
                    return Split {
                        messages,
                        tail: Tail::NeedMoreBytes {
                            resume_at,
                            additional,
                        },
                    };
                }
                Err(error) => {
                    return Split {
                        messages,
                        tail: Tail::Malformed { offset, error },
                    };
                }
            }
        }

        Split {
            messages,
            tail: Tail::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split<'a> {
    /// Offset within the buffer and bytes of each complete message.
    pub messages: Vec<(usize, &'a [u8])>,
    pub tail: Tail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tail {
    Empty,
    NeedMoreBytes { resume_at: u64, additional: usize },
    Malformed { offset: usize, error: DecodeError },
}

/// Payload of a message still owed by later packets of the same direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Carryover {
    remaining: usize,
}

/// How the start of a packet divides between leftover payload and new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarryoverSplit {
    pub payload: usize,
    /// False when the whole packet was leftover payload; header parsing must not start.
    pub header_allowed: bool,
}

impl Carryover {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_pending(&self) -> bool {
        self.remaining > 0
    }

    /// Records that a message declared `declared` payload bytes of which only `seen` were present.
    pub fn set(&mut self, declared: usize, seen: usize) {
        self.remaining = declared.saturating_sub(seen);
    }

    pub fn take(&mut self, available: usize) -> CarryoverSplit {
        let payload = self.remaining.min(available);
        self.remaining -= payload;
        CarryoverSplit {
            payload,
            header_allowed: payload < available,
        }
    }

    pub fn clear(&mut self) {
        self.remaining = 0;
    }
}
