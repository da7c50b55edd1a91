use super::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

macro_rules! read_int {
    ($read:ident, $peek:ident, $ty:ty) => {
        pub fn $read(&mut self, endian: Endian) -> Result<$ty, DecodeError> {
            let value = self.$peek(0, endian)?;
            self.pos += size_of::<$ty>();
            Ok(value)
        }

        pub fn $peek(&self, offset: usize, endian: Endian) -> Result<$ty, DecodeError> {
            let bytes = self.peek_exact(offset, size_of::<$ty>())?;
            let mut raw = [0u8; size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(match endian {
                Endian::Big => <$ty>::from_be_bytes(raw),
                Endian::Little => <$ty>::from_le_bytes(raw),
            })
        }
    };
}

/// Bounds-checked reader over a packet buffer. Every read either succeeds or
/// reports `InsufficientData` without moving the cursor.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn with_pos(data: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        if pos > data.len() {
            return Err(DecodeError::InsufficientData {
                needed: pos,
                available: data.len(),
            });
        }
        Ok(Self { data, pos })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub fn advance(&mut self, bytes: usize) -> Result<(), DecodeError> {
        self.peek_exact(0, bytes)?;
        self.pos += bytes;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek_u8(0)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn peek_u8(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.peek_exact(offset, 1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_ne_bytes([self.read_u8()?]))
    }

    read_int!(read_u16, peek_u16, u16);
    read_int!(read_u32, peek_u32, u32);
    read_int!(read_u64, peek_u64, u64);
    read_int!(read_i16, peek_i16, i16);
    read_int!(read_i32, peek_i32, i32);
    read_int!(read_i64, peek_i64, i64);

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let out = self.peek_exact(0, len)?;
        self.pos += len;
        Ok(out)
    }

    /// Reads a NUL-terminated string of at most `max` bytes, not counting the
    /// terminator, and consumes the terminator.
    pub fn read_cstring(&mut self, max: usize) -> Result<&'a [u8], DecodeError> {
        let rest = self.rest();
        let window = &rest[..rest.len().min(max.saturating_add(1))];
        match window.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.pos += nul + 1;
                Ok(&window[..nul])
            }
            None if rest.len() <= max => Err(DecodeError::InsufficientData {
                needed: rest.len() + 1,
                available: rest.len(),
            }),
            None => Err(DecodeError::malformed("cstring", "string exceeds maximum length")),
        }
    }

    pub fn peek_exact(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        let start = self.pos.saturating_add(offset);
        let insufficient = || DecodeError::InsufficientData {
            needed: offset.saturating_add(len),
            available: self.remaining(),
        };
        let end = start.checked_add(len).ok_or_else(insufficient)?;
        self.data.get(start..end).ok_or_else(insufficient)
    }
}
