use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};


/// Number of padding bytes needed to bring `len` up to the next multiple of `divisible_by`
pub fn padding_needed(len: usize, divisible_by: usize) -> usize {
    match len % divisible_by {
        0 => 0,
        m => divisible_by - m,
    }
}

pub fn padded_len(len: usize, divisible_by: usize) -> usize {
    len + padding_needed(len, divisible_by)
}

/// CD-1.1 aligns every variable-length field to 4 bytes
pub fn pad4(len: usize) -> usize {
    padded_len(len, 4)
}

/// Fixed-width CD-1.1 strings may be null terminated (or null padded) and space padded. This
///  removes all null bytes and surrounding whitespace.
pub fn strip_string(raw: &[u8]) -> String {
    let without_nulls: Vec<u8> = raw.iter()
        .copied()
        .filter(|b| *b != 0)
        .collect();
    String::from_utf8_lossy(&without_nulls).trim().to_string()
}


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}", stringify!($ty)));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked big-endian reads for CD-1.1 fields. All CD-1.1 numbers are in network byte order, and
///  running out of bytes is a parse error rather than a panic.
pub trait Cd11BufExt: Buf {
    get_try_impl!(try_get_byte, u8, get_u8);
    get_try_impl!(try_get_i16_be, i16, get_i16);
    get_try_impl!(try_get_u16_be, u16, get_u16);
    get_try_impl!(try_get_i32_be, i32, get_i32);
    get_try_impl!(try_get_u32_be, u32, get_u32);
    get_try_impl!(try_get_i64_be, i64, get_i64);
    get_try_impl!(try_get_f32_be, f32, get_f32);

    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: need {} bytes, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_skip(&mut self, len: usize) -> anyhow::Result<()> {
        if self.remaining() < len {
            bail!("buffer underflow: cannot skip {} bytes, {} remaining", len, self.remaining());
        }
        self.advance(len);
        Ok(())
    }

    fn try_get_fixed_string(&mut self, len: usize) -> anyhow::Result<String> {
        let raw = self.try_get_bytes(len)?;
        Ok(strip_string(&raw))
    }

    /// reads an `i32` length field, rejecting negative values
    fn try_get_length(&mut self, field: &str) -> anyhow::Result<usize> {
        let len = self.try_get_i32_be()?;
        if len < 0 {
            bail!("{} must be non-negative, was {}", field, len);
        }
        Ok(len as usize)
    }

    /// reads `len` bytes followed by padding to the next 4 byte boundary, returning the unpadded
    ///  bytes
    fn try_get_padded_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        let value = self.try_get_bytes(len)?;
        self.try_skip(padding_needed(len, 4))?;
        Ok(value)
    }

    /// length-prefixed padded field: `size:i32` followed by `pad4(size)` bytes
    fn try_get_sized_padded_bytes(&mut self, field: &str) -> anyhow::Result<Bytes> {
        let len = self.try_get_length(field)?;
        self.try_get_padded_bytes(len)
    }
}

pub trait Cd11BufMutExt: BufMut {
    fn put_fixed_string(&mut self, s: &str, len: usize) -> anyhow::Result<()> {
        if s.len() > len {
            bail!("string '{}' is longer than its field width of {} bytes", s, len);
        }
        self.put_slice(s.as_bytes());
        self.put_bytes(0, len - s.len());
        Ok(())
    }

    fn put_padded_bytes(&mut self, value: &[u8]) {
        self.put_slice(value);
        self.put_bytes(0, padding_needed(value.len(), 4));
    }

    fn put_sized_padded_bytes(&mut self, value: &[u8]) -> anyhow::Result<()> {
        let len: i32 = value.len().try_into()
            .map_err(|_| anyhow!("field of {} bytes exceeds the CD-1.1 size limit", value.len()))?;
        self.put_i32(len);
        self.put_padded_bytes(value);
        Ok(())
    }
}

impl <T: Buf> Cd11BufExt for T {
}

impl <T: BufMut> Cd11BufMutExt for T {
}
