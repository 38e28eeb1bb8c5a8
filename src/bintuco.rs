//! Bintuco is the byte-level codec shared by records, geometry blobs and the
//! field-descriptor block.
//!
//! ## How Bintuco Works
//!
//! - **Primitives:**
//!   Integers and floats are little-endian in their fixed width. `u32` always
//!   uses 4 bytes, `f64` uses 8 bytes, etc.
//!
//! - **Unsigned varint:**
//!   Base-128, 7 value bits per byte, low group first, bit 7 set on every
//!   byte except the last.
//!
//! - **Signed varint:**
//!   Sign-magnitude, not zig-zag. The first byte carries the 6 lowest
//!   magnitude bits, the sign in bit 6 and the continuation in bit 7. The
//!   following bytes carry 7 bits each like the unsigned form.
//!
//! - **Strings:**
//!   A varuint *byte* count, then either UTF-8 bytes or UTF-16LE code units.
//!
//! ```text
//!   -3       ->  [ 43 ]                 0100_0011  (sign, magnitude 3)
//!   100      ->  [ A4 01 ]              1010_0100 0000_0001
//!   "Bob"    ->  [ 03 ] [ 42 6F 62 ]    utf-8
//!   "Bob"    ->  [ 06 ] [ 42 00 6F 00 62 00 ]  utf-16
//! ```
//!
//! ## Decoding
//!
//! Decoding goes through [`ByteReader`], a cursor over a borrowed slice. Every
//! read is bounds checked; running past the end is `CorruptData`.

// src/bintuco.rs

use crate::dberror::DbError;

/// Main Traits
pub trait BintucoEncode {
    fn encode(&self, out: &mut Vec<u8>);
}
pub trait BintucoDecode: Sized {
    fn decode(input: &[u8]) -> Option<(Self, usize)>;
}

pub fn encode_to_vec<T: BintucoEncode>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

pub fn decode_from_slice<T: BintucoDecode>(bytes: &[u8]) -> Result<(T, usize), DbError> {
    T::decode(bytes).ok_or_else(|| DbError::corrupt("unexpected end of buffer"))
}

// ----------- Primitives ------------

macro_rules! encode_primitive {
    ($t:ty, $size:expr, $to_bytes:ident, $from_bytes:ident) => {
        impl BintucoEncode for $t {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.$to_bytes());
            }
        }
        impl BintucoDecode for $t {
            fn decode(input: &[u8]) -> Option<(Self, usize)> {
                if input.len() < $size { return None; }
                let mut arr = [0u8; $size];
                arr.copy_from_slice(&input[0..$size]);
                Some((<$t>::$from_bytes(arr), $size))
            }
        }
    };
}

encode_primitive!(u8, 1, to_le_bytes, from_le_bytes);
encode_primitive!(u16, 2, to_le_bytes, from_le_bytes);
encode_primitive!(u32, 4, to_le_bytes, from_le_bytes);
encode_primitive!(u64, 8, to_le_bytes, from_le_bytes);
encode_primitive!(i16, 2, to_le_bytes, from_le_bytes);
encode_primitive!(i32, 4, to_le_bytes, from_le_bytes);
encode_primitive!(i64, 8, to_le_bytes, from_le_bytes);
encode_primitive!(f32, 4, to_le_bytes, from_le_bytes);
encode_primitive!(f64, 8, to_le_bytes, from_le_bytes);

// ----------- Varints ---------------

pub fn write_var_uint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_var_int(out: &mut Vec<u8>, value: i64) {
    let mut magnitude = value.unsigned_abs();
    let mut first = (magnitude & 0x3F) as u8;
    if value < 0 {
        first |= 0x40;
    }
    magnitude >>= 6;
    if magnitude == 0 {
        out.push(first);
        return;
    }
    out.push(first | 0x80);
    write_var_uint(out, magnitude);
}

pub fn var_uint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

// ----------- Strings ---------------

pub fn write_utf8_string(out: &mut Vec<u8>, s: &str) {
    write_var_uint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_utf16_string(out: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    write_var_uint(out, (units.len() * 2) as u64);
    for u in units {
        u.encode(out);
    }
}

/// Field names in the descriptor block: u8 code unit count, then UTF-16LE.
pub fn write_short_utf16(out: &mut Vec<u8>, s: &str) -> Result<(), DbError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > u8::MAX as usize {
        return Err(DbError::constraint(format!("name '{}' is too long", s)));
    }
    (units.len() as u8).encode(out);
    for u in units {
        u.encode(out);
    }
    Ok(())
}

// ══════════════════════════════════════ READER ══════════════════════════════════════

/// Bounds-checked cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn read<T: BintucoDecode>(&mut self) -> Result<T, DbError> {
        let (v, n) = T::decode(&self.buf[self.pos..]).ok_or_else(|| {
            DbError::corrupt(format!("buffer ends at byte {} while reading a fixed-width value", self.pos))
        })?;
        self.pos += n;
        Ok(v)
    }

    pub fn read_u8(&mut self) -> Result<u8, DbError> {
        self.read::<u8>()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DbError> {
        if len > self.remaining() {
            return Err(DbError::corrupt(format!(
                "need {} bytes at position {}, only {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DbError> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_var_uint(&mut self) -> Result<u64, DbError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && (byte & 0x7F) > 1) {
                return Err(DbError::corrupt("varuint overflows 64 bits"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Varuint that must fit a u32 count.
    pub fn read_var_u32(&mut self) -> Result<u32, DbError> {
        let v = self.read_var_uint()?;
        u32::try_from(v).map_err(|_| DbError::corrupt(format!("count {} does not fit 32 bits", v)))
    }

    pub fn read_var_int(&mut self) -> Result<i64, DbError> {
        let first = self.read_u8()?;
        let negative = first & 0x40 != 0;
        let mut magnitude = (first & 0x3F) as u64;
        if first & 0x80 != 0 {
            let rest = self.read_var_uint()?;
            if rest > (u64::MAX >> 6) {
                return Err(DbError::corrupt("varint overflows 64 bits"));
            }
            magnitude |= rest << 6;
        }
        if negative {
            if magnitude > (i64::MAX as u64) + 1 {
                return Err(DbError::corrupt("varint overflows 64 bits"));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            i64::try_from(magnitude).map_err(|_| DbError::corrupt("varint overflows 64 bits"))
        }
    }

    pub fn read_utf8_string(&mut self) -> Result<String, DbError> {
        let len = self.read_var_uint()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DbError::corrupt(format!("invalid utf-8: {}", e)))
    }

    pub fn read_utf16_string(&mut self) -> Result<String, DbError> {
        let len = self.read_var_uint()? as usize;
        if len % 2 != 0 {
            return Err(DbError::corrupt("odd byte count for utf-16 string"));
        }
        let bytes = self.read_bytes(len)?;
        decode_utf16_units(bytes)
    }

    pub fn read_short_utf16(&mut self) -> Result<String, DbError> {
        let units = self.read_u8()? as usize;
        let bytes = self.read_bytes(units * 2)?;
        decode_utf16_units(bytes)
    }
}

fn decode_utf16_units(bytes: &[u8]) -> Result<String, DbError> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| DbError::corrupt(format!("invalid utf-16: {}", e)))
}
