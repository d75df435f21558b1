//! Primitive wire encodings
//!
//! Variable-length integers use 7-bit groups, least significant group first,
//! with the high bit marking continuation. Arrays and strings are a `vInt`
//! length followed by the raw bytes; optional ones use a signed (zig-zag)
//! length where `-1` means absent.

use crate::error::{ClientError, Result};
use crate::types::{Expiration, Lifetime};
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub fn write_vint(buf: &mut BytesMut, value: u32) {
    write_vlong(buf, value as u64);
}

pub fn write_vlong(buf: &mut BytesMut, mut value: u64) {
    while value & !0x7F != 0 {
        buf.put_u8(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn write_signed_vint(buf: &mut BytesMut, value: i32) {
    write_vint(buf, ((value << 1) ^ (value >> 31)) as u32);
}

pub fn write_array(buf: &mut BytesMut, bytes: &[u8]) {
    write_vint(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_array(buf, s.as_bytes());
}

pub fn write_optional_array(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            write_signed_vint(buf, bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => write_signed_vint(buf, -1),
    }
}

pub fn write_optional_string(buf: &mut BytesMut, s: Option<&str>) {
    write_optional_array(buf, s.map(str::as_bytes));
}

/// Expiration byte followed by the durations that carry a value
pub fn write_expiration(buf: &mut BytesMut, expiration: &Expiration) {
    let (lifespan_unit, lifespan) = expiration.lifespan.wire_parts();
    let (max_idle_unit, max_idle) = expiration.max_idle.wire_parts();
    buf.put_u8((lifespan_unit << 4) | max_idle_unit);
    if let Some(lifespan) = lifespan {
        write_vlong(buf, lifespan);
    }
    if let Some(max_idle) = max_idle {
        write_vlong(buf, max_idle);
    }
}

fn ensure(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        Err(ClientError::truncated(what))
    } else {
        Ok(())
    }
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1, "byte")?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2, "short")?;
    Ok(buf.get_u16())
}

pub fn read_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4, "int")?;
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8, "long")?;
    Ok(buf.get_i64())
}

pub fn read_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8, "long")?;
    Ok(buf.get_u64())
}

pub fn read_vint(buf: &mut Bytes) -> Result<u32> {
    let value = read_vlong(buf)?;
    u32::try_from(value).map_err(|_| ClientError::Protocol(format!("vInt overflow: {}", value)))
}

pub fn read_vlong(buf: &mut Bytes) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let b = read_u8(buf)?;
        value |= ((b & 0x7F) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ClientError::Protocol("vLong longer than 10 bytes".into()));
        }
    }
}

pub fn read_signed_vint(buf: &mut Bytes) -> Result<i32> {
    let raw = read_vint(buf)?;
    Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
}

pub fn read_array(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_vint(buf)? as usize;
    ensure(buf, len, "array")?;
    Ok(buf.split_to(len))
}

pub fn read_string(buf: &mut Bytes) -> Result<String> {
    let bytes = read_array(buf)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ClientError::Protocol(format!("Invalid UTF-8 string: {}", e)))
}

pub fn read_optional_array(buf: &mut Bytes) -> Result<Option<Bytes>> {
    let len = read_signed_vint(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure(buf, len, "optional array")?;
    Ok(Some(buf.split_to(len)))
}

pub fn read_optional_string(buf: &mut Bytes) -> Result<Option<String>> {
    read_optional_array(buf)?
        .map(|bytes| {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| ClientError::Protocol(format!("Invalid UTF-8 string: {}", e)))
        })
        .transpose()
}

/// Inverse of [`write_expiration`]
pub fn read_expiration(buf: &mut Bytes) -> Result<Expiration> {
    let units = read_u8(buf)?;
    let lifespan = read_lifetime(buf, units >> 4)?;
    let max_idle = read_lifetime(buf, units & 0x0F)?;
    Ok(Expiration::new(lifespan, max_idle))
}

fn read_lifetime(buf: &mut Bytes, unit: u8) -> Result<Lifetime> {
    let lifetime = match unit {
        0x07 => Lifetime::ServerDefault,
        0x08 => Lifetime::Immortal,
        0x00 => Lifetime::After(Duration::from_secs(read_vlong(buf)?)),
        0x01 => Lifetime::After(Duration::from_millis(read_vlong(buf)?)),
        0x02 => Lifetime::After(Duration::from_nanos(read_vlong(buf)?)),
        other => {
            return Err(ClientError::Protocol(format!(
                "Unknown time unit {:#04x}",
                other
            )))
        }
    };
    Ok(lifetime)
}

/// Segment set encoded as a little-endian bitset
pub fn segments_to_bitset(segments: impl IntoIterator<Item = u32>) -> Vec<u8> {
    let mut bits: Vec<u8> = Vec::new();
    for segment in segments {
        let byte = (segment / 8) as usize;
        if bits.len() <= byte {
            bits.resize(byte + 1, 0);
        }
        bits[byte] |= 1 << (segment % 8);
    }
    bits
}

pub fn bitset_to_segments(bits: &[u8]) -> Vec<u32> {
    bits.iter()
        .enumerate()
        .flat_map(|(i, byte)| {
            (0..8u32)
                .filter(move |bit| byte & (1 << bit) != 0)
                .map(move |bit| i as u32 * 8 + bit)
        })
        .collect()
}
