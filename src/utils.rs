//! Utility functions

use crate::error::{Result, VdsError};
use crate::types::Element;
use bytes::{Buf, BufMut};

/// Take a little-endian u8 from the front of `buf`
pub fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

/// Take a little-endian u32 from the front of `buf`
pub fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32_le())
}

/// Take a little-endian u64 from the front of `buf`
pub fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Take a little-endian unsigned integer of `width` bytes (2, 4 or 8)
pub fn take_uint(buf: &mut &[u8], width: usize) -> Result<u64> {
    ensure_remaining(buf, width)?;
    Ok(buf.get_uint_le(width))
}

/// Take a zero-terminated string
pub fn take_cstr(buf: &mut &[u8]) -> Result<String> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| VdsError::Codec("unterminated string".to_string()))?;
    let s = std::str::from_utf8(&buf[..nul])
        .map_err(|e| VdsError::Codec(format!("string is not UTF-8: {}", e)))?
        .to_string();
    buf.advance(nul + 1);
    Ok(s)
}

/// Append `value` as a little-endian integer of `width` bytes
pub fn put_uint(out: &mut Vec<u8>, value: u64, width: usize) -> Result<()> {
    if width < 8 && value >> (8 * width) != 0 {
        return Err(VdsError::Codec(format!(
            "value {} does not fit in {} bytes",
            value, width
        )));
    }
    out.put_uint_le(value, width);
    Ok(())
}

/// Append a zero-terminated string
pub fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn ensure_remaining(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(VdsError::Codec(format!(
            "truncated input: need {} bytes, {} left",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Convert little-endian bytes to typed data
pub fn bytes_to_typed_data<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::DATA_TYPE.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(VdsError::BadValue(
            "Byte length not aligned with data type size".to_string(),
        ));
    }

    Ok(bytes.chunks_exact(size).map(T::read_le).collect())
}

/// Convert typed data to little-endian bytes
pub fn typed_data_to_bytes<T: Element>(data: &[T]) -> Vec<u8> {
    let size = T::DATA_TYPE.size_in_bytes();
    let mut bytes = vec![0u8; data.len() * size];

    for (value, out) in data.iter().zip(bytes.chunks_exact_mut(size)) {
        value.write_le(out);
    }

    bytes
}

/// Number of decimal digits needed to print `value`
pub fn digits10(mut value: u64) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

/// Smallest power-of-two capacity of at least `floor` that holds `needed`
pub fn grow_capacity(needed: usize, floor: usize) -> usize {
    debug_assert!(floor.is_power_of_two());
    needed.max(floor).next_power_of_two()
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_conversion() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let bytes = typed_data_to_bytes(&data);
        assert_eq!(bytes.len(), data.len() * 4);

        let recovered: Vec<f32> = bytes_to_typed_data(&bytes).unwrap();
        assert_eq!(data, recovered);
        assert!(bytes_to_typed_data::<f32>(&bytes[..5]).is_err());
    }

    #[test]
    fn test_cursor_helpers() {
        let mut out = Vec::new();
        put_uint(&mut out, 0x0102, 2).unwrap();
        put_cstr(&mut out, "abc");
        out.extend_from_slice(&7u32.to_le_bytes());
        assert!(put_uint(&mut out, 0x1_0000, 2).is_err());

        let mut buf = &out[..];
        assert_eq!(take_uint(&mut buf, 2).unwrap(), 0x0102);
        assert_eq!(take_cstr(&mut buf).unwrap(), "abc");
        assert_eq!(take_u32(&mut buf).unwrap(), 7);
        assert!(matches!(take_u8(&mut buf), Err(VdsError::Codec(_))));

        let mut unterminated: &[u8] = b"abc";
        assert!(take_cstr(&mut unterminated).is_err());
    }

    #[test]
    fn test_digits10() {
        assert_eq!(digits10(0), 1);
        assert_eq!(digits10(9), 1);
        assert_eq!(digits10(10), 2);
        assert_eq!(digits10(12345), 5);
        assert_eq!(digits10(u64::MAX), 20);
    }

    #[test]
    fn test_grow_capacity() {
        assert_eq!(grow_capacity(1, 128), 128);
        assert_eq!(grow_capacity(128, 128), 128);
        assert_eq!(grow_capacity(129, 128), 256);
        assert_eq!(grow_capacity(600, 128), 1024);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
