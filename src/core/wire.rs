//! # Wire Primitives
//!
//! Big-endian field readers and writers shared by every payload codec, plus
//! the port derivation rules.
//!
//! Strings travel as `[length: i32][length x u16]` where the units are UTF-16
//! code units. Readers report [`MeshError::Truncated`] when the cursor runs
//! dry, which the stream decoder turns into "wait for more bytes".

use crate::error::{MeshError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Read a single byte.
pub fn get_u8(cur: &mut &[u8]) -> Result<u8> {
    if cur.remaining() < 1 {
        return Err(MeshError::Truncated);
    }
    Ok(cur.get_u8())
}

/// Read a big-endian i32.
pub fn get_i32(cur: &mut &[u8]) -> Result<i32> {
    if cur.remaining() < 4 {
        return Err(MeshError::Truncated);
    }
    Ok(cur.get_i32())
}

/// Read a big-endian i64.
pub fn get_i64(cur: &mut &[u8]) -> Result<i64> {
    if cur.remaining() < 8 {
        return Err(MeshError::Truncated);
    }
    Ok(cur.get_i64())
}

/// Read `len` raw bytes.
pub fn get_bytes(cur: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if cur.remaining() < len {
        return Err(MeshError::Truncated);
    }
    let mut out = vec![0u8; len];
    cur.copy_to_slice(&mut out);
    Ok(out)
}

/// Append a length-prefixed UTF-16 string.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_i32(units.len() as i32);
    for unit in units {
        buf.put_u16(unit);
    }
}

/// Read a length-prefixed UTF-16 string.
pub fn get_string(cur: &mut &[u8]) -> Result<String> {
    let len = get_i32(cur)?;
    if len < 0 {
        return Err(MeshError::MalformedString);
    }
    let len = len as usize;
    if cur.remaining() < len * 2 {
        return Err(MeshError::Truncated);
    }
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(cur.get_u16());
    }
    String::from_utf16(&units).map_err(|_| MeshError::MalformedString)
}

/// Port a peer's mesh listener binds, derived from its wire id.
pub fn mesh_port(base_port: u16, init_id: i32, id: i32) -> u16 {
    (i32::from(base_port) + (id - init_id)) as u16
}

/// Port a peer's direct side-channel acceptor binds. Grows downward from
/// `base_port - 2` so the range never collides with mesh listeners.
pub fn direct_port(base_port: u16, init_id: i32, id: i32) -> u16 {
    (i32::from(base_port) - 2 - (id - init_id)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str) -> String {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut cur = &buf[..];
        let out = get_string(&mut cur).expect("decode");
        assert!(cur.is_empty(), "string decode left bytes behind");
        out
    }

    #[test]
    fn string_roundtrip() {
        assert_eq!(roundtrip(""), "");
        assert_eq!(roundtrip("host"), "host");
        assert_eq!(roundtrip("påverka överlag"), "påverka överlag");
    }

    #[test]
    fn string_roundtrip_outside_bmp() {
        // A surrogate pair occupies two UTF-16 units.
        let s = "clef: 𝄞";
        assert_eq!(roundtrip(s), s);
    }

    #[test]
    fn truncated_string_is_reported() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abcdef");
        let short = &buf[..buf.len() - 2];
        let mut cur = short;
        assert!(matches!(get_string(&mut cur), Err(MeshError::Truncated)));
    }

    #[test]
    fn negative_length_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_i32(-4);
        let mut cur = &buf[..];
        assert!(matches!(
            get_string(&mut cur),
            Err(MeshError::MalformedString)
        ));
    }

    #[test]
    fn port_derivation() {
        assert_eq!(mesh_port(25994, 1337, 1337), 25994);
        assert_eq!(mesh_port(25994, 1337, 1338), 25995);
        assert_eq!(direct_port(25994, 1337, 1337), 25992);
        assert_eq!(direct_port(25994, 1337, 1338), 25991);
    }
}
