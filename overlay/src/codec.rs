//! On-disk encoding of overlay records.
//!
//! Every record stored by a file-per-record backend starts with a fixed
//! 64-byte header: a 4-byte identifier (`OVDR` for directory records, `OVFL`
//! for file contents), a big-endian u32 format version, and zero padding.
//! The padding is reserved; readers validate only the identifier and
//! version.
//!
//! Directory payloads use a compact varint encoding:
//!
//! ```text
//! varint  entry count
//! repeated per entry, in name order:
//!   varint  name length, then name bytes
//!   varint  mode
//!   varint  inode number (0 = not allocated)
//!   u8      1 if an object id follows, else 0
//!   varint  object id length, then object id bytes   (only if present)
//! ```
//!
//! Key/value backends store the payload without the header.

use bstr::BString;
use bytes::Bytes;

use crate::dir::{OverlayDir, OverlayEntry};
use crate::inode_number::{InodeNumber, MAX_INODE_NUMBER};
use crate::OverlayError;

/// Total header length, identifier and version included.
pub const HEADER_LEN: usize = 64;

/// Header identifier for serialized directory records.
pub const DIR_HEADER: &[u8; 4] = b"OVDR";

/// Header identifier for file contents.
pub const FILE_HEADER: &[u8; 4] = b"OVFL";

/// Current format version, stored big-endian after the identifier.
pub const FORMAT_VERSION: u32 = 1;

/// Builds a 64-byte record header for the given identifier.
pub fn make_header(identifier: &[u8; 4]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(identifier);
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    header
}

/// Validates the header at the start of `data` and returns the payload that
/// follows it.
pub fn validate_header<'a>(
    inode: InodeNumber,
    data: &'a [u8],
    identifier: &[u8; 4],
) -> Result<&'a [u8], OverlayError> {
    if data.len() < HEADER_LEN {
        return Err(OverlayError::DataCorruption {
            inode,
            reason: format!("record too short for header: {} bytes", data.len()),
        });
    }
    if &data[..4] != identifier {
        return Err(OverlayError::DataCorruption {
            inode,
            reason: format!(
                "unexpected header identifier {:02x?}, wanted {:?}",
                &data[..4],
                std::str::from_utf8(identifier).unwrap_or("?"),
            ),
        });
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(OverlayError::UnsupportedVersion(version));
    }
    Ok(&data[HEADER_LEN..])
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(input: &mut &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let (byte, rest) = input.split_first()?;
        *input = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    // More than ten continuation bytes cannot be a valid u64.
    None
}

fn get_bytes<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = usize::try_from(get_varint(input)?).ok()?;
    if input.len() < len {
        return None;
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Some(bytes)
}

/// Serializes a directory record payload (header not included).
pub fn encode_dir(dir: &OverlayDir) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + dir.len() * 48);
    put_varint(&mut out, dir.len() as u64);
    for (name, entry) in dir.entries() {
        put_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name);
        put_varint(&mut out, u64::from(entry.mode));
        put_varint(&mut out, entry.inode.map_or(0, InodeNumber::get));
        match &entry.object_id {
            Some(id) => {
                out.push(1);
                put_varint(&mut out, id.len() as u64);
                out.extend_from_slice(id);
            }
            None => out.push(0),
        }
    }
    out
}

/// Deserializes a directory record payload (header already stripped).
pub fn decode_dir(inode: InodeNumber, payload: &[u8]) -> Result<OverlayDir, OverlayError> {
    let corrupt = |reason: &str| OverlayError::DataCorruption {
        inode,
        reason: reason.to_string(),
    };

    let mut input = payload;
    let count = get_varint(&mut input).ok_or_else(|| corrupt("truncated entry count"))?;
    let mut dir = OverlayDir::new();
    for _ in 0..count {
        let name: BString = get_bytes(&mut input)
            .ok_or_else(|| corrupt("truncated entry name"))?
            .into();
        let raw_mode = get_varint(&mut input).ok_or_else(|| corrupt("truncated mode"))?;
        let mode =
            u32::try_from(raw_mode).map_err(|_| corrupt("mode does not fit in 32 bits"))?;
        let raw_inode = get_varint(&mut input).ok_or_else(|| corrupt("truncated inode number"))?;
        let entry_inode = match raw_inode {
            0 => None,
            n if n <= MAX_INODE_NUMBER => Some(InodeNumber::from_raw(n)),
            _ => return Err(corrupt("inode number out of range")),
        };
        let object_id = match input.split_first() {
            Some((0, rest)) => {
                input = rest;
                None
            }
            Some((1, rest)) => {
                input = rest;
                let id = get_bytes(&mut input).ok_or_else(|| corrupt("truncated object id"))?;
                Some(Bytes::copy_from_slice(id))
            }
            _ => return Err(corrupt("bad object id marker")),
        };
        dir.add(
            name,
            OverlayEntry {
                mode,
                inode: entry_inode,
                object_id,
            },
        )
        .map_err(|e| corrupt(&e.to_string()))?;
    }
    if !input.is_empty() {
        return Err(corrupt("trailing bytes after last entry"));
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::mode;
    use pretty_assertions::assert_eq;

    fn sample_dir() -> OverlayDir {
        let mut dir = OverlayDir::new();
        dir.add(
            "src".into(),
            OverlayEntry {
                mode: mode::DIR | 0o755,
                inode: Some(InodeNumber::from_raw(17)),
                object_id: None,
            },
        )
        .unwrap();
        dir.add(
            "README.md".into(),
            OverlayEntry {
                mode: mode::REG | 0o644,
                inode: Some(InodeNumber::from_raw(18)),
                object_id: Some(Bytes::from_static(b"blob:readme-v1")),
            },
        )
        .unwrap();
        dir.add(
            "link".into(),
            OverlayEntry {
                mode: mode::LNK | 0o777,
                inode: None,
                object_id: Some(Bytes::from_static(b"blob:target")),
            },
        )
        .unwrap();
        dir
    }

    #[test]
    fn dir_roundtrip() {
        let dir = sample_dir();
        let payload = encode_dir(&dir);
        let decoded = decode_dir(InodeNumber::from_raw(5), &payload).unwrap();
        assert_eq!(dir, decoded);
    }

    #[test]
    fn empty_dir_roundtrip() {
        let payload = encode_dir(&OverlayDir::new());
        assert_eq!(payload, vec![0]);
        let decoded = decode_dir(InodeNumber::from_raw(5), &payload).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn header_roundtrip() {
        let header = make_header(DIR_HEADER);
        assert_eq!(header.len(), HEADER_LEN);

        let mut record = header.to_vec();
        record.extend_from_slice(b"payload");
        let payload = validate_header(ROOT, &record, DIR_HEADER).unwrap();
        assert_eq!(payload, b"payload");
    }

    const ROOT: InodeNumber = crate::ROOT_INODE;

    #[test]
    fn header_rejects_wrong_identifier() {
        let record = make_header(FILE_HEADER);
        assert!(matches!(
            validate_header(ROOT, &record, DIR_HEADER),
            Err(OverlayError::DataCorruption { .. })
        ));
    }

    #[test]
    fn header_rejects_short_record() {
        assert!(matches!(
            validate_header(ROOT, b"OVDR", DIR_HEADER),
            Err(OverlayError::DataCorruption { .. })
        ));
    }

    #[test]
    fn header_rejects_future_version() {
        let mut record = make_header(DIR_HEADER);
        record[4..8].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(
            validate_header(ROOT, &record, DIR_HEADER),
            Err(OverlayError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn decode_rejects_truncation_everywhere() {
        let payload = encode_dir(&sample_dir());
        for cut in 1..payload.len() {
            assert!(
                decode_dir(ROOT, &payload[..cut]).is_err(),
                "truncation at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut payload = encode_dir(&sample_dir());
        payload.push(0xff);
        assert!(decode_dir(ROOT, &payload).is_err());
    }

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut slice = buf.as_slice();
            assert_eq!(get_varint(&mut slice), Some(v));
            assert!(slice.is_empty());
        }
    }
}
