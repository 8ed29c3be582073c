//! Binary pin record format and file save/load.
//!
//! Layout, little-endian:
//!
//! ```text
//! u32  version (= 1)
//! i32  count
//! count × {
//!     7-bit varint  name length in bytes
//!     [u8]          UTF-8 name
//!     7 × f64       virtual pose  [px, py, pz, qx, qy, qz, qw]
//!     7 × f64       locked pose   [px, py, pz, qx, qy, qz, qw]
//! }
//! ```
//!
//! Doubles are stored bit-exact, so a restored virtual pose compares equal
//! to the one that was saved.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dl_core::{PIN_RECORD_VERSION, PinRecord, Pose, Quaternion, Vec3};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

const POSE_LEN: usize = 7 * 8;

pub fn encode_pins(records: &[PinRecord]) -> Result<Vec<u8>> {
    let count = i32::try_from(records.len())
        .map_err(|_| StoreError::InvalidData(format!("too many pins: {}", records.len())))?;
    let mut buf = Vec::with_capacity(8 + records.len() * (2 * POSE_LEN + 16));
    buf.extend_from_slice(&PIN_RECORD_VERSION.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for record in records {
        write_varint(&mut buf, record.name.len());
        buf.extend_from_slice(record.name.as_bytes());
        write_pose(&mut buf, record.virtual_pose);
        write_pose(&mut buf, record.locked_pose);
    }
    Ok(buf)
}

pub fn decode_pins(bytes: &[u8]) -> Result<Vec<PinRecord>> {
    let mut reader = Reader { bytes, pos: 0 };
    let version = u32::from_le_bytes(reader.array()?);
    if version != PIN_RECORD_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }
    let count = i32::from_le_bytes(reader.array()?);
    let count = usize::try_from(count)
        .map_err(|_| StoreError::InvalidData(format!("negative pin count {count}")))?;

    // Each record is at least one length byte plus two poses.
    let mut records = Vec::with_capacity(count.min(reader.remaining() / (2 * POSE_LEN + 1)));
    for _ in 0..count {
        let len = reader.varint()?;
        let name = std::str::from_utf8(reader.take(len)?)
            .map_err(|e| StoreError::InvalidData(format!("pin name is not UTF-8: {e}")))?
            .to_string();
        let virtual_pose = reader.pose()?;
        let locked_pose = reader.pose()?;
        records.push(PinRecord {
            name,
            virtual_pose,
            locked_pose,
        });
    }
    if reader.remaining() > 0 {
        debug!(trailing = reader.remaining(), "ignoring bytes after pin records");
    }
    Ok(records)
}

/// Write pins to `path` atomically: a sibling temp file is written, synced
/// and renamed over the target.
pub fn save_pins(path: &Path, records: &[PinRecord]) -> Result<()> {
    let bytes = encode_pins(records)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = temp_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()
    })();
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    info!(path = %path.display(), pins = records.len(), "pins saved");
    Ok(())
}

pub fn load_pins(path: &Path) -> Result<Vec<PinRecord>> {
    let bytes = fs::read(path)?;
    let records = decode_pins(&bytes)?;
    info!(path = %path.display(), pins = records.len(), "pins loaded");
    Ok(records)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_varint(buf: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_pose(buf: &mut Vec<u8>, pose: Pose) {
    for v in pose.to_array() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(StoreError::InvalidData(format!(
                "truncated pin record: wanted {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn varint(&mut self) -> Result<usize> {
        let mut value = 0usize;
        for shift in (0..usize::BITS).step_by(7) {
            let [byte] = self.array::<1>()?;
            value |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(StoreError::InvalidData("name length prefix too long".into()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Components are taken as stored, without renormalizing the rotation.
    fn pose(&mut self) -> Result<Pose> {
        let position = Vec3::new(self.f64()?, self.f64()?, self.f64()?);
        let (x, y, z, w) = (self.f64()?, self.f64()?, self.f64()?, self.f64()?);
        Ok(Pose::new(position, Quaternion { w, x, y, z }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, x: f64) -> PinRecord {
        PinRecord {
            name: name.to_string(),
            virtual_pose: Pose::new(Vec3::new(x, 1.5, -2.0), Quaternion::from_yaw(0.3)),
            locked_pose: Pose::from_position(Vec3::new(x + 0.1, 1.5, -2.05)),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_pins(&[record("a", 1.0)]).unwrap();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], b'a');
        assert_eq!(bytes.len(), 8 + 1 + 1 + 2 * POSE_LEN);
        assert_eq!(&bytes[10..18], &1.0f64.to_le_bytes());
    }

    #[test]
    fn test_decode_is_bit_exact() {
        let records = vec![record("door", 0.1 + 0.2), record("window", -3.7)];
        let decoded = decode_pins(&encode_pins(&records).unwrap()).unwrap();
        assert_eq!(decoded.len(), 2);
        for (a, b) in records.iter().zip(&decoded) {
            assert_eq!(a.name, b.name);
            assert!(a.virtual_pose.bitwise_eq(b.virtual_pose));
            assert!(a.locked_pose.bitwise_eq(b.locked_pose));
        }
    }

    #[test]
    fn test_long_name_uses_multibyte_prefix() {
        let name = "pin-".repeat(50);
        let bytes = encode_pins(&[record(&name, 0.0)]).unwrap();
        assert_eq!(&bytes[8..10], &[0xc8, 0x01]);
        let decoded = decode_pins(&bytes).unwrap();
        assert_eq!(decoded[0].name, name);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode_pins(&[record("a", 1.0)]).unwrap();
        bytes[0] = 2;
        assert!(matches!(
            decode_pins(&bytes),
            Err(StoreError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_truncated_and_negative_rejected() {
        let bytes = encode_pins(&[record("a", 1.0)]).unwrap();
        assert!(matches!(
            decode_pins(&bytes[..bytes.len() - 3]),
            Err(StoreError::InvalidData(_))
        ));
        assert!(matches!(decode_pins(&bytes[..2]), Err(StoreError::InvalidData(_))));

        let mut negative = bytes.clone();
        negative[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(decode_pins(&negative), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_empty_record_set() {
        let bytes = encode_pins(&[]).unwrap();
        assert_eq!(bytes.len(), 8);
        assert!(decode_pins(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pins.bin");
        save_pins(&path, &[record("a", 1.0), record("b", 2.0)]).unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = load_pins(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].name, "b");

        save_pins(&path, &[record("c", 3.0)]).unwrap();
        assert_eq!(load_pins(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_pins(&dir.path().join("absent.bin"));
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
