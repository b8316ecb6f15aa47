// MCUboot firmware image inspection.
//
// Reads the metadata the OTA flow needs out of an image file before any
// byte reaches the device: the packed version, the SHA-256 the bootloader
// will report for the image, and the vendor tags the build system appends
// (commit hash, build timestamp).
//
// Container layout (all little-endian):
//   32-byte header: magic, load addr, header size, protected-TLV size,
//                   image size, flags, version (maj u8 / min u8 / rev u16 /
//                   build u32), pad
//   image payload
//   TLV trailer: info header {magic, total}, then {type u16, len u16, data}
//   entries. Magic 0x6908 marks the protected area, 0x6907 the rest.
//
// The image hash covers header + payload + protected TLVs.

use crate::error::{Error, Result};
use crate::version::FirmwareVersion;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ============================================================================
// Constants
// ============================================================================

pub(crate) const IMAGE_MAGIC: u32 = 0x96f3_b83d;
pub(crate) const TLV_INFO_MAGIC: u16 = 0x6907;
const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// SHA-256 of the image, per the MCUboot spec.
pub(crate) const TLV_SHA256: u16 = 0x10;
/// Vendor tag: git commit hash of the firmware build.
const TLV_VENDOR_COMMIT: u16 = 0xa0;
/// Vendor tag: build timestamp, big-endian Unix seconds.
const TLV_VENDOR_TIMESTAMP: u16 = 0xa1;

/// Upload ceiling. The device has nowhere to put anything bigger.
pub const MAX_IMAGE_FILE_SIZE: usize = 10_000_000;

pub(crate) const HEADER_SIZE: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// Metadata extracted from a firmware image file.
#[derive(Clone, Debug)]
pub struct FirmwareImageInfo {
    pub version: FirmwareVersion,
    /// SHA-256 the bootloader will report for this image.
    pub hash: Vec<u8>,
    /// Declared payload size from the header.
    pub size: usize,
    /// Size of the file as given.
    pub file_size: usize,
}

// ============================================================================
// Parsing
// ============================================================================

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Walk a TLV area starting at `offset`, collecting entries into `tags`.
/// Returns the offset just past the area.
fn walk_tlv_area(
    data: &[u8],
    offset: usize,
    expected_magic: u16,
    tags: &mut HashMap<u16, Vec<u8>>,
) -> Result<usize> {
    if offset + 4 > data.len() {
        return Err(Error::InvalidImage("truncated TLV info header".to_string()));
    }
    let magic = u16_at(data, offset);
    if magic != expected_magic {
        return Err(Error::InvalidImage(format!(
            "bad TLV magic 0x{magic:04x} (expected 0x{expected_magic:04x})"
        )));
    }
    // Total includes the info header itself.
    let total = u16_at(data, offset + 2) as usize;
    let end = offset
        .checked_add(total)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::InvalidImage("TLV area overruns file".to_string()))?;

    let mut pos = offset + 4;
    while pos + 4 <= end {
        let tlv_type = u16_at(data, pos);
        let tlv_len = u16_at(data, pos + 2) as usize;
        pos += 4;
        if pos + tlv_len > end {
            return Err(Error::InvalidImage(format!(
                "TLV 0x{tlv_type:02x} overruns its area"
            )));
        }
        tags.insert(tlv_type, data[pos..pos + tlv_len].to_vec());
        pos += tlv_len;
    }

    Ok(end)
}

/// Inspect a firmware image file.
///
/// Fails with `FileTooLarge` above the upload ceiling, `InvalidImage` for a
/// malformed container and `InvalidImageHash` when the declared SHA-256
/// does not match the computed one.
pub fn inspect(data: &[u8]) -> Result<FirmwareImageInfo> {
    if data.len() > MAX_IMAGE_FILE_SIZE {
        return Err(Error::FileTooLarge {
            size: data.len(),
            limit: MAX_IMAGE_FILE_SIZE,
        });
    }
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidImage(format!(
            "file is {} bytes, smaller than the image header",
            data.len()
        )));
    }

    let magic = u32_at(data, 0);
    if magic != IMAGE_MAGIC {
        return Err(Error::InvalidImage(format!(
            "bad image magic 0x{magic:08x}"
        )));
    }

    let hdr_size = u16_at(data, 8) as usize;
    let protect_tlv_size = u16_at(data, 10) as usize;
    let img_size = u32_at(data, 12) as usize;

    let major = data[20] as u16;
    let minor = data[21] as u16;
    let revision = u16_at(data, 22);
    let build = u32_at(data, 24);

    let hashed_len = hdr_size + img_size + protect_tlv_size;
    if hashed_len > data.len() {
        return Err(Error::InvalidImage(format!(
            "declared image size {hashed_len} exceeds file size {}",
            data.len()
        )));
    }

    // Collect trailer tags: the protected area first when present, then
    // the unprotected area.
    let mut tags = HashMap::new();
    let mut offset = hdr_size + img_size;
    if protect_tlv_size > 0 {
        offset = walk_tlv_area(data, offset, TLV_PROT_INFO_MAGIC, &mut tags)?;
    }
    walk_tlv_area(data, offset, TLV_INFO_MAGIC, &mut tags)?;

    let declared_hash = tags
        .get(&TLV_SHA256)
        .cloned()
        .ok_or_else(|| Error::InvalidImageHash("image carries no SHA-256 TLV".to_string()))?;

    let computed_hash = Sha256::digest(&data[..hashed_len]).to_vec();
    if computed_hash != declared_hash {
        return Err(Error::InvalidImageHash(format!(
            "declared {} != computed {}",
            hex::encode(&declared_hash),
            hex::encode(&computed_hash)
        )));
    }

    let commit = tags.get(&TLV_VENDOR_COMMIT).cloned().unwrap_or_default();
    let timestamp = tags
        .get(&TLV_VENDOR_TIMESTAMP)
        .and_then(|raw| decode_timestamp(raw));

    Ok(FirmwareImageInfo {
        version: FirmwareVersion {
            major,
            minor,
            revision,
            build,
            commit,
            timestamp,
            hash: declared_hash.clone(),
        },
        hash: declared_hash,
        size: img_size,
        file_size: data.len(),
    })
}

/// Decode the vendor timestamp tag: the raw bytes are left-zero-padded to
/// 8 bytes and read as a big-endian u64 of Unix seconds. A zero timestamp
/// means the build carried none.
fn decode_timestamp(raw: &[u8]) -> Option<DateTime<Utc>> {
    if raw.len() > 8 {
        return None;
    }
    let mut padded = [0u8; 8];
    padded[8 - raw.len()..].copy_from_slice(raw);
    let seconds = u64::from_be_bytes(padded);
    if seconds == 0 {
        return None;
    }
    DateTime::from_timestamp(seconds as i64, 0)
}
