// Firmware version decoding.
//
// MCUboot images carry a plain semantic version; the Smart Paci firmware
// additionally packs a release variant and a build counter into the 32-bit
// build component. The top 4 bits select the variant (1 = alpha, 2 = beta,
// 3 = rc, 4 = preview; 0 and anything else render no label), the low 8 bits
// count builds/commits since the release tag, and a variant nibble of 0xF
// suppresses the counter entirely.
//
// Example: build 0x10000005 on v0.2.7 renders as "0.2.7-alpha5".

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Release variant labels indexed by the top 4 bits of the build field.
/// Index 0 ("dirty" builds, commits ahead of a tag) renders unlabeled.
const RELEASE_VARIANTS: [&str; 5] = ["", "alpha", "beta", "rc", "preview"];

/// Variant nibble that explicitly carries no build counter.
const NO_COUNT_SENTINEL: u32 = 0xF;

/// A decoded firmware version, reconstructed fresh on every version query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
    /// Raw build field; variant and counter are derived views of it.
    pub build: u32,
    /// Git commit hash of the firmware build, empty when unknown.
    pub commit: Vec<u8>,
    /// Build time (UTC), `None` when the image carries no timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// SHA-256 of the image as calculated per the MCUboot spec.
    pub hash: Vec<u8>,
}

impl FirmwareVersion {
    pub fn from_parts(major: u16, minor: u16, revision: u16, build: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build,
            ..Default::default()
        }
    }

    /// Parse a dotted numeric string, `"major.minor.revision"` or
    /// `"major.minor.revision.build"`. A missing build component defaults
    /// to 0. Anything else is `MalformedVersionString`.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = || Error::MalformedVersionString(input.to_string());

        let parts: Vec<&str> = input.split('.').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(malformed());
        }

        let major: u16 = parts[0].trim().parse().map_err(|_| malformed())?;
        let minor: u16 = parts[1].trim().parse().map_err(|_| malformed())?;
        let revision: u16 = parts[2].trim().parse().map_err(|_| malformed())?;
        let build: u32 = match parts.get(3) {
            Some(p) => p.trim().parse().map_err(|_| malformed())?,
            None => 0,
        };

        Ok(Self::from_parts(major, minor, revision, build))
    }

    /// Release variant nibble (top 4 bits of the build field).
    fn release_type(&self) -> u32 {
        (self.build >> 28) & 0xF
    }

    /// Build counter (low 8 bits of the build field).
    fn build_count(&self) -> u32 {
        self.build & 0xFF
    }

    /// Variant label: `"alpha"`, `"beta"`, `"rc"`, `"preview"` or `""`.
    pub fn variant(&self) -> &'static str {
        match self.release_type() {
            t if (t as usize) < RELEASE_VARIANTS.len() => RELEASE_VARIANTS[t as usize],
            _ => "",
        }
    }

    /// Firmware commit hash as lowercase hex, empty when unknown.
    pub fn commit_hex(&self) -> String {
        hex::encode(&self.commit)
    }

    /// Image hash as lowercase hex, empty when unknown.
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;

        let variant = self.variant();
        if !variant.is_empty() {
            write!(f, "-{variant}")?;
        }

        let count = self.build_count();
        if count > 0 {
            let release_type = self.release_type();
            if release_type == 0 {
                // Dirty builds count commits ahead of the release tag.
                write!(f, "+{count}")?;
            } else if release_type != NO_COUNT_SENTINEL {
                write!(f, "{count}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_parts_defaults_build() {
        let v = FirmwareVersion::parse("1.2.3").unwrap();
        assert_eq!((v.major, v.minor, v.revision, v.build), (1, 2, 3, 0));
    }

    #[test]
    fn test_parse_four_parts() {
        let v = FirmwareVersion::parse("0.1.10.268435456").unwrap();
        assert_eq!(v.build, 0x1000_0000);
        assert_eq!(v.variant(), "alpha");
    }

    #[test]
    fn test_parse_malformed() {
        for input in ["", "1.2", "a.b.c", "1.2.3.4.5", "1.2.x"] {
            assert!(
                matches!(
                    FirmwareVersion::parse(input),
                    Err(Error::MalformedVersionString(_))
                ),
                "expected malformed error for {input:?}"
            );
        }
    }

    #[test]
    fn test_format_plain_release() {
        let v = FirmwareVersion::from_parts(1, 4, 0, 0);
        assert_eq!(v.to_string(), "1.4.0");
    }

    #[test]
    fn test_format_dirty_build_counts_commits() {
        let v = FirmwareVersion::from_parts(0, 2, 7, 0x0000_0003);
        assert_eq!(v.to_string(), "0.2.7+3");
    }

    #[test]
    fn test_format_alpha_with_count() {
        let v = FirmwareVersion::from_parts(0, 2, 7, 0x1000_0005);
        assert_eq!(v.to_string(), "0.2.7-alpha5");
    }

    #[test]
    fn test_format_variants_without_count() {
        for (build, expected) in [
            (0x1000_0000, "1.0.0-alpha"),
            (0x2000_0000, "1.0.0-beta"),
            (0x3000_0000, "1.0.0-rc"),
            (0x4000_0000, "1.0.0-preview"),
        ] {
            let v = FirmwareVersion::from_parts(1, 0, 0, build);
            assert_eq!(v.to_string(), expected);
        }
    }

    #[test]
    fn test_format_unknown_variant_no_label() {
        // Variant nibble 0xF is the no-count sentinel: neither a label nor
        // a counter is rendered.
        let v = FirmwareVersion::from_parts(2, 0, 1, 0xF000_0007);
        assert_eq!(v.to_string(), "2.0.1");

        // Other out-of-table nibbles render no label but keep the counter.
        let v = FirmwareVersion::from_parts(2, 0, 1, 0x5000_0002);
        assert_eq!(v.to_string(), "2.0.12");
    }

    #[test]
    fn test_format_idempotent() {
        let v = FirmwareVersion::from_parts(3, 1, 4, 0x2000_0042);
        assert_eq!(v.to_string(), v.to_string());
    }

    #[test]
    fn test_parse_format_round_trip() {
        let v = FirmwareVersion::parse("0.1.10.268435461").unwrap();
        assert_eq!(v.to_string(), "0.1.10-alpha5");
    }
}
