use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Bgr8,
    /// Compressed bytes (JPEG/PNG); dimensions are informational.
    Encoded,
}

impl PixelFormat {
    pub const fn code(self) -> u16 {
        match self {
            Self::Gray8 => 1,
            Self::Rgb8 => 3,
            Self::Bgr8 => 4,
            Self::Encoded => 16,
        }
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Gray8),
            3 => Some(Self::Rgb8),
            4 => Some(Self::Bgr8),
            16 => Some(Self::Encoded),
            _ => None,
        }
    }

    pub const fn channels(self) -> Option<u32> {
        match self {
            Self::Gray8 => Some(1),
            Self::Rgb8 | Self::Bgr8 => Some(3),
            Self::Encoded => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gray8 => "gray8",
            Self::Rgb8 => "rgb8",
            Self::Bgr8 => "bgr8",
            Self::Encoded => "encoded",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gray8" | "gray" | "mono8" => Ok(Self::Gray8),
            "rgb8" | "rgb" => Ok(Self::Rgb8),
            "bgr8" | "bgr" => Ok(Self::Bgr8),
            "encoded" | "jpeg" | "jpg" | "png" => Ok(Self::Encoded),
            other => Err(anyhow!("unknown pixel format `{other}`")),
        }
    }
}

/// Describes the pixel bytes carried by one shared-memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub byte_len: u64,
}

impl ImageMeta {
    /// Metadata for a raw buffer; the length must match the dimensions.
    pub fn raw(width: u32, height: u32, format: PixelFormat, byte_len: u64) -> Result<Self> {
        let meta = Self {
            width,
            height,
            format,
            byte_len,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.format
            .channels()
            .map(|channels| u64::from(self.width) * u64::from(self.height) * u64::from(channels))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(expected) = self.expected_len() {
            if expected != self.byte_len {
                bail!(
                    "{}x{} {} image needs {expected} bytes, got {}",
                    self.width,
                    self.height,
                    self.format,
                    self.byte_len
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_meta_checks_length() {
        assert!(ImageMeta::raw(4, 2, PixelFormat::Rgb8, 24).is_ok());
        assert!(ImageMeta::raw(4, 2, PixelFormat::Rgb8, 23).is_err());
        assert!(ImageMeta::raw(4, 2, PixelFormat::Gray8, 8).is_ok());
        assert!(ImageMeta::raw(640, 480, PixelFormat::Encoded, 1234).is_ok());
    }

    #[test]
    fn codes_round_trip() {
        for format in [
            PixelFormat::Gray8,
            PixelFormat::Rgb8,
            PixelFormat::Bgr8,
            PixelFormat::Encoded,
        ] {
            assert_eq!(PixelFormat::from_code(format.code()), Some(format));
        }
        assert_eq!(PixelFormat::from_code(2), None);
        assert_eq!("JPEG".parse::<PixelFormat>().unwrap(), PixelFormat::Encoded);
    }
}
