//! Compression profile: target resolution, image quality and colour mode.

use crate::error::PdfToolsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest accepted target resolution.
pub const MIN_DPI: u32 = 72;
/// Highest accepted target resolution.
pub const MAX_DPI: u32 = 300;
/// Lowest accepted JPEG quality.
pub const MIN_QUALITY: u8 = 10;
/// Highest accepted JPEG quality.
pub const MAX_QUALITY: u8 = 100;

/// Default target resolution.
pub const DEFAULT_TARGET_DPI: u32 = 144;
/// Default JPEG quality for recompressed images.
pub const DEFAULT_IMAGE_QUALITY: u8 = 75;

/// What compression does to the colour of embedded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileColorMode {
    /// Keep the source colour model.
    #[default]
    Unchanged,
    Grayscale,
    Monochrome,
}

impl ProfileColorMode {
    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileColorMode::Unchanged => "no-change",
            ProfileColorMode::Grayscale => "grayscale",
            ProfileColorMode::Monochrome => "monochrome",
        }
    }

    /// Whether images end up in a single gray channel.
    pub fn is_gray(self) -> bool {
        !matches!(self, ProfileColorMode::Unchanged)
    }
}

impl fmt::Display for ProfileColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileColorMode {
    type Err = PdfToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no-change" | "no_change" | "unchanged" => Ok(ProfileColorMode::Unchanged),
            "grayscale" | "gray" | "greyscale" | "grey" => Ok(ProfileColorMode::Grayscale),
            "monochrome" | "mono" => Ok(ProfileColorMode::Monochrome),
            other => Err(PdfToolsError::InvalidProfile(format!(
                "unknown colour mode '{other}' (expected no-change, grayscale or monochrome)"
            ))),
        }
    }
}

/// Parameters for one compression run.
///
/// Construct freely, then call [`CompressionProfile::validate`]; the
/// compressor does so before touching any file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionProfile {
    /// Embedded images are downsampled to at most this resolution.
    pub target_dpi: u32,
    /// JPEG quality used when images are re-encoded.
    pub image_quality: u8,
    pub color_mode: ProfileColorMode,
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self {
            target_dpi: DEFAULT_TARGET_DPI,
            image_quality: DEFAULT_IMAGE_QUALITY,
            color_mode: ProfileColorMode::default(),
        }
    }
}

impl CompressionProfile {
    pub fn new(target_dpi: u32, image_quality: u8, color_mode: ProfileColorMode) -> Self {
        Self {
            target_dpi,
            image_quality,
            color_mode,
        }
    }

    /// Check every field against its accepted range.
    ///
    /// # Errors
    /// [`PdfToolsError::InvalidProfile`] naming the offending field.
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        if !(MIN_DPI..=MAX_DPI).contains(&self.target_dpi) {
            return Err(PdfToolsError::InvalidProfile(format!(
                "target_dpi must be within {MIN_DPI}..={MAX_DPI}, got {}",
                self.target_dpi
            )));
        }
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&self.image_quality) {
            return Err(PdfToolsError::InvalidProfile(format!(
                "image_quality must be within {MIN_QUALITY}..={MAX_QUALITY}, got {}",
                self.image_quality
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CompressionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dpi, quality {}, {}",
            self.target_dpi, self.image_quality, self.color_mode
        )
    }
}
