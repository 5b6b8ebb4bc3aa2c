//! Capture format descriptors, format selection and negotiation candidates

use crate::error::{Error, Result};
use crate::plugin::{StartFlags, StartRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Leading type code of MJPEG descriptors
pub const MJPEG_TYPE_CODE: u32 = 6;

/// Widths tried in order before falling back to the first MJPEG entry
pub const DEFAULT_PREFERRED_WIDTHS: [u32; 5] = [640, 848, 960, 1280, 1024];

/// Compression kind of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Motion JPEG
    Mjpeg,
    /// Any other type code
    Other(u32),
}

impl FormatKind {
    fn from_code(code: u32) -> Self {
        if code == MJPEG_TYPE_CODE {
            FormatKind::Mjpeg
        } else {
            FormatKind::Other(code)
        }
    }
}

/// One parsed entry of a device's capability list
///
/// Raw descriptors look like `"6,1280,720,30"`: type code, width, height,
/// frame rate, optionally followed by more driver-specific fields.
/// The type code is compared as a whole field, so `"60,..."` is not MJPEG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    /// Position of the descriptor in the list returned by open
    pub index: usize,
    /// Compression kind from the leading type code
    pub kind: FormatKind,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels, when the field parses
    pub height: Option<u32>,
    /// Frame rate, when the field parses
    pub fps: Option<u32>,
    /// The descriptor as advertised
    pub raw: String,
}

impl FormatDescriptor {
    /// Parse one raw descriptor; `None` when it has fewer than four fields
    /// or its type code or width is not numeric.
    pub fn parse(index: usize, raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return None;
        }

        let code = fields[0].parse::<u32>().ok()?;
        let width = fields[1].parse::<u32>().ok()?;

        Some(Self {
            index,
            kind: FormatKind::from_code(code),
            width,
            height: fields[2].parse().ok(),
            fps: fields[3].parse().ok(),
            raw: raw.to_string(),
        })
    }

    /// Whether this descriptor may be selected
    pub fn is_eligible(&self) -> bool {
        self.kind == FormatKind::Mjpeg
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}]", self.index, self.raw)
    }
}

/// Format selection under a preferred-width policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCatalog {
    preferred_widths: Vec<u32>,
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_PREFERRED_WIDTHS.to_vec())
    }
}

impl FormatCatalog {
    /// Catalog preferring the given widths, most preferred first
    pub fn new(preferred_widths: Vec<u32>) -> Self {
        Self { preferred_widths }
    }

    /// Preferred widths in order
    pub fn preferred_widths(&self) -> &[u32] {
        &self.preferred_widths
    }

    /// Every eligible descriptor, in advertised order
    pub fn eligible(raw: &[String]) -> Vec<FormatDescriptor> {
        raw.iter()
            .enumerate()
            .filter_map(|(index, entry)| FormatDescriptor::parse(index, entry))
            .filter(FormatDescriptor::is_eligible)
            .collect()
    }

    /// Pick the descriptor to run with
    ///
    /// Preferred widths are walked in preference order and the first eligible
    /// descriptor matching one wins, wherever it sits in the list. Without a
    /// match the first eligible descriptor is used.
    pub fn select(&self, raw: &[String]) -> Result<FormatDescriptor> {
        let eligible = Self::eligible(raw);

        for width in &self.preferred_widths {
            if let Some(found) = eligible.iter().find(|d| d.width == *width) {
                tracing::debug!(descriptor = %found, "Preferred MJPEG format found");
                return Ok(found.clone());
            }
        }

        match eligible.into_iter().next() {
            Some(first) => {
                tracing::debug!(descriptor = %first, "Using first MJPEG format");
                Ok(first)
            }
            None => Err(Error::NoEligibleFormat(raw.len())),
        }
    }
}

/// One entry of the negotiation preference table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Driver format selector
    pub format_selector: u32,
    /// Requested share of USB bandwidth, in (0, 1]
    pub bandwidth: f32,
}

impl ResolutionCandidate {
    /// Build a candidate
    pub const fn new(width: u32, height: u32, fps: u32, format_selector: u32, bandwidth: f32) -> Self {
        Self {
            width,
            height,
            fps,
            format_selector,
            bandwidth,
        }
    }

    /// Pixel count of one frame
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Check the invariants of a configured candidate
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(Error::Config(format!(
                "Candidate {self} must have non-zero width, height and fps"
            )));
        }
        if !(self.bandwidth > 0.0 && self.bandwidth <= 1.0) {
            return Err(Error::Config(format!(
                "Candidate {self} bandwidth {} outside (0, 1]",
                self.bandwidth
            )));
        }
        Ok(())
    }

    /// Native start arguments for this candidate
    pub fn start_request(&self, flags: StartFlags) -> StartRequest {
        StartRequest {
            width: self.width,
            height: self.height,
            fps: self.fps,
            format_selector: self.format_selector,
            bandwidth: self.bandwidth,
            flags,
        }
    }
}

impl fmt::Display for ResolutionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} (format {}, bw {:.2})",
            self.width, self.height, self.fps, self.format_selector, self.bandwidth
        )
    }
}

/// How the negotiation walks its candidate table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPolicy {
    /// Try every candidate in table order
    #[default]
    Table,
    /// After a rejection only try strictly smaller frames
    Descending,
}

impl NegotiationPolicy {
    /// Default candidate table for this policy
    pub fn default_candidates(self) -> Vec<ResolutionCandidate> {
        match self {
            NegotiationPolicy::Table => vec![
                ResolutionCandidate::new(640, 480, 30, 8, 0.15),
                ResolutionCandidate::new(848, 480, 30, 5, 0.12),
                ResolutionCandidate::new(320, 240, 30, 2, 0.10),
                ResolutionCandidate::new(424, 240, 30, 3, 0.20),
            ],
            NegotiationPolicy::Descending => vec![
                ResolutionCandidate::new(1920, 1080, 30, 9, 0.3),
                ResolutionCandidate::new(1280, 720, 30, 9, 0.3),
                ResolutionCandidate::new(640, 480, 30, 9, 0.3),
            ],
        }
    }

    /// Whether `candidate` may be tried given the smallest frame rejected so far
    pub fn admits(self, candidate: &ResolutionCandidate, smallest_rejected: Option<u64>) -> bool {
        match (self, smallest_rejected) {
            (NegotiationPolicy::Table, _) | (_, None) => true,
            (NegotiationPolicy::Descending, Some(floor)) => candidate.pixels() < floor,
        }
    }

    /// Canonical config string
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationPolicy::Table => "table",
            NegotiationPolicy::Descending => "descending",
        }
    }
}

impl FromStr for NegotiationPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "table" | "full" => Ok(NegotiationPolicy::Table),
            "descending" | "chain" => Ok(NegotiationPolicy::Descending),
            other => Err(format!(
                "Unknown negotiation policy '{other}', expected 'table' or 'descending'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_descriptor_fields() {
        let d = FormatDescriptor::parse(3, "6,1280,720,30,extra").unwrap();
        assert_eq!(d.index, 3);
        assert_eq!(d.kind, FormatKind::Mjpeg);
        assert_eq!(d.width, 1280);
        assert_eq!(d.height, Some(720));
        assert_eq!(d.fps, Some(30));
        assert!(d.is_eligible());

        let other = FormatDescriptor::parse(0, "4,640,480,30").unwrap();
        assert_eq!(other.kind, FormatKind::Other(4));
        assert!(!other.is_eligible());
    }

    #[test]
    fn test_parse_rejects_short_or_garbled() {
        assert!(FormatDescriptor::parse(0, "6,640,480").is_none());
        assert!(FormatDescriptor::parse(0, "6,wide,480,30").is_none());
        assert!(FormatDescriptor::parse(0, "").is_none());
    }

    #[test]
    fn test_no_mjpeg_is_no_eligible_format() {
        let catalog = FormatCatalog::default();
        for list in [
            raw(&[]),
            raw(&["4,640,480,30", "7,1280,720,30"]),
            raw(&["6,640,480", "junk", "60,640,480,30"]),
        ] {
            let err = catalog.select(&list).unwrap_err();
            assert!(matches!(err, Error::NoEligibleFormat(n) if n == list.len()));
        }
    }

    #[test]
    fn test_preferred_width_beats_list_order() {
        let catalog = FormatCatalog::default();
        let list = raw(&["6,1920,1080,30", "4,640,480,30", "6,1280,720,30", "6,640,480,30"]);

        let picked = catalog.select(&list).unwrap();
        assert_eq!(picked.index, 3);
        assert_eq!(picked.width, 640);
    }

    #[test]
    fn test_preference_order_not_list_order() {
        // 1280 is listed first but 848 ranks higher in the preference list
        let catalog = FormatCatalog::default();
        let list = raw(&["6,1280,720,30", "6,848,480,30"]);
        assert_eq!(catalog.select(&list).unwrap().width, 848);
    }

    #[test]
    fn test_falls_back_to_first_mjpeg() {
        let catalog = FormatCatalog::default();
        let list = raw(&["4,640,480,30", "6,1920,1080,30", "6,2560,1440,30"]);
        assert_eq!(catalog.select(&list).unwrap().index, 1);
    }

    #[test]
    fn test_candidate_validation() {
        assert!(ResolutionCandidate::new(640, 480, 30, 8, 0.15).validate().is_ok());
        assert!(ResolutionCandidate::new(640, 480, 30, 8, 1.0).validate().is_ok());
        assert!(ResolutionCandidate::new(640, 480, 30, 8, 0.0).validate().is_err());
        assert!(ResolutionCandidate::new(640, 480, 30, 8, 1.5).validate().is_err());
        assert!(ResolutionCandidate::new(0, 480, 30, 8, 0.5).validate().is_err());
    }

    #[test]
    fn test_descending_policy_skips_larger_frames() {
        let big = ResolutionCandidate::new(1920, 1080, 30, 9, 0.3);
        let small = ResolutionCandidate::new(640, 480, 30, 9, 0.3);
        let floor = Some(ResolutionCandidate::new(1280, 720, 30, 9, 0.3).pixels());

        assert!(NegotiationPolicy::Descending.admits(&big, None));
        assert!(!NegotiationPolicy::Descending.admits(&big, floor));
        assert!(NegotiationPolicy::Descending.admits(&small, floor));
        assert!(NegotiationPolicy::Table.admits(&big, floor));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("TABLE".parse::<NegotiationPolicy>(), Ok(NegotiationPolicy::Table));
        assert_eq!("descending".parse::<NegotiationPolicy>(), Ok(NegotiationPolicy::Descending));
        assert!("sideways".parse::<NegotiationPolicy>().is_err());
    }
}
