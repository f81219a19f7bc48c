//! Geometry and acquisition metadata for the camera under the mode currently
//! selected (spec.md §3, "Camera info").

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ArchonError, Result};

/// Archon's FETCH/WCONFIG block size, in bytes.
pub const BLOCK_LEN: u32 = 1024;

/// Number of controller frame-status buffers.
pub const NBUFS: usize = 3;

/// Region of interest, 1-based inclusive bounds on the detector.
///
/// `Default` is the full 1024x1024 detector frame, mirroring the host
/// crate's `Roi` default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First column, 1-based inclusive.
    pub x0: u32,
    /// Last column, 1-based inclusive.
    pub x1: u32,
    /// First row, 1-based inclusive.
    pub y0: u32,
    /// Last row, 1-based inclusive.
    pub y1: u32,
}

impl Default for Roi {
    fn default() -> Self {
        Roi {
            x0: 1,
            x1: 1024,
            y0: 1,
            y1: 1024,
        }
    }
}

impl Roi {
    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0) + 1
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0) + 1
    }
}

impl PartialOrd for Roi {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Roi {
    /// Orders by area, then by `(x0, y0)` for stability — mirrors the host
    /// crate's `Roi` ordering used when picking the largest of several ROIs.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let area = u64::from(self.width()) * u64::from(self.height());
        let other_area = u64::from(other.width()) * u64::from(other.height());
        area.cmp(&other_area)
            .then_with(|| self.x0.cmp(&other.x0))
            .then_with(|| self.y0.cmp(&other.y0))
    }
}

/// Archon's own `FRAMEMODE` geometry codes (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameMode {
    /// Amplifier rows read top-first.
    TopFirst = 0,
    /// Amplifier rows read bottom-first.
    BottomFirst = 1,
    /// Grid split across both axes.
    Split = 2,
}

impl FrameMode {
    /// Parses Archon's numeric `FRAMEMODE` value.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(FrameMode::TopFirst),
            1 => Ok(FrameMode::BottomFirst),
            2 => Ok(FrameMode::Split),
            other => Err(ArchonError::Other(format!(
                "unknown FRAMEMODE code {other}"
            ))),
        }
    }
}

/// FITS pixel storage datatype, decoupled from any one FITS library's
/// numeric constants (spec.md §9, Open Question 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitsDatatype {
    /// 16-bit unsigned, stored with `BZERO=32768`.
    UShort,
    /// 16-bit signed.
    Short,
    /// 32-bit float.
    Float,
    /// 32-bit signed integer.
    Long,
}

impl FitsDatatype {
    /// `bitpix` value this datatype stores as.
    #[must_use]
    pub fn bitpix(&self) -> i32 {
        match self {
            FitsDatatype::UShort | FitsDatatype::Short => 16,
            FitsDatatype::Float | FitsDatatype::Long => 32,
        }
    }

    /// Bytes per pixel.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            FitsDatatype::UShort | FitsDatatype::Short => 2,
            FitsDatatype::Float | FitsDatatype::Long => 4,
        }
    }

    /// `BZERO` value required to represent this datatype losslessly in a
    /// signed FITS word (spec.md §4.6).
    #[must_use]
    pub fn bzero(&self) -> f64 {
        match self {
            FitsDatatype::UShort => 32768.0,
            _ => 0.0,
        }
    }

    #[cfg(feature = "storage_fits")]
    #[must_use]
    pub(crate) fn image_type(&self) -> fitsio::images::ImageType {
        use fitsio::images::ImageType;
        match self {
            FitsDatatype::UShort => ImageType::UnsignedShort,
            FitsDatatype::Short => ImageType::Short,
            FitsDatatype::Float => ImageType::Float,
            FitsDatatype::Long => ImageType::Long,
        }
    }
}

/// Archon sample-mode codes (spec.md §6, "Sample modes" table — part of the
/// external contract, values are load-bearing).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMode {
    /// Up-the-ramp: `<samples> <ramps>`, `cubedepth = samples`.
    Utr { samples: u32, ramps: u32 },
    /// Single correlated-double-sampling read pair, `fitscubed = 2`.
    Cds,
    /// Multiple-CDS: `<frames> <ext>`, frames even, `frames/2` read pairs.
    Mcds { frames: u32, ext: u32 },
    /// Non-CDS video: single-frame extensions.
    Video,
    /// CDS video: double-size per-frame extensions.
    CdsVideo,
}

impl SampleMode {
    /// Numeric code for this mode (the external Archon/config contract).
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            SampleMode::Utr { .. } => 1,
            SampleMode::Cds => 2,
            SampleMode::Mcds { .. } => 3,
            SampleMode::Video => 4,
            SampleMode::CdsVideo => 5,
        }
    }

    /// Whether this mode produces a correlated-double-sampled result
    /// (spec.md §3 `iscds`).
    #[must_use]
    pub fn is_cds(&self) -> bool {
        matches!(self, SampleMode::Cds | SampleMode::Mcds { .. } | SampleMode::CdsVideo)
    }

    /// `MULTISAM` FITS key value: samples per exposure (spec.md §6, §8
    /// scenarios 2-3: `MULTISAM=2` for `Mcds{frames:4,..}`'s 2 read pairs,
    /// `MULTISAM=8` for `Utr{samples:8,..}`).
    #[must_use]
    pub fn multisam(&self) -> u32 {
        match self {
            SampleMode::Utr { samples, .. } => *samples,
            SampleMode::Cds => 2,
            SampleMode::Mcds { frames, .. } => frames / 2,
            SampleMode::Video | SampleMode::CdsVideo => 1,
        }
    }
}

/// Per-frame readout topology, selecting the deinterlacer implementation
/// (spec.md §4.5, §9 "Template deinterlacers").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadoutType {
    /// No special-cased readout; axes come from the ROI.
    None,
    /// NIRC2-style readout; axes are `imwidth x imheight`.
    Nirc2,
    /// NIRC2 video readout; axes are `imwidth x imheight`.
    Nirc2Video,
    /// Raw, tap-interleaved single-amp readout bypassing normal geometry.
    Raw,
}

/// A typed FITS header value (spec.md §4.6, "type-tagged add_key").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KeyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

/// One FITS header entry: value plus an optional trailing comment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub value: KeyValue,
    pub comment: Option<String>,
}

/// An insertion-ordered FITS keyword database. `BTreeMap` gives stable
/// iteration for deterministic header output; insertion order isn't load
/// bearing for FITS keys (unlike ACF configmap line numbers).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeywordDb {
    entries: BTreeMap<String, KeyEntry>,
}

impl KeywordDb {
    /// Parses `value` according to `kind` and inserts it, truncating
    /// `keyword` to 8 characters (FITS keyword limit) and falling back to
    /// `KeyValue::String` on a conversion failure (spec.md §4.6).
    pub fn add_key(&mut self, keyword: &str, kind: KeyKind, value: &str, comment: Option<&str>) {
        let keyword = keyword.chars().take(8).collect::<String>();
        let parsed = match kind {
            KeyKind::Bool => value
                .parse::<bool>()
                .map(KeyValue::Bool)
                .unwrap_or_else(|_| KeyValue::String(value.to_string())),
            KeyKind::Int => value
                .parse::<i32>()
                .map(KeyValue::Int)
                .unwrap_or_else(|_| KeyValue::String(value.to_string())),
            KeyKind::Long => value
                .parse::<i64>()
                .map(KeyValue::Long)
                .unwrap_or_else(|_| KeyValue::String(value.to_string())),
            KeyKind::Float => value
                .parse::<f32>()
                .map(KeyValue::Float)
                .unwrap_or_else(|_| KeyValue::String(value.to_string())),
            KeyKind::Double => value
                .parse::<f64>()
                .map(KeyValue::Double)
                .unwrap_or_else(|_| KeyValue::String(value.to_string())),
            KeyKind::String => KeyValue::String(value.to_string()),
        };
        self.entries.insert(
            keyword,
            KeyEntry {
                value: parsed,
                comment: comment.map(str::to_string),
            },
        );
    }

    /// Iterates keys in keyword order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Clears all entries, used between extensions (spec.md §4.4, "Clear
    /// per-extension FITS keys database").
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Merges `other`'s entries in, overwriting any keyword already present.
    /// Used to layer the per-exposure system keys over the per-amp
    /// `GAIN{nn}`/`OFFSET{nn}` keys `set_camera_mode` already populated.
    pub fn merge(&mut self, other: KeywordDb) {
        self.entries.extend(other.entries);
    }
}

/// The type tag accepted by [`KeywordDb::add_key`] (spec.md §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Bool,
    Int,
    Long,
    Float,
    Double,
    String,
}

/// Total exposure time: magnitude plus a unit that may be milliseconds or
/// seconds, following spec.md §9's "value type carrying unit + magnitude"
/// guidance so unit mixing can't silently happen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExposureTime {
    /// Stored magnitude, in whichever unit `long` selects.
    magnitude: f64,
    /// Archon's own `exposure_factor`: 1 for seconds, 1000 for milliseconds.
    long: bool,
}

impl ExposureTime {
    /// Builds an `ExposureTime` from a millisecond magnitude.
    #[must_use]
    pub fn from_ms(ms: f64) -> Self {
        ExposureTime {
            magnitude: ms,
            long: true,
        }
    }

    /// Builds an `ExposureTime` from a second magnitude.
    #[must_use]
    pub fn from_s(s: f64) -> Self {
        ExposureTime {
            magnitude: s,
            long: false,
        }
    }

    /// Value in milliseconds.
    #[must_use]
    pub fn ms(&self) -> f64 {
        if self.long {
            self.magnitude
        } else {
            self.magnitude * 1000.0
        }
    }

    /// Value in seconds.
    #[must_use]
    pub fn s(&self) -> f64 {
        if self.long {
            self.magnitude / 1000.0
        } else {
            self.magnitude
        }
    }

    /// Archon's `exposure_factor`: 1 for seconds, 1000 for milliseconds.
    #[must_use]
    pub fn exposure_factor(&self) -> u32 {
        if self.long {
            1000
        } else {
            1
        }
    }

    /// Switches the stored unit, rescaling the magnitude so `ms()`/`s()`
    /// keep returning the same physical duration (spec.md §8 round-trip law).
    pub fn set_longexposure(&mut self, long: bool) {
        if long == self.long {
            return;
        }
        let ms = self.ms();
        self.long = long;
        self.magnitude = if long { ms } else { ms / 1000.0 };
    }
}

/// Geometry and acquisition metadata for the currently selected mode
/// (spec.md §3, "Camera info").
#[derive(Debug)]
pub struct CameraInfo {
    pub detector_pixels: [u32; 2],
    pub region_of_interest: Roi,
    pub binning: [u32; 2],
    pub datatype: FitsDatatype,
    /// Pixels per extension.
    pub section_size: u32,
    /// Bytes per extension.
    pub image_memory: u32,
    /// Slices per extension.
    pub cubedepth: u32,
    pub fitscubed: u32,
    pub nexp: u32,
    pub nseq: u32,
    pub sampmode: SampleMode,
    pub readout_type: ReadoutType,
    pub iscds: bool,
    pub imheight: u32,
    pub imwidth: u32,
    pub exposure_time: ExposureTime,
    /// What Archon is told (may differ from `exposure_time` for
    /// `SAMPMODE_SINGLE`, spec.md §4.4 step 8).
    pub exposure_delay: ExposureTime,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub shutterenable: bool,
    pub fits_filename: Option<String>,
    pub user_keys: KeywordDb,
    pub system_keys: KeywordDb,
    /// Per-amplifier pixel bounds, set by `set_camera_mode` step 6. Used for
    /// the per-extension geometry keys written alongside each FITS image.
    pub amp_sections: Vec<AmpSection>,
    extension: AtomicU32,
}

/// Manual impl: `extension` is an `AtomicU32`, which has no `Clone`, so the
/// counter is snapshotted rather than shared on clone.
impl Clone for CameraInfo {
    fn clone(&self) -> Self {
        CameraInfo {
            detector_pixels: self.detector_pixels,
            region_of_interest: self.region_of_interest,
            binning: self.binning,
            datatype: self.datatype,
            section_size: self.section_size,
            image_memory: self.image_memory,
            cubedepth: self.cubedepth,
            fitscubed: self.fitscubed,
            nexp: self.nexp,
            nseq: self.nseq,
            sampmode: self.sampmode,
            readout_type: self.readout_type,
            iscds: self.iscds,
            imheight: self.imheight,
            imwidth: self.imwidth,
            exposure_time: self.exposure_time,
            exposure_delay: self.exposure_delay,
            start_time: self.start_time,
            shutterenable: self.shutterenable,
            fits_filename: self.fits_filename.clone(),
            user_keys: self.user_keys.clone(),
            system_keys: self.system_keys.clone(),
            amp_sections: self.amp_sections.clone(),
            extension: AtomicU32::new(self.extension()),
        }
    }
}

impl CameraInfo {
    /// Detector pixel count for the current geometry, a full, single-extension
    /// frame unless `RAW` mode or binning change this.
    #[must_use]
    pub fn new(datatype: FitsDatatype, sampmode: SampleMode, readout_type: ReadoutType) -> Self {
        CameraInfo {
            detector_pixels: [1024, 1024],
            region_of_interest: Roi::default(),
            binning: [1, 1],
            datatype,
            section_size: 1024 * 1024,
            image_memory: 1024 * 1024 * datatype.bytes_per_pixel(),
            cubedepth: 1,
            fitscubed: 1,
            nexp: 1,
            nseq: 1,
            iscds: sampmode.is_cds(),
            sampmode,
            readout_type,
            imheight: 1024,
            imwidth: 1024,
            exposure_time: ExposureTime::from_ms(1000.0),
            exposure_delay: ExposureTime::from_ms(1000.0),
            start_time: None,
            shutterenable: false,
            fits_filename: None,
            user_keys: KeywordDb::default(),
            system_keys: KeywordDb::default(),
            amp_sections: Vec::new(),
            extension: AtomicU32::new(0),
        }
    }

    /// Whether this exposure writes a multi-extension FITS file: every
    /// sample mode except plain CDS (single-HDU) and RAW.
    #[must_use]
    pub fn mex(&self) -> bool {
        !matches!(self.sampmode, SampleMode::Cds) && !matches!(self.readout_type, ReadoutType::Raw)
    }

    /// Current extension index, advanced with [`CameraInfo::next_extension`].
    #[must_use]
    pub fn extension(&self) -> u32 {
        self.extension.load(Ordering::Acquire)
    }

    /// Resets the extension counter to zero (spec.md §4.4 step 4).
    pub fn reset_extension(&self) {
        self.extension.store(0, Ordering::Release);
    }

    /// Advances and returns the new extension index.
    pub fn next_extension(&self) -> u32 {
        self.extension.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Recomputes `image_data_bytes` per spec.md §4.2 step 5: rounds
    /// `image_memory * num_detect` up to the next 1024-byte block. Returns
    /// [`ArchonError::ZeroImageSize`] if the result is zero.
    pub fn image_data_bytes(&self, num_detect: u32, mode_name: &str) -> Result<u32> {
        let raw = self.image_memory.saturating_mul(num_detect);
        let bytes = raw.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if bytes == 0 {
            return Err(ArchonError::ZeroImageSize(mode_name.to_string()));
        }
        Ok(bytes)
    }
}

/// One amplifier's 1-based inclusive pixel bounds (spec.md §4.2 step 6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AmpSection {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

/// Builds the per-amplifier section table: `hamps * vamps` entries, tiled as
/// a grid for `FrameMode::Split`, otherwise stacked as horizontal stripes
/// (spec.md §4.2 step 6).
#[must_use]
pub fn amp_sections(
    hamps: u32,
    vamps: u32,
    width: u32,
    height: u32,
    framemode: FrameMode,
) -> Vec<AmpSection> {
    let mut sections = Vec::with_capacity((hamps * vamps) as usize);
    match framemode {
        FrameMode::Split => {
            let amp_w = width / hamps.max(1);
            let amp_h = height / vamps.max(1);
            for vy in 0..vamps {
                for hx in 0..hamps {
                    sections.push(AmpSection {
                        x0: hx * amp_w + 1,
                        x1: (hx + 1) * amp_w,
                        y0: vy * amp_h + 1,
                        y1: (vy + 1) * amp_h,
                    });
                }
            }
        }
        FrameMode::TopFirst | FrameMode::BottomFirst => {
            let n = hamps.max(1) * vamps.max(1);
            let amp_h = height / n.max(1);
            for i in 0..n {
                sections.push(AmpSection {
                    x0: 1,
                    x1: width,
                    y0: i * amp_h + 1,
                    y1: (i + 1) * amp_h,
                });
            }
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_default_is_full_detector() {
        let roi = Roi::default();
        assert_eq!(roi.width(), 1024);
        assert_eq!(roi.height(), 1024);
    }

    #[test]
    fn exposure_time_ms_s_round_trip() {
        let et = ExposureTime::from_ms(2500.0);
        assert_eq!(et.ms(), et.s() * 1000.0);
    }

    #[test]
    fn exposure_time_unit_toggle_preserves_duration() {
        let mut et = ExposureTime::from_ms(1500.0);
        let ms_before = et.ms();
        et.set_longexposure(false);
        assert!((et.ms() - ms_before).abs() < 1e-9);
    }

    #[test]
    fn image_data_bytes_rounds_to_block() {
        let info = CameraInfo::new(FitsDatatype::UShort, SampleMode::Cds, ReadoutType::None);
        // image_memory = 1024*1024*2, num_detect = 1 -> already block aligned
        let bytes = info.image_data_bytes(1, "DEFAULT").unwrap();
        assert_eq!(bytes % BLOCK_LEN, 0);
    }

    #[test]
    fn zero_image_size_is_fatal() {
        let mut info = CameraInfo::new(FitsDatatype::UShort, SampleMode::Cds, ReadoutType::None);
        info.image_memory = 0;
        assert!(matches!(
            info.image_data_bytes(1, "DEFAULT"),
            Err(ArchonError::ZeroImageSize(_))
        ));
    }

    #[test]
    fn amp_sections_split_tiles_grid() {
        let sections = amp_sections(2, 2, 1024, 1024, FrameMode::Split);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0], AmpSection { x0: 1, x1: 512, y0: 1, y1: 512 });
    }

    #[test]
    fn amp_sections_stripe_for_topfirst() {
        let sections = amp_sections(1, 4, 1024, 1024, FrameMode::TopFirst);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].y0, 1);
        assert_eq!(sections[3].y1, 1024);
    }

    #[test]
    fn keyword_db_falls_back_to_string_on_bad_parse() {
        let mut db = KeywordDb::default();
        db.add_key("ITIME", KeyKind::Int, "not-a-number", None);
        let (_, entry) = db.iter().next().unwrap();
        assert_eq!(entry.value, KeyValue::String("not-a-number".to_string()));
    }

    #[test]
    fn keyword_truncates_to_eight_chars() {
        let mut db = KeywordDb::default();
        db.add_key("VERYLONGKEYWORD", KeyKind::String, "x", None);
        let (k, _) = db.iter().next().unwrap();
        assert_eq!(k.len(), 8);
    }
}
