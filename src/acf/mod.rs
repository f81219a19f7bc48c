//! ACF (Archon Configuration File) parser and mode database (spec.md §4.2).

mod parse;

pub use parse::{load_acf, AcfLoadResult};

use std::collections::BTreeMap;

use crate::camera_info::FrameMode;

/// One `configmap`/mode-overlay configuration entry: a controller line
/// number plus its value (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigLine {
    pub line: u16,
    pub value: String,
}

/// One `parammap`/mode-overlay parameter entry (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamLine {
    /// The `PARAMETERn` slot key.
    pub key: String,
    pub name: String,
    pub value: String,
    pub line: u16,
}

/// Ordered configuration key -> line/value map (insertion order preserved
/// for diagnostics, per spec.md §9).
pub type ConfigMap = BTreeMap<String, ConfigLine>;
/// Parameter name -> slot/value map.
pub type ParamMap = BTreeMap<String, ParamLine>;

/// Per-mode geometry, mirroring `geometry_t` in `archon.h` (spec.md §3).
#[derive(Clone, Copy, Debug, Default)]
pub struct Geometry {
    pub amps: [u32; 2],
    pub num_detect: u32,
    pub linecount: u32,
    pub pixelcount: u32,
    pub framemode: Option<FrameMode>,
}

/// One `[MODE_xxxx]` section: its own configmap/parammap overlays, FITS
/// keyword table, geometry, and whether `RAWENABLE` was set (spec.md §3,
/// "modemap").
#[derive(Clone, Debug, Default)]
pub struct ModeRecord {
    pub rawenable: Option<bool>,
    pub configmap: ConfigMap,
    pub parammap: ParamMap,
    pub fits_keys: crate::camera_info::KeywordDb,
    pub geometry: Geometry,
}

/// The parsed ACF database: canonical configmap/parammap plus per-mode
/// overlays (spec.md §3).
#[derive(Clone, Debug, Default)]
pub struct AcfDatabase {
    pub configmap: ConfigMap,
    pub parammap: ParamMap,
    pub modemap: BTreeMap<String, ModeRecord>,
    pub firmware_path: Option<String>,
    pub firmware_md5: Option<String>,
}

impl AcfDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a mode by its uppercased name.
    #[must_use]
    pub fn mode(&self, name: &str) -> Option<&ModeRecord> {
        self.modemap.get(&name.to_ascii_uppercase())
    }
}
