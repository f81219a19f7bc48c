//! External configuration bindings the core consumes.
//!
//! Loading this from a TOML file, merging environment overrides, and
//! wiring it into a running daemon is the CLI/daemon shell's job (out of
//! core scope, spec.md §1). This module only defines the shape of what the
//! shell hands the core: the Archon host/port, default acquisition
//! parameters, timing constants used by the exposure sequencer's wait
//! primitives, and the named Archon parameters the sequencer writes to
//! (exposure, abort, shutter, and the per-sample-mode parameter names).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::camera_info::Roi;

/// Archon connection and acquisition defaults, plus the named-parameter
/// bindings the exposure sequencer needs (spec.md §6, "Configuration file").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchonSettings {
    /// Archon controller IP address or hostname.
    pub archon_ip: String,
    /// Archon controller TCP port.
    pub archon_port: u16,

    /// ACF file loaded at daemon start unless overridden.
    #[serde(default)]
    pub default_firmware: Option<String>,
    /// Default sample mode code (spec.md §6 table) if none is selected.
    #[serde(default = "default_sampmode")]
    pub default_sampmode: u8,
    /// Default total exposure time, milliseconds.
    #[serde(default = "default_exptime_ms")]
    pub default_exptime_ms: f64,
    /// Default region of interest, full detector unless overridden.
    #[serde(default)]
    pub default_roi: Option<Roi>,

    /// Timing model used by `wait_for_exposure`/`wait_for_readout` (§4.7).
    #[serde(default)]
    pub timing: TimingSettings,

    /// Output directory for FITS files (`image_dir` in spec.md §6).
    pub imdir: String,
    /// Whether to create a `YYYYMMDD` subdirectory under `imdir`.
    #[serde(default)]
    pub dirmode: bool,
    /// Filename prefix for generated FITS files.
    pub basename: String,
    /// Whether to embed raw tap/block offsets as FITS keys for diagnostics.
    #[serde(default)]
    pub write_tapinfo_to_fits: bool,

    /// Named-parameter bindings (spec.md §6).
    pub params: ParamBindings,
}

fn default_sampmode() -> u8 {
    2 // CDS
}

fn default_exptime_ms() -> f64 {
    1000.0
}

/// Timing constants consumed by the wait primitives (§4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Nominal whole-frame readout time, used to bound `wait_for_readout`.
    #[serde(with = "humantime_serde", default = "default_readout_time")]
    pub readout_time: Duration,
    /// Per-pixel clock time, used by higher-level timing estimators.
    #[serde(with = "humantime_serde", default = "default_pixel_time")]
    pub pixel_time: Duration,
    /// Per-pixel clock time while skipping (ROI/binning fast-forward).
    #[serde(with = "humantime_serde", default = "default_pixel_skip_time")]
    pub pixel_skip_time: Duration,
    /// Per-row overhead time.
    #[serde(with = "humantime_serde", default = "default_row_overhead_time")]
    pub row_overhead_time: Duration,
    /// Per-row skip time.
    #[serde(with = "humantime_serde", default = "default_row_skip_time")]
    pub row_skip_time: Duration,
    /// Frame-start overhead.
    #[serde(with = "humantime_serde", default = "default_frame_start_time")]
    pub frame_start_time: Duration,
    /// Frame-sync pulse width.
    #[serde(with = "humantime_serde", default = "default_fs_pulse_time")]
    pub fs_pulse_time: Duration,
    /// Number of bits to right-shift 32-bit Archon samples before storing.
    #[serde(default)]
    pub hdr_shift: u8,
}

fn default_readout_time() -> Duration {
    Duration::from_millis(500)
}
fn default_pixel_time() -> Duration {
    Duration::from_nanos(40)
}
fn default_pixel_skip_time() -> Duration {
    Duration::from_nanos(10)
}
fn default_row_overhead_time() -> Duration {
    Duration::from_micros(1)
}
fn default_row_skip_time() -> Duration {
    Duration::from_micros(1)
}
fn default_frame_start_time() -> Duration {
    Duration::from_micros(10)
}
fn default_fs_pulse_time() -> Duration {
    Duration::from_nanos(100)
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            readout_time: default_readout_time(),
            pixel_time: default_pixel_time(),
            pixel_skip_time: default_pixel_skip_time(),
            row_overhead_time: default_row_overhead_time(),
            row_skip_time: default_row_skip_time(),
            frame_start_time: default_frame_start_time(),
            fs_pulse_time: default_fs_pulse_time(),
            hdr_shift: 0,
        }
    }
}

/// Names of Archon parameters the sequencer reads/writes by name rather than
/// by hardcoded string, so a given ACF can rebind them (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamBindings {
    /// Parameter carrying the user-facing exposure count/time.
    pub expose_param: String,
    /// Parameter the sequencer raises to request an abort.
    pub abort_param: String,
    /// Parameter naming MCDS pair count, if used by the loaded ACF.
    #[serde(default)]
    pub mcdspairs_param: Option<String>,
    /// Parameter selecting MCDS mode.
    #[serde(default)]
    pub mcdsmode_param: Option<String>,
    /// Parameter selecting non-CDS video readout mode.
    #[serde(default)]
    pub rxmode_param: Option<String>,
    /// Parameter selecting CDS video readout mode.
    #[serde(default)]
    pub rxrmode_param: Option<String>,
    /// Parameter naming the video sample count.
    #[serde(default)]
    pub videosamples_param: Option<String>,
    /// Parameter naming UTR sample count.
    #[serde(default)]
    pub utrsample_param: Option<String>,
    /// Parameter selecting UTR mode.
    #[serde(default)]
    pub utrmode_param: Option<String>,
    /// Parameter enabling the shutter.
    #[serde(default)]
    pub shutenable_param: Option<String>,
    /// Value written to `shutenable_param` to enable the shutter.
    #[serde(default)]
    pub shutenable_enable: Option<String>,
    /// Value written to `shutenable_param` to disable the shutter.
    #[serde(default)]
    pub shutenable_disable: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_are_nonzero() {
        let t = TimingSettings::default();
        assert!(t.readout_time.as_millis() > 0);
        assert!(t.pixel_time.as_nanos() > 0);
    }
}
