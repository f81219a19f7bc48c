//! FITS writer pipeline: single-image path and multi-extension cube path
//! with its background drain thread (spec.md §4.6).

pub mod keys;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::camera_info::{CameraInfo, FitsDatatype, KeyKind, KeywordDb};
use crate::error::Result;

/// How an exposure's FITS file ended, written as `COMPSTAT` at close
/// (spec.md §5, §8 scenarios 1 and 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Aborted,
}

impl CompletionStatus {
    fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Aborted => "aborted",
        }
    }
}

/// Default cube-writer cap: roll over at 1 GiB (spec.md §3).
pub const DEFAULT_MAX_SIZE: u64 = 1 << 30;
/// Default cube-writer cap: roll over at 10,000 frames (spec.md §3).
pub const DEFAULT_MAX_CUBE_FRAMES: u32 = 10_000;
/// How many cache records the cube writer drains per pass (spec.md §4.6).
const DRAIN_BATCH: usize = 5;
/// How often progress is logged (spec.md §4.6: "every 1000 frames").
const PROGRESS_INTERVAL: u32 = 1000;

/// One frame handed from a producer (the exposure loop) to the cube-writer
/// task (spec.md §4.6: "write_image(ptr, ts, seq, info)").
pub struct CubeFrame {
    pub pixels: Vec<i32>,
    pub timestamp: u64,
    pub seq: u32,
    pub system_keys: KeywordDb,
    pub extension_name: String,
}

/// Builds the output path under `imdir[/YYYYMMDD]`, `basename` plus a
/// timestamp or incrementing integer, with `-N` suffixing on collision
/// (spec.md §6 "Output").
#[must_use]
pub fn build_output_path(
    imdir: &Path,
    dirmode: bool,
    basename: &str,
    start_time: chrono::DateTime<chrono::Utc>,
) -> PathBuf {
    let dir = if dirmode {
        imdir.join(start_time.format("%Y%m%d").to_string())
    } else {
        imdir.to_path_buf()
    };
    let stamp = start_time.format("%Y%m%d%H%M%S");
    let mut path = dir.join(format!("{basename}_{stamp}.fits"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{basename}_{stamp}-{n}.fits"));
        n += 1;
    }
    path
}

#[cfg(feature = "storage_fits")]
mod backend {
    use super::*;
    use fitsio::images::{ImageDescription, ImageType};
    use fitsio::FitsFile as RawFitsFile;

    /// Single-image FITS writer (spec.md §4.6 "Single-image path").
    pub struct SingleImageWriter {
        path: PathBuf,
    }

    impl SingleImageWriter {
        #[must_use]
        pub fn new(path: PathBuf) -> Self {
            SingleImageWriter { path }
        }

        /// Creates the file, writes the primary image, the system/user
        /// keys, and closes it with `DATE-BEG`/`DATE-END`/`DATE`/`COMPSTAT`
        /// set from `date_beg` and `status` (spec.md §4.6, §5).
        pub fn write(
            &self,
            pixels: &[i32],
            datatype: FitsDatatype,
            axes: &[usize],
            system_keys: &KeywordDb,
            user_keys: &KeywordDb,
            date_beg: DateTime<Utc>,
            status: CompletionStatus,
        ) -> Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let description = ImageDescription {
                data_type: datatype.image_type(),
                dimensions: axes,
            };
            let mut fptr = RawFitsFile::create(&self.path)
                .with_custom_primary(&description)
                .open()?;
            let mut hdu = fptr.primary_hdu()?;
            hdu.write_image(&mut fptr, pixels)?;
            keys::write_keys(&mut fptr, &mut hdu, system_keys)?;
            keys::write_keys(&mut fptr, &mut hdu, user_keys)?;
            hdu.write_key(&mut fptr, "BZERO", datatype.bzero())?;
            let date_end = Utc::now();
            let mut closing = KeywordDb::default();
            closing.add_key("DATE-BEG", KeyKind::String, &date_beg.to_rfc3339(), None);
            closing.add_key("DATE-END", KeyKind::String, &date_end.to_rfc3339(), None);
            closing.add_key("DATE", KeyKind::String, &date_end.to_rfc3339(), None);
            closing.add_key("COMPSTAT", KeyKind::String, status.as_str(), None);
            keys::write_keys(&mut fptr, &mut hdu, &closing)?;
            Ok(())
        }
    }

    /// Multi-extension cube writer: an empty primary plus a background
    /// drain task appending one image extension per [`CubeFrame`]
    /// (spec.md §4.6 "Cube path").
    pub struct FitsCubeWriter {
        tx: mpsc::Sender<CubeFrame>,
        done_tx: Option<oneshot::Sender<(CompletionStatus, DateTime<Utc>)>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl FitsCubeWriter {
        /// Creates the empty primary (all-zero axes) and spawns the drain
        /// task. `rollover_enabled` gates the size/frame-cap rollover per
        /// spec.md §9 Open Question 3 (caps retained, behavior opt-in).
        pub fn open(
            path: PathBuf,
            channel_capacity: usize,
            rollover_enabled: bool,
            max_size: u64,
            max_cube_frames: u32,
            system_keys: &KeywordDb,
            user_keys: &KeywordDb,
        ) -> Result<Self> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let description = ImageDescription {
                data_type: ImageType::Long,
                dimensions: &[0, 0],
            };
            let mut fptr = RawFitsFile::create(&path)
                .with_custom_primary(&description)
                .open()?;
            let mut primary = fptr.primary_hdu()?;
            keys::write_keys(&mut fptr, &mut primary, system_keys)?;
            keys::write_keys(&mut fptr, &mut primary, user_keys)?;

            let (tx, rx) = mpsc::channel(channel_capacity);
            let (done_tx, done_rx) = oneshot::channel();
            let handle = tokio::spawn(drain_loop(
                fptr,
                path,
                rx,
                done_rx,
                rollover_enabled,
                max_size,
                max_cube_frames,
            ));
            Ok(FitsCubeWriter {
                tx,
                done_tx: Some(done_tx),
                handle,
            })
        }

        /// Enqueues a frame; blocks (backpressure, not an unbounded deque
        /// per spec.md §9) if the channel is full.
        pub async fn write_image(&self, frame: CubeFrame) -> Result<()> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| crate::error::ArchonError::Other("cube writer task died".into()))
        }

        /// Signals completion and waits for the drain task to finish
        /// flushing (spec.md §4.6: "the worker finalises the file only
        /// after the cache and deque are empty"). `date_beg` is the
        /// exposure's `cmd_start_time`, written as `DATE-BEG`; `status`
        /// becomes `COMPSTAT`.
        pub async fn complete(mut self, status: CompletionStatus, date_beg: DateTime<Utc>) -> Result<()> {
            drop(self.tx);
            if let Some(done_tx) = self.done_tx.take() {
                let _ = done_tx.send((status, date_beg));
            }
            self.handle
                .await
                .map_err(|_| crate::error::ArchonError::Other("cube writer task panicked".into()))
        }
    }

    async fn drain_loop(
        mut fptr: RawFitsFile,
        path: PathBuf,
        mut rx: mpsc::Receiver<CubeFrame>,
        done_rx: oneshot::Receiver<(CompletionStatus, DateTime<Utc>)>,
        rollover_enabled: bool,
        max_size: u64,
        max_cube_frames: u32,
    ) {
        let mut written = 0u32;
        let mut batch = Vec::with_capacity(DRAIN_BATCH);
        loop {
            let n = rx.recv_many(&mut batch, DRAIN_BATCH).await;
            if n == 0 {
                break;
            }
            for frame in batch.drain(..) {
                if let Err(e) = write_extension(&mut fptr, &frame) {
                    warn!(error = %e, seq = frame.seq, "failed to write cube extension");
                    continue;
                }
                written += 1;
                if written % PROGRESS_INTERVAL == 0 {
                    info!(written, "cube writer progress");
                }
                if rollover_enabled {
                    let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    if size_bytes >= max_size || written >= max_cube_frames {
                        warn!(written, size_bytes, "cube cap reached, rollover requested");
                    }
                }
            }
        }

        let (status, date_beg) = done_rx
            .await
            .unwrap_or_else(|_| (CompletionStatus::Aborted, Utc::now()));
        if let Err(e) = write_closing_keys(&mut fptr, status, date_beg) {
            warn!(error = %e, "failed to write cube primary closing keys");
        }
    }

    fn write_closing_keys(
        fptr: &mut RawFitsFile,
        status: CompletionStatus,
        date_beg: DateTime<Utc>,
    ) -> Result<()> {
        let date_end = Utc::now();
        let mut closing = KeywordDb::default();
        closing.add_key("DATE-BEG", KeyKind::String, &date_beg.to_rfc3339(), None);
        closing.add_key("DATE-END", KeyKind::String, &date_end.to_rfc3339(), None);
        closing.add_key("DATE", KeyKind::String, &date_end.to_rfc3339(), None);
        closing.add_key("COMPSTAT", KeyKind::String, status.as_str(), None);
        let mut primary = fptr.primary_hdu()?;
        keys::write_keys(fptr, &mut primary, &closing)
    }

    fn write_extension(fptr: &mut RawFitsFile, frame: &CubeFrame) -> Result<()> {
        let len = frame.pixels.len();
        let description = ImageDescription {
            data_type: ImageType::Long,
            dimensions: &[len],
        };
        let mut hdu = fptr.create_image(frame.extension_name.clone(), &description)?;
        hdu.write_image(fptr, &frame.pixels)?;
        keys::write_keys(fptr, &mut hdu, &frame.system_keys)?;
        Ok(())
    }
}

#[cfg(not(feature = "storage_fits"))]
mod backend {
    use super::*;
    use crate::error::ArchonError;

    pub struct SingleImageWriter;

    impl SingleImageWriter {
        #[must_use]
        pub fn new(_path: PathBuf) -> Self {
            SingleImageWriter
        }

        pub fn write(
            &self,
            _pixels: &[i32],
            _datatype: FitsDatatype,
            _axes: &[usize],
            _system_keys: &KeywordDb,
            _user_keys: &KeywordDb,
            _date_beg: DateTime<Utc>,
            _status: CompletionStatus,
        ) -> Result<()> {
            Err(ArchonError::FeatureNotEnabled("storage_fits".to_string()))
        }
    }

    pub struct FitsCubeWriter;

    impl FitsCubeWriter {
        pub fn open(
            _path: PathBuf,
            _channel_capacity: usize,
            _rollover_enabled: bool,
            _max_size: u64,
            _max_cube_frames: u32,
            _system_keys: &KeywordDb,
            _user_keys: &KeywordDb,
        ) -> Result<Self> {
            Err(ArchonError::FeatureNotEnabled("storage_fits".to_string()))
        }

        pub async fn write_image(&self, _frame: CubeFrame) -> Result<()> {
            Err(ArchonError::FeatureNotEnabled("storage_fits".to_string()))
        }

        pub async fn complete(self, _status: CompletionStatus, _date_beg: DateTime<Utc>) -> Result<()> {
            Err(ArchonError::FeatureNotEnabled("storage_fits".to_string()))
        }
    }
}

pub use backend::{FitsCubeWriter, SingleImageWriter};

/// Populates the system keys every FITS file carries regardless of shape
/// (spec.md §6 "Required header keys"). `cmd_start_time` is the original
/// command time (`DATE-CMD`); `hdr_shift` is the configured header-data
/// bit shift (`HDRSHIFT`).
pub fn populate_system_keys(
    info: &CameraInfo,
    firmware: &str,
    firmware_md5: &str,
    cmd_start_time: DateTime<Utc>,
    hdr_shift: u8,
) -> KeywordDb {
    let mut db = KeywordDb::default();
    db.add_key("FIRMWARE", KeyKind::String, firmware, None);
    db.add_key("FIRM_MD5", KeyKind::String, firmware_md5, Some("MD5 of loaded ACF"));
    db.add_key(
        "ITIME",
        KeyKind::Double,
        &info.exposure_time.ms().to_string(),
        Some("exposure time, ms"),
    );
    db.add_key("SAMPMODE", KeyKind::Int, &info.sampmode.code().to_string(), None);
    db.add_key("MULTISAM", KeyKind::Int, &info.sampmode.multisam().to_string(), None);
    db.add_key("COADDS", KeyKind::Int, &info.nexp.to_string(), None);
    db.add_key("HDRSHIFT", KeyKind::Int, &hdr_shift.to_string(), None);
    db.add_key("DATE-CMD", KeyKind::String, &cmd_start_time.to_rfc3339(), None);
    if let Some(start_time) = info.start_time {
        db.add_key("DATE-OBS", KeyKind::String, &start_time.format("%Y-%m-%d").to_string(), None);
        db.add_key(
            "TIME-OBS",
            KeyKind::String,
            &start_time.format("%H:%M:%S%.3f").to_string(),
            None,
        );
    }
    if let Some(name) = &info.fits_filename {
        db.add_key("FILENAME", KeyKind::String, name, None);
    }
    db
}

/// Per-extension geometry/amplifier keys (spec.md §6 per-extension key
/// list). `BIASSEC`/`READNOI`/`DARKCUR` are omitted: this core has no
/// overscan region or per-amp noise/dark-current calibration data to draw
/// them from (see DESIGN.md).
pub fn populate_extension_keys(info: &CameraInfo) -> KeywordDb {
    let mut db = KeywordDb::default();
    let detsize = format!("[1:{},1:{}]", info.detector_pixels[0], info.detector_pixels[1]);
    let datasec = format!("[1:{},1:{}]", info.imwidth, info.imheight);
    let roisec = format!(
        "[{}:{},{}:{}]",
        info.region_of_interest.x0, info.region_of_interest.x1, info.region_of_interest.y0, info.region_of_interest.y1
    );
    db.add_key("DETSIZE", KeyKind::String, &detsize, None);
    db.add_key("CCDSEC", KeyKind::String, &datasec, None);
    db.add_key("DETSEC", KeyKind::String, &datasec, None);
    db.add_key("DATASEC", KeyKind::String, &datasec, None);
    db.add_key("TRIMSEC", KeyKind::String, &datasec, None);
    db.add_key("ROISEC", KeyKind::String, &roisec, None);
    if let Some(first) = info.amp_sections.first() {
        let ampsec = format!("[{}:{},{}:{}]", first.x0, first.x1, first.y0, first.y1);
        db.add_key("AMPSEC", KeyKind::String, &ampsec, None);
        db.add_key("AMP_ID", KeyKind::Int, "1", None);
        db.add_key("AMP_NAME", KeyKind::String, "AMP1", None);
    }
    if let Some((_, entry)) = info.system_keys.iter().find(|(k, _)| *k == "GAIN01") {
        if let crate::camera_info::KeyValue::Float(v) = &entry.value {
            db.add_key("GAIN", KeyKind::Float, &v.to_string(), None);
        }
    }
    if let Some(t) = info.start_time {
        db.add_key("UTC", KeyKind::String, &t.to_rfc3339(), None);
    }
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_is_unique_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = chrono::DateTime::from_timestamp(0, 0).unwrap();
        let p1 = build_output_path(dir.path(), false, "nirc2", stamp);
        std::fs::write(&p1, b"").unwrap();
        let p2 = build_output_path(dir.path(), false, "nirc2", stamp);
        assert_ne!(p1, p2);
    }

    #[test]
    fn dirmode_nests_under_date_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = chrono::DateTime::from_timestamp(0, 0).unwrap();
        let p = build_output_path(dir.path(), true, "nirc2", stamp);
        assert!(p.parent().unwrap().ends_with("19700101"));
    }

    #[test]
    fn system_keys_include_firmware_and_md5() {
        let info = CameraInfo::new(
            FitsDatatype::UShort,
            crate::camera_info::SampleMode::Cds,
            crate::camera_info::ReadoutType::None,
        );
        let cmd_start = DateTime::from_timestamp(0, 0).unwrap();
        let db = populate_system_keys(&info, "/tmp/nirc2.acf", "deadbeef", cmd_start, 2);
        let keys: Vec<&str> = db.iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"FIRMWARE"));
        assert!(keys.contains(&"FIRM_MD5"));
        assert!(keys.contains(&"DATE-CMD"));
        assert!(keys.contains(&"HDRSHIFT"));
        assert!(keys.contains(&"MULTISAM"));
    }

    #[test]
    fn extension_keys_include_geometry() {
        let info = CameraInfo::new(
            FitsDatatype::UShort,
            crate::camera_info::SampleMode::Cds,
            crate::camera_info::ReadoutType::None,
        );
        let db = populate_extension_keys(&info);
        let keys: Vec<&str> = db.iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"DETSIZE"));
        assert!(keys.contains(&"DATASEC"));
        assert!(keys.contains(&"ROISEC"));
    }
}
