//! Exposure sequencer: the concurrent state machine behind one `do_expose`
//! call, from `EXPOSE` through read, deinterlace, and write (spec.md §4.4,
//! §4.7, §4.8).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::camera_info::{CameraInfo, KeyKind, KeywordDb, SampleMode};
use crate::config::ArchonSettings;
use crate::error::{ArchonError, Result};
use crate::fits::{self, CompletionStatus, CubeFrame, FitsCubeWriter, SingleImageWriter};
use crate::frame_status::{get_frame_status, FrameStatus};
use crate::ring::{Ring, SlotState, RING_SIZE};
use crate::sample_mode::{make_deinterlacer, DeinterlaceContext};
use crate::session::ControllerSession;

/// Consecutive BUSY replies `wait_for_readout` tolerates before giving up
/// (spec.md §4.7: "up to ~30000 consecutive BUSY replies (≈3 s)").
const MAX_BUSY_RETRIES: u32 = 30_000;
const READOUT_POLL_INTERVAL: Duration = Duration::from_micros(100);
/// Backlog the cube writer's channel tolerates before the producer blocks
/// (spec.md §9, "back-pressure is the producer blocking").
const CUBE_CHANNEL_CAPACITY: usize = 16;

/// Per-exposure sequencing state: abort flag and the counters the end-of-run
/// invariants are checked against (spec.md §5 "Counters", §8).
pub struct ExposureSequencer {
    aborted: AtomicBool,
    deinterlace_count: AtomicU32,
    write_frame_count: AtomicU32,
    progress: StdMutex<f64>,
}

impl Default for ExposureSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl ExposureSequencer {
    #[must_use]
    pub fn new() -> Self {
        ExposureSequencer {
            aborted: AtomicBool::new(false),
            deinterlace_count: AtomicU32::new(0),
            write_frame_count: AtomicU32::new(0),
            progress: StdMutex::new(0.0),
        }
    }

    /// Cooperative cancellation flag checked at every suspension point
    /// (spec.md §5 "Cancellation").
    pub fn request_abort(&self) {
        warn!("exposure abort requested");
        self.aborted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Monotonic `[0,1]` progress through the current exposure's integration
    /// (spec.md §4.7).
    #[must_use]
    pub fn progress(&self) -> f64 {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many frames have been deinterlaced so far this exposure.
    #[must_use]
    pub fn deinterlace_count(&self) -> u32 {
        self.deinterlace_count.load(Ordering::Acquire)
    }

    /// How many frames have been written (or discarded-on-abort) so far.
    #[must_use]
    pub fn write_frame_count(&self) -> u32 {
        self.write_frame_count.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
        self.deinterlace_count.store(0, Ordering::Release);
        self.write_frame_count.store(0, Ordering::Release);
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = 0.0;
    }

    fn set_progress(&self, value: f64) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = value.clamp(0.0, 1.0);
    }

    /// Waits out the integration: a rough host-clock sleep until 1 s before
    /// the deadline, then polls Archon `TIMER` every 1 ms (spec.md §4.7).
    /// On abort, raises `abort_param` and returns cleanly rather than an
    /// error.
    pub async fn wait_for_exposure(
        &self,
        session: &ControllerSession,
        abort_param: &str,
        exposure_delay_ms: f64,
    ) -> Result<()> {
        let exposure_delay_ms = exposure_delay_ms.max(0.0);
        let timeout = Duration::from_millis(exposure_delay_ms as u64 + 1000)
            .max(Duration::from_millis(1000));
        let start = Instant::now();
        let deadline = start + Duration::from_millis(exposure_delay_ms as u64);
        let rough_until = deadline.checked_sub(Duration::from_secs(1)).unwrap_or(start);

        let now = Instant::now();
        if now < rough_until {
            sleep(rough_until - now).await;
        }

        loop {
            if self.is_aborted() {
                session.write_named_param(abort_param, "1").await?;
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(ArchonError::Timeout {
                    what: "exposure integration".into(),
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
            if Instant::now() >= deadline {
                break;
            }
            let _ = session.transport.command("TIMER").await;
            let elapsed_ms = start.elapsed().as_millis() as f64;
            self.set_progress(elapsed_ms / exposure_delay_ms.max(1.0));
            sleep(Duration::from_millis(1)).await;
        }
        self.set_progress(1.0);
        Ok(())
    }

    /// Polls `get_frame_status()` until the newest-complete buffer advances
    /// past `lastframe`, tolerating transient BUSY (spec.md §4.7).
    pub async fn wait_for_readout(
        &self,
        session: &ControllerSession,
        readout_time: Duration,
        active_bufs: usize,
        lastframe: &mut u32,
    ) -> Result<FrameStatus> {
        let timeout = readout_time.mul_f64(1.1);
        let start = Instant::now();
        let mut busy_retries = 0u32;
        loop {
            if self.is_aborted() {
                return Err(ArchonError::Aborted);
            }
            if start.elapsed() >= timeout {
                return Err(ArchonError::Timeout {
                    what: "readout".into(),
                    elapsed_ms: timeout.as_millis() as u64,
                });
            }
            match get_frame_status(&session.transport, active_bufs).await {
                Ok(status) => {
                    let buf = status.buffers[status.index];
                    if buf.framen != *lastframe && buf.complete == 1 {
                        *lastframe = buf.framen;
                        return Ok(status);
                    }
                }
                Err(ArchonError::Busy) => {
                    busy_retries += 1;
                    if busy_retries > MAX_BUSY_RETRIES {
                        return Err(ArchonError::Busy);
                    }
                }
                Err(e) => return Err(e),
            }
            sleep(READOUT_POLL_INTERVAL).await;
        }
    }

    /// Runs one exposure command through to completion: configures the
    /// camera, drives `nseq` readouts through the ring, and writes the
    /// resulting FITS output (spec.md §4.4).
    ///
    /// `nseq_in` is what the caller asked for; a request for exactly one
    /// frame under up-the-ramp sampling is the "SAMPMODE_SINGLE" case
    /// (spec.md §4.4 step 8, §8): Archon is told 2 so its own reset frame
    /// is absorbed, and the first of the two received frames is discarded
    /// rather than written.
    ///
    /// `num_pre_exposures` adds throwaway iterations ahead of the `nseq_in`
    /// frames actually kept (spec.md §4.4 step 3): the first
    /// `num_pre_exposures` iterations wait out the exposure delay and one
    /// readout, then move on without touching the ring. `None` defaults to
    /// 1, per spec.
    pub async fn do_expose(
        &self,
        session: Arc<ControllerSession>,
        ring: Arc<Ring>,
        settings: &ArchonSettings,
        info: &mut CameraInfo,
        nseq_in: u32,
        num_pre_exposures: Option<u32>,
    ) -> Result<()> {
        self.reset();
        let cmd_start_time = chrono::Utc::now();

        if !session.modeselected.load(Ordering::Acquire) {
            return Err(ArchonError::Other("no camera mode selected".into()));
        }

        let num_pre_exposures = num_pre_exposures.unwrap_or(1);
        let is_single = matches!(info.sampmode, SampleMode::Utr { samples, .. } if samples <= 1);
        let (nseq, archon_nseq) = sequence_counts(nseq_in, num_pre_exposures, is_single);
        let user_nseq = if is_single { 1 } else { nseq_in.max(1) };

        info.nseq = nseq;
        info.reset_extension();
        let ismex = info.mex();
        let pixel_count = (info.imwidth * info.imheight) as usize;

        let image_bytes = info.image_data_bytes(1, "exposure")? as usize;
        let work_bytes = pixel_count * info.cubedepth.max(1) as usize * 4;
        let cds_bytes = if info.iscds { pixel_count * 4 } else { 0 };
        for idx in 0..RING_SIZE {
            ring.ensure_capacity(idx, image_bytes, work_bytes, cds_bytes).await;
        }

        let active_bufs = crate::camera_info::NBUFS;
        let initial_status = get_frame_status(&session.transport, active_bufs).await?;
        let mut lastframe = initial_status.buffers[initial_status.index].framen;

        session
            .write_named_param(&settings.params.expose_param, &archon_nseq.to_string())
            .await?;

        let start_time = chrono::Utc::now();
        info.start_time = Some(start_time);
        let (firmware_path, firmware_md5) = {
            let db = session.database.lock().unwrap_or_else(|e| e.into_inner());
            (
                db.firmware_path.clone().unwrap_or_default(),
                db.firmware_md5.clone().unwrap_or_default(),
            )
        };
        info.system_keys.merge(fits::populate_system_keys(
            info,
            &firmware_path,
            &firmware_md5,
            cmd_start_time,
            settings.timing.hdr_shift,
        ));

        let path = fits::build_output_path(
            std::path::Path::new(&settings.imdir),
            settings.dirmode,
            &settings.basename,
            start_time,
        );
        info.fits_filename = path.file_name().map(|n| n.to_string_lossy().into_owned());

        let cube_writer = if ismex {
            Some(Arc::new(FitsCubeWriter::open(
                path.clone(),
                CUBE_CHANNEL_CAPACITY,
                false,
                fits::DEFAULT_MAX_SIZE,
                fits::DEFAULT_MAX_CUBE_FRAMES,
                &info.system_keys,
                &info.user_keys,
            )?))
        } else {
            None
        };

        // Plain CDS (non-mex) runs coadd successive read pairs into one
        // single-HDU result (spec.md §4.5, §4.6 "Single-image path").
        let mut coaddbuf = if !ismex && info.iscds {
            vec![0i32; pixel_count]
        } else {
            Vec::new()
        };

        let params = DeinterlaceParams {
            datatype: info.datatype,
            readout_type: info.readout_type,
            imheight: info.imheight,
            imwidth: info.imwidth,
            cubedepth: info.cubedepth,
            hdr_shift: settings.timing.hdr_shift,
            iscds: info.iscds,
            nmcds: nmcds_for(&info.sampmode),
        };

        let mut handles = Vec::new();
        let mut first_frame_timestamp: Option<u64> = None;
        let mut discarded_first = false;
        let mut seq = 0u32;

        // For SAMPMODE_SINGLE, Archon is told `archon_nseq == 2` but only
        // one slice is ever written; the loop reads both and drops the
        // first (spec.md §4.4 step 8).
        for read in 0..archon_nseq {
            if self.is_aborted() {
                break;
            }

            let expcount = read + 1;
            if expcount <= num_pre_exposures {
                self.wait_for_exposure(&session, &settings.params.abort_param, info.exposure_delay.ms())
                    .await?;
                let _ = self
                    .wait_for_readout(
                        &session,
                        settings.timing.readout_time,
                        active_bufs,
                        &mut lastframe,
                    )
                    .await?;
                continue;
            }

            let status = self
                .wait_for_readout(
                    &session,
                    settings.timing.readout_time,
                    active_bufs,
                    &mut lastframe,
                )
                .await?;

            if is_single && !discarded_first {
                discarded_first = true;
                continue;
            }

            let buf = status.buffers[status.index];
            let ts = buf.timestamp;
            let first_ts = *first_frame_timestamp.get_or_insert(ts);
            let dts = ts.saturating_sub(first_ts);

            let idx = ring.ringcount();
            ring.lock_slot(idx).await?;
            let read_result = read_frame(&session, buf.base as u32, image_bytes as u32, &ring, idx).await;
            if let Err(e) = read_result {
                ring.unlock_slot(idx);
                return Err(e);
            }

            let mut keys = KeywordDb::default();
            keys.add_key(&format!("TS{seq}"), KeyKind::Long, &ts.to_string(), None);
            keys.add_key(&format!("DTS{seq}"), KeyKind::Long, &dts.to_string(), None);
            keys.add_key("NSLICE", KeyKind::Int, &(seq + 1).to_string(), None);
            if user_nseq % 2 == 0 && seq + 1 == user_nseq / 2 {
                keys.add_key(
                    "TRUITIME",
                    KeyKind::Double,
                    &(dts as f64 / 1e8).to_string(),
                    Some("true integration time, s"),
                );
            }
            keys.merge(fits::populate_extension_keys(info));

            if ismex {
                ring.clear_deinterlaced(idx);
                let extension = info.next_extension();
                let handle = tokio::spawn(deinterlace_and_write(
                    ring.clone(),
                    idx,
                    cube_writer.clone().expect("mex run always opens a cube writer"),
                    params,
                    keys,
                    extension,
                ));
                handles.push(handle);
                ring.unlock_slot(idx);
            } else {
                let image = ring.image(idx).await;
                let mut work = vec![0i32; pixel_count * params.cubedepth.max(1) as usize];
                let mut cds_dst = if params.iscds { vec![0i32; pixel_count] } else { Vec::new() };
                run_deinterlace(&image, &mut work, &mut cds_dst, params)?;
                drop(image);
                ring.unlock_slot(idx);

                if params.iscds {
                    fold_cds(&mut coaddbuf, &cds_dst);
                } else {
                    let writer = SingleImageWriter::new(path.clone());
                    writer.write(
                        &work,
                        info.datatype,
                        &[info.imwidth as usize, info.imheight as usize],
                        &keys,
                        &info.user_keys,
                        cmd_start_time,
                        CompletionStatus::Completed,
                    )?;
                    self.write_frame_count.fetch_add(1, Ordering::AcqRel);
                }
            }

            ring.advance();
            self.deinterlace_count.fetch_add(1, Ordering::AcqRel);
            seq += 1;
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {
                    self.write_frame_count.fetch_add(1, Ordering::AcqRel);
                }
                Ok(Err(e)) => warn!(error = %e, "mex write task failed"),
                Err(e) => warn!(error = %e, "mex write task panicked"),
            }
        }

        let completion_status = if self.is_aborted() {
            CompletionStatus::Aborted
        } else {
            CompletionStatus::Completed
        };

        if let Some(writer) = cube_writer {
            if let Ok(writer) = Arc::try_unwrap(writer) {
                writer.complete(completion_status, cmd_start_time).await?;
            }
        }

        if !ismex && info.iscds {
            let writer = SingleImageWriter::new(path.clone());
            writer.write(
                &coaddbuf,
                info.datatype,
                &[info.imwidth as usize, info.imheight as usize],
                &info.system_keys,
                &info.user_keys,
                cmd_start_time,
                completion_status,
            )?;
            self.write_frame_count.fetch_add(1, Ordering::AcqRel);
        }

        if self.is_aborted() {
            info!(written = self.write_frame_count(), "exposure aborted");
            ring.broadcast_abort();
        } else {
            info!(written = self.write_frame_count(), nseq, "exposure complete");
        }

        Ok(())
    }
}

/// Per-call deinterlace parameters, pulled out of `CameraInfo` so the
/// spawned mex task doesn't need to borrow it across an await.
#[derive(Clone, Copy)]
struct DeinterlaceParams {
    datatype: crate::camera_info::FitsDatatype,
    readout_type: crate::camera_info::ReadoutType,
    imheight: u32,
    imwidth: u32,
    cubedepth: u32,
    hdr_shift: u8,
    iscds: bool,
    nmcds: u32,
}

/// Computes the total iteration count and the count told to Archon
/// (spec.md §4.4 steps 3, 8): `nseq = user_nseq + num_pre_exposures`, with
/// the SAMPMODE_SINGLE case still telling Archon 2 regardless of
/// `num_pre_exposures`.
fn sequence_counts(nseq_in: u32, num_pre_exposures: u32, is_single: bool) -> (u32, u32) {
    let user_nseq = if is_single { 1 } else { nseq_in.max(1) };
    let nseq = user_nseq + num_pre_exposures;
    let archon_nseq = if is_single { 2 } else { nseq };
    (nseq, archon_nseq)
}

fn nmcds_for(mode: &SampleMode) -> u32 {
    match mode {
        SampleMode::Mcds { frames, .. } => *frames,
        SampleMode::Cds => 2,
        _ => 0,
    }
}

/// Folds `(signal - baseline)` CDS results from successive read pairs into
/// the running coadd (spec.md §4.5, "cds_aggregator_thread" arithmetic,
/// performed inline here since the non-mex path has no concurrent writer to
/// synchronize against).
fn fold_cds(coaddbuf: &mut [i32], cds: &[i32]) {
    for (c, v) in coaddbuf.iter_mut().zip(cds.iter()) {
        *c += v;
    }
}

/// Performs one FETCH into ring slot `idx` (spec.md §4.5 `read_frame`).
async fn read_frame(
    session: &ControllerSession,
    addr: u32,
    image_bytes: u32,
    ring: &Ring,
    idx: usize,
) -> Result<()> {
    let blocks = image_bytes / crate::camera_info::BLOCK_LEN;
    let msgref = session.transport.fetch_begin(addr, blocks).await?;
    let mut guard = ring.image_mut(idx).await;
    let result: Result<()> = async {
        for chunk in guard.chunks_mut(crate::camera_info::BLOCK_LEN as usize) {
            session.transport.fetch_block(msgref, chunk).await?;
        }
        Ok(())
    }
    .await;
    drop(guard);
    session.transport.fetch_end();
    result
}

/// Runs the readout-type-appropriate deinterlacer over `image`, writing
/// pixels into `work` (and `cds_dst`, for CDS/MCDS video).
fn run_deinterlace(
    image: &[u8],
    work: &mut [i32],
    cds_dst: &mut [i32],
    params: DeinterlaceParams,
) -> Result<()> {
    let deinterlacer = make_deinterlacer(params.readout_type);
    let mut coaddbuf: Vec<i32> = Vec::new();
    let mut mcdsbuf_0 = vec![0i32; work.len()];
    let mut mcdsbuf_1 = vec![0i32; work.len()];
    let has_cds_dst = !cds_dst.is_empty();
    let mut ctx = DeinterlaceContext {
        src: image,
        dst: work,
        cds_dst: if has_cds_dst { Some(cds_dst) } else { None },
        coaddbuf: &mut coaddbuf,
        mcdsbuf_0: &mut mcdsbuf_0,
        mcdsbuf_1: &mut mcdsbuf_1,
        iscds: params.iscds,
        nmcds: params.nmcds,
        detector_pixels: [params.imwidth, params.imheight],
        imheight: params.imheight,
        imwidth: params.imwidth,
        cubedepth: params.cubedepth,
        datatype: params.datatype,
        hdr_shift: params.hdr_shift,
    };
    deinterlacer.do_deinterlace(&mut ctx)
}

/// The mex path's detached deinterlace+write task for one ring slot
/// (spec.md §4.4: "spawn a detached deinterlace thread and a detached
/// write-frame thread ... the write thread blocks on the deinterlace cv").
/// Folded into one task here since both halves run sequentially within it
/// and sharing the ring slot guard across a second spawn boundary would
/// require cloning the data out anyway.
async fn deinterlace_and_write(
    ring: Arc<Ring>,
    idx: usize,
    cube_writer: Arc<FitsCubeWriter>,
    params: DeinterlaceParams,
    system_keys: KeywordDb,
    extension: u32,
) -> Result<()> {
    ring.set_state(idx, SlotState::Deinterlacing).await;
    let pixel_count = (params.imwidth * params.imheight) as usize;
    let work_len = pixel_count * params.cubedepth.max(1) as usize;
    let mut work = vec![0i32; work_len];
    let mut cds_dst = if params.iscds { vec![0i32; pixel_count] } else { Vec::new() };

    {
        let image = ring.image(idx).await;
        run_deinterlace(&image, &mut work, &mut cds_dst, params)?;
    }
    ring.mark_deinterlaced(idx);
    ring.set_state(idx, SlotState::Writing).await;

    let pixels = if params.iscds { cds_dst } else { work };
    let frame = CubeFrame {
        pixels,
        timestamp: 0,
        seq: extension,
        system_keys,
        extension_name: format!("IM{extension}"),
    };
    cube_writer.write_image(frame).await?;
    ring.set_state(idx, SlotState::Empty).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counts_add_pre_exposures() {
        assert_eq!(sequence_counts(4, 1, false), (5, 5));
        assert_eq!(sequence_counts(4, 0, false), (4, 4));
    }

    #[test]
    fn sequence_counts_single_always_tells_archon_two() {
        assert_eq!(sequence_counts(1, 1, true), (2, 2));
        assert_eq!(sequence_counts(1, 0, true), (1, 2));
    }

    #[test]
    fn nmcds_matches_sample_mode() {
        assert_eq!(nmcds_for(&SampleMode::Cds), 2);
        assert_eq!(nmcds_for(&SampleMode::Mcds { frames: 8, ext: 1 }), 8);
        assert_eq!(nmcds_for(&SampleMode::Video), 0);
    }

    #[test]
    fn single_frame_utr_is_detected_as_sampmode_single() {
        let single = SampleMode::Utr { samples: 1, ramps: 1 };
        let multi = SampleMode::Utr { samples: 8, ramps: 1 };
        assert!(matches!(single, SampleMode::Utr { samples: 1, .. }));
        assert!(!matches!(multi, SampleMode::Utr { samples: 1, .. }));
    }

    #[test]
    fn fold_cds_accumulates_across_calls() {
        let mut coadd = vec![0i32; 4];
        fold_cds(&mut coadd, &[1, 2, 3, 4]);
        fold_cds(&mut coadd, &[1, 1, 1, 1]);
        assert_eq!(coadd, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn progress_starts_at_zero_and_resets() {
        let seq = ExposureSequencer::new();
        assert_eq!(seq.progress(), 0.0);
        seq.set_progress(0.5);
        assert_eq!(seq.progress(), 0.5);
        seq.reset();
        assert_eq!(seq.progress(), 0.0);
    }

    #[test]
    fn abort_flag_round_trips() {
        let seq = ExposureSequencer::new();
        assert!(!seq.is_aborted());
        seq.request_abort();
        assert!(seq.is_aborted());
    }

    #[tracing_test::traced_test]
    #[test]
    fn abort_request_is_logged() {
        let seq = ExposureSequencer::new();
        seq.request_abort();
        assert!(logs_contain("exposure abort requested"));
    }
}
