//! Tap deinterlacing and CDS/MCDS/UTR sample-mode arithmetic (spec.md §4.5).
//!
//! One [`Deinterlacer`] implementation per [`ReadoutType`], selected at
//! mode-set time (spec.md §9, "Template deinterlacers"), plus the CDS
//! aggregator loop that turns a sequence of deinterlaced baseline/signal
//! frames into the coadded correlated-double-sampled image.

use tokio::sync::Notify;

use crate::camera_info::{FitsDatatype, ReadoutType};
use crate::error::{ArchonError, Result};

/// Everything a [`Deinterlacer`] needs for one frame (spec.md §4.5).
pub struct DeinterlaceContext<'a> {
    /// Raw tap-interleaved bytes FETCHed off the wire.
    pub src: &'a [u8],
    /// Deinterlaced pixel destination, one `i32` per pixel regardless of
    /// storage width (narrowed on write-out by the FITS writer).
    pub dst: &'a mut [i32],
    /// CDS-result destination, present only when `iscds`.
    pub cds_dst: Option<&'a mut [i32]>,
    pub coaddbuf: &'a mut [i32],
    /// Baseline-frame sum (first half of the cube).
    pub mcdsbuf_0: &'a mut [i32],
    /// Signal-frame sum (second half of the cube).
    pub mcdsbuf_1: &'a mut [i32],
    pub iscds: bool,
    /// Number of read pairs averaged (0 outside CDS/MCDS).
    pub nmcds: u32,
    pub detector_pixels: [u32; 2],
    pub imheight: u32,
    pub imwidth: u32,
    pub cubedepth: u32,
    pub datatype: FitsDatatype,
    pub hdr_shift: u8,
}

/// Per-`ReadoutType` deinterlacer (spec.md §9).
pub trait Deinterlacer: Send {
    fn do_deinterlace(&self, ctx: &mut DeinterlaceContext<'_>) -> Result<()>;
}

/// Builds the deinterlacer appropriate for `readout_type`.
#[must_use]
pub fn make_deinterlacer(readout_type: ReadoutType) -> Box<dyn Deinterlacer> {
    match readout_type {
        ReadoutType::None => Box::new(NoneDeinterlacer),
        ReadoutType::Nirc2 => Box::new(Nirc2Deinterlacer),
        ReadoutType::Nirc2Video => Box::new(Nirc2VideoDeinterlacer),
        ReadoutType::Raw => Box::new(RawDeinterlacer),
    }
}

/// Unpacks one raw sample from `src` at byte offset `pixel * width`,
/// applying HDR shift (32-bit) or the unsigned-to-signed offset (16-bit),
/// per spec.md §4.5.
fn unpack_sample(src: &[u8], pixel: usize, datatype: FitsDatatype, hdr_shift: u8) -> i32 {
    match datatype {
        FitsDatatype::UShort | FitsDatatype::Short => {
            let off = pixel * 2;
            let raw = u16::from_le_bytes([src[off], src[off + 1]]);
            i32::from(raw) - 32768
        }
        FitsDatatype::Float | FitsDatatype::Long => {
            let off = pixel * 4;
            let raw = u32::from_le_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]]);
            (raw >> hdr_shift) as i32
        }
    }
}

/// Splits `src` tap-interleaved samples into row-major pixel order across
/// `namps` amplifier taps, writing into `dst` at `frame_offset`. This is the
/// shared tap-unscrambling step every readout type performs before its own
/// arithmetic (spec.md §4.5: "tap-interleaved pixel unscrambling per the STA
/// Archon tap geometry").
fn unscramble_tap_interleaved(
    ctx: &DeinterlaceContext<'_>,
    namps: u32,
    frame_offset: usize,
    frame_pixels: usize,
) -> Vec<i32> {
    let namps = namps.max(1) as usize;
    let mut out = vec![0i32; frame_pixels];
    let bytes_per_pixel = ctx.datatype.bytes_per_pixel() as usize;
    let base = frame_offset * bytes_per_pixel;
    for (i, slot) in out.iter_mut().enumerate() {
        let tap = i % namps;
        let within_tap = i / namps;
        let src_pixel = (base / bytes_per_pixel) + tap * (frame_pixels / namps) + within_tap;
        *slot = unpack_sample(ctx.src, src_pixel, ctx.datatype, ctx.hdr_shift);
    }
    out
}

/// Accumulates `frame` into `mcdsbuf_0` (first half of the cube) or
/// `mcdsbuf_1` (second half), per spec.md §4.5: "the first `cubedepth/2`
/// frames are added into `mcdsbuf_0`, the remaining into `mcdsbuf_1`".
fn accumulate_cds(ctx: &mut DeinterlaceContext<'_>, frame_index: u32, frame: &[i32]) {
    let half = ctx.cubedepth / 2;
    let target = if frame_index < half {
        &mut *ctx.mcdsbuf_0
    } else {
        &mut *ctx.mcdsbuf_1
    };
    for (t, v) in target.iter_mut().zip(frame.iter()) {
        *t += v;
    }
}

struct NoneDeinterlacer;
impl Deinterlacer for NoneDeinterlacer {
    fn do_deinterlace(&self, ctx: &mut DeinterlaceContext<'_>) -> Result<()> {
        let frame_pixels = (ctx.imwidth * ctx.imheight) as usize;
        if frame_pixels == 0 {
            return Err(ArchonError::ZeroImageSize("NONE".into()));
        }
        let frames = ctx.cubedepth.max(1);
        for f in 0..frames {
            let frame = unscramble_tap_interleaved(ctx, 1, f as usize * frame_pixels, frame_pixels);
            if ctx.iscds {
                accumulate_cds(ctx, f, &frame);
            } else {
                ctx.dst[f as usize * frame_pixels..(f as usize + 1) * frame_pixels]
                    .copy_from_slice(&frame);
            }
        }
        Ok(())
    }
}

struct Nirc2Deinterlacer;
impl Deinterlacer for Nirc2Deinterlacer {
    fn do_deinterlace(&self, ctx: &mut DeinterlaceContext<'_>) -> Result<()> {
        let frame_pixels = (ctx.imwidth * ctx.imheight) as usize;
        if frame_pixels == 0 {
            return Err(ArchonError::ZeroImageSize("NIRC2".into()));
        }
        let frames = ctx.cubedepth.max(1);
        for f in 0..frames {
            let frame = unscramble_tap_interleaved(ctx, 4, f as usize * frame_pixels, frame_pixels);
            if ctx.iscds {
                accumulate_cds(ctx, f, &frame);
            } else {
                ctx.dst[f as usize * frame_pixels..(f as usize + 1) * frame_pixels]
                    .copy_from_slice(&frame);
            }
        }
        Ok(())
    }
}

/// NIRC2 video: non-CDS single-frame extensions and RXRV (CDS video) pairs,
/// both written directly rather than accumulated across the exposure
/// (spec.md §4.5: "RXRV (video CDS) writes consecutive pairs; non-CDS video
/// writes raw single frames").
struct Nirc2VideoDeinterlacer;
impl Deinterlacer for Nirc2VideoDeinterlacer {
    fn do_deinterlace(&self, ctx: &mut DeinterlaceContext<'_>) -> Result<()> {
        let frame_pixels = (ctx.imwidth * ctx.imheight) as usize;
        if frame_pixels == 0 {
            return Err(ArchonError::ZeroImageSize("NIRC2VIDEO".into()));
        }
        if ctx.iscds {
            let baseline = unscramble_tap_interleaved(ctx, 4, 0, frame_pixels);
            let signal = unscramble_tap_interleaved(ctx, 4, frame_pixels, frame_pixels);
            let cds_dst = ctx
                .cds_dst
                .as_deref_mut()
                .ok_or_else(|| ArchonError::Other("CDS video requires cds_dst".into()))?;
            for ((d, b), s) in cds_dst.iter_mut().zip(baseline.iter()).zip(signal.iter()) {
                *d = s - b;
            }
        } else {
            let frame = unscramble_tap_interleaved(ctx, 4, 0, frame_pixels);
            ctx.dst[..frame_pixels].copy_from_slice(&frame);
        }
        Ok(())
    }
}

struct RawDeinterlacer;
impl Deinterlacer for RawDeinterlacer {
    fn do_deinterlace(&self, ctx: &mut DeinterlaceContext<'_>) -> Result<()> {
        // RAW bypasses normal geometry and tap unscrambling entirely
        // (spec.md §3: "the mode named RAW ... bypasses normal geometry").
        let frame_pixels = ctx.dst.len();
        let frame = unscramble_tap_interleaved(ctx, 1, 0, frame_pixels);
        ctx.dst.copy_from_slice(&frame);
        Ok(())
    }
}

/// Owns the persistent `coadd` accumulator for one exposure's CDS aggregator
/// (spec.md §4.5, "cds_aggregator_thread"). Only spawned when `iscds`.
pub struct CdsAggregator {
    coadd: tokio::sync::Mutex<Vec<i32>>,
    notify: Notify,
}

impl CdsAggregator {
    #[must_use]
    pub fn new(pixel_count: usize) -> Self {
        CdsAggregator {
            coadd: tokio::sync::Mutex::new(vec![0i32; pixel_count]),
            notify: Notify::new(),
        }
    }

    /// Wakes the aggregator loop after a new deinterlaced frame is ready.
    pub fn notify_frame_ready(&self) {
        self.notify.notify_one();
    }

    /// Runs until `deinterlace_count` reaches `nseq` or abort is observed,
    /// each wake folding `(mcdsbuf_1 - mcdsbuf_0) / (nmcds/2)` into `coadd`
    /// (spec.md §4.5). `mcdsbuf_0`/`mcdsbuf_1` are shared with the deinterlace
    /// task that refills them each iteration, so each wake takes only a
    /// short-lived lock rather than holding one for the aggregator's whole
    /// lifetime. On completion, copies `coadd` into `coaddbuf`.
    pub async fn run(
        &self,
        deinterlace_count: &std::sync::atomic::AtomicU32,
        nseq: u32,
        aborted: &std::sync::atomic::AtomicBool,
        nmcds: u32,
        mcdsbuf_0: &tokio::sync::Mutex<Vec<i32>>,
        mcdsbuf_1: &tokio::sync::Mutex<Vec<i32>>,
        coaddbuf: &mut [i32],
    ) {
        use std::sync::atomic::Ordering;
        loop {
            if aborted.load(Ordering::Acquire) || deinterlace_count.load(Ordering::Acquire) >= nseq
            {
                break;
            }
            self.notify.notified().await;
            if nmcds > 0 {
                let divisor = (nmcds / 2).max(1) as i64;
                let b0 = mcdsbuf_0.lock().await;
                let b1 = mcdsbuf_1.lock().await;
                let mut coadd = self.coadd.lock().await;
                for ((c, b), s) in coadd.iter_mut().zip(b0.iter()).zip(b1.iter()) {
                    let diff = i64::from(*s - *b) / divisor;
                    *c += diff as i32;
                }
            }
        }
        let coadd = self.coadd.lock().await;
        coaddbuf.copy_from_slice(&coadd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_ushort_frame(values: &[u16]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| v.wrapping_add(32768).to_le_bytes())
            .collect()
    }

    #[test]
    fn none_deinterlacer_round_trips_single_tap_frame() {
        let values: Vec<u16> = (0..16).collect();
        let src = encode_ushort_frame(&values);
        let mut dst = vec![0i32; 16];
        let mut coadd = vec![];
        let mut b0 = vec![];
        let mut b1 = vec![];
        let mut ctx = DeinterlaceContext {
            src: &src,
            dst: &mut dst,
            cds_dst: None,
            coaddbuf: &mut coadd,
            mcdsbuf_0: &mut b0,
            mcdsbuf_1: &mut b1,
            iscds: false,
            nmcds: 0,
            detector_pixels: [4, 4],
            imheight: 4,
            imwidth: 4,
            cubedepth: 1,
            datatype: FitsDatatype::UShort,
            hdr_shift: 0,
        };
        NoneDeinterlacer.do_deinterlace(&mut ctx).unwrap();
        let expected: Vec<i32> = values.iter().map(|&v| i32::from(v)).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn cds_video_computes_signal_minus_baseline() {
        let baseline: Vec<u16> = vec![100; 16];
        let signal: Vec<u16> = vec![150; 16];
        let mut src = encode_ushort_frame(&baseline);
        src.extend(encode_ushort_frame(&signal));
        let mut dst = vec![0i32; 16];
        let mut cds_dst = vec![0i32; 16];
        let mut coadd = vec![];
        let mut b0 = vec![];
        let mut b1 = vec![];
        let mut ctx = DeinterlaceContext {
            src: &src,
            dst: &mut dst,
            cds_dst: Some(&mut cds_dst),
            coaddbuf: &mut coadd,
            mcdsbuf_0: &mut b0,
            mcdsbuf_1: &mut b1,
            iscds: true,
            nmcds: 2,
            detector_pixels: [4, 4],
            imheight: 4,
            imwidth: 4,
            cubedepth: 2,
            datatype: FitsDatatype::UShort,
            hdr_shift: 0,
        };
        Nirc2VideoDeinterlacer.do_deinterlace(&mut ctx).unwrap();
        assert!(cds_dst.iter().all(|&v| v == 50));
    }

    #[tokio::test]
    async fn cds_aggregator_averages_mcds_pairs() {
        use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        let aggregator = CdsAggregator::new(4);
        let deinterlace_count = AtomicU32::new(0);
        let aborted = AtomicBool::new(false);
        let mcdsbuf_0 = tokio::sync::Mutex::new(vec![100i32; 4]);
        let mcdsbuf_1 = tokio::sync::Mutex::new(vec![300i32; 4]);
        let mut coaddbuf = vec![0i32; 4];

        let run = aggregator.run(
            &deinterlace_count,
            1,
            &aborted,
            2,
            &mcdsbuf_0,
            &mcdsbuf_1,
            &mut coaddbuf,
        );
        let notify_task = async {
            tokio::task::yield_now().await;
            deinterlace_count.store(1, Ordering::Release);
            aggregator.notify_frame_ready();
        };
        tokio::join!(run, notify_task);
        assert!(coaddbuf.iter().all(|&v| v == 200));
    }
}
