//! Parses Archon `FRAME` replies into a structured view of the controller's
//! three frame buffers and tracks the newest-complete one (spec.md §4.3).

use crate::camera_info::NBUFS;
use crate::error::{ArchonError, Result};
use crate::transport::Transport;

/// Per-buffer fields parsed from a `FRAME` reply (spec.md §3).
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStatus {
    pub sample: u32,
    pub complete: u32,
    pub mode: u32,
    pub base: u64,
    pub framen: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: u32,
    pub lines: u32,
    pub rawblocks: u32,
    pub rawlines: u32,
    pub rawoffset: u32,
    pub timestamp: u64,
    pub retimestamp: u64,
    pub fetimestamp: u64,
}

/// A full `FRAME` snapshot: the three buffers plus the derived
/// newest-complete pointers (spec.md §3, §4.3).
#[derive(Clone, Debug, Default)]
pub struct FrameStatus {
    pub buffers: [BufferStatus; NBUFS],
    pub timer: String,
    pub rbuf: u32,
    pub wbuf: u32,
    /// Index (0-based) of the newest complete buffer.
    pub index: usize,
    /// Frame number of the newest complete buffer.
    pub frame: u32,
    /// `(index + 1) mod active_bufs`.
    pub next_index: usize,
}

/// Sends `FRAME`, tokenizes the reply, and recomputes the newest-complete
/// pointer. `active_bufs` is normally [`NBUFS`] but may be narrower if the
/// controller reports fewer.
pub async fn get_frame_status(transport: &Transport, active_bufs: usize) -> Result<FrameStatus> {
    let reply = transport.command("FRAME").await?;
    let mut status = FrameStatus::default();

    for token in reply.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if key == "TIMER" {
            status.timer = value.to_string();
            continue;
        }
        if key == "RBUF" {
            status.rbuf = parse_u32(value)?;
            continue;
        }
        if key == "WBUF" {
            status.wbuf = parse_u32(value)?;
            continue;
        }
        let Some(rest) = key.strip_prefix("BUF") else {
            continue;
        };
        let digit_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digit_len == 0 {
            continue;
        }
        let (num_str, field) = rest.split_at(digit_len);
        let n: usize = num_str
            .parse()
            .map_err(|_| ArchonError::Other(format!("bad buffer number in `{token}`")))?;
        if !(1..=NBUFS).contains(&n) {
            return Err(ArchonError::Other(format!(
                "buffer number {n} out of range 1..={NBUFS}"
            )));
        }
        let buf = &mut status.buffers[n - 1];
        match field {
            "SAMPLE" => buf.sample = parse_u32(value)?,
            "COMPLETE" => buf.complete = parse_u32(value)?,
            "MODE" => buf.mode = parse_u32(value)?,
            "BASE" => buf.base = parse_u64_decimal(value)?,
            "FRAME" => buf.framen = parse_u32(value)?,
            "WIDTH" => buf.width = parse_u32(value)?,
            "HEIGHT" => buf.height = parse_u32(value)?,
            "PIXELS" => buf.pixels = parse_u32(value)?,
            "LINES" => buf.lines = parse_u32(value)?,
            "RAWBLOCKS" => buf.rawblocks = parse_u32(value)?,
            "RAWLINES" => buf.rawlines = parse_u32(value)?,
            "RAWOFFSET" => buf.rawoffset = parse_u32(value)?,
            "TIMESTAMP" => buf.timestamp = parse_u64_hex(value)?,
            "RETIMESTAMP" => buf.retimestamp = parse_u64_hex(value)?,
            "FETIMESTAMP" => buf.fetimestamp = parse_u64_hex(value)?,
            _ => {}
        }
    }

    recompute_newest(&mut status, active_bufs);
    Ok(status)
}

/// Picks the newest-complete buffer: among `complete==1` buffers, the
/// highest `framen`, ties broken by lower index. At startup (all
/// `framen == 0`) index 0/frame 0 is chosen (spec.md §4.3).
fn recompute_newest(status: &mut FrameStatus, active_bufs: usize) {
    let active_bufs = active_bufs.clamp(1, NBUFS);
    let all_zero = status.buffers[..active_bufs].iter().all(|b| b.framen == 0);
    if all_zero {
        status.index = 0;
        status.frame = 0;
    } else {
        let mut best_index = 0;
        let mut best_frame = 0u32;
        let mut found = false;
        for (i, buf) in status.buffers[..active_bufs].iter().enumerate() {
            if buf.complete == 1 && (!found || buf.framen > best_frame) {
                best_index = i;
                best_frame = buf.framen;
                found = true;
            }
        }
        status.index = best_index;
        status.frame = best_frame;
    }
    status.next_index = (status.index + 1) % active_bufs;
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| ArchonError::Other(format!("bad integer `{s}` in FRAME reply")))
}

fn parse_u64_decimal(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| ArchonError::Other(format!("bad integer `{s}` in FRAME reply")))
}

fn parse_u64_hex(s: &str) -> Result<u64> {
    u64::from_str_radix(s, 16)
        .map_err(|_| ArchonError::Other(format!("bad hex timestamp `{s}` in FRAME reply")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> String {
        "TIMER=00112233 RBUF=1 WBUF=2 \
         BUF1SAMPLE=0 BUF1COMPLETE=1 BUF1FRAME=5 BUF1BASE=1024 BUF1TIMESTAMP=ABCD \
         BUF2SAMPLE=0 BUF2COMPLETE=1 BUF2FRAME=6 BUF2BASE=2048 BUF2TIMESTAMP=ABCE \
         BUF3SAMPLE=0 BUF3COMPLETE=0 BUF3FRAME=0 BUF3BASE=0 BUF3TIMESTAMP=0"
            .to_string()
    }

    fn parse_reply_for_test(reply: &str) -> FrameStatus {
        let mut status = FrameStatus::default();
        for token in reply.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            if key == "TIMER" {
                status.timer = value.to_string();
                continue;
            }
            if key == "RBUF" {
                status.rbuf = value.parse().unwrap();
                continue;
            }
            if key == "WBUF" {
                status.wbuf = value.parse().unwrap();
                continue;
            }
            let Some(rest) = key.strip_prefix("BUF") else {
                continue;
            };
            let digit_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            let (num_str, field) = rest.split_at(digit_len);
            let n: usize = num_str.parse().unwrap();
            let buf = &mut status.buffers[n - 1];
            match field {
                "SAMPLE" => buf.sample = value.parse().unwrap(),
                "COMPLETE" => buf.complete = value.parse().unwrap(),
                "FRAME" => buf.framen = value.parse().unwrap(),
                "BASE" => buf.base = value.parse().unwrap(),
                "TIMESTAMP" => buf.timestamp = u64::from_str_radix(value, 16).unwrap(),
                _ => {}
            }
        }
        recompute_newest(&mut status, NBUFS);
        status
    }

    #[test]
    fn picks_highest_framen_among_complete() {
        let status = parse_reply_for_test(&sample_reply());
        assert_eq!(status.index, 1);
        assert_eq!(status.frame, 6);
        assert_eq!(status.next_index, 2);
    }

    #[test]
    fn startup_all_zero_picks_index_zero() {
        let reply = "TIMER=0 RBUF=0 WBUF=0 \
            BUF1SAMPLE=0 BUF1COMPLETE=0 BUF1FRAME=0 BUF1BASE=0 BUF1TIMESTAMP=0 \
            BUF2SAMPLE=0 BUF2COMPLETE=0 BUF2FRAME=0 BUF2BASE=0 BUF2TIMESTAMP=0 \
            BUF3SAMPLE=0 BUF3COMPLETE=0 BUF3FRAME=0 BUF3BASE=0 BUF3TIMESTAMP=0";
        let status = parse_reply_for_test(reply);
        assert_eq!(status.index, 0);
        assert_eq!(status.frame, 0);
        assert_eq!(status.next_index, 1);
    }

    #[test]
    fn ties_broken_by_lower_index() {
        let reply = "TIMER=0 RBUF=0 WBUF=0 \
            BUF1SAMPLE=0 BUF1COMPLETE=1 BUF1FRAME=9 BUF1BASE=0 BUF1TIMESTAMP=0 \
            BUF2SAMPLE=0 BUF2COMPLETE=1 BUF2FRAME=9 BUF2BASE=0 BUF2TIMESTAMP=0 \
            BUF3SAMPLE=0 BUF3COMPLETE=0 BUF3FRAME=0 BUF3BASE=0 BUF3TIMESTAMP=0";
        let status = parse_reply_for_test(reply);
        assert_eq!(status.index, 0);
    }
}
