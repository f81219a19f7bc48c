//! Framed TCP transport and command layer for the Archon controller
//! (spec.md §4.1).
//!
//! One connection, one rotating message reference, one busy flag. `FETCH`
//! is the one command that hands the busy flag off to the binary block
//! reader instead of clearing it on return — see [`Transport::fetch_begin`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::camera_info::BLOCK_LEN;
use crate::error::{ArchonError, Result};

/// Default command round-trip timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-FETCH-block timeout (spec.md §4.5: "Timeout if >1 s wait for block+header").
const FETCH_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands that are high-frequency and therefore only traced, never logged
/// at `info` (spec.md §4.1).
fn is_chatty(cmd: &str) -> bool {
    const CHATTY: &[&str] = &["STATUS", "TIMER", "WCONFIG", "FRAME"];
    CHATTY.iter().any(|prefix| cmd.starts_with(prefix))
}

/// A single framed TCP session to the Archon controller.
pub struct Transport {
    stream: Mutex<TcpStream>,
    msgref: AtomicU8,
    busy: AtomicBool,
}

impl Transport {
    /// Connects to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Transport {
            stream: Mutex::new(stream),
            msgref: AtomicU8::new(0),
            busy: AtomicBool::new(false),
        })
    }

    /// Wraps an already-connected stream (used by tests against a mock
    /// listener).
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Transport {
            stream: Mutex::new(stream),
            msgref: AtomicU8::new(0),
            busy: AtomicBool::new(false),
        }
    }

    fn next_msgref(&self) -> u8 {
        self.msgref.fetch_add(1, Ordering::AcqRel)
    }

    /// Sends `cmd` and waits for its `<HH...` reply, validating the msgref
    /// and surfacing controller-reported (`?`) errors.
    ///
    /// Rejects re-entry with [`ArchonError::Busy`] if a `FETCH` is still in
    /// flight (spec.md §4.1: the busy flag is a separate atomic test-and-set
    /// from the socket mutex).
    pub async fn command(&self, cmd: &str) -> Result<String> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ArchonError::Busy);
        }
        let result = self.command_locked(cmd).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    async fn command_locked(&self, cmd: &str) -> Result<String> {
        let msgref = self.next_msgref();
        let line = format!(">{msgref:02X}{cmd}\n");
        if is_chatty(cmd) {
            trace!(cmd, msgref, "sending command");
        } else {
            tracing::debug!(cmd, msgref, "sending command");
        }

        let mut guard = self.stream.lock().await;
        timeout(COMMAND_TIMEOUT, guard.write_all(line.as_bytes()))
            .await
            .map_err(|_| ArchonError::Timeout {
                what: format!("writing `{cmd}`"),
                elapsed_ms: COMMAND_TIMEOUT.as_millis() as u64,
            })??;

        let reply = timeout(COMMAND_TIMEOUT, read_line(&mut guard))
            .await
            .map_err(|_| ArchonError::Timeout {
                what: format!("reply to `{cmd}`"),
                elapsed_ms: COMMAND_TIMEOUT.as_millis() as u64,
            })??;

        validate_reply(&reply, msgref, cmd)
    }

    /// Begins a `FETCH{addr:08X}{blocks:08X}` transfer. Unlike
    /// [`Transport::command`], the busy flag is **not** cleared on return —
    /// the caller must drain `blocks` blocks with [`Transport::fetch_block`]
    /// and then call [`Transport::fetch_end`] (spec.md §4.1, §4.5).
    pub async fn fetch_begin(&self, addr: u32, blocks: u32) -> Result<u8> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ArchonError::Busy);
        }
        let msgref = self.next_msgref();
        let line = format!(">{msgref:02X}FETCH{addr:08X}{blocks:08X}\n");
        trace!(addr, blocks, msgref, "sending FETCH");

        let mut guard = self.stream.lock().await;
        let write_result = timeout(COMMAND_TIMEOUT, guard.write_all(line.as_bytes())).await;
        drop(guard);
        match write_result {
            Ok(Ok(())) => Ok(msgref),
            Ok(Err(e)) => {
                self.busy.store(false, Ordering::Release);
                Err(ArchonError::Io(e))
            }
            Err(_) => {
                self.busy.store(false, Ordering::Release);
                Err(ArchonError::Timeout {
                    what: "writing FETCH".into(),
                    elapsed_ms: COMMAND_TIMEOUT.as_millis() as u64,
                })
            }
        }
    }

    /// Reads one 1024-byte FETCH block, preceded by its 4-byte `<HH:`
    /// header. A header starting with `?` means the controller reported an
    /// error; the caller should drain `FETCHLOG` and abort the fetch.
    pub async fn fetch_block(&self, expected_msgref: u8, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), BLOCK_LEN as usize);
        let mut guard = self.stream.lock().await;
        let mut header = [0u8; 4];
        timeout(FETCH_BLOCK_TIMEOUT, guard.read_exact(&mut header))
            .await
            .map_err(|_| ArchonError::Timeout {
                what: "FETCH block header".into(),
                elapsed_ms: FETCH_BLOCK_TIMEOUT.as_millis() as u64,
            })??;

        if header[0] == b'?' {
            drop(guard);
            let detail = self.fetch_log().await.unwrap_or_else(|_| "see FETCHLOG".into());
            warn!(detail, "controller reported an error mid-FETCH");
            return Err(ArchonError::ControllerError {
                command: "FETCH".into(),
                detail,
            });
        }

        let got_msgref = parse_hex_byte(&header[1..3]).ok_or(ArchonError::ReplyMismatch {
            sent: expected_msgref,
            got: header[0..3].try_into().unwrap_or([0; 3]),
        })?;
        if header[0] != b'<' || got_msgref != expected_msgref || header[3] != b':' {
            return Err(ArchonError::ReplyMismatch {
                sent: expected_msgref,
                got: header[0..3].try_into().unwrap_or([0; 3]),
            });
        }

        timeout(FETCH_BLOCK_TIMEOUT, guard.read_exact(dst))
            .await
            .map_err(|_| ArchonError::Timeout {
                what: "FETCH block data".into(),
                elapsed_ms: FETCH_BLOCK_TIMEOUT.as_millis() as u64,
            })??;
        Ok(())
    }

    /// Clears the busy flag set by [`Transport::fetch_begin`], handing the
    /// socket back to ordinary commands.
    pub fn fetch_end(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Drains the controller's error log via `FETCHLOG`, used when a FETCH
    /// block header reports an error (spec.md §4.5). Goes through
    /// `command_locked` directly rather than `command()`: the busy flag is
    /// already held for the in-flight FETCH this is called from.
    async fn fetch_log(&self) -> Result<String> {
        self.command_locked("FETCHLOG").await
    }

    /// `RCONFIG{line}` then parse `PARAMETERn=Name=Value`, returning `Value`.
    /// For plain `KEY=VALUE` config lines use [`Transport::read_config_value`]
    /// instead — a real Archon echoes those with a single `=`, not three
    /// `=`-separated parts.
    pub async fn read_parameter(&self, line: u16) -> Result<String> {
        let reply = self.command(&format!("RCONFIG{line:04X}")).await?;
        let mut parts = reply.splitn(3, '=');
        let _paramkey = parts.next();
        let _name = parts.next();
        let value = parts.next().ok_or_else(|| {
            ArchonError::Other(format!("malformed RCONFIG reply for line {line}"))
        })?;
        Ok(value.to_string())
    }

    /// `RCONFIG{line}` then parse a plain `KEY=VALUE` reply, returning
    /// `Value`. Used for canonical `[CONFIG]` keys (`LINECOUNT`,
    /// `FRAMEMODE`, …), which have no `PARAMETERn=Name=` prefix.
    pub async fn read_config_value(&self, line: u16) -> Result<String> {
        let reply = self.command(&format!("RCONFIG{line:04X}")).await?;
        let (_, value) = reply.split_once('=').ok_or_else(|| {
            ArchonError::Other(format!("malformed RCONFIG reply for line {line}"))
        })?;
        Ok(value.to_string())
    }

    /// `WCONFIG{HHHH}{KEY}={VALUE}`. Returns whether the value actually
    /// changed, for LOADPARAMS/APPLYCDS gating (spec.md §9, Open Question 2).
    pub async fn write_config_key(&self, line: u16, key: &str, value: &str) -> Result<bool> {
        let previous = self.read_config_value(line).await.ok();
        self.command(&format!("WCONFIG{line:04X}{key}={value}")).await?;
        Ok(previous.as_deref() != Some(value))
    }

    /// `WCONFIG{HHHH}{paramkey}={paramname}={value}`. Returns whether the
    /// value actually changed.
    pub async fn write_parameter(
        &self,
        line: u16,
        paramkey: &str,
        paramname: &str,
        value: &str,
    ) -> Result<bool> {
        let previous = self.read_parameter(line).await.ok();
        self.command(&format!("WCONFIG{line:04X}{paramkey}={paramname}={value}"))
            .await?;
        Ok(previous.as_deref() != Some(value))
    }
}

async fn read_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed while reading reply",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_hex_byte(bytes: &[u8]) -> Option<u8> {
    let s = std::str::from_utf8(bytes).ok()?;
    u8::from_str_radix(s, 16).ok()
}

/// Validates that `reply` begins with `<HH` matching `sent_msgref`, and
/// surfaces a leading `?` as a controller error (spec.md §4.1).
fn validate_reply(reply: &str, sent_msgref: u8, cmd: &str) -> Result<String> {
    let bytes = reply.as_bytes();
    if bytes.len() < 3 {
        return Err(ArchonError::ReplyMismatch {
            sent: sent_msgref,
            got: [0; 3],
        });
    }
    if bytes[0] == b'?' {
        return Err(ArchonError::ControllerError {
            command: cmd.to_string(),
            detail: reply[1..].to_string(),
        });
    }
    let got_msgref = parse_hex_byte(&bytes[1..3]);
    if bytes[0] != b'<' || got_msgref != Some(sent_msgref) {
        let mut got = [0u8; 3];
        got.copy_from_slice(&bytes[0..3]);
        return Err(ArchonError::ReplyMismatch {
            sent: sent_msgref,
            got,
        });
    }
    Ok(reply[3..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reply_accepts_matching_msgref() {
        let reply = validate_reply("<05OK", 5, "STATUS").unwrap();
        assert_eq!(reply, "OK");
    }

    #[test]
    fn validate_reply_rejects_mismatched_msgref() {
        let err = validate_reply("<06OK", 5, "STATUS").unwrap_err();
        assert!(matches!(err, ArchonError::ReplyMismatch { .. }));
    }

    #[test]
    fn validate_reply_surfaces_controller_error() {
        let err = validate_reply("?bad mode", 5, "STATUS").unwrap_err();
        assert!(matches!(err, ArchonError::ControllerError { .. }));
    }

    #[test]
    fn chatty_commands_are_identified() {
        assert!(is_chatty("STATUS"));
        assert!(is_chatty("FRAME"));
        assert!(is_chatty("WCONFIG00AAKEY=1"));
        assert!(!is_chatty("APPLYALL"));
    }

    #[tokio::test]
    async fn read_config_value_parses_single_equals_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]);
            let msgref = &sent[1..3];
            sock.write_all(format!("<{msgref}LINECOUNT=1024\n").as_bytes())
                .await
                .unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let transport = Transport::from_stream(stream);
        let value = transport.read_config_value(2).await.unwrap();
        assert_eq!(value, "1024");
    }

    #[tokio::test]
    async fn read_parameter_parses_three_part_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]);
            let msgref = &sent[1..3];
            sock.write_all(format!("<{msgref}PARAMETER0=GAIN1=2.5\n").as_bytes())
                .await
                .unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let transport = Transport::from_stream(stream);
        let value = transport.read_parameter(0).await.unwrap();
        assert_eq!(value, "2.5");
    }

    #[tokio::test]
    async fn command_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]);
            let msgref = &sent[1..3];
            sock.write_all(format!("<{msgref}OK\n").as_bytes())
                .await
                .unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let transport = Transport::from_stream(stream);
        let reply = transport.command("STATUS").await.unwrap();
        assert_eq!(reply, "OK");
    }

    #[tokio::test]
    async fn fetch_block_error_header_drains_fetchlog() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // FETCH request: don't bother replying with blocks, just send an
            // error header straight away.
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"?00:").await.unwrap();
            // FETCHLOG request follows.
            let n = sock.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]);
            let msgref = &sent[1..3];
            sock.write_all(format!("<{msgref}overflow on tap 3\n").as_bytes())
                .await
                .unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let transport = Transport::from_stream(stream);
        let msgref = transport.fetch_begin(0, 1).await.unwrap();
        let mut dst = vec![0u8; BLOCK_LEN as usize];
        let err = transport.fetch_block(msgref, &mut dst).await.unwrap_err();
        match err {
            ArchonError::ControllerError { command, detail } => {
                assert_eq!(command, "FETCH");
                assert_eq!(detail, "overflow on tap 3");
            }
            other => panic!("expected ControllerError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reentrant_fetch_rejects_with_busy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let transport = Transport::from_stream(stream);
        transport.fetch_begin(0, 1).await.unwrap();
        let err = transport.command("STATUS").await.unwrap_err();
        assert!(matches!(err, ArchonError::Busy));
    }
}
