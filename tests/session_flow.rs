//! End-to-end smoke test: connect, interrogate modules, load firmware,
//! select a mode, against a scripted mock Archon listener over loopback
//! TCP (spec.md §3 "Controller session", §4.2 "set_camera_mode").

use std::sync::Arc;

use archon_daq::ControllerSession;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const ACF_TEXT: &str = "[CONFIG]\nLINECOUNT=1024\nPIXELCOUNT=1024\nPARAMETER0=GAIN1=2.5\nPARAMETER1=OFFSET1=1.1\n\n[MODE_TEST]\nACF:RAWENABLE=0\nARCH:NUM_DETECT=1\nARCH:HORI_AMPS=1\nARCH:VERT_AMPS=1\n";

/// Replies `OK` to everything except `SYSTEM` and `RCONFIG0002`/`RCONFIG0003`
/// (the `LINECOUNT`/`PIXELCOUNT` lines in [`ACF_TEXT`]), which get the plain
/// single-`=` `KEY=VALUE` echo a real Archon sends for canonical config
/// lines (as opposed to the `PARAMETERn=Name=Value` shape of a parameter
/// line).
async fn run_mock_archon(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(rest) = line.strip_prefix('>') else {
            continue;
        };
        if rest.len() < 2 {
            continue;
        }
        let msgref = &rest[0..2];
        let cmd = &rest[2..];
        let body = if cmd.starts_with("SYSTEM") {
            "MOD1_TYPE=2 MOD1_VERSION=1.0 BACKPLANE_VERSION=1.0.548".to_string()
        } else if cmd.starts_with("RCONFIG0002") {
            "LINECOUNT=1024".to_string()
        } else if cmd.starts_with("RCONFIG0003") {
            "PIXELCOUNT=1024".to_string()
        } else {
            "OK".to_string()
        };
        let reply = format!("<{msgref}{body}\n");
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn connects_loads_firmware_and_selects_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        run_mock_archon(sock).await;
    });

    let session = Arc::new(
        ControllerSession::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap(),
    );

    session.interrogate_modules().await.unwrap();
    {
        let table = session.module_table.lock().unwrap();
        assert_eq!(table.backplane_version, "1.0.548");
        assert_eq!(table.types[0], 2);
    }

    session.load_firmware("test.acf", ACF_TEXT).await.unwrap();
    assert!(session.firmwareloaded.load(std::sync::atomic::Ordering::Acquire));

    let info = session.set_camera_mode("TEST", false).await.unwrap();
    assert_eq!(info.imwidth, 1024);
    assert_eq!(info.imheight, 1024);
    assert!(session.modeselected.load(std::sync::atomic::Ordering::Acquire));

    let system_keys: Vec<&str> = info.system_keys.iter().map(|(k, _)| k).collect();
    assert!(system_keys.contains(&"GAIN01"));
    assert!(system_keys.contains(&"OFFSET01"));

    let current = session.current_mode.lock().unwrap().clone();
    assert_eq!(current.as_deref(), Some("TEST"));

    let db = session.database.lock().unwrap();
    let mode = db.mode("TEST").unwrap();
    assert_eq!(mode.geometry.num_detect, 1);
}

#[tokio::test]
async fn set_camera_mode_rejects_unknown_mode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        run_mock_archon(sock).await;
    });

    let session = ControllerSession::connect(&addr.ip().to_string(), addr.port())
        .await
        .unwrap();
    session.load_firmware("test.acf", ACF_TEXT).await.unwrap();

    let err = session.set_camera_mode("NOPE", false).await.unwrap_err();
    assert!(matches!(err, archon_daq::ArchonError::UnknownMode(_)));
}

#[tokio::test]
async fn set_camera_mode_rejects_while_exposing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        run_mock_archon(sock).await;
    });

    let session = ControllerSession::connect(&addr.ip().to_string(), addr.port())
        .await
        .unwrap();
    let err = session.set_camera_mode("TEST", true).await.unwrap_err();
    assert!(matches!(err, archon_daq::ArchonError::Busy));
}
