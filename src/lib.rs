//! Control and acquisition core for an STA Archon-driven IR array camera.
//!
//! This crate is the core only: connecting to the controller, loading
//! firmware, selecting a mode, and driving one exposure through FETCH,
//! deinterlace, and FITS write. Wiring it up to a command port, a
//! broadcast channel, or a CLI is the surrounding daemon's job (spec.md
//! §1).

pub mod acf;
pub mod camera_info;
pub mod config;
pub mod error;
pub mod exposure;
pub mod fits;
pub mod frame_status;
pub mod ring;
pub mod sample_mode;
pub mod session;
pub mod transport;

pub use camera_info::CameraInfo;
pub use config::ArchonSettings;
pub use error::{ArchonError, ErrorKind, Result};
pub use exposure::ExposureSequencer;
pub use ring::Ring;
pub use session::ControllerSession;

/// Initializes the `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info` if unset. Mirrors the teacher's `tracing-subscriber` bootstrap;
/// a daemon embedding this crate may instead install its own subscriber
/// before calling anything else here.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_tracing_does_not_panic_when_called_twice() {
        super::init_tracing();
        super::init_tracing();
    }
}
