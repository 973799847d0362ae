//! Shared helpers for the integration tests

#![allow(dead_code)]

use fiberloop::{Loop, LoopConfig};
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Initialize test logging; honours `RUST_LOG`, defaults to `debug`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Start a loop on its own thread with a test name
pub fn start_loop(name: &str) -> Loop {
    init_test_logging();
    Loop::start(LoopConfig::default().with_name(name)).expect("loop start")
}

/// Stop a started loop and join its thread
pub fn shutdown(lp: &Loop) {
    lp.stop().expect("stop");
    lp.join().expect("join");
}

/// Poll `cond` until it holds or `PATIENCE` runs out
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
