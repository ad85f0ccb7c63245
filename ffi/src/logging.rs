//! Logging setup for hosts of the FFI layer
//!
//! Library code only talks to the `log` facade. Binaries and tests pick a
//! sink here, backed by `env_logger`.
//!
//! Level conventions:
//!
//! - `warn!` - skipped bootstrap typedefs, panics inside callbacks
//! - `info!` - libraries opened
//! - `debug!` - declarations lowered, symbols bound, cache rollbacks
//! - `trace!` - per-node type construction
//!
//! ```bash
//! RUST_LOG=ffi=debug cffi symbols decls.h
//! RUST_LOG=ffi::resolve=trace cffi layout decls.h
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Warn-level logging; later calls are no-ops
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init()
            .ok();
    });
}

/// Honor `RUST_LOG`, defaulting to warn
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .try_init()
            .ok();
    });
}

/// Test-friendly sink; safe to call from every test
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::debug!("resolving struct Node");
    }
}
