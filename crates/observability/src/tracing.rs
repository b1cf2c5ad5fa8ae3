//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered through `RUST_LOG`. The engine logs every
//! order operation at info, partial-charge resumptions at warn and
//! consistency violations at error; this is where those records pick up
//! their format.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_a_no_op() {
        super::init();
        super::init();
    }
}
