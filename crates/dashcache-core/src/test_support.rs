//! Shared helpers for unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing_subscriber::{fmt, EnvFilter};

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Install a test-friendly subscriber once. Use RUST_LOG to see output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// A fresh, empty directory under the system temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "dashcache-test-{}-{}-{}",
        label,
        std::process::id(),
        n
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
