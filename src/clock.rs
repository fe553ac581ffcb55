//! Clock abstractions used by the window algorithms and the in-memory store.
//!
//! Window arithmetic works on whole seconds since the Unix epoch held in a `u32`,
//! which is good until February 2106.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so window boundaries can be driven by tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in whole seconds since the Unix epoch.
    fn now_secs(&self) -> u32;
}

fn unix_secs() -> u32 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Reads the wall clock on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        unix_secs()
    }
}

static CACHED_SECS: AtomicU32 = AtomicU32::new(0);
static UPDATER_RUNNING: OnceLock<bool> = OnceLock::new();

fn ensure_updater() -> bool {
    *UPDATER_RUNNING.get_or_init(|| {
        CACHED_SECS.store(unix_secs(), Ordering::Release);
        let spawned = std::thread::Builder::new().name("tollgate-clock".into()).spawn(|| loop {
            std::thread::sleep(Duration::from_secs(1));
            CACHED_SECS.store(unix_secs(), Ordering::Release);
        });
        match spawned {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "coarse clock updater failed to start; using wall clock");
                false
            }
        }
    })
}

/// Process-wide cached timestamp with one-second resolution.
///
/// The first use starts a single background thread that refreshes the cached value once per
/// second, so the per-request cost is one atomic load. Every `CoarseClock` shares that value.
/// If the updater thread cannot be spawned the clock degrades to [`SystemClock`] behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoarseClock;

impl CoarseClock {
    /// Create a handle, starting the shared updater if it is not running yet.
    pub fn new() -> Self {
        ensure_updater();
        Self
    }
}

impl Clock for CoarseClock {
    fn now_secs(&self) -> u32 {
        if ensure_updater() {
            CACHED_SECS.load(Ordering::Acquire)
        } else {
            unix_secs()
        }
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    /// Start the clock at `secs` seconds since the epoch.
    pub fn new(secs: u32) -> Self {
        Self { now: Arc::new(AtomicU32::new(secs)) }
    }

    /// Move time forward.
    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: u32) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}
