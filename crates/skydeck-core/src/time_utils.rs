use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Millisecond wall clock shared by the pool, session manager and monitor.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `due_unix_ms` is absent or no longer in the future.
pub fn is_due_unix_ms(due_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    match due_unix_ms {
        Some(value) => value <= now_unix_ms,
        None => true,
    }
}

pub fn system_clock() -> ClockFn {
    Arc::new(current_unix_timestamp_ms)
}

/// Hand-driven clock for simulations and deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_unix_ms)),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    pub fn advance_ms(&self, delta_ms: u64) -> u64 {
        self.now_ms
            .fetch_add(delta_ms, Ordering::SeqCst)
            .saturating_add(delta_ms)
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn clock_fn(&self) -> ClockFn {
        let now_ms = Arc::clone(&self.now_ms);
        Arc::new(move || now_ms.load(Ordering::SeqCst))
    }
}
