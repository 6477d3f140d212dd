//! Retry classification and exponential backoff helpers.

use std::sync::atomic::{AtomicU64, Ordering};

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 425 || status == 429 || status >= 500
}

/// Exponential backoff `base * 2^attempt`, capped at `max_ms`.
pub fn next_backoff_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.min(16);
    base_ms.saturating_mul(1_u64 << shift).min(max_ms.max(base_ms))
}

pub fn next_backoff_ms_with_jitter(base_ms: u64, max_ms: u64, attempt: u32, jitter: bool) -> u64 {
    let backoff = next_backoff_ms(base_ms, max_ms, attempt);
    if !jitter || backoff <= 1 {
        return backoff;
    }

    // Bounded jitter in [50%, 100%] of the deterministic backoff.
    let low = backoff / 2;
    let width = backoff.saturating_sub(low);
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    low.saturating_add(mixed % width.saturating_add(1))
}

pub fn retry_budget_allows_delay(elapsed_ms: u64, delay_ms: u64, retry_budget_ms: u64) -> bool {
    if retry_budget_ms == 0 {
        return true;
    }
    elapsed_ms.saturating_add(delay_ms) <= retry_budget_ms
}
