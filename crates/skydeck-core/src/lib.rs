//! Foundational low-level utilities shared across skydeck crates.
//!
//! Provides the account identifier newtype, an injectable millisecond clock,
//! and the atomic file-write helper used by the credential store and the
//! background monitor snapshots.

pub mod account_id;
pub mod atomic_io;
pub mod time_utils;

pub use account_id::AccountId;
pub use atomic_io::write_text_atomic;
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, is_due_unix_ms, system_clock, ClockFn,
    ManualClock,
};
