//! Pool and session manager tests covering unit, functional, and regression cases.

mod pool;
