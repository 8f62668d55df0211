//! Dialect capability detection.
//!
//! The source platform modeled per-database differences with a
//! template-method JDBC repository hierarchy. This workspace only targets
//! Postgres, but `claim_batch`'s `FOR UPDATE SKIP LOCKED` clause is the one
//! piece of SQL in this crate that isn't portable to every engine a future
//! backend might add — so it is gated behind a capability flag rather than
//! a subclass, per the redesign note in spec §9: "model dialect differences
//! as a small capability interface... no inheritance chains."
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub skip_locked: bool,
}

impl Capabilities {
    /// Postgres supports `SKIP LOCKED` on every version this crate targets.
    pub fn detect_postgres() -> Self {
        Self { skip_locked: true }
    }

    /// Conservative fallback used by tests that want to exercise the
    /// select-then-conditional-update claim path (spec §4.1: "implementations
    /// on engines lacking row-skip-locking MUST fall back to
    /// select-then-conditional-update with a unique-winner contract").
    pub fn without_skip_locked() -> Self {
        Self { skip_locked: false }
    }
}
