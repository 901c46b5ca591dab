//! Local call state flags.
//!
//! The flags are independent rather than one exclusive state: `FAILED` and
//! `IS_NEGOTIATOR` together mean "this peer initiated the call and it failed",
//! while `FAILED` alone means a passive peer's inbound negotiation failed.

use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::error::CallError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LocalState: u8 {
        const STOPPED = 1 << 0;
        const NEGOTIATING = 1 << 1;
        const IS_NEGOTIATOR = 1 << 2;
        const FAILED = 1 << 3;
        const STARTED = 1 << 4;
    }
}

impl LocalState {
    /// `STARTED` and `STOPPED` never co-occur, and `NEGOTIATING` excludes both.
    pub fn is_consistent(self) -> bool {
        let running = Self::STARTED | Self::STOPPED;
        if self.contains(running) {
            return false;
        }
        !(self.contains(Self::NEGOTIATING) && self.intersects(running))
    }

    /// Whether the process owning this peer may exit.
    pub fn is_terminal(self) -> bool {
        self.contains(Self::STOPPED) || self.contains(Self::FAILED | Self::IS_NEGOTIATOR)
    }
}

impl Default for LocalState {
    fn default() -> Self {
        Self::STOPPED
    }
}

/// Atomic holder for [`LocalState`].
///
/// Writers go through [`StateCell::transition`], which applies one
/// compare-and-swap at a time; readers never block.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(initial: LocalState) -> Self {
        Self(AtomicU8::new(initial.bits()))
    }

    pub(crate) fn load(&self) -> LocalState {
        LocalState::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Apply `f` to the current state. `f` returns `None` when `op` is illegal
    /// from that state; results that break the flag invariants are refused
    /// too. Returns the `(previous, next)` pair on success.
    pub(crate) fn transition<F>(
        &self,
        op: &'static str,
        mut f: F,
    ) -> Result<(LocalState, LocalState), CallError>
    where
        F: FnMut(LocalState) -> Option<LocalState>,
    {
        let mut next = LocalState::empty();
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = LocalState::from_bits_truncate(bits);
                let candidate = f(current).filter(|s| s.is_consistent())?;
                next = candidate;
                Some(candidate.bits())
            })
            .map(|bits| (LocalState::from_bits_truncate(bits), next))
            .map_err(|bits| CallError::InvalidState {
                op,
                state: LocalState::from_bits_truncate(bits),
            })
    }
}
