//! Signal handling (spec.md §5): asynchronous handlers do nothing beyond
//! setting a flag word; the dispatcher's event loop inspects the flags
//! after each iteration and performs the user-visible action in normal
//! context. Grounded on `signal-hook`'s flag API, which is exactly this
//! "handler sets an `AtomicBool`, normal code polls it" shape — the
//! teacher's analogous role (an external event interrupting the select
//! loop) is filled by `tokio_util::sync::CancellationToken`, used here for
//! the orderly-shutdown half of `SIGTERM`/`SIGQUIT` once the flag is seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SignalFlags {
    pub terminate: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
    pub snapshot: Arc<AtomicBool>,
    pub rotate_funnel: Arc<AtomicBool>,
    pub flush_tapes: Arc<AtomicBool>,
    pub verbosity_up: Arc<AtomicBool>,
    pub verbosity_down: Arc<AtomicBool>,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct DrainedSignals {
    pub terminate: bool,
    pub reload: bool,
    pub snapshot: bool,
    pub rotate_funnel: bool,
    pub flush_tapes: bool,
    pub verbosity_up: bool,
    pub verbosity_down: bool,
}

impl SignalFlags {
    pub fn install() -> anyhow::Result<Self> {
        let flags = Self {
            terminate: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(AtomicBool::new(false)),
            rotate_funnel: Arc::new(AtomicBool::new(false)),
            flush_tapes: Arc::new(AtomicBool::new(false)),
            verbosity_up: Arc::new(AtomicBool::new(false)),
            verbosity_down: Arc::new(AtomicBool::new(false)),
        };

        signal_hook::flag::register(signal_hook::consts::SIGTERM, flags.terminate.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGQUIT, flags.terminate.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGHUP, flags.reload.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, flags.snapshot.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGALRM, flags.rotate_funnel.clone())?;
        signal_hook::flag::register(libc::SIGIOT, flags.flush_tapes.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGUSR1, flags.verbosity_up.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGUSR2, flags.verbosity_down.clone())?;

        Ok(flags)
    }

    /// Atomically reads and clears every flag, for the event loop to act on
    /// once per iteration.
    pub fn drain(&self) -> DrainedSignals {
        DrainedSignals {
            terminate: self.terminate.swap(false, Ordering::SeqCst),
            reload: self.reload.swap(false, Ordering::SeqCst),
            snapshot: self.snapshot.swap(false, Ordering::SeqCst),
            rotate_funnel: self.rotate_funnel.swap(false, Ordering::SeqCst),
            flush_tapes: self.flush_tapes.swap(false, Ordering::SeqCst),
            verbosity_up: self.verbosity_up.swap(false, Ordering::SeqCst),
            verbosity_down: self.verbosity_down.swap(false, Ordering::SeqCst),
        }
    }
}

/// The fixed verbosity ladder `SIGUSR1`/`SIGUSR2` step through.
pub const VERBOSITY_LADDER: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

pub fn step_verbosity(current_idx: usize, up: bool) -> usize {
    if up {
        (current_idx + 1).min(VERBOSITY_LADDER.len() - 1)
    } else {
        current_idx.saturating_sub(1)
    }
}
