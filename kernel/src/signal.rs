//! Pending/masked/override signal state and the two-phase delivery
//! pipeline that runs on the trap-return path, before control passes back
//! to user mode.
//!
//! Delivery is two phases under the owning process's lock:
//! 1. [`handle_specials`] — drains `pending` for SIGKILL/SIGSTOP/SIGCONT
//!    and any signal whose handler aliases one of those three, in a
//!    fixed-point loop (the caller re-invokes this until it reports
//!    [`SpecialOutcome::Settled`]).
//! 2. [`find_custom_handler`] — picks at most one pending, unblocked,
//!    user-handled signal to inject this trap return. Exactly one custom
//!    handler may be "in flight" per process at a time; `sigret` is its
//!    only way back.

use crate::param::MAX_SIG;
use crate::proc::Trapframe;

pub type Sigset = u32;

pub const SIGKILL: i32 = 9;
pub const SIGSTOP: i32 = 19;
pub const SIGCONT: i32 = 18;

fn bit(signum: i32) -> Sigset {
    1 << signum
}

pub fn is_valid_signum(signum: i32) -> bool {
    signum >= 0 && (signum as usize) < MAX_SIG
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Handler {
    Default,
    Ignore,
    Kill,
    Stop,
    Cont,
    User(usize),
}

pub struct SignalState {
    pending: Sigset,
    mask: Sigset,
    handlers: [Handler; MAX_SIG],
    handler_masks: [Sigset; MAX_SIG],
    freezed: bool,
    in_custom_handler: bool,
    backup_mask: Sigset,
    backup_trapframe: Option<Trapframe>,
}

impl SignalState {
    pub const fn new() -> Self {
        SignalState {
            pending: 0,
            mask: 0,
            handlers: [Handler::Default; MAX_SIG],
            handler_masks: [0; MAX_SIG],
            freezed: false,
            in_custom_handler: false,
            backup_mask: 0,
            backup_trapframe: None,
        }
    }

    pub fn reset(&mut self) {
        *self = SignalState::new();
    }

    /// Inherited by `fork`: handlers and mask carry over; the pending
    /// bitmap does not.
    pub fn inherit_from(&mut self, parent: &SignalState) {
        self.handlers = parent.handlers;
        self.handler_masks = parent.handler_masks;
        self.mask = parent.mask;
        self.pending = 0;
        self.freezed = false;
        self.in_custom_handler = false;
        self.backup_mask = 0;
        self.backup_trapframe = None;
    }

    pub fn is_freezed(&self) -> bool {
        self.freezed
    }

    pub fn has_pending(&self) -> bool {
        self.pending != 0
    }
}

/// `kill(pid, signum)`'s per-process half: OR the bit into `pending`.
/// Rejects invalid signal numbers; the caller (`proc::kill`) is
/// responsible for locating the target process under its lock before
/// calling this.
pub fn raise(state: &mut SignalState, signum: i32) -> Result<(), ()> {
    if !is_valid_signum(signum) {
        return Err(());
    }
    state.pending |= bit(signum);
    Ok(())
}

/// `sigprocmask(new) -> old`. SIGKILL and SIGSTOP are forcibly cleared
/// from whatever mask the caller requests: they are never blockable.
pub fn sigprocmask(state: &mut SignalState, new: Sigset) -> Sigset {
    let old = state.mask;
    state.mask = new & !(bit(SIGKILL) | bit(SIGSTOP));
    old
}

/// `sigaction(signum, new, old)`. Rejects SIGKILL/SIGSTOP with `Err`
/// (the syscall layer turns that into -1, no side effects) rather than
/// ever reaching the lower invariant check in [`set_handler_unchecked`].
pub fn sigaction(
    state: &mut SignalState,
    signum: i32,
    new: Option<(Handler, Sigset)>,
    old_out: &mut (Handler, Sigset),
) -> Result<(), ()> {
    if !is_valid_signum(signum) {
        return Err(());
    }
    if signum == SIGKILL || signum == SIGSTOP {
        return Err(());
    }
    *old_out = (state.handlers[signum as usize], state.handler_masks[signum as usize]);
    if let Some((handler, mask)) = new {
        set_handler_unchecked(state, signum, handler, mask);
    }
    Ok(())
}

/// Kernel-invariant version of the handler-table write: reconfiguring
/// SIGKILL or SIGSTOP's disposition is never valid, reachable or not, so
/// this panics rather than silently accepting it. `sigaction` filters the
/// user-reachable path before it gets here.
fn set_handler_unchecked(state: &mut SignalState, signum: i32, handler: Handler, mask: Sigset) {
    if signum == SIGKILL || signum == SIGSTOP {
        panic!("signal: attempted to reconfigure SIGKILL/SIGSTOP disposition");
    }
    state.handlers[signum as usize] = handler;
    state.handler_masks[signum as usize] = mask;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpecialOutcome {
    /// Nothing special left pending; safe to move to custom-handler
    /// injection.
    Settled,
    /// The process must be killed; caller proceeds straight to `exit(-1)`.
    Killed,
    /// Now frozen (SIGSTOP, and not immediately continued by a SIGCONT
    /// seen in the same pass); caller must release its lock, yield, and
    /// call this again on wake.
    Frozen,
}

/// One pass of the fixed-point "handle specials" loop described in the
/// delivery pipeline. Processes every currently-pending signal once in
/// order; the caller re-invokes this (after yielding, if `Frozen`) until
/// it sees `Settled`.
pub fn handle_specials(state: &mut SignalState) -> SpecialOutcome {
    for signum in 0..MAX_SIG as i32 {
        if state.pending & bit(signum) == 0 {
            continue;
        }
        let handler = state.handlers[signum as usize];

        let is_fatal = signum == SIGKILL
            || handler == Handler::Kill
            || (handler == Handler::Default && signum != SIGCONT);
        if is_fatal {
            state.pending &= !bit(signum);
            return SpecialOutcome::Killed;
        }

        if signum == SIGSTOP || handler == Handler::Stop {
            state.pending &= !bit(signum);
            state.freezed = true;
            continue;
        }

        if handler == Handler::Cont || (signum == SIGCONT && handler == Handler::Default) {
            state.pending &= !bit(signum);
            state.freezed = false;
            continue;
        }

        if handler == Handler::Ignore {
            state.pending &= !bit(signum);
            continue;
        }

        if state.mask & bit(signum) != 0 {
            // Blocked and not one of the specials above: leave pending
            // for the custom-handler phase (or forever, if masked).
            continue;
        }

        // Unblocked, handler is `Handler::User(_)`: leave it for
        // `find_custom_handler`.
    }

    if state.freezed {
        SpecialOutcome::Frozen
    } else {
        SpecialOutcome::Settled
    }
}

/// A custom handler selected for injection this trap return.
pub struct Injection {
    pub signum: i32,
    pub entry: usize,
    pub handler_mask: Sigset,
}

/// Phase 2: scan for at most one pending, unblocked, user-handled signal.
/// Returns `None` if a custom handler is already in flight (only one may
/// execute per process at a time) or none qualifies.
pub fn find_custom_handler(state: &mut SignalState) -> Option<Injection> {
    if state.in_custom_handler {
        return None;
    }
    for signum in 0..MAX_SIG as i32 {
        if state.pending & bit(signum) == 0 {
            continue;
        }
        if state.mask & bit(signum) != 0 {
            continue;
        }
        if let Handler::User(entry) = state.handlers[signum as usize] {
            state.pending &= !bit(signum);
            return Some(Injection {
                signum,
                entry,
                handler_mask: state.handler_masks[signum as usize],
            });
        }
    }
    None
}

/// Record the suspension point: back up the live trapframe and mask,
/// swap in the handler's mask, and mark a custom handler as running.
/// Called by the trap-return path after it has finished writing the
/// stub and rerouting PC/SP/A0 onto the live trapframe.
pub fn begin_custom_handler(state: &mut SignalState, live: Trapframe, injection: &Injection) {
    state.backup_trapframe = Some(live);
    state.backup_mask = state.mask;
    state.mask = injection.handler_mask;
    state.in_custom_handler = true;
}

/// `sigret` syscall: restore the trapframe and mask that were in flight
/// before the custom handler was injected. Returns `None` (a no-op) if
/// called without an in-flight handler.
pub fn sigret(state: &mut SignalState) -> Option<Trapframe> {
    if !state.in_custom_handler {
        return None;
    }
    state.in_custom_handler = false;
    state.mask = state.backup_mask;
    state.backup_trapframe.take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigkill_is_always_fatal_even_if_masked() {
        let mut s = SignalState::new();
        sigprocmask(&mut s, bit(SIGKILL));
        raise(&mut s, SIGKILL).unwrap();
        assert_eq!(handle_specials(&mut s), SpecialOutcome::Killed);
    }

    #[test]
    fn sigstop_then_sigcont_in_one_pass_does_not_freeze() {
        let mut s = SignalState::new();
        raise(&mut s, SIGSTOP).unwrap();
        raise(&mut s, SIGCONT).unwrap();
        assert_eq!(handle_specials(&mut s), SpecialOutcome::Settled);
        assert!(!s.is_freezed());
    }

    #[test]
    fn sigstop_alone_freezes_until_a_later_sigcont() {
        let mut s = SignalState::new();
        raise(&mut s, SIGSTOP).unwrap();
        assert_eq!(handle_specials(&mut s), SpecialOutcome::Frozen);
        raise(&mut s, SIGCONT).unwrap();
        assert_eq!(handle_specials(&mut s), SpecialOutcome::Settled);
    }

    #[test]
    fn ignored_signal_is_dropped_silently() {
        let mut s = SignalState::new();
        let mut old = (Handler::Default, 0);
        sigaction(&mut s, 5, Some((Handler::Ignore, 0)), &mut old).unwrap();
        raise(&mut s, 5).unwrap();
        assert_eq!(handle_specials(&mut s), SpecialOutcome::Settled);
        assert!(find_custom_handler(&mut s).is_none());
    }

    #[test]
    fn sigaction_rejects_sigkill_and_sigstop() {
        let mut s = SignalState::new();
        let mut old = (Handler::Default, 0);
        assert!(sigaction(&mut s, SIGKILL, Some((Handler::Ignore, 0)), &mut old).is_err());
        assert!(sigaction(&mut s, SIGSTOP, Some((Handler::Ignore, 0)), &mut old).is_err());
    }

    #[test]
    fn sigaction_round_trip_restores_previous_handler() {
        let mut s = SignalState::new();
        let mut old1 = (Handler::Default, 0);
        sigaction(&mut s, 3, Some((Handler::User(0x1000), 0xF)), &mut old1).unwrap();
        let mut old2 = (Handler::Default, 0);
        sigaction(&mut s, 3, Some(old1), &mut old2).unwrap();
        assert_eq!(old2, (Handler::User(0x1000), 0xF));
    }

    #[test]
    fn sigprocmask_round_trips_modulo_forced_clear() {
        let mut s = SignalState::new();
        let first = sigprocmask(&mut s, bit(4) | bit(SIGKILL));
        assert_eq!(first, 0);
        let second = sigprocmask(&mut s, 0);
        assert_eq!(second, bit(4)); // SIGKILL bit was forced off
    }

    #[test]
    fn custom_handler_injection_is_one_at_a_time() {
        let mut s = SignalState::new();
        let mut old = (Handler::Default, 0);
        sigaction(&mut s, 2, Some((Handler::User(0x2000), 0)), &mut old).unwrap();
        raise(&mut s, 2).unwrap();
        let inj = find_custom_handler(&mut s).expect("should select signal 2");
        assert_eq!(inj.entry, 0x2000);
        begin_custom_handler(&mut s, Trapframe::zeroed(), &inj);
        raise(&mut s, 2).unwrap();
        assert!(find_custom_handler(&mut s).is_none());
        assert!(sigret(&mut s).is_some());
        raise(&mut s, 2).unwrap();
        assert!(find_custom_handler(&mut s).is_some());
    }
}
