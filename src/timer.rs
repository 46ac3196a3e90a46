//! Timer registry (C3).
//!
//! Per REDESIGN FLAGS ("function-pointer timer keys"), timers are addressed
//! by a small [`TimerId`] handle returned from registration rather than by
//! callback-function identity — this removes the one-registration-per-
//! callback constraint the distilled spec's C source implied, where
//! `startPeriodicTimer`/`stopTimer`/`restartTimer` all took a bare function
//! pointer as the timer's key.
//!
//! This registry does not run callbacks itself and owns no interrupt
//! controller. A caller drives it with [`TimerRegistry::advance`] once per
//! elapsed second and drains fired timers with [`TimerRegistry::poll_expired`];
//! [`crate::dhcp::DhcpClient`] maps the [`TimerId`]s it gets back against the
//! ids it stashed at registration time to know which logical timer fired.

/// A stable handle to a registered timer, opaque outside this module besides
/// equality comparison (a small index into the registry's slab).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u8);

#[derive(Clone, Copy)]
struct Slot {
    deadline: u32,
    /// `Some(period)` for a periodic timer that re-arms itself on expiry;
    /// `None` for a one-shot that is removed from the slab on expiry.
    period_secs: Option<u32>,
}

/// A fixed-capacity slab of timers, all driven off one shared monotonic
/// second counter. `N` bounds how many timers can be registered at once —
/// this crate has no allocator, so the capacity is a compile-time constant
/// chosen by the owner ([`crate::dhcp::DhcpClient`] needs room for seven:
/// discovery, request, t1, t2, lease, the ARP conflict window, and the
/// periodic ARP-probe resend).
pub struct TimerRegistry<const N: usize> {
    now_secs: u32,
    slots: [Option<Slot>; N],
}

impl<const N: usize> TimerRegistry<N> {
    /// An empty registry with its clock at zero.
    pub const fn new() -> Self {
        Self {
            now_secs: 0,
            slots: [None; N],
        }
    }

    fn insert(&mut self, deadline: u32, period_secs: Option<u32>) -> Option<TimerId> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Slot {
                    deadline,
                    period_secs,
                });
                return Some(TimerId(i as u8));
            }
        }
        None
    }

    /// Register a timer that fires once, `seconds` from now, then is removed.
    pub fn start_oneshot(&mut self, seconds: u32) -> Option<TimerId> {
        self.insert(self.now_secs.saturating_add(seconds), None)
    }

    /// Register a timer that fires every `seconds`, re-arming itself on
    /// every expiry until [`TimerRegistry::stop`] is called.
    pub fn start_periodic(&mut self, seconds: u32) -> Option<TimerId> {
        self.insert(self.now_secs.saturating_add(seconds), Some(seconds))
    }

    /// Re-arm `id` for another `seconds` from now as a one-shot, regardless
    /// of what it was registered as. Returns `false` if `id` is not
    /// currently registered.
    pub fn restart_oneshot_with(&mut self, id: TimerId, seconds: u32) -> bool {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(slot)) => {
                slot.deadline = self.now_secs.saturating_add(seconds);
                slot.period_secs = None;
                true
            }
            _ => false,
        }
    }

    /// Re-arm a periodic timer for another full period from now, reusing
    /// its existing period. Returns `false` if `id` is not registered or is
    /// not periodic.
    pub fn restart(&mut self, id: TimerId) -> bool {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(slot)) => match slot.period_secs {
                Some(period) => {
                    slot.deadline = self.now_secs.saturating_add(period);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Cancel `id`. Returns whether a timer was actually registered there.
    pub fn stop(&mut self, id: TimerId) -> bool {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel every registered timer.
    pub fn stop_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Advance the shared clock by `seconds`. Does not itself fire anything
    /// — call [`TimerRegistry::poll_expired`] afterward to drain what's due.
    pub fn advance(&mut self, seconds: u32) {
        self.now_secs = self.now_secs.saturating_add(seconds);
    }

    /// Invoke `on_expired` once for each timer whose deadline has passed.
    /// Periodic timers are re-armed for their next period as they fire;
    /// one-shots are removed from the slab.
    pub fn poll_expired<F: FnMut(TimerId)>(&mut self, mut on_expired: F) {
        let now = self.now_secs;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(s) = slot {
                if s.deadline <= now {
                    on_expired(TimerId(i as u8));
                    match s.period_secs {
                        Some(period) => s.deadline = now.saturating_add(period.max(1)),
                        None => *slot = None,
                    }
                }
            }
        }
    }
}

impl<const N: usize> Default for TimerRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}
