use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{Arch, IrqLevel};
use crate::kernel::{Kernel, Sched, WaitIdx};
use crate::k_assert;

//

// owner word: ((task index + 1) << 1) | WAITERS, 0 when free with nobody queued
const WAITERS: usize = 1;

fn owner_word(task: u16) -> usize
{
    ((task as usize) + 1) << 1
}

/// Sleeping mutual exclusion lock
///
/// Waiters queue by priority, then arrival. `unlock` wakes the head waiter
/// but does not hand ownership over: the woken task competes for the lock
/// again when it runs. There is no priority inheritance.
///
/// Locking a mutex the caller already holds, and unlocking one it does not
/// hold, are fatal.
pub struct Mutex
{
    owner: AtomicUsize,
    waiters: WaitIdx,
    name: &'static str
}

impl Mutex
{
    pub fn new<A: Arch>(k: &Kernel<A>, name: &'static str) -> Mutex
    {
        Mutex {
            owner: AtomicUsize::new(0),
            waiters: k.add_waitable(name),
            name
        }
    }

    pub fn name(&self) -> &'static str
    {
        self.name
    }

    /// Gives the wait list back to the kernel. Destroying a locked mutex is fatal.
    pub fn destroy<A: Arch>(self, k: &Kernel<A>)
    {
        k_assert!(!self.is_locked(), "mutex {} destroyed while locked", self.name);

        k.remove_waitable(self.waiters);
    }

    pub fn is_locked(&self) -> bool
    {
        self.owner.load(Ordering::Relaxed) & !WAITERS != 0
    }

    #[cfg(target_has_atomic = "ptr")]
    fn try_fast(&self, me: usize) -> bool
    {
        self.owner.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    #[cfg(target_has_atomic = "ptr")]
    fn release_fast(&self, me: usize) -> bool
    {
        self.owner.compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed).is_ok()
    }

    #[cfg(not(target_has_atomic = "ptr"))]
    fn try_fast(&self, _me: usize) -> bool
    {
        false
    }

    #[cfg(not(target_has_atomic = "ptr"))]
    fn release_fast(&self, _me: usize) -> bool
    {
        false
    }

    pub fn lock<A: Arch>(&self, k: &Kernel<A>)
    {
        let locked = self.lock_inner(k, None);
        k_assert!(locked);
    }

    /// Like `lock` but gives up at `deadline`; returns whether the lock was taken.
    pub fn lock_until<A: Arch>(&self, k: &Kernel<A>, deadline: u64) -> bool
    {
        self.lock_inner(k, Some(deadline))
    }

    /// Takes the lock only if that needs no waiting.
    pub fn try_lock<A: Arch>(&self, k: &Kernel<A>) -> bool
    {
        let me = owner_word(k.current_idx());
        if self.try_fast(me) {
            return true;
        }

        let prev = k.arch.raise(IrqLevel::SCHED);
        let cur = self.owner.load(Ordering::Relaxed);
        let locked = cur & !WAITERS == 0;
        if locked {
            self.owner.store(me | cur, Ordering::Relaxed);
        }
        k.arch.restore(prev);

        locked
    }

    pub fn unlock<A: Arch>(&self, k: &Kernel<A>)
    {
        if self.release_fast(owner_word(k.current_idx())) {
            return;
        }

        let prev = k.arch.raise(IrqLevel::SCHED);
        let resched = k.sched.with(|s| self.unlock_sched_locked(s));
        if resched {
            k.arch.reschedule_request();
        }
        k.arch.restore(prev); // a woken task of higher or equal priority runs here
    }

    fn lock_inner<A: Arch>(&self, k: &Kernel<A>, deadline: Option<u64>) -> bool
    {
        if self.try_fast(owner_word(k.current_idx())) {
            return true;
        }

        k.assert_can_block();

        let prev = k.arch.raise(IrqLevel::SCHED);
        let locked = self.lock_sched_locked(k, deadline);
        k.arch.restore(prev);

        locked
    }

    /// Slow path of `lock`, with the gate raised.
    ///
    /// The caller is queued whenever it finds the lock taken; a wake from
    /// `unlock` takes it off the list, so it is never queued twice. The
    /// timeout is armed once for the whole call.
    pub(crate) fn lock_sched_locked<A: Arch>(&self, k: &Kernel<A>, deadline: Option<u64>) -> bool
    {
        let mut armed = false;

        loop {
            let outcome = k.sched.with(|s| {
                let me = owner_word(s.current);
                let cur = self.owner.load(Ordering::Relaxed);

                if cur & !WAITERS == 0 {
                    let w = if s.wait_is_empty(self.waiters) {0} else {WAITERS};
                    self.owner.store(me | w, Ordering::Relaxed);
                    if armed {
                        s.sleep_timed_out(deadline);
                    }
                    return Some(true);
                }

                k_assert!(cur & !WAITERS != me, "mutex {} locked recursively", self.name);

                if armed && !s.sleep_timer_armed() {
                    if s.wait_is_empty(self.waiters) {
                        self.owner.store(cur & !WAITERS, Ordering::Relaxed);
                    }
                    return Some(false);
                }

                s.sleep_current(Some(self.waiters), self.name, if armed {None} else {deadline});
                self.owner.store(cur | WAITERS, Ordering::Relaxed);
                None
            });

            if let Some(locked) = outcome {
                return locked;
            }

            armed = deadline.is_some();
            k.block();
        }
    }

    /// Slow path of `unlock`; returns whether a reschedule is due.
    pub(crate) fn unlock_sched_locked<A: Arch>(&self, s: &mut Sched<A>) -> bool
    {
        let me = owner_word(s.current);
        let cur = self.owner.load(Ordering::Relaxed);

        k_assert!(cur & !WAITERS == me, "mutex {} unlocked by a task that does not own it", self.name);

        let resched = s.wakeup(self.waiters, false);

        let w = if s.wait_is_empty(self.waiters) {0} else {WAITERS};
        self.owner.store(w, Ordering::Release);

        resched
    }
}
