use crate::arch::{Arch, IrqLevel};
use crate::kernel::{Kernel, WaitIdx};
use crate::mutex::Mutex;
use crate::k_assert;

/// Condition variable, and the kernel's generic waitable
///
/// Used with a [`Mutex`] through `wait`/`wait_timeout`, or on its own through
/// `sleep`/`sleep_until` when the waker needs no predicate. Waiters queue
/// by priority, then arrival.
pub struct CondVar
{
    waiters: WaitIdx,
    name: &'static str
}

impl CondVar
{
    pub fn new<A: Arch>(k: &Kernel<A>, name: &'static str) -> CondVar
    {
        CondVar::from_wait(k.add_waitable(name), name)
    }

    pub(crate) fn from_wait(waiters: WaitIdx, name: &'static str) -> CondVar
    {
        CondVar {
            waiters,
            name
        }
    }

    pub(crate) fn wait_idx(&self) -> WaitIdx
    {
        self.waiters
    }

    pub fn name(&self) -> &'static str
    {
        self.name
    }

    /// Gives the wait list back to the kernel; a dropped condition keeps it.
    /// Destroying a condition that tasks wait on is fatal.
    pub fn destroy<A: Arch>(self, k: &Kernel<A>)
    {
        k.remove_waitable(self.waiters);
    }

    /// Unlocks `m`, sleeps until signalled and locks `m` again.
    /// Unlocking and starting to sleep are one step, so a signal sent after
    /// `m` is released is never missed.
    pub fn wait<A: Arch>(&self, k: &Kernel<A>, m: &Mutex)
    {
        self.wait_inner(k, m, None);
    }

    /// Like `wait` with a deadline; returns `true` if it timed out.
    pub fn wait_timeout<A: Arch>(&self, k: &Kernel<A>, m: &Mutex, deadline: u64) -> bool
    {
        self.wait_inner(k, m, Some(deadline))
    }

    fn wait_inner<A: Arch>(&self, k: &Kernel<A>, m: &Mutex, deadline: Option<u64>) -> bool
    {
        k.assert_can_block();

        let prev = k.arch.raise(IrqLevel::SCHED);

        k.sched.with(|s| {
            m.unlock_sched_locked(s);
            s.sleep_current(Some(self.waiters), self.name, deadline);
        });
        k.block();

        let timed_out = k.sched.with(|s| s.sleep_timed_out(deadline));

        let locked = m.lock_sched_locked(k, None);
        k_assert!(locked);

        k.arch.restore(prev);

        timed_out
    }

    /// Sleeps until signalled.
    pub fn sleep<A: Arch>(&self, k: &Kernel<A>)
    {
        self.sleep_inner(k, None);
    }

    /// Sleeps until signalled or `deadline`; returns `true` if it timed out.
    pub fn sleep_until<A: Arch>(&self, k: &Kernel<A>, deadline: u64) -> bool
    {
        self.sleep_inner(k, Some(deadline))
    }

    fn sleep_inner<A: Arch>(&self, k: &Kernel<A>, deadline: Option<u64>) -> bool
    {
        k.assert_can_block();

        let prev = k.arch.raise(IrqLevel::SCHED);

        k.sched.with(|s| s.sleep_current(Some(self.waiters), self.name, deadline));
        k.block();
        let timed_out = k.sched.with(|s| s.sleep_timed_out(deadline));

        k.arch.restore(prev);

        timed_out
    }

    /// Wakes the most eligible waiter. Callable from interrupt context.
    pub fn signal<A: Arch>(&self, k: &Kernel<A>)
    {
        self.wake(k, false);
    }

    /// Wakes every current waiter. Callable from interrupt context.
    pub fn broadcast<A: Arch>(&self, k: &Kernel<A>)
    {
        self.wake(k, true);
    }

    fn wake<A: Arch>(&self, k: &Kernel<A>, all: bool)
    {
        let prev = k.arch.raise(IrqLevel::SCHED);

        if k.sched.with(|s| s.wakeup(self.waiters, all)) {
            k.arch.reschedule_request();
        }

        k.arch.restore(prev);
    }
}
