use alloc::vec::Vec;

use crate::arch::{Arch, IrqLevel};
use crate::condvar::CondVar;
use crate::kernel::Kernel;
use crate::mutex::Mutex;
use crate::stream::{PollDir, Stream};
use crate::k_assert;

/// One condition of a [`Kernel::poll`] set
#[derive(Clone, Copy)]
pub enum PollCond<'a>
{
    /// Ready when signalled.
    Cond(&'a CondVar),
    /// Ready when a read would not block.
    Readable(&'a dyn Stream),
    /// Ready when a write would not block.
    Writable(&'a dyn Stream)
}

impl<'a> PollCond<'a>
{
    /// `None` if ready now, else the condition to sleep on.
    fn pending(&self) -> Option<&'a CondVar>
    {
        match *self {
            PollCond::Cond(cv) => Some(cv),
            PollCond::Readable(s) => s.pending(PollDir::Read),
            PollCond::Writable(s) => s.pending(PollDir::Write)
        }
    }
}

impl<A: Arch> Kernel<A>
{
    /// Waits until any one of `conds` is ready, or `deadline` passes.
    ///
    /// * Returns the index of the condition that woke the caller, or `None`
    ///   on timeout. Stream conditions already ready return at once, the
    ///   lowest index first.
    /// * `interlock` (held by the caller) is released for the duration of
    ///   the wait and locked again before returning, like
    ///   [`CondVar::wait`].
    pub fn poll(&self, conds: &[PollCond<'_>], interlock: Option<&Mutex>, deadline: Option<u64>) -> Option<usize>
    {
        self.assert_can_block();
        k_assert!(conds.len() <= u8::MAX as usize, "poll on {} conditions", conds.len());

        let prev = self.arch.raise(IrqLevel::SCHED);

        let mut waits = Vec::with_capacity(conds.len());
        for (i, cond) in conds.iter().enumerate() {
            match cond.pending() {
                Some(cv) => waits.push(cv.wait_idx()),
                None => {
                    self.arch.restore(prev);
                    return Some(i);
                }
            }
        }

        let proxies = self.sched.with(|s| {
            if let Some(m) = interlock {
                m.unlock_sched_locked(s);
            }

            let me = s.current;
            let proxies: Vec<_> = waits.iter()
                .enumerate()
                .map(|(i, w)| s.add_proxy(me, i as u8, *w))
                .collect();

            s.tcb_mut(me).poll_which = None;
            s.sleep_current(None, "poll", deadline);

            proxies
        });

        self.block();

        let which = self.sched.with(|s| {
            for node in proxies {
                s.drop_proxy(node);
            }
            s.sleep_timed_out(deadline);

            let me = s.current;
            s.tcb_mut(me).poll_which.take()
        });

        if let Some(m) = interlock {
            let locked = m.lock_sched_locked(self, None);
            k_assert!(locked);
        }

        self.arch.restore(prev);

        which.map(usize::from)
    }
}
