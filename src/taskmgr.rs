//! Background task manager
//!
//! Reclaims detached tasks once they are zombies and, when configured,
//! closes a context switch accounting period at a fixed rate.

use crate::arch::Arch;
use crate::kernel::Kernel;

pub(crate) fn task_manager<A: Arch>(k: &'static Kernel<A>)
{
    let period = k.config().accounting_period_us;
    let mut next = period.map(|p| k.now_us() + p);

    loop {
        let n = k.reap_detached();
        if n > 0 {
            log::debug!("task manager reaped {} tasks", n);
        }

        if k.wait_for_zombies(next) {
            k.account();

            if let (Some(deadline), Some(p)) = (next, period) {
                // skip periods missed while busy
                let now = k.now_us();
                let mut d = deadline + p;
                while d <= now {
                    d += p;
                }
                next = Some(d);
            }
        }
    }
}
