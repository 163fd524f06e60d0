//! Deadline-ordered timer queue
//!
//! Timers live in a slab and are threaded, while armed, through a single
//! list sorted by ascending deadline (ties in arming order). Deadlines are
//! absolute microseconds on the monotonic clock; a deadline of `0` means
//! "not armed".

use alloc::vec::Vec;

use crate::k_assert;
use crate::kpanic::KUnwrap;

pub(crate) type TimerIdx = u16;

struct Slot<T>
{
    expire: u64,
    link: Option<TimerIdx>,
    payload: T,
    name: &'static str
}

pub(crate) struct TimerQueue<T>
{
    slots: Vec<Option<Slot<T>>>,
    free: Vec<TimerIdx>,
    head: Option<TimerIdx>
}

impl<T: Copy> TimerQueue<T>
{
    pub(crate) const fn new() -> TimerQueue<T>
    {
        TimerQueue {
            slots: Vec::new(),
            free: Vec::new(),
            head: None
        }
    }

    /// Adds a disarmed timer.
    pub(crate) fn insert(&mut self, name: &'static str, payload: T) -> TimerIdx
    {
        let slot = Slot {
            expire: 0,
            link: None,
            payload,
            name
        };

        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            idx
        }
        else {
            k_assert!(self.slots.len() < TimerIdx::MAX as usize, "out of timers");
            self.slots.push(Some(slot));
            (self.slots.len() - 1) as TimerIdx
        }
    }

    /// Disarms and drops a timer.
    pub(crate) fn remove(&mut self, idx: TimerIdx)
    {
        self.disarm(idx);
        self.slots[idx as usize] = None;
        self.free.push(idx);
    }

    fn slot(&self, idx: TimerIdx) -> &Slot<T>
    {
        self.slots[idx as usize].as_ref().k_unwrap()
    }

    fn slot_mut(&mut self, idx: TimerIdx) -> &mut Slot<T>
    {
        self.slots[idx as usize].as_mut().k_unwrap()
    }

    pub(crate) fn set_payload(&mut self, idx: TimerIdx, payload: T)
    {
        self.slot_mut(idx).payload = payload;
    }

    pub(crate) fn name(&self, idx: TimerIdx) -> &'static str
    {
        self.slot(idx).name
    }

    pub(crate) fn is_armed(&self, idx: TimerIdx) -> bool
    {
        self.slot(idx).expire != 0
    }

    /// Arms (or re-arms) a timer. A deadline of `0` is taken as `1`, the
    /// earliest representable armed deadline.
    pub(crate) fn arm(&mut self, idx: TimerIdx, deadline: u64)
    {
        self.disarm(idx);

        let deadline = deadline.max(1);

        let mut prev: Option<TimerIdx> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let slot = self.slot(c);
            if slot.expire > deadline {
                break;
            }
            prev = Some(c);
            cur = slot.link;
        }

        let slot = self.slot_mut(idx);
        slot.expire = deadline;
        slot.link = cur;

        match prev {
            Some(p) => self.slot_mut(p).link = Some(idx),
            None => self.head = Some(idx)
        }
    }

    /// Unlinks a timer; returns whether it was armed. `false` means it
    /// already fired or was never armed.
    pub(crate) fn disarm(&mut self, idx: TimerIdx) -> bool
    {
        if !self.is_armed(idx) {
            return false;
        }

        let mut prev: Option<TimerIdx> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == idx {
                break;
            }
            prev = cur;
            cur = self.slot(c).link;
        }
        k_assert!(cur == Some(idx), "armed timer {} not on the timer list", idx);

        let slot = self.slot_mut(idx);
        let next = slot.link.take();
        slot.expire = 0;

        match prev {
            Some(p) => self.slot_mut(p).link = next,
            None => self.head = next
        }

        true
    }

    pub(crate) fn next_deadline(&self) -> Option<u64>
    {
        self.head.map(|h| self.slot(h).expire)
    }

    /// Unlinks the earliest timer if its deadline is `<= now`.
    /// Returns the timer, its payload and the deadline it was armed for.
    pub(crate) fn pop_expired(&mut self, now: u64) -> Option<(TimerIdx, T, u64)>
    {
        let idx = self.head?;
        let slot = self.slot_mut(idx);

        let expire = slot.expire;
        if expire > now {
            return None;
        }

        let next = slot.link.take();
        slot.expire = 0;
        let payload = slot.payload;

        self.head = next;

        Some((idx, payload, expire))
    }

    #[cfg(test)]
    fn armed_count(&self) -> usize
    {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            n += 1;
            cur = self.slot(c).link;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire_all(q: &mut TimerQueue<u32>, now: u64) -> Vec<(u32, u64)> {
        let mut fired = Vec::new();
        while let Some((_, p, expire)) = q.pop_expired(now) {
            fired.push((p, expire));
        }
        fired
    }

    // deterministic permutation source
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_dispatch_prefix_in_order() {
        let mut rng = Lcg(0x5eed);

        for round in 0..200 {
            let n = 1 + (round % 12) as usize;
            let mut q = TimerQueue::new();

            // distinct deadlines 10, 20, ... armed in shuffled order
            let mut order: Vec<u64> = (1..=n as u64).map(|i| i * 10).collect();
            for i in (1..order.len()).rev() {
                let j = (rng.next() % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }
            for d in order.iter() {
                let t = q.insert("t", *d as u32);
                q.arm(t, *d);
            }

            let now = rng.next() % (n as u64 * 10 + 20);
            let fired = fire_all(&mut q, now);

            let expect: Vec<(u32, u64)> = (1..=n as u64)
                .map(|i| i * 10)
                .filter(|d| *d <= now)
                .map(|d| (d as u32, d))
                .collect();
            assert_eq!(fired, expect, "round {} now {}", round, now);

            // nothing fires twice, the rest stays armed
            assert!(fire_all(&mut q, now).is_empty());
            assert_eq!(q.armed_count(), n - expect.len());
        }
    }

    #[test]
    fn test_ties_keep_arming_order() {
        let mut q = TimerQueue::new();
        for p in 0..4 {
            let t = q.insert("tie", p);
            q.arm(t, 100);
        }
        let fired: Vec<u32> = fire_all(&mut q, 100).into_iter().map(|(p, _)| p).collect();
        assert_eq!(fired, [0, 1, 2, 3]);
    }

    #[test]
    fn test_rearm_moves_timer() {
        let mut q = TimerQueue::new();
        let a = q.insert("a", 1);
        let b = q.insert("b", 2);
        q.arm(a, 50);
        q.arm(b, 60);
        q.arm(a, 70);

        assert_eq!(q.next_deadline(), Some(60));
        assert_eq!(q.armed_count(), 2);
        assert_eq!(fire_all(&mut q, 1000), [(2, 60), (1, 70)]);
    }

    #[test]
    fn test_disarm_after_fire() {
        let mut q = TimerQueue::new();
        let a = q.insert("a", 1);

        assert!(!q.disarm(a)); // never armed

        q.arm(a, 10);
        assert!(q.is_armed(a));
        assert_eq!(fire_all(&mut q, 10), [(1, 10)]);

        // expiry won the race
        assert!(!q.disarm(a));

        q.arm(a, 20);
        assert!(q.disarm(a));
        assert!(fire_all(&mut q, 100).is_empty());
    }

    #[test]
    fn test_zero_deadline_is_armed() {
        let mut q = TimerQueue::new();
        let a = q.insert("a", 7);
        q.arm(a, 0);
        assert!(q.is_armed(a));
        assert_eq!(fire_all(&mut q, 1), [(7, 1)]);
    }

    #[test]
    fn test_remove_and_reuse() {
        let mut q = TimerQueue::new();
        let a = q.insert("a", 1);
        let b = q.insert("b", 2);
        q.arm(a, 5);
        q.arm(b, 6);
        q.remove(a);

        assert_eq!(q.armed_count(), 1);
        let c = q.insert("c", 3);
        assert_eq!(c, a);
        assert_eq!(q.name(c), "c");
        assert!(!q.is_armed(c));
        assert_eq!(fire_all(&mut q, 10), [(2, 6)]);
    }
}
