mod common;

use std::sync::Arc;

use common::{kernel, Log};
use minisched_cortex_m::*;

fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }

    let mut all = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(i);
        for mut p in permutations(&rest) {
            p.insert(0, first);
            all.push(p);
        }
    }
    all
}

#[test]
fn test_waiters_by_priority_then_arrival() {
    let prios = [1u8, 2, 2, 3];

    for arrival in permutations(&[0, 1, 2, 3]) {
        let k = kernel();
        let m = Arc::new(Mutex::new(k, "m"));
        let log = Log::default();

        let holder = m.clone();
        k.create(move |k| {
            holder.lock(k);
            k.sleep_for(10_000);
            holder.unlock(k);
        }, 256, "holder", TaskFlags::empty(), 10);

        for (pos, &w) in arrival.iter().enumerate() {
            let (m, log) = (m.clone(), log.clone());
            k.create(move |k| {
                k.sleep_for(100 * (pos as u64 + 1));
                m.lock(k);
                log.push(w.to_string());
                m.unlock(k);
            }, 256, "waiter", TaskFlags::empty(), prios[w]);
        }

        assert_eq!(k.run().reason, HaltReason::AllTasksDone);

        let mut expected = arrival.clone();
        expected.sort_by_key(|w| std::cmp::Reverse(prios[*w])); // stable: ties keep arrival
        let expected: Vec<String> = expected.iter().map(|w| w.to_string()).collect();

        assert_eq!(log.take(), expected, "arrival {:?}", arrival);
    }
}

#[test]
fn test_unlock_preempts_for_higher_waiter() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let (mb, lb) = (m.clone(), log.clone());
    k.create(move |k| {
        mb.lock(k);
        lb.push("B locked");

        let (ma, la) = (mb.clone(), lb.clone());
        k.create(move |k| {
            la.push("A wants");
            ma.lock(k);
            la.push("A locked");
            ma.unlock(k);
        }, 256, "A", TaskFlags::empty(), 5);

        lb.push("B unlocking");
        mb.unlock(k);
        lb.push("B done");
    }, 256, "B", TaskFlags::empty(), 3);

    k.run();
    assert_eq!(log.take(), ["B locked", "A wants", "B unlocking", "A locked", "B done"]);
}

#[test]
fn test_lower_waiter_does_not_preempt() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let (mh, lh) = (m.clone(), log.clone());
    k.create(move |k| {
        mh.lock(k);
        k.sleep_for(1_000);
        mh.unlock(k);
        lh.push("high unlocked");
    }, 256, "high", TaskFlags::empty(), 5);

    let (ml, ll) = (m.clone(), log.clone());
    k.create(move |k| {
        ml.lock(k);
        ll.push("low locked");
        ml.unlock(k);
    }, 256, "low", TaskFlags::empty(), 1);

    k.run();
    assert_eq!(log.take(), ["high unlocked", "low locked"]);
}

#[test]
fn test_try_lock_and_timeout() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let (m1, l1) = (m.clone(), log.clone());
    k.create(move |k| {
        assert!(m1.try_lock(k));
        assert!(m1.is_locked());

        let (m2, l2) = (m1.clone(), l1.clone());
        k.create(move |k| {
            assert!(!m2.try_lock(k));
            let locked = m2.lock_until(k, k.now_us() + 5_000);
            l2.push(format!("{}@{}", locked, k.now_us()));
        }, 256, "contender", TaskFlags::empty(), 2);

        k.sleep_for(20_000);
        m1.unlock(k);
        assert!(!m1.is_locked());

        assert!(m1.try_lock(k));
        m1.unlock(k);
        l1.push("holder done");
    }, 256, "holder", TaskFlags::empty(), 1);

    k.run();
    assert_eq!(log.take(), ["false@5000", "holder done"]);
}

#[test]
fn test_lock_until_succeeds_before_deadline() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let (m1, l1) = (m.clone(), log.clone());
    k.create(move |k| {
        m1.lock(k);

        let (m2, l2) = (m1.clone(), l1.clone());
        k.create(move |k| {
            let locked = m2.lock_until(k, 10_000);
            l2.push(format!("{}@{}", locked, k.now_us()));
            m2.unlock(k);
        }, 256, "contender", TaskFlags::empty(), 2);

        k.sleep_for(3_000);
        m1.unlock(k);
    }, 256, "holder", TaskFlags::empty(), 1);

    k.run();
    assert_eq!(log.take(), ["true@3000"]);
}

#[test]
#[should_panic(expected = "locked recursively")]
fn test_recursive_lock_is_fatal() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));

    k.create(move |k| {
        m.lock(k);
        m.lock(k);
    }, 256, "twice", TaskFlags::empty(), 1);

    k.run();
}

#[test]
#[should_panic(expected = "does not own")]
fn test_unlock_by_other_task_is_fatal() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));

    k.create(move |k| {
        m.lock(k);

        let other = m.clone();
        k.create(move |k| other.unlock(k), 256, "thief", TaskFlags::empty(), 2);
    }, 256, "owner", TaskFlags::empty(), 1);

    k.run();
}

fn timer_after_wake(relock: bool) -> Vec<String> {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let mh = m.clone();
    k.create(move |k| {
        mh.lock(k);
        k.sleep_until(500);
        mh.unlock(k); // wakes "waiter", which stays behind "middle"
        if relock {
            mh.lock(k);
        }
        k.sleep_until(3_000);
        if relock {
            mh.unlock(k);
        }
    }, 256, "holder", TaskFlags::empty(), 3);

    let lm = log.clone();
    k.create(move |k| {
        k.sleep_until(500);
        k.arch().busy(1_000); // "waiter"'s deadline passes meanwhile
        lm.push(format!("m done@{}", k.now_us()));
    }, 256, "middle", TaskFlags::empty(), 2);

    let (mw, lw) = (m.clone(), log.clone());
    k.create(move |k| {
        k.sleep_until(100);
        let locked = mw.lock_until(k, 1_000);
        lw.push(format!("{}@{}", locked, k.now_us()));
        if locked {
            mw.unlock(k);
        }
    }, 256, "waiter", TaskFlags::empty(), 1);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
    log.take()
}

#[test]
fn test_expired_waiter_takes_free_lock() {
    assert_eq!(timer_after_wake(false), ["m done@1500", "true@1500"]);
}

#[test]
fn test_expired_waiter_times_out_on_taken_lock() {
    assert_eq!(timer_after_wake(true), ["m done@1500", "false@1500"]);
}

#[test]
fn test_woken_waiter_loses_to_barging_task() {
    let k = kernel();
    let m = Arc::new(Mutex::new(k, "m"));
    let log = Log::default();

    let mh = m.clone();
    k.create(move |k| {
        mh.lock(k);
        k.sleep_until(500);
        mh.unlock(k);
    }, 256, "holder", TaskFlags::empty(), 3);

    let (mw, lw) = (m.clone(), log.clone());
    let waiter = k.create(move |k| {
        k.sleep_until(100);
        mw.lock(k);
        lw.push(format!("w locked@{}", k.now_us()));
        mw.unlock(k);
    }, 256, "waiter", TaskFlags::empty(), 1);

    let (mb, lb) = (m.clone(), log.clone());
    k.create(move |k| {
        k.sleep_until(500);
        mb.lock(k); // "waiter" is woken but not yet running
        lb.push(format!("b locked@{}", k.now_us()));
        k.sleep_until(1_000);

        if k.wait_list_of(waiter) == Some("m") {
            lb.push("w queued again");
        }
        mb.unlock(k);
        lb.push("b unlocked");
    }, 256, "barger", TaskFlags::empty(), 2);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
    assert_eq!(log.take(), ["b locked@500", "w queued again", "b unlocked", "w locked@1000"]);
}

#[test]
fn test_destroy_frees_mutex() {
    let k = kernel();

    k.create(|k| {
        let m = Mutex::new(k, "scratch");
        m.lock(k);
        m.unlock(k);
        m.destroy(k);
    }, 256, "owner", TaskFlags::empty(), 1);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
}

#[test]
#[should_panic(expected = "destroyed while locked")]
fn test_destroy_locked_mutex_is_fatal() {
    let k = kernel();

    k.create(|k| {
        let m = Mutex::new(k, "held");
        m.lock(k);
        m.destroy(k);
    }, 256, "owner", TaskFlags::empty(), 1);

    k.run();
}
