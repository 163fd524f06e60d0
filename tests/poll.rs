mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{kernel, Log};
use minisched_cortex_m::*;

#[test]
fn test_poll_returns_signalled_index() {
    let k = kernel();
    let log = Log::default();

    let a = Arc::new(CondVar::new(k, "a"));
    let b = Arc::new(CondVar::new(k, "b"));

    let (pa, pb, l) = (a.clone(), b.clone(), log.clone());
    k.create(move |k| {
        let which = k.poll(&[PollCond::Cond(&pa), PollCond::Cond(&pb)], None, None);
        l.push(format!("{:?}@{}", which, k.now_us()));
    }, 256, "poller", TaskFlags::empty(), 2);

    k.create(move |k| {
        k.sleep_for(1_000);
        b.signal(k);
        a.signal(k); // nobody left waiting
    }, 256, "signaller", TaskFlags::empty(), 1);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
    assert_eq!(log.take(), ["Some(1)@1000"]);
}

#[test]
fn test_poll_timeout() {
    let k = kernel();
    let log = Log::default();
    let cv = Arc::new(CondVar::new(k, "quiet"));

    let l = log.clone();
    k.create(move |k| {
        let which = k.poll(&[PollCond::Cond(&cv)], None, Some(k.now_us() + 2_000));
        l.push(format!("{:?}@{}", which, k.now_us()));
    }, 256, "poller", TaskFlags::empty(), 1);

    k.run();
    assert_eq!(log.take(), ["None@2000"]);
}

#[test]
fn test_poll_streams() {
    let k = kernel();
    let log = Log::default();

    let q = Arc::new(MsgQueue::<u32>::new(k, "q", 1));
    let cv = Arc::new(CondVar::new(k, "unused"));

    let (pq, l) = (q.clone(), log.clone());
    k.create(move |k| {
        assert!(pq.try_send(k, 7).is_ok());
        assert_eq!(pq.try_send(k, 8), Err(8));

        // ready at once
        let which = k.poll(&[PollCond::Cond(&cv), PollCond::Readable(&*pq)], None, None);
        l.push(format!("readable {:?}", which));

        // full: waits for the receiver to make room
        let which = k.poll(&[PollCond::Writable(&*pq)], None, None);
        l.push(format!("writable {:?}@{}", which, k.now_us()));
    }, 256, "poller", TaskFlags::empty(), 2);

    let (rq, l) = (q.clone(), log.clone());
    k.create(move |k| {
        k.sleep_for(500);
        let v = rq.receive(k);
        l.push(format!("received {}", v));
    }, 256, "receiver", TaskFlags::empty(), 1);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
    assert_eq!(log.take(), ["readable Some(1)", "writable Some(0)@500", "received 7"]);
    assert!(q.is_empty());
}

#[test]
fn test_poll_releases_interlock() {
    let k = kernel();
    let log = Log::default();

    let m = Arc::new(Mutex::new(k, "state"));
    let cv = Arc::new(CondVar::new(k, "changed"));
    let ready = Arc::new(AtomicBool::new(false));

    let (pm, pcv, pready, l) = (m.clone(), cv.clone(), ready.clone(), log.clone());
    k.create(move |k| {
        pm.lock(k);
        while !pready.load(Ordering::Relaxed) {
            let which = k.poll(&[PollCond::Cond(&pcv)], Some(&pm), None);
            assert_eq!(which, Some(0));
            assert!(pm.is_locked());
        }
        pm.unlock(k);
        l.push("seen");
    }, 256, "poller", TaskFlags::empty(), 2);

    let l = log.clone();
    k.create(move |k| {
        k.sleep_for(100);
        m.lock(k); // free while the poller waits
        ready.store(true, Ordering::Relaxed);
        cv.signal(k);
        l.push("set");
        m.unlock(k);
    }, 256, "setter", TaskFlags::empty(), 1);

    assert_eq!(k.run().reason, HaltReason::AllTasksDone);
    assert_eq!(log.take(), ["set", "seen"]);
}
