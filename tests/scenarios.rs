//! End-to-end scenario tests exercising whole containers rather than single
//! operations, one per container family.

use syncprims_rs::{
    AntiReplay, BlkRing, LaxRob, LfRing, LinkList, LinklistStatus, PfRwLock, ReplayResult,
};

#[test]
fn antireplay_sequence_scenario() {
    let ar = AntiReplay::new(8, None).unwrap();
    assert_eq!(ar.test_and_set(5), ReplayResult::Pass);
    assert_eq!(ar.test_and_set(7), ReplayResult::Pass);
    assert_eq!(ar.test_and_set(7), ReplayResult::Replay);
    assert_eq!(ar.test_and_set(3), ReplayResult::Stale);
    assert_eq!(ar.test_and_set(8), ReplayResult::Pass);
}

#[test]
fn blkring_order_scenario() {
    let rb: BlkRing<i32> = BlkRing::new(8).unwrap();
    rb.enqueue_all(vec![10, 20, 30]);
    assert_eq!(rb.dequeue_exact(2), vec![10, 20]);
    rb.enqueue_all(vec![40]);
    assert_eq!(rb.dequeue_exact(2), vec![30, 40]);
}

#[test]
fn lfring_capacity_one_scenario() {
    let ring: LfRing<&str> = LfRing::new(1).unwrap();
    assert!(ring.try_enqueue("a").is_ok());
    assert!(ring.try_enqueue("b").is_err());
    assert_eq!(ring.try_dequeue(), Some("a"));
    assert!(ring.try_enqueue("b").is_ok());
    assert_eq!(ring.try_dequeue(), Some("b"));
    assert!(ring.try_dequeue().is_none());
}

#[test]
fn laxrob_scenario() {
    use std::sync::{Arc, Mutex};
    let out = Arc::new(Mutex::new(Vec::new()));
    let out2 = Arc::clone(&out);
    let rob: LaxRob<&str> = LaxRob::new(4, 2, move |batch| out2.lock().unwrap().extend(batch)).unwrap();

    rob.insert(vec![(3, "c"), (1, "a"), (2, "b")]);
    rob.flush(4);

    let seen = out.lock().unwrap();
    let mut sns: Vec<u64> = seen.iter().map(|(sn, _)| *sn).collect();
    sns.sort_unstable();
    assert_eq!(sns, vec![1, 2, 3]);
}

#[test]
fn harris_list_scenario() {
    let list: LinkList<i32, &str> = LinkList::new();
    assert_eq!(list.insert(5, "five"), LinklistStatus::Success);
    assert_eq!(list.insert(1, "one"), LinklistStatus::Success);
    assert_eq!(list.insert(3, "three"), LinklistStatus::Success);
    assert!(list.contains(&1));
    assert!(list.contains(&3));
    assert!(list.contains(&5));
    assert_eq!(list.remove(&3), LinklistStatus::Success);
    assert!(!list.contains(&3));
    assert_eq!(list.remove(&3), LinklistStatus::NotFound);
}

#[test]
fn phase_fair_rwlock_fairness_scenario() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    let lock = Arc::new(PfRwLock::new());
    lock.acquire_rd();

    let writer_ran = Arc::new(AtomicUsize::new(0));
    let lock2 = Arc::clone(&lock);
    let writer_ran2 = Arc::clone(&writer_ran);
    let writer = thread::spawn(move || {
        lock2.acquire_wr();
        writer_ran2.store(1, Ordering::SeqCst);
        lock2.release_wr();
    });

    thread::sleep(std::time::Duration::from_millis(20));
    // A reader arriving after the writer's ticket must queue behind it
    // instead of extending the current read phase indefinitely.
    assert!(!lock.try_acquire_rd());
    assert_eq!(writer_ran.load(Ordering::SeqCst), 0);

    lock.release_rd();
    writer.join().unwrap();
    assert_eq!(writer_ran.load(Ordering::SeqCst), 1);
}
