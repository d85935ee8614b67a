use std::thread;
use std::time::Duration;

use threadloom::queue::BlockingQueue;

#[test]
fn fifo_across_offer_and_poll() {
    let queue = BlockingQueue::unbounded();
    for value in 0..10 {
        assert!(queue.offer(value));
    }
    let mut drained = Vec::new();
    while let Some(value) = queue.poll() {
        drained.push(value);
    }
    assert_eq!(drained, (0..10).collect::<Vec<_>>());
}

#[test]
fn len_never_exceeds_capacity_and_offer_fails_when_full() {
    let queue = BlockingQueue::new(4);
    for value in 0..4 {
        assert!(queue.offer(value));
        assert!(queue.len() <= queue.capacity());
    }
    assert!(!queue.offer(99));
    assert_eq!(queue.len(), 4);
}

#[test]
fn capacity_one_put_and_take_do_not_deadlock() {
    let queue = BlockingQueue::new(1);
    let producer_queue = queue.clone();
    let producer = thread::spawn(move || {
        producer_queue.put("a");
        producer_queue.put("b");
    });

    let first = queue.take();
    let second = queue.take();
    producer.join().unwrap();

    assert_eq!(first, "a");
    assert_eq!(second, "b");
}

#[test]
fn full_drain_leaves_the_queue_empty() {
    let queue = BlockingQueue::from_vec((0..50).collect(), 50);
    let mut sink = Vec::new();
    let drained = queue.drain_to(&mut sink, usize::MAX, |_| true);

    assert_eq!(drained, 50);
    assert_eq!(queue.len(), 0);
    assert_eq!(sink, (0..50).collect::<Vec<_>>());
}

#[test]
fn predicated_drain_only_removes_matches() {
    let queue = BlockingQueue::from_vec((0..20).collect(), 20);
    let mut evens = Vec::new();
    let drained = queue.drain_to(&mut evens, usize::MAX, |value| value % 2 == 0);

    assert_eq!(drained, 10);
    assert_eq!(evens, (0..20).step_by(2).collect::<Vec<_>>());
    assert_eq!(queue.to_vec(), (0..20).filter(|v| v % 2 != 0).collect::<Vec<_>>());
}

#[test]
fn iterator_fails_fast_on_concurrent_modification() {
    let queue = BlockingQueue::from_vec(vec![1, 2, 3], 10);
    let mut iter = queue.iter();
    assert_eq!(iter.try_next().unwrap(), Some(1));

    queue.offer(4);

    assert!(iter.try_next().is_err());
}

#[test]
fn timed_offer_and_poll_respect_their_deadline() {
    let queue = BlockingQueue::new(1);
    assert!(queue.offer(1));
    let started = std::time::Instant::now();
    assert!(!queue.offer_timeout(2, Duration::from_millis(20)));
    assert!(started.elapsed() >= Duration::from_millis(20));

    assert_eq!(queue.poll(), Some(1));
    let empty = BlockingQueue::<i32>::new(1);
    let started = std::time::Instant::now();
    assert_eq!(empty.poll_timeout(Duration::from_millis(20)), None);
    assert!(started.elapsed() >= Duration::from_millis(20));
}
