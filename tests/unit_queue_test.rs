use riptide::core::pool::{PoolMode, RequestQueue};

#[tokio::test]
async fn test_fifo_disciplines_pop_oldest_first() {
    for mode in [PoolMode::Blocking, PoolMode::NonBlocking] {
        let mut queue: RequestQueue<u32> = RequestQueue::new(0);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop(mode)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4], "mode {mode:?}");
    }
}

#[tokio::test]
async fn test_lifo_discipline_pops_freshest_first() {
    let mut queue: RequestQueue<u32> = RequestQueue::new(0);
    for i in 0..5 {
        queue.push(i).unwrap();
    }
    let order: Vec<u32> = std::iter::from_fn(|| queue.pop(PoolMode::Lifo)).collect();
    assert_eq!(order, vec![4, 3, 2, 1, 0]);
}

#[tokio::test]
async fn test_bounded_queue_fails_fast() {
    let mut queue: RequestQueue<u32> = RequestQueue::new(2);
    queue.push(1).unwrap();
    queue.push(2).unwrap();
    // The rejected item comes back to the producer untouched.
    assert_eq!(queue.push(3), Err(3));
    assert_eq!(queue.len(), 2);

    // Draining one slot re-opens the queue.
    assert_eq!(queue.pop(PoolMode::Blocking), Some(1));
    queue.push(3).unwrap();
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_zero_limit_means_unbounded() {
    let mut queue: RequestQueue<u32> = RequestQueue::new(0);
    for i in 0..10_000 {
        queue.push(i).unwrap();
    }
    assert_eq!(queue.len(), 10_000);
}

#[tokio::test]
async fn test_drain_empties_in_insertion_order() {
    let mut queue: RequestQueue<u32> = RequestQueue::new(0);
    for i in 0..4 {
        queue.push(i).unwrap();
    }
    assert_eq!(queue.drain(), vec![0, 1, 2, 3]);
    assert!(queue.is_empty());
}
