//! Property-based tests for descriptor pool accounting using proptest.

use proptest::prelude::*;
use safer_aio::pool::DescriptorId;
use safer_aio::DescriptorPool;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    /// Release the n-th outstanding id (modulo the outstanding count)
    Release(usize),
    /// Release an id that is not outstanding
    Bogus(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        3 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Bogus),
    ]
}

/// Pool accounting matches a set-based model under any acquire/release mix
#[test]
fn test_pool_matches_model() {
    proptest!(|(
        capacity in 1usize..=32,
        ops in prop::collection::vec(op(), 1..200)
    )| {
        let pool = DescriptorPool::new(capacity).unwrap();
        let mut outstanding: Vec<DescriptorId> = Vec::new();
        let mut exhausted = 0u64;

        for op in ops {
            match op {
                Op::Acquire => match pool.acquire().unwrap() {
                    Some(id) => {
                        prop_assert!(outstanding.len() < capacity);
                        prop_assert!(id.index() < capacity);
                        prop_assert!(!outstanding.contains(&id));
                        outstanding.push(id);
                    }
                    None => {
                        prop_assert_eq!(outstanding.len(), capacity);
                        exhausted += 1;
                    }
                },
                Op::Release(n) if !outstanding.is_empty() => {
                    let id = outstanding.swap_remove(n % outstanding.len());
                    prop_assert!(pool.release(id).is_ok());
                }
                Op::Release(_) => {}
                Op::Bogus(n) => {
                    let id = DescriptorId::from_event_data((n % (capacity * 2)) as u64);
                    if !outstanding.contains(&id) {
                        prop_assert!(pool.release(id).is_err());
                    }
                }
            }

            prop_assert_eq!(pool.used().unwrap(), outstanding.len());
            prop_assert_eq!(pool.available().unwrap(), capacity - outstanding.len());
        }

        let stats = pool.stats().unwrap();
        prop_assert_eq!(stats.exhausted, exhausted);
        prop_assert_eq!(stats.in_use, outstanding.len());
    });
}

/// Every descriptor is handed out exactly once before any repeats
#[test]
fn test_fresh_pool_hands_out_every_id() {
    proptest!(|(capacity in 1usize..=64)| {
        let pool = DescriptorPool::new(capacity).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..capacity {
            let id = pool.acquire().unwrap().unwrap();
            prop_assert!(seen.insert(id));
        }
        prop_assert!(pool.acquire().unwrap().is_none());
    });
}

/// Released ids come back in release order once the fresh ids are used up
#[test]
fn test_release_order_is_reuse_order() {
    proptest!(|(
        capacity in 2usize..=16,
        order in any::<u64>()
    )| {
        let pool = DescriptorPool::new(capacity).unwrap();
        let mut ids: Vec<_> = (0..capacity).map(|_| pool.acquire().unwrap().unwrap()).collect();

        // Deterministic shuffle from the generated seed
        let mut seed = order;
        for i in (1..ids.len()).rev() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ids.swap(i, (seed >> 33) as usize % (i + 1));
        }

        for id in &ids {
            pool.release(*id).unwrap();
        }
        for expected in &ids {
            prop_assert_eq!(pool.acquire().unwrap().unwrap(), *expected);
        }
    });
}
