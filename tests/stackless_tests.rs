//! Integration tests for stackless coroutines sharing one stack

mod common;

use std::hint::black_box;

use common::*;
use spindle::{
    cancel, join, spawn, state, stats, wait, yield_now, Attr, CoroutineId, CoroutineState,
    CoroutineType, WaitOutcome, STATUS_CANCELLED,
};

fn stackless_stepper() -> Attr {
    let mut attr = Attr::stepper();
    attr.set_type(CoroutineType::STACKLESS);
    attr
}

/// Generator yielding the squares of `seed..seed + 64` from a table kept on
/// its own stack.
fn squares(seed: u64) -> impl FnOnce() -> i32 {
    move || {
        let mut table = [0u64; 64];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = seed + i as u64;
        }
        for value in black_box(&table).iter() {
            yield_now(Some(Box::new(value * value)));
        }
        0
    }
}

mod relocation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interleaved_generators_keep_their_frames() {
        let a = spawn("squares-a", stackless_stepper(), squares(10)).unwrap();
        let b = spawn("squares-b", stackless_stepper(), squares(1000)).unwrap();

        for i in 0..64u64 {
            assert_eq!(wait(a).unwrap().downcast::<u64>(), Some((10 + i) * (10 + i)));
            assert_eq!(wait(b).unwrap().downcast::<u64>(), Some((1000 + i) * (1000 + i)));
        }
        assert!(wait(a).unwrap().is_dead());
        assert!(wait(b).unwrap().is_dead());
        assert_eq!(join(a).unwrap(), 0);
        assert_eq!(join(b).unwrap(), 0);

        // Every wait after the first pair moved frames on the shared stack.
        assert!(stats().relocations >= 128);
    }

    #[test]
    fn test_standalone_stackless_round_robin() {
        let sums = log();
        let ids: Vec<CoroutineId> = (1..=3u64)
            .map(|k| {
                let sums = sums.clone();
                spawn(&format!("summer-{}", k), Attr::stackless(), move || {
                    let mut local = [0u64; 32];
                    for round in 0..4u64 {
                        for (i, slot) in local.iter_mut().enumerate() {
                            *slot += k * (i as u64 + round);
                        }
                        yield_now(None);
                    }
                    sums.borrow_mut().push((k, black_box(&local).iter().sum::<u64>()));
                    0
                })
                .unwrap()
            })
            .collect();

        for id in ids {
            assert_eq!(join(id).unwrap(), 0);
        }
        // sum over rounds and slots of k * (i + round) = k * (4 * 496 + 32 * 6)
        let expected: Vec<(u64, u64)> = (1..=3).map(|k| (k, k * (4 * 496 + 32 * 6))).collect();
        assert_eq!(entries(&sums), expected);
    }

    #[test]
    fn test_mixed_stackful_and_stackless() {
        let order = log();
        let kinds = [Attr::default(), Attr::stackless(), Attr::default(), Attr::stackless()];
        let ids: Vec<CoroutineId> = kinds
            .iter()
            .enumerate()
            .map(|(i, attr)| {
                let order = order.clone();
                spawn("mixed", *attr, move || {
                    let marker = black_box(i * 100);
                    for round in 0..3 {
                        order.borrow_mut().push(marker + round);
                        yield_now(None);
                    }
                    marker as i32
                })
                .unwrap()
            })
            .collect();

        let statuses: Vec<i32> = ids.into_iter().map(|id| join(id).unwrap()).collect();
        assert_eq!(statuses, vec![0, 100, 200, 300]);
        assert_eq!(
            entries(&order),
            vec![0, 100, 200, 300, 1, 101, 201, 301, 2, 102, 202, 302]
        );
    }

    #[test]
    fn test_lone_stackless_coroutine_is_not_relocated_again() {
        let id = spawn("alone", Attr::stackless(), || {
            for _ in 0..10 {
                yield_now(None);
            }
            0
        })
        .unwrap();
        join(id).unwrap();
        assert_eq!(stats().relocations, 1);
    }
}

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cancel_suspended_stackless() {
        let victim = spawn("victim", Attr::stackless(), || loop {
            yield_now(None);
        })
        .unwrap();
        let bystander = spawn("bystander", Attr::stackless(), || {
            let local = black_box([3u32; 16]);
            for _ in 0..4 {
                yield_now(None);
            }
            local.iter().sum::<u32>() as i32
        })
        .unwrap();

        yield_now(None);
        yield_now(None);
        cancel(victim).unwrap();
        assert_eq!(join(victim).unwrap(), STATUS_CANCELLED);
        assert_eq!(join(bystander).unwrap(), 48);
    }

    #[test]
    fn test_cancel_stackless_occupant() {
        // The victim is the last stackless coroutine to have run, so its
        // frames are the ones on the shared stack.
        let victim = spawn("occupant", Attr::stackless(), || loop {
            yield_now(None);
        })
        .unwrap();
        yield_now(None);
        assert_eq!(state(victim).unwrap(), CoroutineState::Runnable);

        cancel(victim).unwrap();
        assert_eq!(join(victim).unwrap(), STATUS_CANCELLED);

        let next = spawn("next", stackless_stepper(), squares(2)).unwrap();
        assert_eq!(wait(next).unwrap().downcast::<u64>(), Some(4));
        cancel(next).unwrap();
        assert_eq!(join(next).unwrap(), STATUS_CANCELLED);
    }

    #[test]
    fn test_cancel_ready_stackless_stepper() {
        let a = spawn("a", stackless_stepper(), squares(5)).unwrap();
        let b = spawn("b", stackless_stepper(), squares(7)).unwrap();
        assert_eq!(wait(a).unwrap().downcast::<u64>(), Some(25));
        assert_eq!(wait(b).unwrap().downcast::<u64>(), Some(49));

        // `a` is evicted, `b` occupies the shared stack.
        cancel(a).unwrap();
        assert_eq!(join(a).unwrap(), STATUS_CANCELLED);
        assert_eq!(wait(b).unwrap().downcast::<u64>(), Some(64));
        assert!(matches!(wait(b).unwrap(), WaitOutcome::Yielded(Some(_))));
        cancel(b).unwrap();
        assert_eq!(join(b).unwrap(), STATUS_CANCELLED);
    }

    #[test]
    fn test_panicking_stackless_coroutine() {
        let id = spawn("panicker", Attr::stackless(), || {
            yield_now(None);
            panic!("stackless boom")
        })
        .unwrap();
        assert_eq!(join(id).unwrap(), spindle::STATUS_PANICKED);

        let id = spawn("after", Attr::stackless(), || 11).unwrap();
        assert_eq!(join(id).unwrap(), 11);
    }
}
