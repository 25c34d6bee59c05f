//! Property tests over random relay operation sequences
//!
//! A simple model tracks which framebuffer sits in `pending` and `active`.
//! After every step each buffer's reference count must equal the number of
//! holders the model predicts, and exports must match the model.

use std::sync::Arc;

use proptest::prelude::*;

use membrane::testing::{RelayFixture, TestBuffer};
use membrane::PowerState;

const FRAMEBUFFERS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Commit(usize),
    Tick,
    Export,
    PowerOff,
    PowerOn,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..FRAMEBUFFERS).prop_map(Op::Commit),
        3 => Just(Op::Tick),
        2 => Just(Op::Export),
        1 => Just(Op::PowerOff),
        1 => Just(Op::PowerOn),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn references_are_conserved(ops in prop::collection::vec(op(), 1..40)) {
        let fixture = RelayFixture::new();
        let link = fixture.attach_consumer();
        let framebuffers: Vec<_> = (0..FRAMEBUFFERS).map(|_| fixture.framebuffer(1)).collect();
        let buffers: Vec<&Arc<TestBuffer>> = framebuffers.iter().map(|(_, b)| &b[0]).collect();

        let mut pending: Option<usize> = None;
        let mut active: Option<usize> = None;

        for op in ops {
            match op {
                Op::Commit(i) => {
                    fixture.client().commit(&framebuffers[i].0);
                    pending = Some(i);
                }
                Op::Tick => {
                    let tick = fixture.device().tick();
                    prop_assert_eq!(
                        tick.retired.map(|(id, _)| id),
                        pending.map(|i| framebuffers[i].0.id())
                    );
                    if let Some(i) = pending.take() {
                        active = Some(i);
                    }
                }
                Op::Export => {
                    let export = link.export();
                    match active.take() {
                        Some(i) => {
                            prop_assert_eq!(export.id, framebuffers[i].0.id());
                            prop_assert_eq!(export.count(), 1);
                            prop_assert!(export.is_complete());
                        }
                        None => prop_assert!(export.is_empty()),
                    }
                }
                Op::PowerOff => {
                    fixture.device().set_power(PowerState::Off);
                    pending = None;
                    active = None;
                }
                Op::PowerOn => fixture.device().set_power(PowerState::On),
            }

            for (i, buffer) in buffers.iter().enumerate() {
                // local + registry + framebuffer, plus one per occupied slot
                let expected = 3 + usize::from(pending == Some(i)) + usize::from(active == Some(i));
                prop_assert_eq!(Arc::strong_count(buffer), expected, "buffer {}", i);
            }
            prop_assert_eq!(fixture.device().has_pending(), pending.is_some());
            prop_assert_eq!(fixture.device().has_active(), active.is_some());
        }

        drop(link);
        for buffer in &buffers {
            prop_assert_eq!(Arc::strong_count(buffer), 3);
        }
    }
}
