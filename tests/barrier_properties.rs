// Run with: cargo test --features mock_test --test barrier_properties
#![cfg(feature = "mock_test")]

//! End-to-end properties of a barriered store sequence, checked against a
//! model over randomized store streams.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wbtk::policy::region::CardState;
use wbtk::util::test_util::*;
use wbtk::{
    AccessAttrs, BarrierAssembler, PreservationLevel, RegOrOffset, RuntimeEntry, SlowPathStrategy,
};

const OBJ: MockReg = MockReg(5);
const VAL: MockReg = MockReg(7);
const TMP1: MockReg = MockReg(16);
const TMP2: MockReg = MockReg(17);
const TMP3: MockReg = MockReg(18);

/// Drive one emitted `ref_store_at` over a stream of random stores and
/// check every observable barrier effect against a model.
#[test]
fn randomized_store_stream_matches_the_model() {
    let fixture = BarrierFixture::new();
    let mut machine = MockMachine::new();
    fixture.install(&mut machine);
    fixture.set_marking_active(&mut machine, true);

    let config = fixture.config;
    let mut masm = MockEmitter::new();
    let mut asm = BarrierAssembler::new(&config, SlowPathStrategy::InlineCall);
    asm.ref_store_at(
        &mut masm,
        AccessAttrs::default(),
        OBJ,
        RegOrOffset::Offset(0),
        Some(VAL),
        TMP1,
        TMP2,
        TMP3,
        PreservationLevel::None,
    );

    // Entries handed to the runtime when a buffer is full, captured so the
    // model can account for them alongside the in-buffer entries.
    let spilled_satb = Rc::new(RefCell::new(Vec::<u64>::new()));
    let spilled_cards = Rc::new(RefCell::new(Vec::<u64>::new()));
    {
        let spilled_satb = spilled_satb.clone();
        let spilled_cards = spilled_cards.clone();
        machine.set_runtime_handler(Box::new(move |_machine, entry, args| match entry {
            RuntimeEntry::PreWrite => spilled_satb.borrow_mut().push(args[0]),
            RuntimeEntry::PostWrite => spilled_cards.borrow_mut().push(args[0]),
            _ => panic!("unexpected runtime entry"),
        }));
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut expected_satb: Vec<u64> = vec![];
    let mut expected_cards: Vec<u64> = vec![];

    for _ in 0..300 {
        let slot = rng.random_range(0x100..0x1_0000u64) & !0x7;
        let value = if rng.random_range(0..4) == 0 {
            0
        } else {
            rng.random_range(0x100..0x10_0000u64) & !0x7
        };
        let old = machine.read_u64(slot);
        let card_was = fixture.card_state(&machine, slot);

        machine.set_reg(OBJ, slot);
        machine.set_reg(VAL, value);
        machine.run(&masm);

        assert_eq!(machine.read_u64(slot), value, "raw store must land");

        // Marking is active: every non-null old value is logged exactly
        // once per store.
        if old != 0 {
            expected_satb.push(old);
        }
        // A non-null cross-region store dirties a clean card exactly once.
        let crosses = (slot ^ value) >> config.log_region_bytes != 0;
        if value != 0 && crosses && card_was == CardState::Clean as u8 {
            expected_cards.push(fixture.card_byte_addr(slot));
            assert_eq!(
                fixture.card_state(&machine, slot),
                CardState::Dirty as u8
            );
        } else if value != 0 && crosses {
            assert_ne!(fixture.card_state(&machine, slot), CardState::Clean as u8);
        } else {
            // Filtered: same region or null store leaves the card alone.
            assert_eq!(fixture.card_state(&machine, slot), card_was);
        }
    }

    let mut logged_satb: Vec<u64> = spilled_satb.borrow().clone();
    logged_satb.extend(fixture.satb_entries(&machine));
    logged_satb.sort_unstable();
    expected_satb.sort_unstable();
    assert_eq!(logged_satb, expected_satb);

    let mut logged_cards: Vec<u64> = spilled_cards.borrow().clone();
    logged_cards.extend(fixture.dirty_card_entries(&machine));
    logged_cards.sort_unstable();
    expected_cards.sort_unstable();
    assert_eq!(logged_cards, expected_cards);
}

/// The two strategies must be observably identical on the same store
/// stream.
#[test]
fn strategies_have_identical_observable_behavior() {
    let run = |strategy: SlowPathStrategy| {
        let fixture = BarrierFixture::new();
        let mut machine = MockMachine::new();
        fixture.install(&mut machine);
        fixture.set_marking_active(&mut machine, true);

        let config = fixture.config;
        let mut masm = MockEmitter::new();
        let mut asm = BarrierAssembler::new(&config, strategy);
        asm.ref_store_at(
            &mut masm,
            AccessAttrs::default(),
            OBJ,
            RegOrOffset::Offset(0),
            Some(VAL),
            TMP1,
            TMP2,
            TMP3,
            PreservationLevel::None,
        );
        masm.ret();
        asm.emit_stubs(&mut masm);

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let slot = rng.random_range(0x100..0x1_0000u64) & !0x7;
            let value = if rng.random_range(0..4) == 0 {
                0
            } else {
                rng.random_range(0x100..0x10_0000u64) & !0x7
            };
            machine.set_reg(OBJ, slot);
            machine.set_reg(VAL, value);
            machine.run(&masm);
        }
        (
            fixture.satb_entries(&machine),
            fixture.dirty_card_entries(&machine),
            machine.calls.clone(),
        )
    };

    assert_eq!(
        run(SlowPathStrategy::InlineCall),
        run(SlowPathStrategy::SharedStub)
    );
}
