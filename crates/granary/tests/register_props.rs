//! Property tests for the register model's byte-mask invariants.

use granary::arch::reg::VirtualRegister;
use proptest::prelude::*;

fn arbitrary_width() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(2), Just(4), Just(8)]
}

proptest! {
    #[test]
    fn widened_registers_keep_the_mask_invariants(
        hw in 0u8..16,
        width in arbitrary_width(),
    ) {
        let mut reg = VirtualRegister::from_hw_enc(hw);
        if !reg.is_stack_pointer() {
            reg.widen(width);
        }
        prop_assert_eq!(u32::from(reg.num_bytes), reg.byte_mask.count_ones());
        prop_assert_eq!(reg.byte_mask & reg.preserved_byte_mask, 0);
    }

    #[test]
    fn virtual_registers_keep_the_mask_invariants(
        num in 0u16..64,
        width in arbitrary_width(),
    ) {
        let reg = VirtualRegister::virtual_reg(num, width);
        prop_assert_eq!(u32::from(reg.num_bytes), reg.byte_mask.count_ones());
        prop_assert_eq!(reg.byte_mask & reg.preserved_byte_mask, 0);
        prop_assert!(reg.is_virtual());
    }

    #[test]
    fn widths_round_trip_through_widening(
        hw in 0u8..16,
        w1 in arbitrary_width(),
        w2 in arbitrary_width(),
    ) {
        let mut reg = VirtualRegister::from_hw_enc(hw);
        if reg.is_stack_pointer() {
            return Ok(());
        }
        reg.widen(w1);
        reg.widen(w2);
        prop_assert_eq!(reg.byte_width(), w2);
        prop_assert_eq!(reg.hw_enc(), hw);
    }
}
