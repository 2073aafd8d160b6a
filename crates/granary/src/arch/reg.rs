//! The register model.
//!
//! Every register operand in the IR is a [`VirtualRegister`]: a small copyable
//! record that names either an architectural register (possibly a sub-view of
//! one, like `%ah` or `%r10d`), an unschedulable register (segment, flags,
//! vector, `%rsp`), or a translator-invented virtual register awaiting
//! allocation. Sub-views of a 64-bit GPR are described by a byte mask; a
//! second mask records which bytes a write leaves untouched, which is what
//! makes a narrow write a read-modify-write of the full register.

use super::GPR_WIDTH_BYTES;
use granary_asm::reg as enc;

/// Byte-mask names for the addressable views of a 64-bit GPR.
pub const LOW_BYTE: u8 = 0x01;
pub const BYTE_2: u8 = 0x02;
pub const LOW_2_BYTES: u8 = 0x03;
pub const LOW_4_BYTES: u8 = 0x0f;
pub const ALL_8_BYTES: u8 = 0xff;

const HIGH_6_BYTES: u8 = 0xfc;
const HIGH_7_BYTES: u8 = 0xfe;
const HIGH_6_LOW_1_BYTE: u8 = 0xfd;

/// What a [`VirtualRegister`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum RegKind {
    /// Not a register.
    #[default]
    Invalid,
    /// An architectural register the allocator must not touch: `%rsp`,
    /// segment/flag/control registers, x87/MMX/XMM/YMM/ZMM, `%rip`.
    UnschedulableArch,
    /// One of the fifteen schedulable general-purpose registers.
    ArchGpr,
    /// A short-lived virtual register created by a mangler.
    TemporaryVirtual,
    /// A general virtual register created for instrumentation.
    GenericVirtual,
    /// The base pseudo-register of an abstract spill-slot memory operand.
    VirtualSlot,
}

/// A view of a register, architectural or virtual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VirtualRegister {
    pub kind: RegKind,
    /// Identity within the kind. For `ArchGpr` this indexes the fifteen
    /// schedulable GPRs in hardware-encoding order with `%rsp` skipped;
    /// for `UnschedulableArch` it holds an [`ArchReg`] code.
    pub reg_num: u16,
    /// Number of bytes this view names.
    pub num_bytes: u8,
    /// Which bytes of the enclosing 64-bit register this view names.
    pub byte_mask: u8,
    /// Which bytes a write through this view leaves untouched.
    pub preserved_byte_mask: u8,
    flags: u8,
}

const FLAG_STICKY: u8 = 1 << 0;
const FLAG_LEGACY: u8 = 1 << 1;
const FLAG_SCHEDULED: u8 = 1 << 2;
const FLAG_STACK_POINTER: u8 = 1 << 3;
const FLAG_SP_ALIAS: u8 = 1 << 4;

/// Codes for the unschedulable architectural registers the decoder can
/// encounter. Registers with no translator-visible identity (vector
/// registers and the like) all map to `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ArchReg {
    Rsp = 0,
    Esp,
    Sp,
    Spl,
    Rip,
    Eip,
    Rflags,
    Eflags,
    SegCs,
    SegDs,
    SegEs,
    SegSs,
    SegFs,
    SegGs,
    Other,
}

impl VirtualRegister {
    /// The invalid register.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(self) -> bool {
        self.kind != RegKind::Invalid
    }

    pub fn is_virtual(self) -> bool {
        matches!(
            self.kind,
            RegKind::TemporaryVirtual | RegKind::GenericVirtual
        )
    }

    pub fn is_arch_gpr(self) -> bool {
        self.kind == RegKind::ArchGpr
    }

    pub fn is_virtual_slot(self) -> bool {
        self.kind == RegKind::VirtualSlot
    }

    pub fn is_sticky(self) -> bool {
        self.flags & FLAG_STICKY != 0
    }

    pub fn is_legacy(self) -> bool {
        self.flags & FLAG_LEGACY != 0
    }

    pub fn is_scheduled(self) -> bool {
        self.flags & FLAG_SCHEDULED != 0
    }

    pub fn is_stack_pointer(self) -> bool {
        self.flags & FLAG_STACK_POINTER != 0
    }

    /// Marked by the early mangler on virtual registers that hold a copy
    /// of the stack pointer, so the slot allocator can keep them in the
    /// same partition.
    pub fn is_stack_pointer_alias(self) -> bool {
        self.flags & FLAG_SP_ALIAS != 0
    }

    pub fn mark_as_stack_pointer_alias(&mut self) {
        self.flags |= FLAG_SP_ALIAS;
    }

    /// Width of this view in bytes.
    pub fn byte_width(self) -> usize {
        usize::from(self.num_bytes)
    }

    /// Width of this view in bits.
    pub fn bit_width(self) -> u16 {
        u16::from(self.num_bytes) * 8
    }

    /// Does a write through this view implicitly read the register first?
    pub fn preserves_bytes_on_write(self) -> bool {
        self.preserved_byte_mask != 0
    }

    /// A fresh virtual register of `byte_width` bytes.
    pub fn virtual_reg(num: u16, byte_width: usize) -> Self {
        let mut reg = Self {
            kind: RegKind::TemporaryVirtual,
            reg_num: num,
            ..Self::default()
        };
        reg.widen(byte_width);
        reg
    }

    /// The abstract base register of spill slot `num`.
    pub fn slot(num: u16) -> Self {
        Self {
            kind: RegKind::VirtualSlot,
            reg_num: num,
            num_bytes: 8,
            byte_mask: ALL_8_BYTES,
            preserved_byte_mask: 0,
            flags: 0,
        }
    }

    /// The stack pointer.
    pub fn stack_pointer() -> Self {
        Self {
            kind: RegKind::UnschedulableArch,
            reg_num: ArchReg::Rsp as u16,
            num_bytes: 8,
            byte_mask: ALL_8_BYTES,
            preserved_byte_mask: 0,
            flags: FLAG_STACK_POINTER | FLAG_SCHEDULED,
        }
    }

    /// An architectural GPR from its hardware encoding (0..16, `%rsp`
    /// included and mapped to the unschedulable stack-pointer register).
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not a valid hardware encoding.
    pub fn from_hw_enc(hw: u8) -> Self {
        assert!(hw < 16, "bad hardware register encoding: {hw}");
        if hw == enc::RSP {
            return Self::stack_pointer();
        }
        let reg_num = if hw < enc::RSP { hw } else { hw - 1 };
        Self {
            kind: RegKind::ArchGpr,
            reg_num: u16::from(reg_num),
            num_bytes: 8,
            byte_mask: ALL_8_BYTES,
            preserved_byte_mask: 0,
            flags: FLAG_SCHEDULED,
        }
    }

    /// An unschedulable register that is not a GPR.
    pub fn unschedulable(code: ArchReg) -> Self {
        let flags = match code {
            ArchReg::Rsp | ArchReg::Esp | ArchReg::Sp | ArchReg::Spl => {
                FLAG_STACK_POINTER | FLAG_SCHEDULED
            }
            _ => FLAG_SCHEDULED,
        };
        let num_bytes = match code {
            ArchReg::Spl => 1,
            ArchReg::Sp => 2,
            ArchReg::Esp | ArchReg::Eip | ArchReg::Eflags => 4,
            _ => 8,
        };
        Self {
            kind: RegKind::UnschedulableArch,
            reg_num: code as u16,
            num_bytes,
            byte_mask: ALL_8_BYTES,
            preserved_byte_mask: 0,
            flags,
        }
    }

    /// The segment register this names, if any.
    pub fn segment(self) -> Option<ArchReg> {
        if self.kind != RegKind::UnschedulableArch {
            return None;
        }
        match self.arch_code() {
            c @ (ArchReg::SegCs
            | ArchReg::SegDs
            | ArchReg::SegEs
            | ArchReg::SegSs
            | ArchReg::SegFs
            | ArchReg::SegGs) => Some(c),
            _ => None,
        }
    }

    fn arch_code(self) -> ArchReg {
        debug_assert_eq!(self.kind, RegKind::UnschedulableArch);
        match self.reg_num {
            x if x == ArchReg::Rsp as u16 => ArchReg::Rsp,
            x if x == ArchReg::Esp as u16 => ArchReg::Esp,
            x if x == ArchReg::Sp as u16 => ArchReg::Sp,
            x if x == ArchReg::Spl as u16 => ArchReg::Spl,
            x if x == ArchReg::Rip as u16 => ArchReg::Rip,
            x if x == ArchReg::Eip as u16 => ArchReg::Eip,
            x if x == ArchReg::Rflags as u16 => ArchReg::Rflags,
            x if x == ArchReg::Eflags as u16 => ArchReg::Eflags,
            x if x == ArchReg::SegCs as u16 => ArchReg::SegCs,
            x if x == ArchReg::SegDs as u16 => ArchReg::SegDs,
            x if x == ArchReg::SegEs as u16 => ArchReg::SegEs,
            x if x == ArchReg::SegSs as u16 => ArchReg::SegSs,
            x if x == ArchReg::SegFs as u16 => ArchReg::SegFs,
            x if x == ArchReg::SegGs as u16 => ArchReg::SegGs,
            _ => ArchReg::Other,
        }
    }

    /// Decode a named sub-register of a GPR, e.g. `"ah"` or `"r10d"`.
    /// Unknown names become `UnschedulableArch(Other)`.
    pub fn from_name(name: &str) -> Self {
        if let Some(code) = match name {
            "rsp" => Some(ArchReg::Rsp),
            "esp" => Some(ArchReg::Esp),
            "sp" => Some(ArchReg::Sp),
            "spl" => Some(ArchReg::Spl),
            "rip" => Some(ArchReg::Rip),
            "eip" => Some(ArchReg::Eip),
            "rflags" | "flags" => Some(ArchReg::Rflags),
            "eflags" => Some(ArchReg::Eflags),
            "cs" => Some(ArchReg::SegCs),
            "ds" => Some(ArchReg::SegDs),
            "es" => Some(ArchReg::SegEs),
            "ss" => Some(ArchReg::SegSs),
            "fs" => Some(ArchReg::SegFs),
            "gs" => Some(ArchReg::SegGs),
            _ => None,
        } {
            return Self::unschedulable(code);
        }

        // High-byte legacy registers.
        if let Some(hw) = match name {
            "ah" => Some(enc::RAX),
            "ch" => Some(enc::RCX),
            "dh" => Some(enc::RDX),
            "bh" => Some(enc::RBX),
            _ => None,
        } {
            let mut reg = Self::from_hw_enc(hw);
            reg.num_bytes = 1;
            reg.byte_mask = BYTE_2;
            reg.preserved_byte_mask = HIGH_6_LOW_1_BYTE;
            reg.flags |= FLAG_LEGACY;
            return reg;
        }

        for hw in 0..16u8 {
            if hw == enc::RSP {
                continue;
            }
            for (size, byte_width) in [
                (enc::Size::Quadword, 8usize),
                (enc::Size::Doubleword, 4),
                (enc::Size::Word, 2),
                (enc::Size::Byte, 1),
            ] {
                if enc::name(hw, size) == name {
                    let mut reg = Self::from_hw_enc(hw);
                    reg.widen(byte_width);
                    return reg;
                }
            }
        }

        Self::unschedulable(ArchReg::Other)
    }

    /// The hardware encoding (0..16) to use when emitting this register.
    ///
    /// # Panics
    ///
    /// Panics on virtual registers (they must be scheduled first) and on
    /// unschedulable non-GPR registers.
    pub fn hw_enc(self) -> u8 {
        match self.kind {
            RegKind::ArchGpr => {
                let n = self.reg_num as u8;
                if n < enc::RSP {
                    n
                } else {
                    n + 1
                }
            }
            RegKind::UnschedulableArch if self.is_stack_pointer() => enc::RSP,
            _ => panic!("register has no hardware encoding: {self:?}"),
        }
    }

    /// The hardware encoding to use for an 8-bit operand. High-byte
    /// legacy registers occupy encodings 4..8 when no REX prefix is
    /// present.
    pub fn hw_enc8(self) -> u8 {
        if self.is_legacy() {
            self.hw_enc() + 4
        } else {
            self.hw_enc()
        }
    }

    /// True if emitting this register requires a REX prefix: the upper
    /// eight GPRs, and the uniform byte registers `%spl`..`%dil`.
    pub fn needs_rex(self) -> bool {
        if !self.is_arch_gpr() {
            return false;
        }
        let hw = self.hw_enc();
        hw >= 8 || (self.num_bytes == 1 && !self.is_legacy() && hw >= enc::RSP)
    }

    /// Effective width in bytes of a write through this view. A 32-bit
    /// write zero-extends and therefore defines all eight bytes.
    pub fn effective_write_width(self) -> usize {
        match self.preserved_byte_mask {
            0 => GPR_WIDTH_BYTES,
            HIGH_6_BYTES => 2,
            HIGH_7_BYTES | HIGH_6_LOW_1_BYTE => 1,
            _ => unreachable!("bad preserved byte mask"),
        }
    }

    /// Re-point this view at a different width of the same register.
    /// High-byte views widen to their containing register's low bytes.
    pub fn widen(&mut self, dest_byte_width: usize) {
        let (num_bytes, byte_mask, preserved) = match dest_byte_width {
            1 => (1, LOW_BYTE, HIGH_7_BYTES),
            2 => (2, LOW_2_BYTES, HIGH_6_BYTES),
            4 => (4, LOW_4_BYTES, 0),
            8 => (8, ALL_8_BYTES, 0),
            _ => unreachable!("bad register width: {dest_byte_width}"),
        };
        self.num_bytes = num_bytes;
        self.byte_mask = byte_mask;
        self.preserved_byte_mask = preserved;
        self.flags &= !FLAG_LEGACY;
    }

    /// A copy of this view at a different width.
    pub fn widened_to(mut self, dest_byte_width: usize) -> Self {
        self.widen(dest_byte_width);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_are_consistent() {
        for name in ["al", "ah", "ax", "eax", "rax", "r10b", "r10w", "r10d", "r10"] {
            let reg = VirtualRegister::from_name(name);
            assert_eq!(
                u32::from(reg.num_bytes),
                reg.byte_mask.count_ones(),
                "{name}"
            );
            assert_eq!(reg.byte_mask & reg.preserved_byte_mask, 0, "{name}");
        }
    }

    #[test]
    fn sub_views_share_an_identity() {
        let rax = VirtualRegister::from_name("rax");
        let eax = VirtualRegister::from_name("eax");
        let ah = VirtualRegister::from_name("ah");
        assert_eq!(rax.kind, RegKind::ArchGpr);
        assert_eq!(rax.reg_num, eax.reg_num);
        assert_eq!(rax.reg_num, ah.reg_num);
        assert!(ah.is_legacy());
        assert!(!eax.is_legacy());
    }

    #[test]
    fn thirty_two_bit_writes_zero_extend() {
        let eax = VirtualRegister::from_name("eax");
        assert!(!eax.preserves_bytes_on_write());
        assert_eq!(eax.effective_write_width(), 8);
        let ax = VirtualRegister::from_name("ax");
        assert!(ax.preserves_bytes_on_write());
        assert_eq!(ax.effective_write_width(), 2);
    }

    #[test]
    fn rsp_is_unschedulable() {
        let rsp = VirtualRegister::from_name("rsp");
        assert_eq!(rsp.kind, RegKind::UnschedulableArch);
        assert!(rsp.is_stack_pointer());
        assert_eq!(rsp.hw_enc(), 4);
    }

    #[test]
    fn hw_enc_round_trips_and_skips_rsp() {
        for hw in (0..16u8).filter(|&h| h != 4) {
            let reg = VirtualRegister::from_hw_enc(hw);
            assert_eq!(reg.hw_enc(), hw);
            assert_eq!(reg.kind, RegKind::ArchGpr);
        }
        // The fifteen schedulable identities are dense.
        let r15 = VirtualRegister::from_hw_enc(15);
        assert_eq!(r15.reg_num, 14);
    }

    #[test]
    fn widening_clears_the_legacy_flag() {
        let mut ah = VirtualRegister::from_name("ah");
        ah.widen(4);
        assert!(!ah.is_legacy());
        assert_eq!(ah.byte_mask, LOW_4_BYTES);
        assert_eq!(ah.preserved_byte_mask, 0);
    }
}
