//! Register model and allocation. No graph coloring here: a free register
//! is the first one in the size class that is not currently locked, and
//! when everything is locked the allocator flushes all locks and starts
//! over from the accumulator. Locks are released at statement boundaries by
//! the code generator.

use std::collections::BTreeSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reg {
    Al,
    Ah,
    Bl,
    Bh,
    Cl,
    Ch,
    Dl,
    Dh,
    Ax,
    Bx,
    Cx,
    Dx,
    Sp,
    Bp,
    Si,
    Di,
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Reg {
    pub fn name(self) -> &'static str {
        use Reg::*;
        match self {
            Al => "al",
            Ah => "ah",
            Bl => "bl",
            Bh => "bh",
            Cl => "cl",
            Ch => "ch",
            Dl => "dl",
            Dh => "dh",
            Ax => "ax",
            Bx => "bx",
            Cx => "cx",
            Dx => "dx",
            Sp => "sp",
            Bp => "bp",
            Si => "si",
            Di => "di",
            Eax => "eax",
            Ebx => "ebx",
            Ecx => "ecx",
            Edx => "edx",
            Esp => "esp",
            Ebp => "ebp",
            Esi => "esi",
            Edi => "edi",
        }
    }

    pub fn size(self) -> i32 {
        use Reg::*;
        match self {
            Al | Ah | Bl | Bh | Cl | Ch | Dl | Dh => 1,
            Ax | Bx | Cx | Dx | Sp | Bp | Si | Di => 2,
            _ => 4,
        }
    }

    /// The accumulator of the given operand size.
    pub fn accumulator(size: i32) -> Reg {
        match size {
            1 => Reg::Al,
            2 => Reg::Ax,
            _ => Reg::Eax,
        }
    }

    /// The data register (`dl`/`dx`/`edx`) of the given operand size; pairs
    /// with [Reg::accumulator] for the remainder after `div`.
    pub fn data_reg(size: i32) -> Reg {
        match size {
            1 => Reg::Dl,
            2 => Reg::Dx,
            _ => Reg::Edx,
        }
    }

    /// The base register (`bl`/`bx`/`ebx`) of the given operand size.
    pub fn base_reg(size: i32) -> Reg {
        match size {
            1 => Reg::Bl,
            2 => Reg::Bx,
            _ => Reg::Ebx,
        }
    }

    /// The count register (`cl`/`cx`/`ecx`) of the given operand size, used
    /// for variable array indexing.
    pub fn count_reg(size: i32) -> Reg {
        match size {
            1 => Reg::Cl,
            2 => Reg::Cx,
            _ => Reg::Ecx,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FReg {
    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,
}

impl FReg {
    pub fn name(self) -> &'static str {
        use FReg::*;
        match self {
            St0 => "st0",
            St1 => "st1",
            St2 => "st2",
            St3 => "st3",
            St4 => "st4",
            St5 => "st5",
            St6 => "st6",
            St7 => "st7",
        }
    }
}

const BYTE_REGS: [Reg; 8] = [
    Reg::Al,
    Reg::Ah,
    Reg::Bl,
    Reg::Bh,
    Reg::Cl,
    Reg::Ch,
    Reg::Dl,
    Reg::Dh,
];
const WORD_REGS: [Reg; 8] = [
    Reg::Ax,
    Reg::Bx,
    Reg::Cx,
    Reg::Dx,
    Reg::Sp,
    Reg::Bp,
    Reg::Si,
    Reg::Di,
];
const DWORD_REGS: [Reg; 8] = [
    Reg::Eax,
    Reg::Ebx,
    Reg::Ecx,
    Reg::Edx,
    Reg::Esp,
    Reg::Ebp,
    Reg::Esi,
    Reg::Edi,
];
const FLOAT_REGS: [FReg; 8] = [
    FReg::St0,
    FReg::St1,
    FReg::St2,
    FReg::St3,
    FReg::St4,
    FReg::St5,
    FReg::St6,
    FReg::St7,
];

#[derive(Debug, Default)]
pub struct Registers {
    locked: BTreeSet<Reg>,
    locked_float: BTreeSet<FReg>,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the first free register of the size class. The stack
    /// registers (`sp`/`bp`/`esp`/`ebp`) are never handed out; they carry
    /// the frame.
    pub fn allocate(&mut self, size: i32) -> Reg {
        let class: &[Reg] = match size {
            1 => &BYTE_REGS,
            2 => &WORD_REGS,
            _ => &DWORD_REGS,
        };
        for &reg in class {
            if matches!(reg, Reg::Sp | Reg::Bp | Reg::Esp | Reg::Ebp) {
                continue;
            }
            if !self.locked.contains(&reg) {
                self.locked.insert(reg);
                return reg;
            }
        }
        // everything in use: flush and restart from the accumulator
        self.free_all();
        let reg = Reg::accumulator(size);
        self.locked.insert(reg);
        reg
    }

    pub fn allocate_float(&mut self) -> FReg {
        for &reg in &FLOAT_REGS {
            if !self.locked_float.contains(&reg) {
                self.locked_float.insert(reg);
                return reg;
            }
        }
        self.free_all_float();
        self.locked_float.insert(FReg::St0);
        FReg::St0
    }

    pub fn free(&mut self, reg: Reg) {
        self.locked.remove(&reg);
    }

    pub fn free_float(&mut self, reg: FReg) {
        self.locked_float.remove(&reg);
    }

    pub fn free_all(&mut self) {
        self.locked.clear();
    }

    pub fn free_all_float(&mut self) {
        self.locked_float.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_order() {
        let mut regs = Registers::new();
        assert_eq!(regs.allocate(4), Reg::Eax);
        assert_eq!(regs.allocate(4), Reg::Ebx);
        assert_eq!(regs.allocate(4), Reg::Ecx);
        assert_eq!(regs.allocate(4), Reg::Edx);
        // esp/ebp are skipped
        assert_eq!(regs.allocate(4), Reg::Esi);
        assert_eq!(regs.allocate(4), Reg::Edi);
    }

    #[test]
    fn test_exhaustion_flushes() {
        let mut regs = Registers::new();
        for _ in 0..6 {
            regs.allocate(4);
        }
        // class exhausted: locks flush and eax comes back
        assert_eq!(regs.allocate(4), Reg::Eax);
        assert_eq!(regs.allocate(4), Reg::Ebx);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut regs = Registers::new();
        let r1 = regs.allocate(4);
        let _r2 = regs.allocate(4);
        regs.free(r1);
        assert_eq!(regs.allocate(4), Reg::Eax);
    }

    #[test]
    fn test_float_allocation() {
        let mut regs = Registers::new();
        assert_eq!(regs.allocate_float(), FReg::St0);
        assert_eq!(regs.allocate_float(), FReg::St1);
        regs.free_float(FReg::St0);
        assert_eq!(regs.allocate_float(), FReg::St0);
    }

    #[test]
    fn test_byte_and_word_classes() {
        let mut regs = Registers::new();
        assert_eq!(regs.allocate(1), Reg::Al);
        assert_eq!(regs.allocate(1), Reg::Ah);
        assert_eq!(regs.allocate(2), Reg::Ax);
        // sp/bp skipped in the word class too
        for _ in 0..3 {
            regs.allocate(2);
        }
        assert_eq!(regs.allocate(2), Reg::Si);
    }
}
