//! Shared test fixtures: a miniature guest assembler and engine helpers.

#![allow(dead_code)]

use arcsim::{Engine, SimOptions};

/// Condition field values understood by `bcc`.
pub const COND_EQ: u8 = 1;
pub const COND_NE: u8 = 2;
pub const COND_LT: u8 = 3;
pub const COND_GE: u8 = 4;

/// Assembles guest programs in the simulator's encoding.
pub struct Asm {
    base: u32,
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new(base: u32) -> Self {
        Asm { base, bytes: Vec::new() }
    }

    /// Address of the next emitted instruction.
    pub fn pc(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn parcel(&mut self, parcel: u16) {
        self.bytes.extend_from_slice(&parcel.to_le_bytes());
    }

    fn wide(&mut self, major: u8, a6: u8, b5: u8, c6: u8, imm10: i32) {
        self.parcel(((major as u16) << 11) | ((a6 as u16 & 0x3f) << 5) | (b5 as u16 & 0x1f));
        self.parcel(((c6 as u16 & 0x3f) << 10) | (imm10 as u16 & 0x3ff));
    }

    /// mov reg, imm (short form; imm must fit in s10)
    pub fn mov_imm(&mut self, reg: u8, imm: i32) {
        assert!((-512..512).contains(&imm), "imm {imm} does not fit s10");
        self.wide(0x00, reg, 0, 0x3f, imm);
    }

    /// mov reg, imm32 (long-immediate form)
    pub fn mov_limm(&mut self, reg: u8, imm: u32) {
        self.wide(0x00, reg, 0, 0x3e, 0);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov dest, src
    pub fn mov_reg(&mut self, dest: u8, src: u8) {
        self.wide(0x00, dest, 0, src, 0);
    }

    pub fn add_reg(&mut self, dest: u8, lhs: u8, rhs: u8) {
        self.wide(0x01, dest, lhs, rhs, 0);
    }

    pub fn add_imm(&mut self, dest: u8, lhs: u8, imm: i32) {
        assert!((-512..512).contains(&imm));
        self.wide(0x01, dest, lhs, 0x3f, imm);
    }

    pub fn sub_imm(&mut self, dest: u8, lhs: u8, imm: i32) {
        self.wide(0x02, dest, lhs, 0x3f, imm);
    }

    pub fn mpy_reg(&mut self, dest: u8, lhs: u8, rhs: u8) {
        self.wide(0x08, dest, lhs, rhs, 0);
    }

    pub fn cmp_imm(&mut self, reg: u8, imm: i32) {
        self.wide(0x09, 0x3f, reg, 0x3f, imm);
    }

    pub fn cmp_reg(&mut self, lhs: u8, rhs: u8) {
        self.wide(0x09, 0x3f, lhs, rhs, 0);
    }

    pub fn ld(&mut self, dest: u8, base: u8, offset: i32) {
        self.wide(0x0a, dest, base, 0, offset);
    }

    pub fn st(&mut self, src: u8, base: u8, offset: i32) {
        self.wide(0x0b, 0, base, src, offset);
    }

    fn branch_disp(&self, target: u32, bits: u32) -> i32 {
        let disp = (target as i64 - self.pc() as i64) / 2;
        let limit = 1i64 << (bits - 1);
        assert!(disp >= -limit && disp < limit, "branch target out of range");
        disp as i32
    }

    /// b target
    pub fn b(&mut self, target: u32) {
        let disp = self.branch_disp(target, 20);
        self.wide(0x0c, ((disp >> 15) & 0x1f) as u8, ((disp >> 10) & 0x1f) as u8, 0, disp);
    }

    /// b.d target (with delay slot)
    pub fn b_d(&mut self, target: u32) {
        let disp = self.branch_disp(target, 20);
        self.wide(
            0x0c,
            (((disp >> 15) & 0x1f) as u8) | 0x20,
            ((disp >> 10) & 0x1f) as u8,
            0,
            disp,
        );
    }

    /// bl target (link in r31)
    pub fn bl(&mut self, target: u32) {
        let disp = self.branch_disp(target, 20);
        self.wide(0x0d, ((disp >> 15) & 0x1f) as u8, ((disp >> 10) & 0x1f) as u8, 0, disp);
    }

    /// bcc target (condition field from the COND_* constants)
    pub fn bcc(&mut self, cond: u8, target: u32) {
        let disp = self.branch_disp(target, 15);
        self.wide(0x0e, cond, ((disp >> 10) & 0x1f) as u8, 0, disp);
    }

    /// breq b, c, target
    pub fn breq(&mut self, lhs: u8, rhs: u8, target: u32) {
        let disp = self.branch_disp(target, 10);
        self.wide(0x0f, 0, lhs, rhs, disp);
    }

    /// brne b, c, target
    pub fn brne(&mut self, lhs: u8, rhs: u8, target: u32) {
        let disp = self.branch_disp(target, 10);
        self.wide(0x0f, 1, lhs, rhs, disp);
    }

    /// j [reg]
    pub fn j_reg(&mut self, reg: u8) {
        self.wide(0x10, 0, 0, reg, 0);
    }

    /// jl limm (call an absolute address)
    pub fn jl_abs(&mut self, target: u32) {
        self.wide(0x11, 0, 0, 0x3e, 0);
        self.bytes.extend_from_slice(&target.to_le_bytes());
    }

    pub fn trap(&mut self, cause: i32) {
        self.wide(0x14, 0, 0, 0, cause);
    }

    /// flag 1: halt the guest
    pub fn halt(&mut self) {
        self.wide(0x15, 0, 0, 0x3f, 1);
    }

    pub fn nop(&mut self) {
        self.parcel(0xf000);
    }
}

/// Options for a pure-interpretation run.
pub fn interp_opts() -> SimOptions {
    SimOptions {
        fast: false,
        workers: 1,
        ..SimOptions::default()
    }
}

/// Options with translation enabled and thresholds low enough for tests
/// to reach native code quickly.
pub fn fast_opts(hot_threshold: u64) -> SimOptions {
    SimOptions {
        fast: true,
        workers: 2,
        hot_threshold,
        page_translate_threshold: 1,
        ..SimOptions::default()
    }
}

/// Builds an engine and loads the assembled program at its base address.
pub fn engine_with_program(opts: SimOptions, asm: &Asm) -> Engine {
    let mut engine = Engine::new(opts).expect("engine construction");
    engine.memory_mut().write_bytes(asm.base(), asm.bytes());
    engine.set_pc(asm.base());
    engine
}

/// A counting loop: r1 counts 0..iterations, r2 accumulates the sum of
/// counter values. Halts when done.
pub fn counting_loop(base: u32, iterations: i32) -> Asm {
    let mut asm = Asm::new(base);
    asm.mov_imm(1, 0);
    asm.mov_imm(2, 0);
    let head = asm.pc();
    asm.add_reg(2, 2, 1);
    asm.add_imm(1, 1, 1);
    asm.cmp_imm(1, iterations);
    asm.bcc(COND_NE, head);
    asm.halt();
    asm
}
