//! 65816 code emitter.
//!
//! Instructions are recorded as lines and only turned into bytes and text by
//! [`Emitter::assemble`], so the binary and the disassembly listing always
//! describe the same instruction stream. Branch targets are labels resolved
//! at assembly time; every instruction has a fixed size, so [`Emitter::len`]
//! is exact before assembly.

use std::collections::HashMap;
use std::fmt::Write as _;

use thiserror::Error;

pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_D: u8 = 0x08;
/// Index registers are 8-bit when set.
pub const FLAG_X: u8 = 0x10;
/// Accumulator is 8-bit when set.
pub const FLAG_M: u8 = 0x20;
pub const FLAG_V: u8 = 0x40;
pub const FLAG_N: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

/// Tracks what the emitted code may assume about the `m` and `x` status bits.
///
/// A bit is unknown until it has been set by `sep`/`rep` or explicitly
/// assumed; width-dependent instructions refuse to emit against an unknown
/// width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusTracker {
    p: u8,
    known: u8,
}

impl StatusTracker {
    pub fn assume_sep(&mut self, bits: u8) {
        self.p |= bits;
        self.known |= bits;
    }

    pub fn assume_rep(&mut self, bits: u8) {
        self.p &= !bits;
        self.known |= bits;
    }

    pub fn accumulator(&self) -> Option<Width> {
        self.width_of(FLAG_M)
    }

    pub fn index(&self) -> Option<Width> {
        self.width_of(FLAG_X)
    }

    fn width_of(&self, flag: u8) -> Option<Width> {
        if self.known & flag == 0 {
            None
        } else if self.p & flag != 0 {
            Some(Width::Byte)
        } else {
            Some(Width::Word)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("label '{0}' is never defined")]
    UnknownLabel(String),

    #[error("label '{0}' is defined twice")]
    DuplicateLabel(String),

    #[error("branch to '{label}' at ${from:06x} is out of range ({distance} bytes)")]
    BranchOutOfRange {
        label: String,
        from: u32,
        distance: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Comment(String),
    Label(String),
    Code {
        mnemonic: &'static str,
        operand: String,
        bytes: Vec<u8>,
    },
    Data(Vec<u8>),
    Branch {
        mnemonic: &'static str,
        opcode: u8,
        label: String,
    },
}

impl Line {
    fn len(&self) -> usize {
        match self {
            Line::Comment(_) | Line::Label(_) => 0,
            Line::Code { bytes, .. } => bytes.len(),
            Line::Data(bytes) => bytes.len(),
            Line::Branch { .. } => 2,
        }
    }
}

/// Output of [`Emitter::assemble`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub base: u32,
    pub code: Vec<u8>,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Emitter {
    lines: Vec<Line>,
    status: StatusTracker,
    base: u32,
    len: usize,
}

impl Emitter {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Address the next emitted byte will occupy.
    pub fn address(&self) -> u32 {
        self.base.wrapping_add(self.len as u32)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status(&self) -> StatusTracker {
        self.status
    }

    /// Starts an empty scratch emitter continuing at the current address with
    /// the current register widths. Commit it with [`Emitter::append`] or drop it.
    pub fn fork(&self) -> Emitter {
        Emitter {
            lines: Vec::new(),
            status: self.status,
            base: self.address(),
            len: 0,
        }
    }

    /// Adopts everything emitted into `other`, including its register widths.
    pub fn append(&mut self, other: Emitter) {
        self.len += other.len;
        self.status = other.status;
        self.lines.extend(other.lines);
    }

    pub fn assume_sep(&mut self, bits: u8) {
        self.status.assume_sep(bits);
    }

    pub fn assume_rep(&mut self, bits: u8) {
        self.status.assume_rep(bits);
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.lines.push(Line::Comment(text.into()));
    }

    pub fn label(&mut self, name: impl Into<String>) -> u32 {
        self.lines.push(Line::Label(name.into()));
        self.address()
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
        self.lines.push(Line::Data(bytes.to_vec()));
    }

    fn code(&mut self, mnemonic: &'static str, operand: String, bytes: Vec<u8>) {
        self.len += bytes.len();
        self.lines.push(Line::Code {
            mnemonic,
            operand,
            bytes,
        });
    }

    fn branch(&mut self, mnemonic: &'static str, opcode: u8, label: &str) {
        self.len += 2;
        self.lines.push(Line::Branch {
            mnemonic,
            opcode,
            label: label.to_string(),
        });
    }

    fn require_accumulator(&self, mnemonic: &str, want: Width) {
        match (self.status.accumulator(), want) {
            (Some(have), _) if have == want => {}
            (None, _) => panic!(
                "asm: {mnemonic} emitted before the accumulator width was set; call sep/rep or assume_sep/assume_rep first"
            ),
            (Some(_), Width::Byte) => panic!(
                "asm: {mnemonic} needs an 8-bit accumulator; call sep(0x20) or assume_sep(0x20) first"
            ),
            (Some(_), Width::Word) => panic!(
                "asm: {mnemonic} needs a 16-bit accumulator; call rep(0x20) or assume_rep(0x20) first"
            ),
        }
    }

    fn require_index(&self, mnemonic: &str, want: Width) {
        match (self.status.index(), want) {
            (Some(have), _) if have == want => {}
            (None, _) => panic!(
                "asm: {mnemonic} emitted before the index register width was set; call sep/rep or assume_sep/assume_rep first"
            ),
            (Some(_), Width::Byte) => panic!(
                "asm: {mnemonic} needs 8-bit index registers; call sep(0x10) or assume_sep(0x10) first"
            ),
            (Some(_), Width::Word) => panic!(
                "asm: {mnemonic} needs 16-bit index registers; call rep(0x10) or assume_rep(0x10) first"
            ),
        }
    }

    pub fn rep(&mut self, bits: u8) {
        self.status.assume_rep(bits);
        self.code("rep", format!("#${bits:02x}"), vec![0xC2, bits]);
    }

    pub fn sep(&mut self, bits: u8) {
        self.status.assume_sep(bits);
        self.code("sep", format!("#${bits:02x}"), vec![0xE2, bits]);
    }

    pub fn nop(&mut self) {
        self.code("nop", String::new(), vec![0xEA]);
    }

    pub fn rts(&mut self) {
        self.code("rts", String::new(), vec![0x60]);
    }

    pub fn rtl(&mut self) {
        self.code("rtl", String::new(), vec![0x6B]);
    }

    /// `INC dp`; increments one or two bytes depending on the accumulator width.
    pub fn inc_dp(&mut self, addr: u8) {
        self.code("inc", format!("${addr:02x}"), vec![0xE6, addr]);
    }

    pub fn jsr_abs(&mut self, addr: u16) {
        let [lo, hi] = addr.to_le_bytes();
        self.code("jsr", format!("${addr:04x}"), vec![0x20, lo, hi]);
    }

    pub fn jsl(&mut self, addr: u32) {
        self.long("jsl", 0x22, addr);
    }

    pub fn jml(&mut self, addr: u32) {
        self.long("jml", 0x5C, addr);
    }

    fn long(&mut self, mnemonic: &'static str, opcode: u8, addr: u32) {
        let [lo, hi, bank, _] = addr.to_le_bytes();
        self.code(
            mnemonic,
            format!("${:06x}", addr & 0xFF_FFFF),
            vec![opcode, lo, hi, bank],
        );
    }

    fn abs(&mut self, mnemonic: &'static str, opcode: u8, addr: u16) {
        let [lo, hi] = addr.to_le_bytes();
        self.code(mnemonic, format!("${addr:04x}"), vec![opcode, lo, hi]);
    }

    fn imm8(&mut self, mnemonic: &'static str, opcode: u8, value: u8) {
        self.code(mnemonic, format!("#${value:02x}"), vec![opcode, value]);
    }

    fn imm16(&mut self, mnemonic: &'static str, opcode: u8, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.code(mnemonic, format!("#${value:04x}"), vec![opcode, lo, hi]);
    }

    pub fn lda_imm8(&mut self, value: u8) {
        self.require_accumulator("lda.b", Width::Byte);
        self.imm8("lda.b", 0xA9, value);
    }

    pub fn lda_imm16(&mut self, value: u16) {
        self.require_accumulator("lda.w", Width::Word);
        self.imm16("lda.w", 0xA9, value);
    }

    pub fn lda_long(&mut self, addr: u32) {
        self.long("lda.l", 0xAF, addr);
    }

    pub fn lda_abs(&mut self, addr: u16) {
        self.abs("lda.w", 0xAD, addr);
    }

    pub fn ldy_abs(&mut self, addr: u16) {
        self.abs("ldy.w", 0xAC, addr);
    }

    pub fn sta_long(&mut self, addr: u32) {
        self.long("sta.l", 0x8F, addr);
    }

    pub fn sta_abs(&mut self, addr: u16) {
        self.abs("sta.w", 0x8D, addr);
    }

    pub fn ora_imm8(&mut self, value: u8) {
        self.require_accumulator("ora.b", Width::Byte);
        self.imm8("ora.b", 0x09, value);
    }

    pub fn ora_imm16(&mut self, value: u16) {
        self.require_accumulator("ora.w", Width::Word);
        self.imm16("ora.w", 0x09, value);
    }

    pub fn and_imm8(&mut self, value: u8) {
        self.require_accumulator("and.b", Width::Byte);
        self.imm8("and.b", 0x29, value);
    }

    pub fn cmp_imm8(&mut self, value: u8) {
        self.require_accumulator("cmp.b", Width::Byte);
        self.imm8("cmp.b", 0xC9, value);
    }

    pub fn cmp_imm16(&mut self, value: u16) {
        self.require_accumulator("cmp.w", Width::Word);
        self.imm16("cmp.w", 0xC9, value);
    }

    pub fn adc_imm8(&mut self, value: u8) {
        self.require_accumulator("adc.b", Width::Byte);
        self.imm8("adc.b", 0x69, value);
    }

    pub fn cpy_imm8(&mut self, value: u8) {
        self.require_index("cpy.b", Width::Byte);
        self.imm8("cpy.b", 0xC0, value);
    }

    pub fn bne(&mut self, label: &str) {
        self.branch("bne", 0xD0, label);
    }

    pub fn beq(&mut self, label: &str) {
        self.branch("beq", 0xF0, label);
    }

    pub fn bpl(&mut self, label: &str) {
        self.branch("bpl", 0x10, label);
    }

    pub fn bcs(&mut self, label: &str) {
        self.branch("bcs", 0xB0, label);
    }

    pub fn bra(&mut self, label: &str) {
        self.branch("bra", 0x80, label);
    }

    /// `BEQ` with a literal displacement, for skipping a fixed number of bytes.
    pub fn beq_rel(&mut self, displacement: i8) {
        self.code(
            "beq",
            format!("${:02x}", displacement as u8),
            vec![0xF0, displacement as u8],
        );
    }

    /// `BRA` with a literal displacement.
    pub fn bra_rel(&mut self, displacement: i8) {
        self.code(
            "bra",
            format!("${:02x}", displacement as u8),
            vec![0x80, displacement as u8],
        );
    }

    /// Resolves labels and renders the binary and listing views.
    pub fn assemble(&self) -> Result<Assembled, AsmError> {
        let mut labels = HashMap::new();
        let mut addr = self.base;
        for line in &self.lines {
            if let Line::Label(name) = line
                && labels.insert(name.as_str(), addr).is_some()
            {
                return Err(AsmError::DuplicateLabel(name.clone()));
            }
            addr = addr.wrapping_add(line.len() as u32);
        }

        let mut code = Vec::with_capacity(self.len);
        let mut text = String::new();
        let _ = writeln!(text, "base ${:06x}", self.base);

        let mut addr = self.base;
        for line in &self.lines {
            match line {
                Line::Comment(s) => {
                    let _ = writeln!(text, "    ; {s}");
                }
                Line::Label(name) => {
                    let _ = writeln!(text, "{name}:");
                }
                Line::Code {
                    mnemonic,
                    operand,
                    bytes,
                } => {
                    write_insn(&mut text, mnemonic, operand, addr, bytes);
                    code.extend_from_slice(bytes);
                }
                Line::Data(bytes) => {
                    let listing = bytes
                        .iter()
                        .map(|b| format!("${b:02x}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = writeln!(text, "    {:<5} {listing}", "db");
                    code.extend_from_slice(bytes);
                }
                Line::Branch {
                    mnemonic,
                    opcode,
                    label,
                } => {
                    let target = *labels
                        .get(label.as_str())
                        .ok_or_else(|| AsmError::UnknownLabel(label.clone()))?;
                    let distance = i64::from(target) - (i64::from(addr) + 2);
                    let displacement = i8::try_from(distance).map_err(|_| {
                        AsmError::BranchOutOfRange {
                            label: label.clone(),
                            from: addr,
                            distance,
                        }
                    })?;
                    let bytes = [*opcode, displacement as u8];
                    write_insn(&mut text, mnemonic, label, addr, &bytes);
                    code.extend_from_slice(&bytes);
                }
            }
            addr = addr.wrapping_add(line.len() as u32);
        }

        Ok(Assembled {
            base: self.base,
            code,
            text,
        })
    }
}

fn write_insn(text: &mut String, mnemonic: &str, operand: &str, addr: u32, bytes: &[u8]) {
    let hex = bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(
        text,
        "    {mnemonic:<5} {operand:<8} ; ${:06x}  {hex}",
        addr & 0xFF_FFFF
    );
}
