//! Program builder (§4.C)
//!
//! An append-only list of instruction records plus a label table. Lowers a
//! handful of convenience mnemonics (`safe_regwi`) and resolves labels at
//! `compile()` time, after the full program has been built.

use std::collections::HashMap;
use std::fmt;

use super::encoder::{compile_instruction, fold_immediate};
use super::instructions::lookup;
use crate::error::{Result, TProcError};

/// One instruction argument: either a small integer (register index, page
/// number, immediate) or a symbolic string (a label name or an
/// operator token), per §3's instruction-record data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// An integer argument (register index, page, immediate, channel...).
    Int(i64),
    /// A symbolic argument: a label name (jump target) or an operator
    /// token (`"+"`, `"<<"`, `"upper"`, ...).
    Sym(String),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Sym(s) => write!(f, "{s}"),
        }
    }
}

macro_rules! impl_arg_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                Arg::Int(v as i64)
            }
        })*
    };
}
impl_arg_from_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Sym(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Sym(v)
    }
}

/// One record in the program list: a mnemonic, its arguments, and an
/// optional human-readable comment (never encoded, only used by
/// `format_asm`).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub(crate) mnemonic: String,
    pub(crate) args: Vec<Arg>,
    pub(crate) comment: Option<String>,
}

/// The tProc program builder: an append-only instruction list plus a label
/// table, resolved and encoded by `compile()`.
#[derive(Debug, Clone, Default)]
pub struct Program {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
}

impl Program {
    /// Creates an empty program.
    pub fn new() -> Self {
        Program::default()
    }

    /// Number of instructions appended so far.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// True if no instructions have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Appends one instruction record. Fails with `UnknownInstruction` if
    /// `mnemonic` is not in the static instruction definition table.
    pub fn emit(&mut self, mnemonic: &str, args: &[Arg]) -> Result<usize> {
        self.emit_commented(mnemonic, args, None)
    }

    /// Appends one instruction record with an attached comment.
    pub fn emit_commented(
        &mut self,
        mnemonic: &str,
        args: &[Arg],
        comment: Option<&str>,
    ) -> Result<usize> {
        if lookup(mnemonic).is_none() {
            return Err(TProcError::UnknownInstruction {
                mnemonic: mnemonic.to_string(),
            });
        }
        let idx = self.instructions.len();
        self.instructions.push(Instruction {
            mnemonic: mnemonic.to_string(),
            args: args.to_vec(),
            comment: comment.map(str::to_string),
        });
        Ok(idx)
    }

    /// Binds `name` to the current length of the program (the index the
    /// next-emitted instruction will occupy).
    pub fn label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.instructions.len());
    }

    /// A bookkeeping no-op kept for parity with the original assembler's
    /// `comment` method: attaches no instruction.
    pub fn comment(&mut self, _text: &str) {}

    /// Writes a 32-bit immediate through a register, splitting it across
    /// multiple instructions if it doesn't fit the 30-bit single-`regwi`
    /// fast path. Guarantees the full 32-bit value is reconstructed without
    /// ever emitting an immediate >= 2^30.
    pub fn safe_regwi(&mut self, page: i64, reg: i64, imm: i64, comment: Option<&str>) -> Result<()> {
        if imm < (1 << 30) {
            self.emit_commented("regwi", &[page.into(), reg.into(), imm.into()], comment)?;
        } else {
            self.emit_commented(
                "regwi",
                &[page.into(), reg.into(), (imm >> 1).into()],
                comment,
            )?;
            self.emit_commented(
                "bitwi",
                &[page.into(), reg.into(), reg.into(), "<<".into(), 2.into()],
                None,
            )?;
            if imm % 4 != 0 {
                self.emit_commented(
                    "mathi",
                    &[page.into(), reg.into(), reg.into(), "+".into(), (imm % 4).into()],
                    None,
                )?;
            }
        }
        Ok(())
    }

    /// Convenience wrapper for the `regwi` mnemonic.
    pub fn regwi(&mut self, page: i64, reg: i64, imm: i64, comment: Option<&str>) -> Result<usize> {
        self.emit_commented("regwi", &[page.into(), reg.into(), imm.into()], comment)
    }

    /// Convenience wrapper for the `mathi` mnemonic (`dst = src op imm`).
    pub fn mathi(
        &mut self,
        page: i64,
        dst: i64,
        src: i64,
        op: &str,
        imm: i64,
    ) -> Result<usize> {
        self.emit(
            "mathi",
            &[page.into(), dst.into(), src.into(), op.into(), imm.into()],
        )
    }

    /// Convenience wrapper for the `bitwi` mnemonic (`dst = src op imm`).
    pub fn bitwi(
        &mut self,
        page: i64,
        dst: i64,
        src: i64,
        op: &str,
        imm: i64,
    ) -> Result<usize> {
        self.emit(
            "bitwi",
            &[page.into(), dst.into(), src.into(), op.into(), imm.into()],
        )
    }

    /// Convenience wrapper for the `memwi` mnemonic.
    pub fn memwi(&mut self, page: i64, reg: i64, addr: i64) -> Result<usize> {
        self.emit("memwi", &[page.into(), reg.into(), addr.into()])
    }

    /// Convenience wrapper for the `synci` mnemonic.
    pub fn synci(&mut self, imm: i64) -> Result<usize> {
        self.emit("synci", &[imm.into()])
    }

    /// Convenience wrapper for the `seti` mnemonic (channel output set with
    /// an immediate scheduling time).
    pub fn seti(&mut self, ch: i64, page: i64, reg: i64, t: i64, comment: Option<&str>) -> Result<usize> {
        self.emit_commented("seti", &[ch.into(), page.into(), reg.into(), t.into()], comment)
    }

    /// Convenience wrapper for the `set` mnemonic (channel output trigger
    /// referencing the six pulse registers).
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        ch: i64,
        page: i64,
        r_freq: i64,
        r_phase: i64,
        r_addr: i64,
        r_gain: i64,
        r_mode: i64,
        r_t: i64,
        comment: Option<&str>,
    ) -> Result<usize> {
        self.emit_commented(
            "set",
            &[
                ch.into(),
                page.into(),
                r_freq.into(),
                r_phase.into(),
                r_addr.into(),
                r_gain.into(),
                r_mode.into(),
                r_t.into(),
            ],
            comment,
        )
    }

    /// Convenience wrapper for the `loopnz` mnemonic: decrements `reg` and
    /// jumps to `label` while it is non-zero.
    pub fn loopnz(&mut self, page: i64, reg: i64, label: &str) -> Result<usize> {
        self.emit("loopnz", &[page.into(), reg.into(), label.into()])
    }

    /// Convenience wrapper for the `condj` mnemonic: jumps to `label` if
    /// `val op imm` holds.
    pub fn condj(
        &mut self,
        page: i64,
        val: i64,
        op: &str,
        imm: i64,
        label: &str,
    ) -> Result<usize> {
        self.emit(
            "condj",
            &[page.into(), val.into(), op.into(), imm.into(), label.into()],
        )
    }

    /// Convenience wrapper for the `end` mnemonic.
    pub fn end(&mut self) -> Result<usize> {
        self.emit("end", &[])
    }

    /// Compiles the program into its sequence of 64-bit machine words.
    /// Deterministic: the same program always yields the same sequence.
    pub fn compile(&self) -> Result<Vec<u64>> {
        self.instructions
            .iter()
            .map(|instr| compile_instruction(instr, &self.labels))
            .collect()
    }

    /// Reconstructs a human-readable assembly listing using each
    /// mnemonic's print template and the label table (labels printed as
    /// `name:` prefixes, trailing `// comment` when present).
    pub fn format_asm(&self) -> String {
        let max_label_len = self.labels.keys().map(|l| l.len()).max().unwrap_or(0);
        let indent = " ".repeat(max_label_len + 2);

        let mut lines: Vec<String> = self
            .instructions
            .iter()
            .map(|instr| {
                let def = lookup(&instr.mnemonic).expect("emitted mnemonic must be in the table");
                let body = render_template(def.repr, &instr.args);
                let mut line = format!("{indent}{} {body};", instr.mnemonic);
                if let Some(comment) = &instr.comment {
                    if line.len() < 48 {
                        line.push_str(&" ".repeat(48 - line.len()));
                    } else {
                        line.push(' ');
                    }
                    line.push_str("// ");
                    line.push_str(comment);
                }
                line
            })
            .collect();

        let mut by_index: Vec<(&String, &usize)> = self.labels.iter().collect();
        by_index.sort_by_key(|(_, idx)| **idx);
        for (name, idx) in by_index {
            let prefix = format!("{name}: ");
            let rest = lines[*idx][indent.len()..].to_string();
            let pad = if prefix.len() < indent.len() {
                " ".repeat(indent.len() - prefix.len())
            } else {
                String::new()
            };
            lines[*idx] = format!("{prefix}{pad}{rest}");
        }

        format!("// Program\n\n{}", lines.join("\n"))
    }

    /// Decodes a reference binary program (a flat sequence of 64-bit
    /// words) and compares it word-by-word against this program's
    /// compiled output. Returns the index of the first mismatch, or
    /// `None` if every word through the shorter of the two sequences
    /// matches and the lengths are equal.
    pub fn compare_with(&self, reference: &[u64]) -> Result<Option<usize>> {
        let ours = self.compile()?;
        let n = ours.len().min(reference.len());
        for i in 0..n {
            if ours[i] != reference[i] {
                return Ok(Some(i));
            }
        }
        if ours.len() != reference.len() {
            return Ok(Some(n));
        }
        Ok(None)
    }
}

fn render_template(template: &str, args: &[Arg]) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let digits = &template[i + 1..i + end];
                if let Ok(idx) = digits.parse::<usize>() {
                    if let Some(arg) = args.get(idx) {
                        out.push_str(&arg.to_string());
                    }
                    i += end + 1;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Checks whether `imm` would require more than one emitted instruction
/// under `safe_regwi`'s fast-path threshold (exposed for tests).
#[cfg(test)]
pub(crate) fn needs_split(imm: i64) -> bool {
    imm >= (1 << 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_program_from_spec_scenario_1() {
        let mut p = Program::new();
        p.regwi(0, 14, 0, None).unwrap();
        p.regwi(0, 15, 0, None).unwrap();
        p.label("L");
        p.mathi(0, 15, 15, "+", 1).unwrap();
        p.memwi(0, 15, 1).unwrap();
        p.loopnz(0, 14, "L").unwrap();
        p.end().unwrap();

        let words = p.compile().unwrap();
        assert_eq!(words.len(), 6);

        let loopnz_word = words[4];
        assert_ne!(loopnz_word & (0b1000u64 << 46), 0, "mandatory flag bit must be set");
        let low_field = loopnz_word & 0xFFFF;
        assert_eq!(low_field, 2, "loopnz low field must equal L's instruction index");
    }

    #[test]
    fn safe_regwi_boundary_emits_two_or_three_instructions() {
        let mut p = Program::new();
        p.safe_regwi(0, 3, 1 << 30, None).unwrap();
        assert_eq!(p.len(), 2, "exact 2^30 needs regwi + bitwi, no mathi");

        let mut p2 = Program::new();
        p2.safe_regwi(0, 3, (1 << 30) + 3, None).unwrap();
        assert_eq!(p2.len(), 3, "2^30 + 3 needs regwi + bitwi + mathi");
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        let mut p = Program::new();
        let err = p.emit("frobnicate", &[]).unwrap_err();
        assert!(matches!(err, TProcError::UnknownInstruction { .. }));
    }

    #[test]
    fn unresolved_label_fails_at_compile() {
        let mut p = Program::new();
        p.loopnz(0, 14, "NOPE").unwrap();
        let err = p.compile().unwrap_err();
        assert!(matches!(err, TProcError::UnknownLabel { .. }));
    }

    #[test]
    fn unknown_operator_token_is_rejected_at_compile() {
        let mut p = Program::new();
        p.emit(
            "mathi",
            &[0.into(), 1.into(), 1.into(), "???".into(), 1.into()],
        )
        .unwrap();
        let err = p.compile().unwrap_err();
        assert!(matches!(err, TProcError::UnknownOperator { .. }));
    }

    #[test]
    fn compile_is_deterministic() {
        let mut p = Program::new();
        p.regwi(0, 1, 5, None).unwrap();
        p.label("X");
        p.loopnz(0, 1, "X").unwrap();
        p.end().unwrap();
        assert_eq!(p.compile().unwrap(), p.compile().unwrap());
    }

    #[test]
    fn compare_with_reports_first_mismatch() {
        let mut p = Program::new();
        p.regwi(0, 1, 5, None).unwrap();
        p.regwi(0, 2, 6, None).unwrap();
        let mut reference = p.compile().unwrap();
        reference[1] ^= 1;
        assert_eq!(p.compare_with(&reference).unwrap(), Some(1));
    }

    #[test]
    fn compare_with_matches_identical_program() {
        let mut p = Program::new();
        p.regwi(0, 1, 5, None).unwrap();
        let words = p.compile().unwrap();
        assert_eq!(p.compare_with(&words).unwrap(), None);
    }

    #[test]
    fn format_asm_prefixes_label_lines() {
        let mut p = Program::new();
        p.regwi(0, 14, 0, None).unwrap();
        p.label("LOOP_J");
        p.loopnz(0, 14, "LOOP_J").unwrap();
        let listing = p.format_asm();
        assert!(listing.contains("LOOP_J:"));
    }
}
