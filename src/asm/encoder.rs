//! Instruction encoder (§4.B)
//!
//! Compiles one instruction record into a 64-bit machine word using the
//! static instruction definition table. Pure and deterministic: the same
//! instruction plus the same resolved label table always yields the same
//! word.

use std::collections::HashMap;

use super::instructions::{lookup, operator_code, InstructionClass};
use super::program::{Arg, Instruction};
use crate::error::{Result, TProcError};

/// Folds a signed immediate into its 31-bit two's-complement encoding,
/// failing if the (possibly folded) value still doesn't fit.
pub(crate) fn fold_immediate(x: i64) -> Result<i64> {
    let folded = if x < 0 { (1i64 << 31) + x } else { x };
    if folded >= 1i64 << 31 || folded < 0 {
        return Err(TProcError::ImmediateOverflow { value: x });
    }
    Ok(folded)
}

fn sym_at<'a>(args: &'a [Arg], idx: usize) -> &'a str {
    match &args[idx] {
        Arg::Sym(s) => s.as_str(),
        Arg::Int(_) => panic!(
            "instruction argument at position {idx} was expected to be symbolic (a label or operator token)"
        ),
    }
}

/// Compiles a single instruction record into its 64-bit machine word,
/// given the fully-built label table (see §4.C `compile`).
pub(crate) fn compile_instruction(
    instr: &Instruction,
    labels: &HashMap<String, usize>,
) -> Result<u64> {
    let def = lookup(&instr.mnemonic).ok_or_else(|| TProcError::UnknownInstruction {
        mnemonic: instr.mnemonic.clone(),
    })?;

    let mut vals: Vec<i64> = instr
        .args
        .iter()
        .map(|a| match a {
            Arg::Int(v) => *v,
            Arg::Sym(_) => 0,
        })
        .collect();

    if def.class == InstructionClass::Imm {
        let idx = vals.len() - 1;
        vals[idx] = fold_immediate(vals[idx])?;
    }

    if instr.mnemonic == "loopnz" || instr.mnemonic == "condj" {
        let idx = vals.len() - 1;
        let label = sym_at(&instr.args, idx);
        let target = labels
            .get(label)
            .ok_or_else(|| TProcError::UnknownLabel { label: label.to_string() })?;
        vals[idx] = *target as i64;
    }

    if instr.mnemonic == "condj" {
        let tok = sym_at(&instr.args, 2);
        vals[2] = operator_code(tok)
            .ok_or_else(|| TProcError::UnknownOperator { token: tok.to_string() })?
            as i64;
    } else if instr.mnemonic.starts_with("math") {
        let tok = sym_at(&instr.args, 3);
        vals[3] = operator_code(tok)
            .ok_or_else(|| TProcError::UnknownOperator { token: tok.to_string() })?
            as i64;
    } else if instr.mnemonic.starts_with("bitw") {
        let tok = sym_at(&instr.args, 3);
        vals[3] = operator_code(tok)
            .ok_or_else(|| TProcError::UnknownOperator { token: tok.to_string() })?
            as i64;
    } else if instr.mnemonic.starts_with("read") {
        let tok = sym_at(&instr.args, 2);
        vals[2] = operator_code(tok)
            .ok_or_else(|| TProcError::UnknownOperator { token: tok.to_string() })?
            as i64;
    }

    let mut word: u64 = (def.opcode as u64) << 56;
    for (idx, shift) in def.fields {
        word |= (vals[*idx] as u64) << shift;
    }

    if instr.mnemonic == "loopnz" {
        word |= 0b1000u64 << 46;
    }

    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_immediate_passes_through_small_positive() {
        assert_eq!(fold_immediate(42).unwrap(), 42);
    }

    #[test]
    fn fold_immediate_wraps_negative() {
        assert_eq!(fold_immediate(-1).unwrap(), (1i64 << 31) - 1);
    }

    #[test]
    fn fold_immediate_rejects_too_large() {
        assert!(fold_immediate(1i64 << 31).is_err());
    }
}
