//! tProc assembler (§4.A–§4.C)
//!
//! A small program builder and encoder for the timed processor's
//! instruction set: an append-only instruction list (`Program`), a static
//! per-mnemonic bit-field table (`instructions`), and a pure encoder
//! (`encoder`) that lowers one resolved instruction into its 64-bit machine
//! word.

mod encoder;
mod instructions;
mod program;

pub use instructions::{operator_code, InstructionClass, InstructionDef};
pub use program::{Arg, Instruction, Program};
