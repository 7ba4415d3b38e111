//! Timed-processor assembler, pulse sequencer, and averager runtime
//!
//! Drives an FPGA-based pulse controller used in qubit-control experiments.
//! A small custom processor on the FPGA (the "timed processor", TP) executes
//! a 64-bit instruction stream that, cycle-accurately, programs multiple
//! direct-digital-synthesis (DDS) signal generators and triggers ADC capture
//! windows. This crate compiles that instruction stream, sequences envelope
//! pulses on top of it, and runs the host-side averaging control loop that
//! drains accumulated I/Q samples off the device.
//!
//! # Crate feature flags
//! - `asm` (default): instruction table, encoder, and program builder
//!   (`asm` module)
//! - `sequencer` (default): pulse library and timeline sequencer
//!   (`pulse`, `sequencer` modules), depends on `asm`
//! - `averager` (default): host-side averager control loop (`averager`,
//!   `device`, `config` modules), depends on `sequencer`
//! - `testing` (opt-in): in-memory `MockDevice` façade for tests/examples
//!
//! # Quick start
//! ```
//! use tproc_qick::asm::Program;
//!
//! let mut prog = Program::new();
//! prog.regwi(0, 14, 0, None).unwrap();
//! prog.regwi(0, 15, 0, None).unwrap();
//! prog.label("LOOP");
//! prog.mathi(0, 15, 15, "+", 1).unwrap();
//! prog.memwi(0, 15, 1).unwrap();
//! prog.loopnz(0, 14, "LOOP").unwrap();
//! prog.end().unwrap();
//! let words = prog.compile().unwrap();
//! assert_eq!(words.len(), 6);
//! ```

#![warn(missing_docs)]

#[cfg(feature = "asm")]
pub mod asm; // Instruction encoder + program builder

#[cfg(feature = "averager")]
pub mod averager; // Host-side averager control loop

#[cfg(feature = "averager")]
pub mod config; // Configuration dictionary

#[cfg(feature = "averager")]
pub mod device; // Device façade trait (+ MockDevice under `testing`)

pub mod error; // Crate-wide error type

#[cfg(feature = "sequencer")]
pub mod pulse; // Per-channel envelope registry

#[cfg(feature = "sequencer")]
pub mod sequencer; // Pulse emission + timeline synchronization

pub mod units; // Physical-unit <-> register conversions

pub use error::{Result, TProcError};

#[cfg(feature = "asm")]
pub use asm::Program;

#[cfg(feature = "averager")]
pub use averager::{AveragerHooks, SingleAxisAverager, TwoAxisAverager};

#[cfg(feature = "averager")]
pub use device::DeviceFacade;

#[cfg(feature = "sequencer")]
pub use sequencer::Sequencer;

pub use units::DeviceClock;
