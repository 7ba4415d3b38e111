//! Pulse emission and timeline synchronization (§4.E)
//!
//! Wraps a [`Program`](crate::asm::Program) with a per-channel time
//! cursor and the pulse-register bookkeeping needed to play `const`,
//! `arb`, and `flat_top` envelopes from the [`PulseLibrary`].

use crate::asm::Program;
use crate::error::{Result, TProcError};
use crate::pulse::{Envelope, PulseLibrary};

/// Per-channel register slots, alternating between the two tProc pages
/// channel pairs share (ch 1,3,5,7 use page slots `{16..21}`, ch 2,4,6,8
/// use `{23..28}`).
struct SpecialRegisters {
    freq: i64,
    phase: i64,
    addr: i64,
    gain: i64,
    mode: i64,
    t: i64,
}

const SPECIAL_REGISTERS: [SpecialRegisters; 8] = [
    SpecialRegisters { freq: 16, phase: 17, addr: 18, gain: 19, mode: 20, t: 21 },
    SpecialRegisters { freq: 23, phase: 24, addr: 25, gain: 26, mode: 27, t: 28 },
    SpecialRegisters { freq: 16, phase: 17, addr: 18, gain: 19, mode: 20, t: 21 },
    SpecialRegisters { freq: 23, phase: 24, addr: 25, gain: 26, mode: 27, t: 28 },
    SpecialRegisters { freq: 16, phase: 17, addr: 18, gain: 19, mode: 20, t: 21 },
    SpecialRegisters { freq: 23, phase: 24, addr: 25, gain: 26, mode: 27, t: 28 },
    SpecialRegisters { freq: 16, phase: 17, addr: 18, gain: 19, mode: 20, t: 21 },
    SpecialRegisters { freq: 23, phase: 24, addr: 25, gain: 26, mode: 27, t: 28 },
];

fn ch_page(ch: usize) -> i64 {
    ((ch - 1) / 2) as i64
}

fn sreg(ch: usize) -> &'static SpecialRegisters {
    &SPECIAL_REGISTERS[ch - 1]
}

/// The 21-bit mode code: `phrst(1) | stdysel(1) | mode(1) | outsel(2) |
/// length(16)`, high to low. Defaults match the hardware's reset state:
/// `phrst=false, stdysel=true, mode=false, outsel=0`.
#[derive(Debug, Clone, Copy)]
pub struct ModeCode {
    /// Reset the phase-coherent accumulator at the start of the pulse.
    pub phrst: bool,
    /// Output a steady zero (true) or the last computed sample (false)
    /// after the pulse ends.
    pub stdysel: bool,
    /// Periodic (true) vs one-shot (false) output.
    pub mode: bool,
    /// Output source selector (0: table*DDS, 1: DDS only, 2: table real
    /// part only, 3: always zero).
    pub outsel: u8,
    /// Pulse length in samples.
    pub length: u16,
}

impl Default for ModeCode {
    fn default() -> Self {
        ModeCode {
            phrst: false,
            stdysel: true,
            mode: false,
            outsel: 0,
            length: 0,
        }
    }
}

impl ModeCode {
    /// Packs the fields into their 21-bit register encoding.
    pub fn encode(&self) -> u32 {
        let mc = (self.phrst as u32) << 4
            | (self.stdysel as u32) << 3
            | (self.mode as u32) << 2
            | (self.outsel as u32 & 0b11);
        (mc << 16) | (self.length as u32)
    }
}

/// Where a pulse's output instruction should be scheduled.
#[derive(Debug, Clone, Copy)]
pub enum PulseTime {
    /// Use the channel's current time cursor, then advance it.
    Auto,
    /// Schedule at this absolute tick, then advance the cursor from it.
    At(i64),
}

/// The register set written by `set_pulse_registers`, addressable by the
/// channel-output (`set`) instruction.
#[derive(Debug, Clone, Copy)]
pub struct PulseRegs {
    /// Register page for this channel pair.
    pub page: i64,
    /// Frequency register.
    pub r_freq: i64,
    /// Phase register.
    pub r_phase: i64,
    /// Table-address register.
    pub r_addr: i64,
    /// Gain register.
    pub r_gain: i64,
    /// Mode-code register.
    pub r_mode: i64,
    /// Scheduled-time register.
    pub r_t: i64,
}

/// Optional per-call overrides for `set_pulse_registers`. Any field left
/// `None` leaves that register untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseRegisterUpdate {
    /// Frequency, in DDS register units.
    pub freq: Option<i64>,
    /// Phase, in DDS register units.
    pub phase: Option<i64>,
    /// Table address, in 16-sample blocks.
    pub addr: Option<i64>,
    /// Gain, in DAC units.
    pub gain: Option<i64>,
    /// Absolute schedule time, in TP ticks.
    pub t: Option<i64>,
    /// Mode-code fields to pack and write.
    pub mode: Option<ModeCode>,
}

/// Default offset (in TP ticks) from the scheduled trigger time to when
/// `trigger_adc` zeroes the ADC-trigger output, matching the window the
/// original firmware budgets for the marker pulse.
pub const DEFAULT_ADC_TRIG_OFFSET: i64 = 270;

/// Wraps a [`Program`] builder with the channel-cursor and
/// pulse-register bookkeeping needed to emit envelope playback and
/// timeline-synchronization instructions.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    program: Program,
    pulses: PulseLibrary,
    /// `dac_ts[0]` is unused; `dac_ts[1..=8]` are the per-channel cursors.
    dac_ts: [i64; 9],
}

impl Sequencer {
    /// Creates an empty sequencer.
    pub fn new() -> Self {
        Sequencer::default()
    }

    /// Borrows the underlying program builder (for `emit`/`label`/custom
    /// instructions alongside pulse emission).
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Mutably borrows the underlying program builder.
    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Mutably borrows the envelope registry.
    pub fn pulses_mut(&mut self) -> &mut PulseLibrary {
        &mut self.pulses
    }

    /// Borrows the envelope registry.
    pub fn pulses(&self) -> &PulseLibrary {
        &self.pulses
    }

    /// The current time cursor for channel `ch`.
    pub fn cursor(&self, ch: usize) -> Result<i64> {
        if (1..=8).contains(&ch) {
            Ok(self.dac_ts[ch])
        } else {
            Err(TProcError::ChannelOutOfRange { channel: ch })
        }
    }

    /// Emits up to six register writes for channel `ch`'s pulse
    /// registers: one each for any non-null field in `update`. Returns
    /// the channel's register handles for use by the channel-output
    /// instruction.
    pub fn set_pulse_registers(&mut self, ch: usize, update: PulseRegisterUpdate) -> Result<PulseRegs> {
        check_channel(ch)?;
        let page = ch_page(ch);
        let s = sreg(ch);

        if let Some(freq) = update.freq {
            self.program.safe_regwi(page, s.freq, freq, None)?;
        }
        if let Some(phase) = update.phase {
            self.program.safe_regwi(page, s.phase, phase, None)?;
        }
        if let Some(gain) = update.gain {
            self.program.regwi(page, s.gain, gain, None)?;
        }
        if let Some(t) = update.t {
            self.program.regwi(page, s.t, t, None)?;
        }
        if let Some(addr) = update.addr {
            self.program.regwi(page, s.addr, addr, None)?;
        }
        if let Some(mode) = update.mode {
            self.program
                .regwi(page, s.mode, mode.encode() as i64, None)?;
        }

        Ok(PulseRegs {
            page,
            r_freq: s.freq,
            r_phase: s.phase,
            r_addr: s.addr,
            r_gain: s.gain,
            r_mode: s.mode,
            r_t: s.t,
        })
    }

    fn emit_channel_output(&mut self, ch: usize, regs: PulseRegs) -> Result<()> {
        self.program.set(
            ch as i64,
            regs.page,
            regs.r_freq,
            regs.r_phase,
            regs.r_addr,
            regs.r_gain,
            regs.r_mode,
            regs.r_t,
            None,
        )?;
        Ok(())
    }

    fn resolve_envelope(&mut self, ch: usize, name: Option<&str>) -> Result<(String, Envelope)> {
        let resolved_name = match name {
            Some(n) => n.to_string(),
            None => self
                .pulses
                .last_played(ch)
                .ok_or_else(|| TProcError::ConfigMissing {
                    key: format!("no pulse previously played on channel {ch}"),
                })?
                .to_string(),
        };
        let env = self
            .pulses
            .get(ch, &resolved_name)
            .ok_or_else(|| TProcError::ConfigMissing {
                key: format!("pulse '{resolved_name}' on channel {ch}"),
            })?
            .clone();
        if name.is_some() {
            self.pulses.set_last_played(ch, &resolved_name);
        }
        Ok((resolved_name, env))
    }

    /// Plays a constant (table-free) pulse. Resolves `length` from the
    /// named envelope (or the last-played one) unless `length_override`
    /// is given, in which case `outsel` is forced to `1` (DDS only).
    #[allow(clippy::too_many_arguments)]
    pub fn const_pulse(
        &mut self,
        ch: usize,
        name: Option<&str>,
        freq: Option<f64>,
        phase: Option<f64>,
        gain: Option<i64>,
        mut mode: ModeCode,
        t: PulseTime,
        play: bool,
    ) -> Result<()> {
        let (_, env) = self.resolve_envelope(ch, name)?;
        let length = match env {
            Envelope::Const { length } => length,
            _ => {
                return Err(TProcError::ConfigMissing {
                    key: format!("channel {ch} pulse is not a const-style envelope"),
                })
            }
        };
        mode.length = length as u16;
        mode.outsel = 1;

        let regs = self.set_pulse_registers(
            ch,
            PulseRegisterUpdate {
                freq: freq.map(|f| f as i64),
                phase: phase.map(|p| p as i64),
                gain,
                mode: Some(mode),
                ..Default::default()
            },
        )?;

        if play {
            let t_abs = match t {
                PulseTime::Auto => self.dac_ts[ch],
                PulseTime::At(t) => t,
            };
            self.dac_ts[ch] = t_abs + length as i64;
            self.program.regwi(regs.page, regs.r_t, t_abs, None)?;
            self.emit_channel_output(ch, regs)?;
        }
        Ok(())
    }

    /// Plays an arbitrary-shaped table-driven pulse.
    #[allow(clippy::too_many_arguments)]
    pub fn arb_pulse(
        &mut self,
        ch: usize,
        name: Option<&str>,
        freq: Option<f64>,
        phase: Option<f64>,
        gain: Option<i64>,
        mut mode: ModeCode,
        t: PulseTime,
        play: bool,
    ) -> Result<()> {
        let (_, env) = self.resolve_envelope(ch, name)?;
        let (base_addr, blocks) = match env {
            Envelope::Arb { base_addr, blocks, .. } => (base_addr, blocks),
            _ => {
                return Err(TProcError::ConfigMissing {
                    key: format!("channel {ch} pulse is not an arb-style envelope"),
                })
            }
        };
        mode.length = blocks as u16;

        let regs = self.set_pulse_registers(
            ch,
            PulseRegisterUpdate {
                freq: freq.map(|f| f as i64),
                phase: phase.map(|p| p as i64),
                addr: Some((base_addr / 16) as i64),
                gain,
                mode: Some(mode),
                ..Default::default()
            },
        )?;

        if play {
            let t_abs = match t {
                PulseTime::Auto => self.dac_ts[ch],
                PulseTime::At(t) => t,
            };
            self.dac_ts[ch] = t_abs + blocks as i64;
            self.program.safe_regwi(regs.page, regs.r_t, t_abs, None)?;
            self.emit_channel_output(ch, regs)?;
        }
        Ok(())
    }

    /// Plays a ramp-up / constant-middle / ramp-down pulse as three
    /// consecutive channel-output instructions at `t`, `t`, and `t +
    /// ramp_length + middle_length`.
    #[allow(clippy::too_many_arguments)]
    pub fn flat_top_pulse(
        &mut self,
        ch: usize,
        name: Option<&str>,
        freq: Option<f64>,
        phase: Option<f64>,
        gain: Option<i64>,
        t: PulseTime,
        play: bool,
    ) -> Result<()> {
        let (_, env) = self.resolve_envelope(ch, name)?;
        let (base_addr, middle_length, total_len) = match env {
            Envelope::FlatTop { base_addr, middle_length, i_samples, .. } => {
                (base_addr, middle_length, i_samples.len())
            }
            _ => {
                return Err(TProcError::ConfigMissing {
                    key: format!("channel {ch} pulse is not a flat-top envelope"),
                })
            }
        };
        let ramp_length = total_len / 16 / 2;
        let base_blocks = base_addr / 16;

        if play {
            let t_abs = match t {
                PulseTime::Auto => self.dac_ts[ch],
                PulseTime::At(t) => t,
            };
            let half_gain = gain.map(|g| g / 2);

            // Ramp up.
            let up = self.set_pulse_registers(
                ch,
                PulseRegisterUpdate {
                    addr: Some(base_blocks as i64),
                    phase: phase.map(|p| p as i64),
                    gain,
                    t: Some(t_abs),
                    mode: Some(ModeCode { outsel: 0, length: ramp_length as u16, stdysel: true, ..Default::default() }),
                    ..Default::default()
                },
            )?;
            self.emit_channel_output(ch, up)?;

            // Constant middle, half gain, DDS-only.
            let mid = self.set_pulse_registers(
                ch,
                PulseRegisterUpdate {
                    addr: Some(base_blocks as i64),
                    phase: phase.map(|p| p as i64),
                    gain: half_gain,
                    t: Some(t_abs),
                    mode: Some(ModeCode { outsel: 1, length: middle_length as u16, stdysel: true, ..Default::default() }),
                    ..Default::default()
                },
            )?;
            self.emit_channel_output(ch, mid)?;

            // Ramp down, delayed past the middle section.
            let down = self.set_pulse_registers(
                ch,
                PulseRegisterUpdate {
                    addr: Some((base_blocks + ramp_length) as i64),
                    phase: phase.map(|p| p as i64),
                    gain,
                    t: Some(t_abs + ramp_length as i64 + middle_length as i64),
                    mode: Some(ModeCode { outsel: 0, length: ramp_length as u16, stdysel: true, ..Default::default() }),
                    ..Default::default()
                },
            )?;
            self.emit_channel_output(ch, down)?;

            self.dac_ts[ch] = t_abs + middle_length as i64 + 2 * ramp_length as i64;
        }
        Ok(())
    }

    /// Plays the named (or last-played) envelope on `ch`, dispatching to
    /// `const_pulse`/`arb_pulse`/`flat_top_pulse` by its registered style.
    #[allow(clippy::too_many_arguments)]
    pub fn pulse(
        &mut self,
        ch: usize,
        name: Option<&str>,
        freq: Option<f64>,
        phase: Option<f64>,
        gain: Option<i64>,
        mode: ModeCode,
        t: PulseTime,
        play: bool,
    ) -> Result<()> {
        let (_, env) = self.resolve_envelope(ch, name)?;
        match env {
            Envelope::Const { .. } => self.const_pulse(ch, name, freq, phase, gain, mode, t, play),
            Envelope::Arb { .. } => self.arb_pulse(ch, name, freq, phase, gain, mode, t, play),
            Envelope::FlatTop { .. } => self.flat_top_pulse(ch, name, freq, phase, gain, t, play),
        }
    }

    /// Sets every channel's time cursor to the maximum cursor over all
    /// channels.
    pub fn align(&mut self) {
        let max_t = self.dac_ts[1..=8].iter().copied().max().unwrap_or(0);
        for t in &mut self.dac_ts[1..=8] {
            *t = max_t;
        }
    }

    /// Emits a `synci(max_cursor + offset)` instruction, then resets
    /// every channel cursor to 0. No-op if `max_cursor + offset <= 0`.
    pub fn sync_all(&mut self, offset: i64) -> Result<()> {
        let max_t = self.dac_ts[1..=8].iter().copied().max().unwrap_or(0);
        if max_t + offset > 0 {
            self.program.synci(max_t + offset)?;
            self.dac_ts = [0; 9];
        }
        Ok(())
    }

    /// The general ADC/output trigger primitive. Encodes a 16-bit output
    /// word from `t1..t4` and `adc1`/`adc2`, then writes it via a `seti`
    /// on register page `rp` at time `t`. If `short`, zeroes the output
    /// again 5 ticks later.
    #[allow(clippy::too_many_arguments)]
    pub fn marker(
        &mut self,
        t: i64,
        t1: bool,
        t2: bool,
        t3: bool,
        t4: bool,
        adc1: bool,
        adc2: bool,
        rp: i64,
        r_out: i64,
        short: bool,
    ) -> Result<()> {
        let out = ((adc2 as i64) << 15)
            | ((adc1 as i64) << 14)
            | ((t4 as i64) << 3)
            | ((t3 as i64) << 2)
            | ((t2 as i64) << 1)
            | (t1 as i64);
        self.program.regwi(rp, r_out, out, None)?;
        self.program.seti(0, rp, r_out, t, None)?;
        if short {
            self.program.regwi(rp, r_out, 0, None)?;
            self.program.seti(0, rp, r_out, t + 5, None)?;
        }
        Ok(())
    }

    /// Triggers the ADC(s): writes the trigger word via register, emits
    /// a pulse on the channel-0 output at `t + offset`, then zeroes the
    /// output 10 ticks later. Specializes `marker` with `t1..t4` all
    /// zero, `rp=0`, and `short=true`. `offset` defaults to
    /// [`DEFAULT_ADC_TRIG_OFFSET`] when `None`.
    pub fn trigger_adc(&mut self, adc1: bool, adc2: bool, offset: Option<i64>, t: i64) -> Result<()> {
        let offset = offset.unwrap_or(DEFAULT_ADC_TRIG_OFFSET);
        let out = ((adc2 as i64) << 15) | ((adc1 as i64) << 14);
        let r_out = 31;
        self.program.regwi(0, r_out, out, None)?;
        self.program.seti(0, 0, r_out, t + offset, None)?;
        self.program.regwi(0, r_out, 0, None)?;
        self.program.seti(0, 0, r_out, t + offset + 10, None)?;
        Ok(())
    }
}

fn check_channel(ch: usize) -> Result<()> {
    if (1..=8).contains(&ch) {
        Ok(())
    } else {
        Err(TProcError::ChannelOutOfRange { channel: ch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_code_packs_fields_high_to_low() {
        let mc = ModeCode {
            phrst: true,
            stdysel: false,
            mode: true,
            outsel: 0b10,
            length: 12,
        };
        let encoded = mc.encode();
        assert_eq!(encoded & 0xFFFF, 12);
        assert_eq!((encoded >> 16) & 0b11111, 0b10110);
    }

    #[test]
    fn mode_code_defaults_match_hardware_reset_state() {
        let mc = ModeCode::default();
        assert!(!mc.phrst);
        assert!(mc.stdysel);
        assert!(!mc.mode);
        assert_eq!(mc.outsel, 0);
    }

    #[test]
    fn align_sets_every_channel_to_the_max_cursor() {
        let mut seq = Sequencer::new();
        seq.dac_ts[2] = 40;
        seq.dac_ts[5] = 100;
        seq.align();
        assert!(seq.dac_ts[1..=8].iter().all(|&t| t == 100));
    }

    #[test]
    fn sync_all_resets_cursors_and_emits_synci() {
        let mut seq = Sequencer::new();
        seq.dac_ts[3] = 50;
        seq.sync_all(10).unwrap();
        assert_eq!(seq.program().len(), 1);
        assert!(seq.dac_ts[1..=8].iter().all(|&t| t == 0));
    }

    #[test]
    fn sync_all_is_a_no_op_when_nonpositive() {
        let mut seq = Sequencer::new();
        seq.sync_all(0).unwrap();
        assert_eq!(seq.program().len(), 0);
    }

    #[test]
    fn const_pulse_scenario_plays_and_advances_cursor() {
        let mut seq = Sequencer::new();
        seq.pulses_mut().register_const(1, "ring", 500).unwrap();
        seq.const_pulse(1, Some("ring"), Some(100.0), Some(0.0), Some(30000), ModeCode::default(), PulseTime::Auto, true)
            .unwrap();
        assert_eq!(seq.cursor(1).unwrap(), 500);
    }

    #[test]
    fn flat_top_pulse_schedules_three_instructions_at_expected_times() {
        let mut seq = Sequencer::new();
        seq.pulses_mut()
            .register_flat_top(1, "ft", Some(vec![0; 32]), Some(vec![0; 32]), 200)
            .unwrap();
        let before = seq.program().len();
        seq.flat_top_pulse(1, Some("ft"), Some(50.0), Some(0.0), Some(20000), PulseTime::At(100), true)
            .unwrap();
        // 3x (set_pulse_registers + set)
        assert!(seq.program().len() > before);
        // ramp_length = 32/16/2 = 1; cursor = 100 + 200 + 2*1
        assert_eq!(seq.cursor(1).unwrap(), 302);
    }

    #[test]
    fn channel_out_of_range_rejected() {
        let mut seq = Sequencer::new();
        let err = seq.cursor(9).unwrap_err();
        assert!(matches!(err, TProcError::ChannelOutOfRange { channel: 9 }));
    }
}
