//! Per-channel envelope registry (§4.D)
//!
//! Each DAC channel owns a table memory and a name -> envelope map. `arb`
//! and `flat_top` envelopes consume table space (`next_addr` advances by
//! the sample count); `const` envelopes don't use table memory at all.

use std::collections::HashMap;

use crate::error::{Result, TProcError};

/// Pulse envelope style and its associated sample data, as registered
/// under a name on one DAC channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A table-free pulse: DDS output only, for `length` TP ticks.
    Const {
        /// Pulse duration, in TP clock ticks.
        length: usize,
    },
    /// An arbitrary-shaped pulse driven entirely from table memory.
    Arb {
        /// I-channel sample data.
        i_samples: Vec<i32>,
        /// Q-channel sample data.
        q_samples: Vec<i32>,
        /// Table address this envelope's samples start at.
        base_addr: usize,
        /// `i_samples.len() / 16`, the length in 16-sample table blocks.
        blocks: usize,
    },
    /// A ramp-up / constant-middle / ramp-down pulse. The envelope's first
    /// half is the ramp-up shape; its second half is the ramp-down shape.
    FlatTop {
        /// I-channel sample data (ramp-up followed by ramp-down).
        i_samples: Vec<i32>,
        /// Q-channel sample data (ramp-up followed by ramp-down).
        q_samples: Vec<i32>,
        /// Table address this envelope's samples start at.
        base_addr: usize,
        /// Duration of the constant middle section, in TP ticks.
        middle_length: usize,
    },
}

impl Envelope {
    /// The table address used when playing this envelope (in blocks of
    /// 16 samples for `Arb`/`FlatTop`, unused for `Const`).
    pub(crate) fn table_addr_blocks(&self) -> usize {
        match self {
            Envelope::Const { .. } => 0,
            Envelope::Arb { base_addr, .. } => base_addr / 16,
            Envelope::FlatTop { base_addr, .. } => base_addr / 16,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelTable {
    next_addr: usize,
    pulses: HashMap<String, Envelope>,
    last_pulse: Option<String>,
}

/// Per-channel envelope registry for DAC channels `1..=8`.
#[derive(Debug, Clone, Default)]
pub struct PulseLibrary {
    channels: HashMap<usize, ChannelTable>,
}

fn check_channel(ch: usize) -> Result<()> {
    if (1..=8).contains(&ch) {
        Ok(())
    } else {
        Err(TProcError::ChannelOutOfRange { channel: ch })
    }
}

fn check_length(len: usize) -> Result<()> {
    if len > 0 && len % 16 == 0 {
        Ok(())
    } else {
        Err(TProcError::EnvelopeLengthInvalid { length: len })
    }
}

impl PulseLibrary {
    /// Creates an empty registry.
    pub fn new() -> Self {
        PulseLibrary::default()
    }

    /// Registers a constant (table-free) pulse of `length` TP ticks under
    /// `name` on channel `ch`.
    pub fn register_const(&mut self, ch: usize, name: &str, length: usize) -> Result<()> {
        check_channel(ch)?;
        let table = self.channels.entry(ch).or_default();
        table.pulses.insert(name.to_string(), Envelope::Const { length });
        Ok(())
    }

    /// Registers an arbitrary-shaped pulse under `name` on channel `ch`.
    /// If only one of `i_samples`/`q_samples` is given, the other is
    /// zero-filled to match. The (equal) length must be a positive
    /// multiple of 16.
    pub fn register_arb(
        &mut self,
        ch: usize,
        name: &str,
        i_samples: Option<Vec<i32>>,
        q_samples: Option<Vec<i32>>,
    ) -> Result<()> {
        check_channel(ch)?;
        let (i_samples, q_samples) = fill_missing(i_samples, q_samples)?;
        check_length(i_samples.len())?;

        let table = self.channels.entry(ch).or_default();
        let base_addr = table.next_addr;
        let blocks = i_samples.len() / 16;
        table.next_addr += i_samples.len();
        table.pulses.insert(
            name.to_string(),
            Envelope::Arb {
                i_samples,
                q_samples,
                base_addr,
                blocks,
            },
        );
        Ok(())
    }

    /// Registers a flat-top pulse under `name` on channel `ch`. The ramp
    /// data's combined length must be a positive multiple of 16;
    /// `middle_length` is the duration (in TP ticks) of the constant
    /// middle section played between the ramps.
    pub fn register_flat_top(
        &mut self,
        ch: usize,
        name: &str,
        i_samples: Option<Vec<i32>>,
        q_samples: Option<Vec<i32>>,
        middle_length: usize,
    ) -> Result<()> {
        check_channel(ch)?;
        let (i_samples, q_samples) = fill_missing(i_samples, q_samples)?;
        check_length(i_samples.len())?;

        let table = self.channels.entry(ch).or_default();
        let base_addr = table.next_addr;
        table.next_addr += i_samples.len();
        table.pulses.insert(
            name.to_string(),
            Envelope::FlatTop {
                i_samples,
                q_samples,
                base_addr,
                middle_length,
            },
        );
        Ok(())
    }

    /// Looks up a previously registered envelope by channel and name.
    pub fn get(&self, ch: usize, name: &str) -> Option<&Envelope> {
        self.channels.get(&ch)?.pulses.get(name)
    }

    /// Records `name` as the most recently played pulse on `ch`, so a
    /// later call with no name can resolve it (mirrors the sequencer's
    /// "replay last pulse" convention).
    pub(crate) fn set_last_played(&mut self, ch: usize, name: &str) {
        self.channels.entry(ch).or_default().last_pulse = Some(name.to_string());
    }

    /// The name of the most recently played pulse on `ch`, if any.
    pub(crate) fn last_played(&self, ch: usize) -> Option<&str> {
        self.channels.get(&ch)?.last_pulse.as_deref()
    }

    /// Uploads every `Arb`/`FlatTop` envelope's sample data to the device,
    /// in ascending channel order, via `load_envelope(ch, i16, q16, addr)`.
    /// `Const` envelopes own no table data and are skipped.
    pub fn upload_envelopes<F>(&self, mut load_envelope: F) -> Result<()>
    where
        F: FnMut(usize, &[i16], &[i16], usize) -> Result<()>,
    {
        let mut channels: Vec<&usize> = self.channels.keys().collect();
        channels.sort();
        for &ch in channels {
            let table = &self.channels[&ch];
            let mut names: Vec<&String> = table.pulses.keys().collect();
            names.sort();
            for name in names {
                match &table.pulses[name] {
                    Envelope::Const { .. } => {}
                    Envelope::Arb {
                        i_samples,
                        q_samples,
                        base_addr,
                        ..
                    }
                    | Envelope::FlatTop {
                        i_samples,
                        q_samples,
                        base_addr,
                        ..
                    } => {
                        let i16_samples: Vec<i16> = i_samples.iter().map(|&v| v as i16).collect();
                        let q16_samples: Vec<i16> = q_samples.iter().map(|&v| v as i16).collect();
                        load_envelope(ch, &i16_samples, &q16_samples, *base_addr)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn fill_missing(
    i_samples: Option<Vec<i32>>,
    q_samples: Option<Vec<i32>>,
) -> Result<(Vec<i32>, Vec<i32>)> {
    match (i_samples, q_samples) {
        (Some(i), Some(q)) => Ok((i, q)),
        (Some(i), None) => {
            let len = i.len();
            Ok((i, vec![0; len]))
        }
        (None, Some(q)) => {
            let len = q.len();
            Ok((vec![0; len], q))
        }
        (None, None) => Err(TProcError::EnvelopeLengthInvalid { length: 0 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_pulse_needs_no_table_space() {
        let mut lib = PulseLibrary::new();
        lib.register_const(1, "ring", 500).unwrap();
        assert_eq!(lib.channels[&1].next_addr, 0);
    }

    #[test]
    fn arb_pulse_advances_channel_table_cursor() {
        let mut lib = PulseLibrary::new();
        lib.register_arb(3, "gauss", Some(vec![0; 32]), Some(vec![0; 32])).unwrap();
        assert_eq!(lib.channels[&3].next_addr, 32);
        let env = lib.get(3, "gauss").unwrap();
        match env {
            Envelope::Arb { blocks, base_addr, .. } => {
                assert_eq!(*blocks, 2);
                assert_eq!(*base_addr, 0);
            }
            _ => panic!("expected Arb"),
        }
    }

    #[test]
    fn one_sided_samples_are_zero_filled() {
        let mut lib = PulseLibrary::new();
        lib.register_arb(1, "p", Some(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]), None)
            .unwrap();
        match lib.get(1, "p").unwrap() {
            Envelope::Arb { q_samples, .. } => assert!(q_samples.iter().all(|&v| v == 0)),
            _ => panic!("expected Arb"),
        }
    }

    #[test]
    fn misaligned_envelope_length_is_rejected() {
        let mut lib = PulseLibrary::new();
        let err = lib
            .register_arb(1, "bad", Some(vec![0; 17]), Some(vec![0; 17]))
            .unwrap_err();
        assert!(matches!(err, TProcError::EnvelopeLengthInvalid { length: 17 }));
    }

    #[test]
    fn channel_out_of_range_is_rejected() {
        let mut lib = PulseLibrary::new();
        let err = lib.register_const(9, "x", 10).unwrap_err();
        assert!(matches!(err, TProcError::ChannelOutOfRange { channel: 9 }));
    }

    #[test]
    fn upload_visits_arb_and_flat_top_but_skips_const() {
        let mut lib = PulseLibrary::new();
        lib.register_const(1, "c", 10).unwrap();
        lib.register_arb(1, "a", Some(vec![0; 16]), Some(vec![0; 16])).unwrap();
        lib.register_flat_top(2, "f", Some(vec![0; 32]), Some(vec![0; 32]), 100)
            .unwrap();

        let mut uploaded = Vec::new();
        lib.upload_envelopes(|ch, i, q, addr| {
            uploaded.push((ch, i.len(), q.len(), addr));
            Ok(())
        })
        .unwrap();

        assert_eq!(uploaded.len(), 2);
        assert_eq!(uploaded[0].0, 1);
        assert_eq!(uploaded[1].0, 2);
    }
}
