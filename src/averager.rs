//! Host-side averager control loop (§4.F)
//!
//! Three program templates (single-axis, two-axis, and the decimated
//! variant share the single-axis template) wrap a subclass's
//! `initialize`/`body`/`update` hooks in the counting loop the TP runs,
//! then `acquire` drives the host side: compile, upload, start, drain,
//! reduce.

use std::time::Duration;

use crate::config::AveragerConfig;
use crate::device::{DeviceFacade, ReadoutMode};
use crate::error::Result;
use crate::sequencer::Sequencer;

/// Program hooks a concrete experiment implements. All default to
/// no-op, matching the original's pass-through base class methods.
/// Implementors build pulses via the [`Sequencer`] API; they must not
/// emit the wrapping reps/expts loops themselves — the averager does
/// that in `make_program`.
pub trait AveragerHooks {
    /// Runs once, before the counting loop, to set up registers/pulses
    /// that don't change between repetitions.
    fn initialize(&mut self, seq: &mut Sequencer) -> Result<()> {
        let _ = seq;
        Ok(())
    }

    /// Runs once per repetition (and, for the two-axis template, once
    /// per repetition per experiment point), inside the counted loop.
    fn body(&mut self, seq: &mut Sequencer) -> Result<()> {
        let _ = seq;
        Ok(())
    }

    /// Runs once per experiment point, between the inner reps loop and
    /// the outer loop's `loopnz` (two-axis template only).
    fn update(&mut self, seq: &mut Sequencer) -> Result<()> {
        let _ = seq;
        Ok(())
    }
}

/// One entry in the drain-loop stats trace: when a chunk was read, the
/// counter value observed, and the ring range it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainEvent {
    /// Wall-clock time this chunk was drained, per the caller's `now`
    /// capability.
    pub wall_time: Duration,
    /// The progress-counter value observed at this drain.
    pub count: usize,
    /// Ring address this chunk was read from.
    pub addr: usize,
    /// Number of (I, Q) entries read in this chunk.
    pub length: usize,
}

/// Per-experiment-point reduction for one averaging offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionResult {
    /// The averaging offset this reduction covers (`0..readouts_per_expt`).
    pub offset: usize,
    /// Per-ADC-channel averaged I values, one per experiment point.
    pub i: Vec<Vec<f64>>,
    /// Per-ADC-channel averaged Q values, one per experiment point.
    pub q: Vec<Vec<f64>>,
    /// Per-ADC-channel averaged amplitude, one per experiment point.
    pub amp: Vec<Vec<f64>>,
}

/// The result of a two-axis `acquire`: either reduced per-offset
/// averages, or the raw per-channel accumulated buffers when the caller
/// requested no reduction (`average_offsets` empty).
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// Reduced per-experiment-point averages, one entry per requested
    /// offset.
    Reduced(Vec<ReductionResult>),
    /// Raw per-channel accumulated `(I, Q)` buffers, unreduced.
    Raw {
        /// Per-ADC-channel raw I buffer.
        di: Vec<Vec<i32>>,
        /// Per-ADC-channel raw Q buffer.
        dq: Vec<Vec<i32>>,
    },
}

const fn even_floor(length: usize) -> usize {
    length - (length % 2)
}

fn configure_capture<D: DeviceFacade>(
    device: &mut D,
    seq: &Sequencer,
    cfg: &AveragerConfig,
) -> Result<()> {
    seq.pulses()
        .upload_envelopes(|ch, i, q, addr| device.load_envelope(ch, i, q, addr))?;
    for (ch, readout) in cfg.readouts.iter().enumerate() {
        device.configure_readout(ch, ReadoutMode::Product, readout.adc_freq)?;
        device.configure_accumulated_buffer(ch, 0, readout.adc_length)?;
        device.configure_decimated_buffer(ch, 0, readout.adc_length)?;
    }
    Ok(())
}

/// Drains the accumulated-sample ring until `total` entries have been
/// read for every ADC channel, appending one [`DrainEvent`] per chunk.
fn drain_accumulated<D: DeviceFacade, F: FnMut() -> Duration>(
    device: &mut D,
    num_channels: usize,
    total: usize,
    mut now: F,
) -> Result<(Vec<Vec<i32>>, Vec<Vec<i32>>, Vec<DrainEvent>)> {
    let avg_max = device.avg_max();
    let mut di_buf = vec![vec![0i32; total]; num_channels];
    let mut dq_buf = vec![vec![0i32; total]; num_channels];
    let mut stats = Vec::new();

    let mut last_count = 0usize;
    while last_count < total {
        let count = device.peek(1)? as usize;
        let threshold = (last_count + 1000).min(total.saturating_sub(1));
        if count >= threshold {
            let addr = last_count % avg_max;
            let length = even_floor(count - last_count);
            if length == 0 {
                if count >= total {
                    break;
                }
                continue;
            }
            for ch in 0..num_channels {
                let (i, q) = device.read_accumulated(ch, addr, length)?;
                di_buf[ch][last_count..last_count + length].copy_from_slice(&i[..length]);
                dq_buf[ch][last_count..last_count + length].copy_from_slice(&q[..length]);
            }
            last_count += length;
            stats.push(DrainEvent { wall_time: now(), count, addr, length });
        }
    }
    Ok((di_buf, dq_buf, stats))
}

/// Averaged I/Q/amplitude for one ADC channel, reduced over `reps`
/// repetitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelAverage {
    /// Averaged in-phase component.
    pub i: f64,
    /// Averaged quadrature component.
    pub q: f64,
    /// `sqrt(i^2 + q^2)`.
    pub amp: f64,
}

/// Reps-only averager: `initialize; loop reps { body; count += 1; store
/// count at addr=1 }`.
pub struct SingleAxisAverager;

impl SingleAxisAverager {
    const RCOUNT: i64 = 15;
    const RJJ: i64 = 14;

    /// Builds the single-axis program template, invoking `hooks` at the
    /// appropriate points.
    pub fn build_program(hooks: &mut impl AveragerHooks, cfg: &AveragerConfig) -> Result<Sequencer> {
        let mut seq = Sequencer::new();
        hooks.initialize(&mut seq)?;

        let p = seq.program_mut();
        p.regwi(0, Self::RCOUNT, 0, None)?;
        p.regwi(0, Self::RJJ, cfg.reps as i64 - 1, None)?;
        p.label("LOOP_J");

        hooks.body(&mut seq)?;

        let p = seq.program_mut();
        p.mathi(0, Self::RCOUNT, Self::RCOUNT, "+", 1)?;
        p.memwi(0, Self::RCOUNT, 1)?;
        p.loopnz(0, Self::RJJ, "LOOP_J")?;
        p.end()?;
        Ok(seq)
    }

    /// Compiles and runs the program, draining the accumulated ring for
    /// `reps` repetitions, then reduces each channel's buffer to a
    /// single averaged `(I, Q, amp)` point.
    pub fn acquire<D: DeviceFacade, F: FnMut() -> Duration>(
        seq: &Sequencer,
        device: &mut D,
        cfg: &AveragerConfig,
        now: F,
    ) -> Result<(Vec<ChannelAverage>, Vec<DrainEvent>)> {
        configure_capture(device, seq, cfg)?;
        let words = seq.program().compile()?;
        device.load_program(&words)?;

        device.stop()?;
        device.poke(1, 0)?;
        device.start()?;

        let total = cfg.reps;
        let (di_buf, dq_buf, stats) = drain_accumulated(device, cfg.readouts.len(), total, now)?;

        let averages = (0..cfg.readouts.len())
            .map(|ch| {
                let sum_i: i64 = di_buf[ch].iter().map(|&v| v as i64).sum();
                let sum_q: i64 = dq_buf[ch].iter().map(|&v| v as i64).sum();
                let length = cfg.readouts[ch].adc_length as f64;
                let i = sum_i as f64 / cfg.reps as f64 / length;
                let q = sum_q as f64 / cfg.reps as f64 / length;
                ChannelAverage { i, q, amp: (i * i + q * q).sqrt() }
            })
            .collect();

        Ok((averages, stats))
    }

    /// The decimated (time-resolved) variant: loops `soft_avgs`
    /// iterations in software, each restarting the TP and reading the
    /// full decimated buffer once per ADC channel, summing the results.
    /// Expects `cfg.reps == 1`.
    pub fn acquire_decimated<D: DeviceFacade>(
        seq: &Sequencer,
        device: &mut D,
        cfg: &AveragerConfig,
    ) -> Result<Vec<(Vec<f64>, Vec<f64>)>> {
        configure_capture(device, seq, cfg)?;
        let words = seq.program().compile()?;

        let mut sums: Vec<(Vec<f64>, Vec<f64>)> = cfg
            .readouts
            .iter()
            .map(|r| (vec![0.0; r.adc_length], vec![0.0; r.adc_length]))
            .collect();

        for _ in 0..cfg.soft_avgs {
            device.stop()?;
            for (ch, readout) in cfg.readouts.iter().enumerate() {
                device.configure_accumulated_buffer(ch, 0, readout.adc_length)?;
                device.configure_decimated_buffer(ch, 0, readout.adc_length)?;
            }
            device.poke(1, 0)?;
            device.load_program(&words)?;
            device.start()?;

            loop {
                let count = device.peek(1)?;
                if count >= 1 {
                    break;
                }
            }

            for (ch, readout) in cfg.readouts.iter().enumerate() {
                let (i, q) = device.read_decimated(ch, 0, readout.adc_length)?;
                for k in 0..readout.adc_length {
                    sums[ch].0[k] += i[k] as f64;
                    sums[ch].1[k] += q[k] as f64;
                }
            }
        }

        for (i_sum, q_sum) in &mut sums {
            for v in i_sum.iter_mut() {
                *v /= cfg.soft_avgs as f64;
            }
            for v in q_sum.iter_mut() {
                *v /= cfg.soft_avgs as f64;
            }
        }
        Ok(sums)
    }
}

/// Reps x experiments averager: adds an outer loop of `expts`
/// iterations, with `update` running between the inner loop's end and
/// the outer loop's `loopnz`.
pub struct TwoAxisAverager;

impl TwoAxisAverager {
    const RCOUNT: i64 = 13;
    const RII: i64 = 14;
    const RJJ: i64 = 15;

    /// Builds the two-axis program template, invoking `hooks` at the
    /// appropriate points.
    pub fn build_program(hooks: &mut impl AveragerHooks, cfg: &AveragerConfig) -> Result<Sequencer> {
        let mut seq = Sequencer::new();
        hooks.initialize(&mut seq)?;

        let p = seq.program_mut();
        p.regwi(0, Self::RCOUNT, 0, None)?;
        p.regwi(0, Self::RII, cfg.expts as i64 - 1, None)?;
        p.label("LOOP_I");
        p.regwi(0, Self::RJJ, cfg.reps as i64 - 1, None)?;
        p.label("LOOP_J");

        hooks.body(&mut seq)?;

        let p = seq.program_mut();
        p.mathi(0, Self::RCOUNT, Self::RCOUNT, "+", 1)?;
        p.memwi(0, Self::RCOUNT, 1)?;
        p.loopnz(0, Self::RJJ, "LOOP_J")?;

        hooks.update(&mut seq)?;

        let p = seq.program_mut();
        p.loopnz(0, Self::RII, "LOOP_I")?;
        p.end()?;
        Ok(seq)
    }

    /// Experiment-point coordinates, `start + i * step` for `i` in
    /// `0..expts`.
    pub fn expt_pts(cfg: &AveragerConfig) -> Vec<f64> {
        (0..cfg.expts).map(|i| cfg.start + (i as f64) * cfg.step).collect()
    }

    /// Compiles and runs the program, draining `reps * expts *
    /// readouts_per_expt` accumulated entries, then reduces per
    /// `average_offsets` (empty means "return raw buffers,
    /// unreduced").
    ///
    /// Per-readout counter convention: the device counter increments
    /// once per experiment iteration of the inner loop, so the observed
    /// counter is multiplied by `readouts_per_expt` to get the true
    /// accumulated-entry count (see DESIGN.md's Open Question decision).
    pub fn acquire<D: DeviceFacade, F: FnMut() -> Duration>(
        seq: &Sequencer,
        device: &mut D,
        cfg: &AveragerConfig,
        readouts_per_expt: usize,
        average_offsets: &[usize],
        now: F,
    ) -> Result<(AcquireOutcome, Vec<DrainEvent>)> {
        configure_capture(device, seq, cfg)?;
        let words = seq.program().compile()?;
        device.load_program(&words)?;

        device.stop()?;
        device.poke(1, 0)?;
        device.start()?;

        let total = cfg.total_count(readouts_per_expt);
        let (di_buf, dq_buf, stats) =
            drain_counted_by_readout(device, cfg.readouts.len(), total, readouts_per_expt, now)?;

        if average_offsets.is_empty() {
            return Ok((AcquireOutcome::Raw { di: di_buf, dq: dq_buf }, stats));
        }

        let mut results = Vec::with_capacity(average_offsets.len());
        for &offset in average_offsets {
            let mut i_out = Vec::with_capacity(cfg.readouts.len());
            let mut q_out = Vec::with_capacity(cfg.readouts.len());
            let mut amp_out = Vec::with_capacity(cfg.readouts.len());
            for ch in 0..cfg.readouts.len() {
                let length = cfg.readouts[ch].adc_length as f64;
                let mut i_pts = vec![0.0f64; cfg.expts];
                let mut q_pts = vec![0.0f64; cfg.expts];
                for expt in 0..cfg.expts {
                    let mut sum_i = 0i64;
                    let mut sum_q = 0i64;
                    for rep in 0..cfg.reps {
                        let idx = (expt * cfg.reps + rep) * readouts_per_expt + offset;
                        sum_i += di_buf[ch][idx] as i64;
                        sum_q += dq_buf[ch][idx] as i64;
                    }
                    i_pts[expt] = sum_i as f64 / cfg.reps as f64 / length;
                    q_pts[expt] = sum_q as f64 / cfg.reps as f64 / length;
                }
                let amp_pts: Vec<f64> = i_pts
                    .iter()
                    .zip(&q_pts)
                    .map(|(&i, &q)| (i * i + q * q).sqrt())
                    .collect();
                i_out.push(i_pts);
                q_out.push(q_pts);
                amp_out.push(amp_pts);
            }
            results.push(ReductionResult { offset, i: i_out, q: q_out, amp: amp_out });
        }

        Ok((AcquireOutcome::Reduced(results), stats))
    }
}

fn drain_counted_by_readout<D: DeviceFacade, F: FnMut() -> Duration>(
    device: &mut D,
    num_channels: usize,
    total: usize,
    readouts_per_expt: usize,
    mut now: F,
) -> Result<(Vec<Vec<i32>>, Vec<Vec<i32>>, Vec<DrainEvent>)> {
    let avg_max = device.avg_max();
    let mut di_buf = vec![vec![0i32; total]; num_channels];
    let mut dq_buf = vec![vec![0i32; total]; num_channels];
    let mut stats = Vec::new();

    let mut last_count = 0usize;
    while last_count < total {
        let count = (device.peek(1)? as usize) * readouts_per_expt;
        let threshold = (last_count + 1000).min(total.saturating_sub(1));
        if count >= threshold {
            let addr = last_count % avg_max;
            let length = even_floor(count - last_count);
            if length == 0 {
                if count >= total {
                    break;
                }
                continue;
            }
            for ch in 0..num_channels {
                let (i, q) = device.read_accumulated(ch, addr, length)?;
                di_buf[ch][last_count..last_count + length].copy_from_slice(&i[..length]);
                dq_buf[ch][last_count..last_count + length].copy_from_slice(&q[..length]);
            }
            last_count += length;
            stats.push(DrainEvent { wall_time: now(), count, addr, length });
        }
    }
    Ok((di_buf, dq_buf, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadoutConfig;
    use crate::device::MockDevice;

    struct NoopHooks;
    impl AveragerHooks for NoopHooks {}

    fn cfg(reps: usize, expts: usize) -> AveragerConfig {
        AveragerConfig {
            reps,
            expts,
            start: 0.0,
            step: 1.0,
            soft_avgs: 1,
            readouts: vec![
                ReadoutConfig { adc_freq: 100.0, adc_length: 4 },
                ReadoutConfig { adc_freq: 150.0, adc_length: 4 },
            ],
        }
    }

    #[test]
    fn single_axis_program_has_expected_instruction_count() {
        let mut hooks = NoopHooks;
        let c = cfg(10, 1);
        let seq = SingleAxisAverager::build_program(&mut hooks, &c).unwrap();
        // regwi, regwi, mathi, memwi, loopnz, end = 6
        assert_eq!(seq.program().len(), 6);
    }

    #[test]
    fn two_axis_program_has_expected_instruction_count() {
        let mut hooks = NoopHooks;
        let c = cfg(10, 5);
        let seq = TwoAxisAverager::build_program(&mut hooks, &c).unwrap();
        // regwi, regwi, regwi, mathi, memwi, loopnz, loopnz, end = 8
        assert_eq!(seq.program().len(), 8);
    }

    #[test]
    fn single_axis_acquire_drains_and_averages() {
        let mut hooks = NoopHooks;
        let c = cfg(4, 1);
        let seq = SingleAxisAverager::build_program(&mut hooks, &c).unwrap();

        let mut device = MockDevice::new(16384);
        device.seed_accumulated(0, vec![1, 2, 3, 4], vec![0, 0, 0, 0]);
        device.seed_accumulated(1, vec![5, 5, 5, 5], vec![1, 1, 1, 1]);
        device.set_counter_on_start(4);

        let mut t = Duration::from_secs(0);
        let (averages, stats) = SingleAxisAverager::acquire(&seq, &mut device, &c, || {
            t += Duration::from_millis(1);
            t
        })
        .unwrap();

        assert_eq!(averages.len(), 2);
        assert!((averages[0].i - (10.0 / 4.0 / 4.0)).abs() < 1e-9);
        assert!(!stats.is_empty());
    }

    #[test]
    fn two_axis_acquire_reduces_per_offset() {
        let mut hooks = NoopHooks;
        let c = cfg(2, 3);
        let seq = TwoAxisAverager::build_program(&mut hooks, &c).unwrap();

        let total = c.total_count(1);
        let mut device = MockDevice::new(16384);
        let i_data: Vec<i32> = (0..total as i32).collect();
        let q_data: Vec<i32> = vec![0; total];
        device.seed_accumulated(0, i_data.clone(), q_data.clone());
        device.seed_accumulated(1, i_data, q_data);
        device.set_counter_on_start(total as u32);

        let mut t = Duration::from_secs(0);
        let (outcome, _stats) =
            TwoAxisAverager::acquire(&seq, &mut device, &c, 1, &[0], || {
                t += Duration::from_millis(1);
                t
            })
            .unwrap();

        match outcome {
            AcquireOutcome::Reduced(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].i[0].len(), c.expts);
            }
            AcquireOutcome::Raw { .. } => panic!("expected reduced output"),
        }
    }

    #[test]
    fn two_axis_acquire_returns_raw_when_no_offsets_requested() {
        let mut hooks = NoopHooks;
        let c = cfg(2, 2);
        let seq = TwoAxisAverager::build_program(&mut hooks, &c).unwrap();

        let total = c.total_count(1);
        let mut device = MockDevice::new(16384);
        device.seed_accumulated(0, vec![0; total], vec![0; total]);
        device.seed_accumulated(1, vec![0; total], vec![0; total]);
        device.set_counter_on_start(total as u32);

        let (outcome, _) = TwoAxisAverager::acquire(&seq, &mut device, &c, 1, &[], || Duration::from_secs(0))
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Raw { .. }));
    }

    #[test]
    fn expt_pts_follows_start_and_step() {
        let c = cfg(1, 4);
        let pts = TwoAxisAverager::expt_pts(&c);
        assert_eq!(pts, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn decimated_acquire_averages_over_soft_avgs() {
        let mut hooks = NoopHooks;
        let mut c = cfg(1, 1);
        c.soft_avgs = 2;
        let seq = SingleAxisAverager::build_program(&mut hooks, &c).unwrap();

        let mut device = MockDevice::new(16384);
        device.seed_decimated(0, vec![2, 4, 6, 8], vec![0; 4]);
        device.seed_decimated(1, vec![2, 4, 6, 8], vec![0; 4]);
        device.set_counter_on_start(1);

        let sums = SingleAxisAverager::acquire_decimated(&seq, &mut device, &c).unwrap();
        assert_eq!(sums[0].0, vec![2.0, 4.0, 6.0, 8.0]);
    }
}
