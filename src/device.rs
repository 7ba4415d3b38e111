//! Device façade (§4.G)
//!
//! The seam between this crate's program/sequencing/averaging logic and
//! an actual FPGA board. Everything below this trait (bitstream loading,
//! PLL/clock init, SPI peripheral drivers, DMA transfers, wire-level
//! register maps) is out of scope (§9 Non-goals) — a concrete
//! implementation of `DeviceFacade` owns all of that.

use crate::error::Result;

/// Readout mixer mode for one ADC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutMode {
    /// Mixer output is the product of the input and the local oscillator.
    Product,
    /// Mixer is bypassed; raw ADC samples pass through.
    Bypass,
}

/// Minimum capability the averager and sequencer runtime requires of a
/// concrete device, polymorphic over any actual hardware backend.
pub trait DeviceFacade {
    /// Ring size of the accumulated-sample buffer, in entries per channel.
    fn avg_max(&self) -> usize;

    /// Uploads a compiled program (a flat sequence of 64-bit words) to
    /// the timed processor's instruction memory.
    fn load_program(&mut self, words: &[u64]) -> Result<()>;

    /// Starts timed-processor execution.
    fn start(&mut self) -> Result<()>;

    /// Halts timed-processor execution immediately.
    fn stop(&mut self) -> Result<()>;

    /// Reads a 32-bit register slot (e.g. the progress counter at `addr
    /// = 1`).
    fn peek(&mut self, addr: usize) -> Result<u32>;

    /// Writes a 32-bit register slot.
    fn poke(&mut self, addr: usize, value: u32) -> Result<()>;

    /// Uploads one channel's envelope sample data to device table memory
    /// starting at `base_addr`.
    fn load_envelope(&mut self, ch: usize, i: &[i16], q: &[i16], base_addr: usize) -> Result<()>;

    /// Configures one ADC channel's readout mixer.
    fn configure_readout(&mut self, ch: usize, mode: ReadoutMode, freq_mhz: f64) -> Result<()>;

    /// Configures and enables the accumulated-sample buffer for one ADC
    /// channel.
    fn configure_accumulated_buffer(&mut self, ch: usize, addr: usize, length: usize) -> Result<()>;

    /// Configures and enables the decimated-sample buffer for one ADC
    /// channel.
    fn configure_decimated_buffer(&mut self, ch: usize, addr: usize, length: usize) -> Result<()>;

    /// Reads `length` accumulated `(I, Q)` sample pairs for one ADC
    /// channel, starting at `addr` (modulo `avg_max`).
    fn read_accumulated(&mut self, ch: usize, addr: usize, length: usize) -> Result<(Vec<i32>, Vec<i32>)>;

    /// Reads `length` decimated `(I, Q)` sample pairs for one ADC
    /// channel, starting at `addr`.
    fn read_decimated(&mut self, ch: usize, addr: usize, length: usize) -> Result<(Vec<i32>, Vec<i32>)>;
}

#[cfg(feature = "testing")]
pub use mock::MockDevice;

#[cfg(feature = "testing")]
mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::{DeviceFacade, ReadoutMode};
    use crate::error::Result;

    struct Shared {
        running: bool,
        registers: HashMap<usize, u32>,
        /// Accumulated ring, per ADC channel: a full (I, Q) trace the
        /// test pre-seeds, as if the TP had already produced it.
        accumulated: HashMap<usize, (Vec<i32>, Vec<i32>)>,
        decimated: HashMap<usize, (Vec<i32>, Vec<i32>)>,
        envelopes: Vec<(usize, Vec<i16>, Vec<i16>, usize)>,
        programs_loaded: Vec<Vec<u64>>,
        counter_on_start: Option<u32>,
    }

    /// An in-memory [`DeviceFacade`] double, for tests and doctests.
    ///
    /// A counter-bearing device is the only realistic way to exercise
    /// the averager's drain loop deterministically: `advance_counter`
    /// lets a test script the TP's progress without any real timing.
    pub struct MockDevice {
        avg_max: usize,
        shared: Mutex<Shared>,
    }

    impl MockDevice {
        /// Creates a mock device with the given accumulated-ring size.
        pub fn new(avg_max: usize) -> Self {
            MockDevice {
                avg_max,
                shared: Mutex::new(Shared {
                    running: false,
                    registers: HashMap::new(),
                    accumulated: HashMap::new(),
                    decimated: HashMap::new(),
                    envelopes: Vec::new(),
                    programs_loaded: Vec::new(),
                    counter_on_start: None,
                }),
            }
        }

        /// Pre-seeds one ADC channel's full accumulated (I, Q) trace, as
        /// if the TP had already generated `entries.len()` samples.
        pub fn seed_accumulated(&self, ch: usize, i: Vec<i32>, q: Vec<i32>) {
            self.shared.lock().accumulated.insert(ch, (i, q));
        }

        /// Pre-seeds one ADC channel's decimated (I, Q) trace.
        pub fn seed_decimated(&self, ch: usize, i: Vec<i32>, q: Vec<i32>) {
            self.shared.lock().decimated.insert(ch, (i, q));
        }

        /// Directly sets the progress-counter register (`addr = 1`), as
        /// the TP would as it runs.
        pub fn advance_counter(&self, count: u32) {
            self.shared.lock().registers.insert(1, count);
        }

        /// Schedules the progress counter to jump to `value` as soon as
        /// `start()` is called, standing in for a TP that runs to
        /// completion instantly. A real device naturally has no such
        /// hook; this exists purely so the drain loop can be exercised
        /// deterministically without a background thread.
        pub fn set_counter_on_start(&self, value: u32) {
            self.shared.lock().counter_on_start = Some(value);
        }

        /// Number of programs uploaded so far (for assertions).
        pub fn programs_loaded(&self) -> usize {
            self.shared.lock().programs_loaded.len()
        }

        /// Envelopes uploaded so far, in upload order.
        pub fn envelopes_loaded(&self) -> usize {
            self.shared.lock().envelopes.len()
        }

        /// Whether `start()` has been called more recently than `stop()`.
        pub fn is_running(&self) -> bool {
            self.shared.lock().running
        }
    }

    impl DeviceFacade for MockDevice {
        fn avg_max(&self) -> usize {
            self.avg_max
        }

        fn load_program(&mut self, words: &[u64]) -> Result<()> {
            self.shared.lock().programs_loaded.push(words.to_vec());
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            let mut shared = self.shared.lock();
            shared.running = true;
            if let Some(value) = shared.counter_on_start {
                shared.registers.insert(1, value);
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.shared.lock().running = false;
            Ok(())
        }

        fn peek(&mut self, addr: usize) -> Result<u32> {
            Ok(*self.shared.lock().registers.get(&addr).unwrap_or(&0))
        }

        fn poke(&mut self, addr: usize, value: u32) -> Result<()> {
            self.shared.lock().registers.insert(addr, value);
            Ok(())
        }

        fn load_envelope(&mut self, ch: usize, i: &[i16], q: &[i16], base_addr: usize) -> Result<()> {
            self.shared
                .lock()
                .envelopes
                .push((ch, i.to_vec(), q.to_vec(), base_addr));
            Ok(())
        }

        fn configure_readout(&mut self, _ch: usize, _mode: ReadoutMode, _freq_mhz: f64) -> Result<()> {
            Ok(())
        }

        fn configure_accumulated_buffer(&mut self, _ch: usize, _addr: usize, _length: usize) -> Result<()> {
            Ok(())
        }

        fn configure_decimated_buffer(&mut self, _ch: usize, _addr: usize, _length: usize) -> Result<()> {
            Ok(())
        }

        fn read_accumulated(&mut self, ch: usize, addr: usize, length: usize) -> Result<(Vec<i32>, Vec<i32>)> {
            let shared = self.shared.lock();
            let (i, q) = shared.accumulated.get(&ch).cloned().unwrap_or_default();
            Ok(slice_modulo(&i, &q, addr, length, self.avg_max))
        }

        fn read_decimated(&mut self, ch: usize, addr: usize, length: usize) -> Result<(Vec<i32>, Vec<i32>)> {
            let shared = self.shared.lock();
            let (i, q) = shared.decimated.get(&ch).cloned().unwrap_or_default();
            Ok(slice_modulo(&i, &q, addr, length, self.avg_max))
        }
    }

    fn slice_modulo(
        i: &[i32],
        q: &[i32],
        addr: usize,
        length: usize,
        avg_max: usize,
    ) -> (Vec<i32>, Vec<i32>) {
        let mut out_i = Vec::with_capacity(length);
        let mut out_q = Vec::with_capacity(length);
        for k in 0..length {
            let idx = (addr + k) % avg_max.max(1);
            out_i.push(i.get(idx).copied().unwrap_or(0));
            out_q.push(q.get(idx).copied().unwrap_or(0));
        }
        (out_i, out_q)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn start_stop_tracks_running_state() {
            let mut dev = MockDevice::new(16384);
            assert!(!dev.is_running());
            dev.start().unwrap();
            assert!(dev.is_running());
            dev.stop().unwrap();
            assert!(!dev.is_running());
        }

        #[test]
        fn peek_poke_round_trip() {
            let mut dev = MockDevice::new(16384);
            dev.poke(1, 42).unwrap();
            assert_eq!(dev.peek(1).unwrap(), 42);
        }

        #[test]
        fn advance_counter_is_visible_through_peek() {
            let dev = MockDevice::new(16384);
            dev.advance_counter(7);
            let mut handle = dev;
            assert_eq!(handle.peek(1).unwrap(), 7);
        }

        #[test]
        fn read_accumulated_wraps_modulo_avg_max() {
            let mut dev = MockDevice::new(4);
            dev.seed_accumulated(0, vec![10, 20, 30, 40], vec![1, 2, 3, 4]);
            let (i, q) = dev.read_accumulated(0, 3, 3).unwrap();
            assert_eq!(i, vec![40, 10, 20]);
            assert_eq!(q, vec![4, 1, 2]);
        }
    }
}
