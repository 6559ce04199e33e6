use std::collections::BTreeMap;

use super::dut::PixelConfig;
use super::events::{Event, RawEvent};
use super::loops::TestFlags;
use super::registry::Probe;

/// Parameter block of one hardware measurement primitive.
///
/// Each variant describes one family of instrument-side test routines; the
/// loop expansion engine picks the call shape (whole module, single chip,
/// single pixel) separately. The hardware returns one event per trigger, in
/// scan order: for a DAC scan all triggers of the first setting first, for a
/// two-dimensional scan the second register varies fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    /// Plain calibrate-pulse measurement at the current register settings.
    Calibrate { flags: TestFlags, triggers: u16 },
    /// Sweep one register over an inclusive range.
    DacScan {
        register: u8,
        min: u8,
        max: u8,
        step: u8,
        flags: TestFlags,
        triggers: u16,
    },
    /// Sweep two registers over nested inclusive ranges.
    DacDacScan {
        register1: u8,
        min1: u8,
        max1: u8,
        step1: u8,
        register2: u8,
        min2: u8,
        max2: u8,
        step2: u8,
        flags: TestFlags,
        triggers: u16,
    },
}

impl Measurement {
    pub fn triggers(&self) -> u16 {
        match self {
            Measurement::Calibrate { triggers, .. } => *triggers,
            Measurement::DacScan { triggers, .. } => *triggers,
            Measurement::DacDacScan { triggers, .. } => *triggers,
        }
    }

    /// Number of scan points this measurement visits per pixel.
    pub fn points(&self) -> usize {
        fn span(min: u8, max: u8, step: u8) -> usize {
            (max - min) as usize / step.max(1) as usize + 1
        }
        match self {
            Measurement::Calibrate { .. } => 1,
            Measurement::DacScan { min, max, step, .. } => span(*min, *max, *step),
            Measurement::DacDacScan {
                min1,
                max1,
                step1,
                min2,
                max2,
                step2,
                ..
            } => span(*min1, *max1, *step1) * span(*min2, *max2, *step2),
        }
    }
}

/// The set of primitive operations the engine may invoke on the physical
/// instrument.
///
/// The engine depends only on this contract; the implementation lives in the
/// hardware-adjacent layer and owns the electrical protocol. All calls block
/// until the instrument has responded.
pub trait Hal {
    /// Firmware/library compatibility check, done once before configuration.
    fn compatible(&self) -> bool;
    /// Whether the testboard is connected and initialized.
    fn ready(&self) -> bool;

    // Testboard setup
    #[allow(clippy::too_many_arguments)]
    fn init_testboard(
        &mut self,
        sig_delays: &BTreeMap<u8, u8>,
        pg_program: &[(u16, u8)],
        pg_sum: u32,
        va: f64,
        vd: f64,
        ia: f64,
        id: f64,
    );
    fn set_testboard_delays(&mut self, sig_delays: &BTreeMap<u8, u8>);
    fn setup_pattern_generator(&mut self, pg_program: &[(u16, u8)], pg_sum: u32);
    fn set_testboard_power(&mut self, va: f64, vd: f64, ia: f64, id: f64);
    fn flash(&mut self, firmware: &[u8]) -> bool;
    fn set_clock_stretch(&mut self, source: u8, width: u16, delay: u16);

    // Power, probes and telemetry
    fn power_on(&mut self);
    fn power_off(&mut self);
    fn hv_on(&mut self);
    fn hv_off(&mut self);
    fn tb_ia(&mut self) -> f64;
    fn tb_va(&mut self) -> f64;
    fn tb_id(&mut self) -> f64;
    fn tb_vd(&mut self) -> f64;
    fn route_probe(&mut self, probe: Probe, signal: u8);

    // Device programming
    fn set_hub_id(&mut self, hub: u8);
    fn init_tbm_core(&mut self, device_code: u8, regs: &BTreeMap<u8, u8>);
    fn init_roc(&mut self, i2c: u8, device_code: u8, dacs: &BTreeMap<u8, u8>);
    fn roc_set_dac(&mut self, i2c: u8, register: u8, value: u8);
    fn tbm_set_reg(&mut self, register: u8, value: u8);
    /// Announce the configured chip addresses to the instrument firmware.
    fn setup_i2c_values(&mut self, addresses: &[u8]);
    /// Upload the per-pixel trim/mask state for one chip to the instrument
    /// firmware, without applying it yet.
    fn setup_trim_values(&mut self, i2c: u8, pixels: &[PixelConfig]);
    /// Mask every pixel of one chip.
    fn roc_mask_all(&mut self, i2c: u8);
    /// Unmask one chip and apply the configured trim values, honoring
    /// per-pixel mask bits.
    fn roc_trim_unmask(&mut self, i2c: u8, pixels: &[PixelConfig]);
    fn pixel_set_calibrate(&mut self, i2c: u8, column: u8, row: u8);
    fn roc_clear_calibrate(&mut self, i2c: u8);
    fn all_columns_enable(&mut self, i2c: u8, enable: bool);

    // Measurement primitives; each returns one event per trigger and scan
    // point, in scan order.
    fn single_roc_all_pixels(&mut self, i2c: u8, measurement: &Measurement) -> Vec<Event>;
    fn single_roc_one_pixel(
        &mut self,
        i2c: u8,
        column: u8,
        row: u8,
        measurement: &Measurement,
    ) -> Vec<Event>;
    fn multi_roc_all_pixels(&mut self, i2cs: &[u8], measurement: &Measurement) -> Vec<Event>;
    fn multi_roc_one_pixel(
        &mut self,
        i2cs: &[u8],
        column: u8,
        row: u8,
        measurement: &Measurement,
    ) -> Vec<Event>;

    // Acquisition
    fn daq_clear(&mut self);
    fn daq_start(&mut self, deser_phase: u8, tbm_cores: usize, buffer_size: u32);
    fn daq_stop(&mut self);
    fn daq_trigger(&mut self, count: u32, period: u16);
    fn daq_trigger_loop(&mut self, period: u16);
    fn daq_trigger_loop_halt(&mut self);
    /// Current fill state of the acquisition buffer, in bytes.
    fn daq_buffer_fill(&mut self) -> u32;
    fn daq_buffer(&mut self) -> Vec<u16>;
    fn daq_all_raw_events(&mut self) -> Vec<RawEvent>;
    fn daq_all_events(&mut self) -> Vec<Event>;
    fn daq_next_raw_event(&mut self) -> Option<RawEvent>;
    fn daq_next_event(&mut self) -> Option<Event>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted testboard stand-in recording every call it receives.

    use super::*;
    use crate::events::Pixel;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        InitTestboard,
        SetTestboardDelays,
        SetupPatternGenerator(u32),
        SetTestboardPower(f64, f64, f64, f64),
        Flash,
        SetClockStretch(u8, u16, u16),
        PowerOn,
        PowerOff,
        HvOn,
        HvOff,
        RouteProbe(Probe, u8),
        SetHubId(u8),
        InitTbmCore(u8),
        InitRoc(u8, u8),
        RocSetDac(u8, u8, u8),
        TbmSetReg(u8, u8),
        SetupI2cValues(Vec<u8>),
        SetupTrimValues(u8),
        RocMaskAll(u8),
        RocTrimUnmask(u8),
        PixelSetCalibrate(u8, u8, u8),
        RocClearCalibrate(u8),
        AllColumnsEnable(u8, bool),
        SingleRocAllPixels(u8),
        SingleRocOnePixel(u8, u8, u8),
        MultiRocAllPixels(Vec<u8>),
        MultiRocOnePixel(Vec<u8>, u8, u8),
        DaqClear,
        DaqStart { phase: u8, cores: usize, size: u32 },
        DaqStop,
        DaqTrigger(u32, u16),
        DaqTriggerLoop(u16),
        DaqTriggerLoopHalt,
    }

    pub struct MockHal {
        pub calls: Vec<Call>,
        pub ready: bool,
        pub compatible: bool,
        /// Value handed back by `daq_buffer_fill`.
        pub buffer_fill: u32,
        /// Events handed back by `daq_all_events`.
        pub daq_events: Vec<Event>,
        /// Pulse height stamped on every generated hit.
        pub pulse_height: f64,
        /// Decoder error count stamped on every generated event.
        pub decoder_errors: u32,
    }

    impl Default for MockHal {
        fn default() -> Self {
            MockHal {
                calls: Vec::new(),
                ready: true,
                compatible: true,
                buffer_fill: 0,
                daq_events: Vec::new(),
                pulse_height: 10.0,
                decoder_errors: 0,
            }
        }
    }

    impl MockHal {
        /// Events for one primitive call: one event per trigger and scan
        /// point, each carrying the given hits.
        fn generate(&self, measurement: &Measurement, hits: Vec<Pixel>) -> Vec<Event> {
            let count = measurement.points() * measurement.triggers() as usize;
            (0..count)
                .map(|_| Event {
                    pixels: hits.clone(),
                    decoder_errors: self.decoder_errors,
                    ..Event::default()
                })
                .collect()
        }

        fn hit(&self, roc: u8, column: u8, row: u8) -> Pixel {
            Pixel::new(roc, column, row, self.pulse_height)
        }
    }

    impl Hal for MockHal {
        fn compatible(&self) -> bool {
            self.compatible
        }

        fn ready(&self) -> bool {
            self.ready
        }

        fn init_testboard(
            &mut self,
            _sig_delays: &BTreeMap<u8, u8>,
            _pg_program: &[(u16, u8)],
            _pg_sum: u32,
            _va: f64,
            _vd: f64,
            _ia: f64,
            _id: f64,
        ) {
            self.calls.push(Call::InitTestboard);
        }

        fn set_testboard_delays(&mut self, _sig_delays: &BTreeMap<u8, u8>) {
            self.calls.push(Call::SetTestboardDelays);
        }

        fn setup_pattern_generator(&mut self, _pg_program: &[(u16, u8)], pg_sum: u32) {
            self.calls.push(Call::SetupPatternGenerator(pg_sum));
        }

        fn set_testboard_power(&mut self, va: f64, vd: f64, ia: f64, id: f64) {
            self.calls.push(Call::SetTestboardPower(va, vd, ia, id));
        }

        fn flash(&mut self, _firmware: &[u8]) -> bool {
            self.calls.push(Call::Flash);
            true
        }

        fn set_clock_stretch(&mut self, source: u8, width: u16, delay: u16) {
            self.calls.push(Call::SetClockStretch(source, width, delay));
        }

        fn power_on(&mut self) {
            self.calls.push(Call::PowerOn);
        }

        fn power_off(&mut self) {
            self.calls.push(Call::PowerOff);
        }

        fn hv_on(&mut self) {
            self.calls.push(Call::HvOn);
        }

        fn hv_off(&mut self) {
            self.calls.push(Call::HvOff);
        }

        fn tb_ia(&mut self) -> f64 {
            0.021
        }

        fn tb_va(&mut self) -> f64 {
            1.9
        }

        fn tb_id(&mut self) -> f64 {
            0.4
        }

        fn tb_vd(&mut self) -> f64 {
            2.6
        }

        fn route_probe(&mut self, probe: Probe, signal: u8) {
            self.calls.push(Call::RouteProbe(probe, signal));
        }

        fn set_hub_id(&mut self, hub: u8) {
            self.calls.push(Call::SetHubId(hub));
        }

        fn init_tbm_core(&mut self, device_code: u8, _regs: &BTreeMap<u8, u8>) {
            self.calls.push(Call::InitTbmCore(device_code));
        }

        fn init_roc(&mut self, i2c: u8, device_code: u8, _dacs: &BTreeMap<u8, u8>) {
            self.calls.push(Call::InitRoc(i2c, device_code));
        }

        fn roc_set_dac(&mut self, i2c: u8, register: u8, value: u8) {
            self.calls.push(Call::RocSetDac(i2c, register, value));
        }

        fn tbm_set_reg(&mut self, register: u8, value: u8) {
            self.calls.push(Call::TbmSetReg(register, value));
        }

        fn setup_i2c_values(&mut self, addresses: &[u8]) {
            self.calls.push(Call::SetupI2cValues(addresses.to_vec()));
        }

        fn setup_trim_values(&mut self, i2c: u8, _pixels: &[PixelConfig]) {
            self.calls.push(Call::SetupTrimValues(i2c));
        }

        fn roc_mask_all(&mut self, i2c: u8) {
            self.calls.push(Call::RocMaskAll(i2c));
        }

        fn roc_trim_unmask(&mut self, i2c: u8, _pixels: &[PixelConfig]) {
            self.calls.push(Call::RocTrimUnmask(i2c));
        }

        fn pixel_set_calibrate(&mut self, i2c: u8, column: u8, row: u8) {
            self.calls.push(Call::PixelSetCalibrate(i2c, column, row));
        }

        fn roc_clear_calibrate(&mut self, i2c: u8) {
            self.calls.push(Call::RocClearCalibrate(i2c));
        }

        fn all_columns_enable(&mut self, i2c: u8, enable: bool) {
            self.calls.push(Call::AllColumnsEnable(i2c, enable));
        }

        fn single_roc_all_pixels(&mut self, i2c: u8, measurement: &Measurement) -> Vec<Event> {
            self.calls.push(Call::SingleRocAllPixels(i2c));
            let hits = vec![self.hit(i2c, 0, 0)];
            self.generate(measurement, hits)
        }

        fn single_roc_one_pixel(
            &mut self,
            i2c: u8,
            column: u8,
            row: u8,
            measurement: &Measurement,
        ) -> Vec<Event> {
            self.calls.push(Call::SingleRocOnePixel(i2c, column, row));
            let hits = vec![self.hit(i2c, column, row)];
            self.generate(measurement, hits)
        }

        fn multi_roc_all_pixels(&mut self, i2cs: &[u8], measurement: &Measurement) -> Vec<Event> {
            self.calls.push(Call::MultiRocAllPixels(i2cs.to_vec()));
            let hits = i2cs.iter().map(|i2c| self.hit(*i2c, 0, 0)).collect();
            self.generate(measurement, hits)
        }

        fn multi_roc_one_pixel(
            &mut self,
            i2cs: &[u8],
            column: u8,
            row: u8,
            measurement: &Measurement,
        ) -> Vec<Event> {
            self.calls
                .push(Call::MultiRocOnePixel(i2cs.to_vec(), column, row));
            let hits = i2cs.iter().map(|i2c| self.hit(*i2c, column, row)).collect();
            self.generate(measurement, hits)
        }

        fn daq_clear(&mut self) {
            self.calls.push(Call::DaqClear);
        }

        fn daq_start(&mut self, deser_phase: u8, tbm_cores: usize, buffer_size: u32) {
            self.calls.push(Call::DaqStart {
                phase: deser_phase,
                cores: tbm_cores,
                size: buffer_size,
            });
        }

        fn daq_stop(&mut self) {
            self.calls.push(Call::DaqStop);
        }

        fn daq_trigger(&mut self, count: u32, period: u16) {
            self.calls.push(Call::DaqTrigger(count, period));
        }

        fn daq_trigger_loop(&mut self, period: u16) {
            self.calls.push(Call::DaqTriggerLoop(period));
        }

        fn daq_trigger_loop_halt(&mut self) {
            self.calls.push(Call::DaqTriggerLoopHalt);
        }

        fn daq_buffer_fill(&mut self) -> u32 {
            self.buffer_fill
        }

        fn daq_buffer(&mut self) -> Vec<u16> {
            Vec::new()
        }

        fn daq_all_raw_events(&mut self) -> Vec<RawEvent> {
            Vec::new()
        }

        fn daq_all_events(&mut self) -> Vec<Event> {
            std::mem::take(&mut self.daq_events)
        }

        fn daq_next_raw_event(&mut self) -> Option<RawEvent> {
            None
        }

        fn daq_next_event(&mut self) -> Option<Event> {
            if self.daq_events.is_empty() {
                None
            } else {
                Some(self.daq_events.remove(0))
            }
        }
    }
}
