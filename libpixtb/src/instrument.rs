use super::condense::Statistic;
use super::config;
use super::constants::DAQ_BUFFER_SIZE;
use super::dut::{Dut, PixelConfig};
use super::error::ConfigError;
use super::events::{total_decoder_errors, Event, Pixel};
use super::hal::{Hal, Measurement};
use super::loops::{self, Primitives, TestFlags};
use super::registry::{Probe, RegisterSpace, Registry};
use super::repack;

/// The instrument control and acquisition engine.
///
/// Owns the hardware access interface, the device configuration model and
/// the dictionary, and exposes the configuration, calibration-scan and
/// acquisition operations on top of them. All operations are synchronous;
/// every hardware call blocks until the instrument has responded.
///
/// Scan operations report failure by returning an empty result after an
/// error log rather than panicking, since an empty stream during a
/// multi-hour campaign points at an enablement problem the caller wants to
/// inspect, not a crash.
pub struct Instrument<H: Hal> {
    pub(crate) hal: H,
    pub(crate) dut: Dut,
    pub(crate) registry: Registry,
    pub(crate) daq_running: bool,
    pub(crate) daq_buffer_size: u32,
    pub(crate) decoder_errors: u32,
}

impl<H: Hal> Instrument<H> {
    /// Create an engine over a hardware interface, with the standard
    /// dictionary.
    pub fn new(hal: H) -> Self {
        Self::with_registry(hal, Registry::default())
    }

    pub fn with_registry(hal: H, registry: Registry) -> Self {
        Instrument {
            hal,
            dut: Dut::default(),
            registry,
            daq_running: false,
            daq_buffer_size: DAQ_BUFFER_SIZE,
            decoder_errors: 0,
        }
    }

    pub fn dut(&self) -> &Dut {
        &self.dut
    }

    /// Mutable access to the configuration model, e.g. to adjust pixel
    /// enablement between scans. Not safe to use while a DAQ session is
    /// running.
    pub fn dut_mut(&mut self) -> &mut Dut {
        &mut self.dut
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decoder errors tallied by the most recent scan or readout batch.
    pub fn decoder_errors(&self) -> u32 {
        self.decoder_errors
    }

    /// Hardware connected and DUT initialized and programmed.
    pub fn status(&self) -> bool {
        self.hal.ready() && self.dut.status()
    }

    // ---------------------------------------------------------------------
    // Configuration

    /// Validate and apply the testboard settings: signal delays, power
    /// limits and the pattern generator program.
    pub fn init_testboard(
        &mut self,
        sig_delays: &[(String, u8)],
        power_settings: &[(String, f64)],
        pg_program: &[(String, u8)],
    ) -> Result<(), ConfigError> {
        if !self.hal.compatible() {
            return Err(ConfigError::IncompatibleHardware);
        }

        let limits = config::check_testboard_power(power_settings)?;
        self.dut.va = limits.va;
        self.dut.vd = limits.vd;
        self.dut.ia = limits.ia;
        self.dut.id = limits.id;

        self.dut.sig_delays = config::check_testboard_delays(&self.registry, sig_delays);

        let (program, sum) = config::verify_pattern_generator(&self.registry, pg_program)?;
        self.dut.pg_program = program;
        self.dut.pg_sum = sum;

        self.hal.init_testboard(
            &self.dut.sig_delays,
            &self.dut.pg_program,
            self.dut.pg_sum,
            limits.va,
            limits.vd,
            limits.ia,
            limits.id,
        );
        Ok(())
    }

    /// Re-validate and push updated signal delays.
    pub fn set_testboard_delays(&mut self, sig_delays: &[(String, u8)]) -> Result<(), ConfigError> {
        if !self.hal.ready() {
            spdlog::error!("Signal delays not updated!");
            return Err(ConfigError::HardwareNotReady);
        }
        self.dut.sig_delays = config::check_testboard_delays(&self.registry, sig_delays);
        self.hal.set_testboard_delays(&self.dut.sig_delays);
        spdlog::debug!("Testboard signal delays updated.");
        Ok(())
    }

    /// Re-validate and push an updated pattern generator program.
    pub fn set_pattern_generator(&mut self, pg_program: &[(String, u8)]) -> Result<(), ConfigError> {
        if !self.hal.ready() {
            spdlog::error!("Pattern generator not updated!");
            return Err(ConfigError::HardwareNotReady);
        }
        let (program, sum) = config::verify_pattern_generator(&self.registry, pg_program)?;
        self.dut.pg_program = program;
        self.dut.pg_sum = sum;
        self.hal
            .setup_pattern_generator(&self.dut.pg_program, self.dut.pg_sum);
        spdlog::debug!("Pattern generator verified and updated.");
        Ok(())
    }

    /// Re-validate and push updated power limits.
    pub fn set_testboard_power(
        &mut self,
        power_settings: &[(String, f64)],
    ) -> Result<(), ConfigError> {
        if !self.hal.ready() {
            spdlog::error!("Voltages/current limits not updated!");
            return Err(ConfigError::HardwareNotReady);
        }
        let limits = config::check_testboard_power(power_settings)?;
        self.dut.va = limits.va;
        self.dut.vd = limits.vd;
        self.dut.ia = limits.ia;
        self.dut.id = limits.id;
        self.hal
            .set_testboard_power(limits.va, limits.vd, limits.ia, limits.id);
        spdlog::debug!("Voltages/current limits updated.");
        Ok(())
    }

    /// Validate a full device description, then program it.
    pub fn init_dut(
        &mut self,
        hub_id: u8,
        tbm_type: &str,
        tbm_regs: &[Vec<(String, u8)>],
        roc_type: &str,
        roc_dacs: &[Vec<(String, u8)>],
        roc_pixels: &[Vec<PixelConfig>],
    ) -> Result<(), ConfigError> {
        if !self.hal.ready() {
            return Err(ConfigError::HardwareNotReady);
        }
        config::populate_dut(
            &self.registry,
            &mut self.dut,
            hub_id,
            tbm_type,
            tbm_regs,
            roc_type,
            roc_dacs,
            roc_pixels,
        )?;
        self.program_dut()
    }

    /// Push the validated configuration to the hardware: power up, hub id,
    /// enabled cores, enabled chips, then mask the whole device.
    pub fn program_dut(&mut self) -> Result<(), ConfigError> {
        if !self.dut.initialized() {
            spdlog::error!("DUT not initialized, unable to program it.");
            return Err(ConfigError::NotInitialized);
        }

        self.hal.power_on();
        self.hal.set_hub_id(self.dut.hub_id);

        if self.dut.n_enabled_tbms() > 0 {
            spdlog::debug!("Programming TBMs...");
        }
        for tbm in self.dut.enabled_tbms() {
            self.hal.init_tbm_core(tbm.device_code, &tbm.regs);
        }

        if self.dut.n_enabled_rocs() > 0 {
            spdlog::debug!("Programming ROCs...");
        }
        for roc in self.dut.enabled_rocs() {
            self.hal.init_roc(roc.i2c_address, roc.device_code, &roc.dacs);
        }

        loops::mask_device(&mut self.hal, &self.dut);

        self.dut.mark_programmed();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Register updates

    /// Declared maximum of a named chip register, 0 for unknown names.
    pub fn dac_range(&self, name: &str) -> u8 {
        match self.registry.register(name, RegisterSpace::Roc) {
            Some(spec) => spec.max,
            None => {
                spdlog::error!("Invalid register name \"{}\"", name);
                0
            }
        }
    }

    /// Set a DAC on one chip (even a disabled one).
    pub fn set_roc_dac(&mut self, name: &str, value: u8, roc: usize) -> bool {
        if !self.status() {
            return false;
        }
        let Some((register, value)) =
            config::verify_register(&self.registry, name, value, RegisterSpace::Roc)
        else {
            return false;
        };
        if roc >= self.dut.rocs.len() {
            spdlog::error!("ROC {} does not exist in the DUT!", roc);
            return false;
        }

        if self.dut.store_dac(roc, register, value) {
            spdlog::debug!("DAC \"{}\" updated with value {}", name, value);
        } else {
            spdlog::warn!(
                "DAC \"{}\" was not initialized. Created with value {}",
                name,
                value
            );
        }
        let i2c = self.dut.rocs[roc].i2c_address;
        self.hal.roc_set_dac(i2c, register, value);
        true
    }

    /// Set a DAC on every enabled chip.
    pub fn set_dac(&mut self, name: &str, value: u8) -> bool {
        if !self.status() {
            return false;
        }
        let Some((register, value)) =
            config::verify_register(&self.registry, name, value, RegisterSpace::Roc)
        else {
            return false;
        };

        let targets: Vec<usize> = self
            .dut
            .rocs
            .iter()
            .enumerate()
            .filter(|(_, roc)| roc.enable)
            .map(|(index, _)| index)
            .collect();
        for roc in targets {
            if self.dut.store_dac(roc, register, value) {
                spdlog::debug!("DAC \"{}\" updated with value {}", name, value);
            } else {
                spdlog::warn!(
                    "DAC \"{}\" was not initialized. Created with value {}",
                    name,
                    value
                );
            }
            let i2c = self.dut.rocs[roc].i2c_address;
            self.hal.roc_set_dac(i2c, register, value);
        }
        true
    }

    /// Set a register on one TBM core (even a disabled one). The core-select
    /// nibble is taken over from the core's existing registers.
    pub fn set_tbm_reg(&mut self, name: &str, value: u8, tbm: usize) -> bool {
        if !self.status() {
            return false;
        }
        let Some((register, value)) =
            config::verify_register(&self.registry, name, value, RegisterSpace::Tbm)
        else {
            return false;
        };
        if tbm >= self.dut.tbms.len() {
            spdlog::error!("TBM {} does not exist in the DUT!", tbm);
            return false;
        }

        let core = &mut self.dut.tbms[tbm];
        let core_select = core
            .regs
            .keys()
            .next()
            .map(|reg| reg & 0xF0)
            .unwrap_or(if tbm % 2 == 0 { 0xE0 } else { 0xF0 });
        let register = core_select | register;
        if core.regs.insert(register, value).is_some() {
            spdlog::debug!(
                "Register \"{}\" ({:#04x}) updated with value {}",
                name,
                register,
                value
            );
        } else {
            spdlog::warn!(
                "Register \"{}\" ({:#04x}) was not initialized. Created with value {}",
                name,
                register,
                value
            );
        }
        self.hal.tbm_set_reg(register, value);
        true
    }

    /// Set a register on every TBM core.
    pub fn set_tbm_regs(&mut self, name: &str, value: u8) -> bool {
        for tbm in 0..self.dut.tbms.len() {
            if !self.set_tbm_reg(name, value, tbm) {
                return false;
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Calibration scans

    /// Averaged pulse height per pixel at the current settings.
    pub fn pulseheight_map(&mut self, flags: TestFlags, triggers: u16) -> Vec<Pixel> {
        self.map_scan(flags, triggers, Statistic::PulseHeight)
    }

    /// Trigger response count per pixel at the current settings.
    pub fn efficiency_map(&mut self, flags: TestFlags, triggers: u16) -> Vec<Pixel> {
        self.map_scan(flags, triggers, Statistic::Efficiency)
    }

    /// Averaged pulse height per pixel and setting of one swept register.
    pub fn pulseheight_vs_dac(
        &mut self,
        dac: &str,
        step: u8,
        min: u8,
        max: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<(u8, Vec<Pixel>)> {
        self.dac_scan(dac, step, min, max, flags, triggers, Statistic::PulseHeight)
    }

    /// Trigger response count per pixel and setting of one swept register.
    pub fn efficiency_vs_dac(
        &mut self,
        dac: &str,
        step: u8,
        min: u8,
        max: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<(u8, Vec<Pixel>)> {
        self.dac_scan(dac, step, min, max, flags, triggers, Statistic::Efficiency)
    }

    /// Averaged pulse height over a two-dimensional register sweep.
    #[allow(clippy::too_many_arguments)]
    pub fn pulseheight_vs_dacdac(
        &mut self,
        dac1: &str,
        step1: u8,
        min1: u8,
        max1: u8,
        dac2: &str,
        step2: u8,
        min2: u8,
        max2: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<(u8, u8, Vec<Pixel>)> {
        self.dacdac_scan(
            dac1,
            step1,
            min1,
            max1,
            dac2,
            step2,
            min2,
            max2,
            flags,
            triggers,
            Statistic::PulseHeight,
        )
    }

    /// Trigger response count over a two-dimensional register sweep.
    #[allow(clippy::too_many_arguments)]
    pub fn efficiency_vs_dacdac(
        &mut self,
        dac1: &str,
        step1: u8,
        min1: u8,
        max1: u8,
        dac2: &str,
        step2: u8,
        min2: u8,
        max2: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<(u8, u8, Vec<Pixel>)> {
        self.dacdac_scan(
            dac1,
            step1,
            min1,
            max1,
            dac2,
            step2,
            min2,
            max2,
            flags,
            triggers,
            Statistic::Efficiency,
        )
    }

    /// Per-pixel threshold of one swept register, extracted from an
    /// efficiency scan at the given level (percent of triggers).
    #[allow(clippy::too_many_arguments)]
    pub fn threshold_map(
        &mut self,
        dac: &str,
        step: u8,
        min: u8,
        max: u8,
        level: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<Pixel> {
        if !self.status() || !check_threshold_level(level) {
            return Vec::new();
        }
        let (min, max) = normalize_range(min, max);
        let Some((register, max)) =
            config::verify_register(&self.registry, dac, max, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let min = min.min(max);

        let measurement = Measurement::DacScan {
            register,
            min,
            max,
            step,
            flags,
            triggers,
        };
        let data = self.run_loop(&measurement, Primitives::ALL, flags);
        repack::repack_threshold_map(data, step, min, max, level, triggers, flags)
    }

    /// Threshold map over the register's full range at the 50% level.
    pub fn threshold_map_full_range(
        &mut self,
        dac: &str,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<Pixel> {
        let max = self.dac_range(dac);
        self.threshold_map(dac, 1, 0, max, 50, flags, triggers)
    }

    /// Per-pixel threshold of the first register, per setting of the second.
    ///
    /// The whole-chip call shapes are not available for this scan; sweeping
    /// the full matrix over two registers would overrun the acquisition
    /// buffer, so the expansion runs pixel by pixel.
    #[allow(clippy::too_many_arguments)]
    pub fn threshold_vs_dac(
        &mut self,
        dac1: &str,
        step1: u8,
        min1: u8,
        max1: u8,
        dac2: &str,
        step2: u8,
        min2: u8,
        max2: u8,
        level: u8,
        flags: TestFlags,
        triggers: u16,
    ) -> Vec<(u8, Vec<Pixel>)> {
        if !self.status() || !check_threshold_level(level) {
            return Vec::new();
        }
        let (min1, max1) = normalize_range(min1, max1);
        let (min2, max2) = normalize_range(min2, max2);
        let Some((register1, max1)) =
            config::verify_register(&self.registry, dac1, max1, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let Some((register2, max2)) =
            config::verify_register(&self.registry, dac2, max2, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let min1 = min1.min(max1);
        let min2 = min2.min(max2);

        let measurement = Measurement::DacDacScan {
            register1,
            min1,
            max1,
            step1,
            register2,
            min2,
            max2,
            step2,
            flags,
            triggers,
        };
        let data = self.run_loop(&measurement, Primitives::PIXEL_ONLY, flags);
        let result = repack::repack_threshold_dac_scan(
            data, step1, min1, max1, step2, min2, max2, level, triggers, flags,
        );
        self.restore_dac(register1, dac1);
        self.restore_dac(register2, dac2);
        result
    }

    fn map_scan(&mut self, flags: TestFlags, triggers: u16, statistic: Statistic) -> Vec<Pixel> {
        if !self.status() {
            return Vec::new();
        }
        let measurement = Measurement::Calibrate { flags, triggers };
        let data = self.run_loop(&measurement, Primitives::ALL, flags);
        repack::repack_map(data, triggers, flags, statistic)
    }

    #[allow(clippy::too_many_arguments)]
    fn dac_scan(
        &mut self,
        dac: &str,
        step: u8,
        min: u8,
        max: u8,
        flags: TestFlags,
        triggers: u16,
        statistic: Statistic,
    ) -> Vec<(u8, Vec<Pixel>)> {
        if !self.status() {
            return Vec::new();
        }
        let (min, max) = normalize_range(min, max);
        let Some((register, max)) =
            config::verify_register(&self.registry, dac, max, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let min = min.min(max);

        let measurement = Measurement::DacScan {
            register,
            min,
            max,
            step,
            flags,
            triggers,
        };
        let data = self.run_loop(&measurement, Primitives::ALL, flags);
        let result = repack::repack_dac_scan(data, step, min, max, triggers, statistic);
        self.restore_dac(register, dac);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn dacdac_scan(
        &mut self,
        dac1: &str,
        step1: u8,
        min1: u8,
        max1: u8,
        dac2: &str,
        step2: u8,
        min2: u8,
        max2: u8,
        flags: TestFlags,
        triggers: u16,
        statistic: Statistic,
    ) -> Vec<(u8, u8, Vec<Pixel>)> {
        if !self.status() {
            return Vec::new();
        }
        let (min1, max1) = normalize_range(min1, max1);
        let (min2, max2) = normalize_range(min2, max2);
        let Some((register1, max1)) =
            config::verify_register(&self.registry, dac1, max1, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let Some((register2, max2)) =
            config::verify_register(&self.registry, dac2, max2, RegisterSpace::Roc)
        else {
            return Vec::new();
        };
        let min1 = min1.min(max1);
        let min2 = min2.min(max2);

        let measurement = Measurement::DacDacScan {
            register1,
            min1,
            max1,
            step1,
            register2,
            min2,
            max2,
            step2,
            flags,
            triggers,
        };
        let data = self.run_loop(&measurement, Primitives::ALL, flags);
        let result = repack::repack_dacdac_scan(
            data, step1, min1, max1, step2, min2, max2, triggers, statistic,
        );
        self.restore_dac(register1, dac1);
        self.restore_dac(register2, dac2);
        result
    }

    /// Expand one measurement over the enabled chips/pixels and tally its
    /// decoder errors.
    fn run_loop(
        &mut self,
        measurement: &Measurement,
        primitives: Primitives,
        flags: TestFlags,
    ) -> Vec<Event> {
        let data = loops::expand_loop(&mut self.hal, &self.dut, measurement, primitives, flags);
        self.record_decoder_errors(&data);
        data
    }

    /// Reset the per-call decoder error tally from a fresh event stream.
    pub(crate) fn record_decoder_errors(&mut self, data: &[Event]) {
        self.decoder_errors = total_decoder_errors(data);
        if self.decoder_errors > 0 {
            spdlog::critical!(
                "A total of {} pixels could not be decoded in this readout.",
                self.decoder_errors
            );
        }
    }

    /// Write a scanned register back to its configured value on every
    /// enabled chip.
    fn restore_dac(&mut self, register: u8, name: &str) {
        let restores: Vec<(u8, u8)> = self
            .dut
            .enabled_rocs()
            .filter_map(|roc| {
                roc.dacs
                    .get(&register)
                    .map(|value| (roc.i2c_address, *value))
            })
            .collect();
        for (i2c, value) in restores {
            spdlog::debug!("Reset DAC \"{}\" to original value {}", name, value);
            self.hal.roc_set_dac(i2c, register, value);
        }
    }

    // ---------------------------------------------------------------------
    // Device operations

    pub fn tb_ia(&mut self) -> f64 {
        if !self.hal.ready() {
            return 0.0;
        }
        self.hal.tb_ia()
    }

    pub fn tb_va(&mut self) -> f64 {
        if !self.hal.ready() {
            return 0.0;
        }
        self.hal.tb_va()
    }

    pub fn tb_id(&mut self) -> f64 {
        if !self.hal.ready() {
            return 0.0;
        }
        self.hal.tb_id()
    }

    pub fn tb_vd(&mut self) -> f64 {
        if !self.hal.ready() {
            return 0.0;
        }
        self.hal.tb_vd()
    }

    pub fn hv_on(&mut self) {
        self.hal.hv_on();
    }

    pub fn hv_off(&mut self) {
        self.hal.hv_off();
    }

    /// Power the device up again and re-program it; register state was lost
    /// while the power was down.
    pub fn power_on(&mut self) -> Result<(), ConfigError> {
        self.program_dut()
    }

    /// Switch the device power off. The configuration stays valid but has to
    /// be re-programmed on the next power-up.
    pub fn power_off(&mut self) {
        self.hal.power_off();
        self.dut.invalidate_programming();
    }

    /// Route a named signal to one of the probe outputs (`d1`, `d2`, `a1`,
    /// `a2`).
    pub fn signal_probe(&mut self, probe: &str, signal: &str) -> bool {
        if !self.hal.ready() {
            return false;
        }
        let target = match probe.to_ascii_lowercase().as_str() {
            "d1" => Probe::D1,
            "d2" => Probe::D2,
            "a1" => Probe::A1,
            "a2" => Probe::A2,
            _ => {
                spdlog::error!("Invalid probe name \"{}\" selected!", probe);
                return false;
            }
        };
        let Some(code) = self.registry.probe_signal(target, signal) else {
            spdlog::error!("Invalid probe signal \"{}\" selected!", signal);
            return false;
        };
        spdlog::debug!(
            "Probe signal lookup for \"{}\" returned signal {:#04x}",
            signal,
            code
        );
        self.hal.route_probe(target, code);
        true
    }

    /// Flash new testboard firmware. Only permitted while the hardware is
    /// unready and no device is configured.
    pub fn flash_testboard(&mut self, firmware: &[u8]) -> Result<(), ConfigError> {
        if self.hal.ready() || self.dut.status() {
            spdlog::error!(
                "The testboard should only be flashed without initialization and with all attached DUTs powered down."
            );
            spdlog::error!("Please power cycle the testboard and flash directly after startup!");
            return Err(ConfigError::FlashNotPermitted);
        }
        if self.hal.flash(firmware) {
            Ok(())
        } else {
            Err(ConfigError::FlashFailed)
        }
    }

    pub fn set_clock_stretch(&mut self, source: u8, delay: u16, width: u16) {
        spdlog::debug!("Set clock stretch {} {} {}", source, delay, width);
        self.hal.set_clock_stretch(source, width, delay);
    }
}

/// Swap a caller-supplied scan range into ascending order.
fn normalize_range(min: u8, max: u8) -> (u8, u8) {
    if min > max {
        spdlog::warn!("Swapping upper and lower bound.");
        (max, min)
    } else {
        (min, max)
    }
}

fn check_threshold_level(level: u8) -> bool {
    if level == 0 || level > 100 {
        spdlog::critical!("Threshold level of {}% is not possible!", level);
        return false;
    }
    true
}
