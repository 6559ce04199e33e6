use bitflags::bitflags;

use super::dut::{Dut, RocConfig};
use super::events::Event;
use super::hal::{Hal, Measurement};

bitflags! {
    /// Execution flags of one measurement call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TestFlags: u16 {
        /// Run chip by chip even if a whole-module routine exists.
        const FORCE_SERIAL = 1 << 0;
        /// Skip the mask baseline; leave the device trimmed and unmasked.
        const FORCE_UNMASKED = 1 << 1;
        /// Threshold extraction scans the swept register upward.
        const RISING_EDGE = 1 << 2;
        /// Verify that pixels arrive in raster order and flag violators.
        const CHECK_ORDER = 1 << 3;
        /// Leave repacked results in arrival order.
        const NOSORT = 1 << 4;
    }
}

/// Which of the four hardware call shapes exist for a measurement.
///
/// Mirrors the instrument firmware: most routines come in all four shapes,
/// but some sweeps are only practical pixel by pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitives {
    pub module_parallel: bool,
    pub pixel_parallel: bool,
    pub roc_serial: bool,
    pub pixel_serial: bool,
}

impl Primitives {
    pub const ALL: Primitives = Primitives {
        module_parallel: true,
        pixel_parallel: true,
        roc_serial: true,
        pixel_serial: true,
    };

    /// Whole-chip shapes disabled; used where a full-matrix sweep would
    /// overrun the acquisition buffer.
    pub const PIXEL_ONLY: Primitives = Primitives {
        module_parallel: false,
        pixel_parallel: true,
        roc_serial: false,
        pixel_serial: true,
    };
}

/// The call pattern selected for one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One call covering all enabled chips at once.
    ModuleParallel,
    /// One call per pixel coordinate, each covering all enabled chips.
    PixelParallel,
    /// One call per enabled chip.
    RocSerial,
    /// One call per enabled pixel of each enabled chip.
    PixelSerial,
}

/// Pick the fastest legal call pattern for the current enablement state.
///
/// Returns `None` when no applicable shape exists; the caller treats that as
/// an empty result, not a panic, since it indicates an enablement problem.
pub(crate) fn select_strategy(dut: &Dut, primitives: Primitives, flags: TestFlags) -> Option<Strategy> {
    if dut.n_enabled_rocs() > 1 && !flags.contains(TestFlags::FORCE_SERIAL) {
        if dut.all_pixels_enabled() && primitives.module_parallel {
            return Some(Strategy::ModuleParallel);
        }
        if primitives.pixel_parallel {
            return Some(Strategy::PixelParallel);
        }
        None
    } else {
        if dut.all_pixels_enabled() && primitives.roc_serial {
            return Some(Strategy::RocSerial);
        }
        if primitives.pixel_serial {
            return Some(Strategy::PixelSerial);
        }
        None
    }
}

/// Expand one measurement into the hardware calls covering every enabled
/// chip and pixel, and collect the flat event stream.
///
/// Result order is deterministic: chips follow configuration order, pixels
/// follow each chip's pixel configuration order, and the pixel-parallel
/// shape concatenates chip data per pixel coordinate.
pub(crate) fn expand_loop<H: Hal>(
    hal: &mut H,
    dut: &Dut,
    measurement: &Measurement,
    primitives: Primitives,
    flags: TestFlags,
) -> Vec<Event> {
    // Establish a known mask/trim baseline before touching timing-dependent
    // state, unless the caller explicitly wants the device left unmasked.
    if !flags.contains(TestFlags::FORCE_UNMASKED) {
        upload_trim_values(hal, dut);
        mask_device(hal, dut);
    } else if flags.contains(TestFlags::FORCE_SERIAL) {
        mask_device(hal, dut);
    } else {
        trim_device(hal, dut);
    }

    let Some(strategy) = select_strategy(dut, primitives, flags) else {
        spdlog::critical!("Loop expansion failed: no matching hardware routine for this measurement");
        return Vec::new();
    };

    let data = match strategy {
        Strategy::ModuleParallel => {
            let addresses = dut.enabled_roc_addresses();
            spdlog::debug!("The loop contains one whole-module call");
            hal.multi_roc_all_pixels(&addresses, measurement)
        }
        Strategy::PixelParallel => {
            let addresses = dut.enabled_roc_addresses();
            // Pixel coordinates are taken from the first enabled chip only;
            // identical pixel enablement across all enabled chips is assumed
            // here. Divergent per-chip enablement is not respected by this
            // shape.
            let pixels = dut
                .enabled_rocs()
                .next()
                .map(RocConfig::enabled_pixels)
                .unwrap_or_default();
            spdlog::debug!("The loop contains {} whole-module single-pixel calls", pixels.len());
            let mut data = Vec::new();
            for px in &pixels {
                data.extend(hal.multi_roc_one_pixel(&addresses, px.column, px.row, measurement));
            }
            data
        }
        Strategy::RocSerial => {
            let enabled: Vec<&RocConfig> = dut.enabled_rocs().collect();
            spdlog::debug!("The loop contains {} whole-chip calls", enabled.len());
            let mut data = Vec::new();
            for roc in enabled {
                // Serial unmasked runs still need the chip trimmed right
                // before its measurement.
                if flags.contains(TestFlags::FORCE_SERIAL | TestFlags::FORCE_UNMASKED) {
                    trim_roc(hal, roc);
                }
                data.extend(hal.single_roc_all_pixels(roc.i2c_address, measurement));
            }
            data
        }
        Strategy::PixelSerial => {
            let mut data = Vec::new();
            for roc in dut.enabled_rocs() {
                let pixels = roc.enabled_pixels();
                spdlog::debug!(
                    "The loop for chip {} contains {} single-pixel calls",
                    roc.i2c_address,
                    pixels.len()
                );
                for px in &pixels {
                    data.extend(hal.single_roc_one_pixel(
                        roc.i2c_address,
                        px.column,
                        px.row,
                        measurement,
                    ));
                }
            }
            data
        }
    };

    if data.is_empty() {
        spdlog::critical!("No data from measurement loop: are any TBMs/ROCs/pixels enabled?");
        return data;
    }

    // Measurement is over, return the device to its masked state.
    mask_device(hal, dut);

    data
}

/// Transmit the configured chip addresses and per-pixel trim values to the
/// instrument firmware.
pub(crate) fn upload_trim_values<H: Hal>(hal: &mut H, dut: &Dut) {
    hal.setup_i2c_values(&dut.all_roc_addresses());
    for roc in &dut.rocs {
        hal.setup_trim_values(roc.i2c_address, &roc.pixels);
    }
}

/// Mask every pixel of every configured chip.
pub(crate) fn mask_device<H: Hal>(hal: &mut H, dut: &Dut) {
    for roc in &dut.rocs {
        spdlog::debug!("Masking chip {} in one go", roc.i2c_address);
        hal.roc_mask_all(roc.i2c_address);
    }
}

/// Unmask and trim every configured chip as configured.
pub(crate) fn trim_device<H: Hal>(hal: &mut H, dut: &Dut) {
    for roc in &dut.rocs {
        trim_roc(hal, roc);
    }
}

fn trim_roc<H: Hal>(hal: &mut H, roc: &RocConfig) {
    spdlog::debug!(
        "Unmasking and trimming chip {} ({} pixels stay masked)",
        roc.i2c_address,
        roc.masked_pixel_count()
    );
    hal.roc_trim_unmask(roc.i2c_address, &roc.pixels);
}

/// Set the calibrate bit on every enabled pixel, or clear it chip-wide.
pub(crate) fn set_calibrate_bits<H: Hal>(hal: &mut H, dut: &Dut, enable: bool) {
    for roc in &dut.rocs {
        spdlog::debug!("Configuring calibrate bits on chip {}", roc.i2c_address);
        if enable {
            for px in roc.pixels.iter().filter(|px| px.enable) {
                hal.pixel_set_calibrate(roc.i2c_address, px.column, px.row);
            }
        } else {
            hal.roc_clear_calibrate(roc.i2c_address);
        }
    }
}
