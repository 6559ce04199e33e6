//! Validation of raw name/value settings into the device configuration
//! model.
//!
//! Malformed input that indicates a broken configuration file rejects the
//! whole step with a [`ConfigError`]. Conditions that are survivable during
//! a run (unknown register names, out-of-range values) are logged and
//! degraded instead, so a long calibration campaign is not aborted over a
//! typo in a single optional setting.

use std::collections::BTreeMap;

use fxhash::FxHashSet;

use super::constants::{
    IA_LIMIT, ID_LIMIT, PG_MAX_ENTRIES, POWER_MINIMUM, ROC_NUM_COLS, ROC_NUM_PIXELS, ROC_NUM_ROWS,
    TRIM_MAX, VA_LIMIT, VD_LIMIT,
};
use super::dut::{Dut, PixelConfig, RocConfig, TbmConfig};
use super::error::ConfigError;
use super::registry::{RegisterSpace, Registry};

/// Validated testboard power limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PowerLimits {
    pub va: f64,
    pub vd: f64,
    pub ia: f64,
    pub id: f64,
}

/// Resolve a register name and clamp its value to the declared maximum.
///
/// Returns `None` (after an error log) for unknown names; callers skip the
/// entry. Overflowing values are clamped with a warning, never rejected.
pub(crate) fn verify_register(
    registry: &Registry,
    name: &str,
    value: u8,
    space: RegisterSpace,
) -> Option<(u8, u8)> {
    let Some(spec) = registry.register(name, space) else {
        spdlog::error!("Invalid register name \"{}\"", name);
        return None;
    };
    let value = if value > spec.max {
        spdlog::warn!(
            "Register range overflow, set register \"{}\" ({}) to {} (was: {})",
            name,
            spec.id,
            spec.max,
            value
        );
        spec.max
    } else {
        value
    };
    spdlog::trace!(
        "Verified register \"{}\" ({}): {} (max {})",
        name,
        spec.id,
        value,
        spec.max
    );
    Some((spec.id, value))
}

/// Resolve a device type name to its code.
pub(crate) fn device_code(registry: &Registry, name: &str) -> Result<u8, ConfigError> {
    match registry.device_code(name) {
        Some(code) if code != 0x0 => {
            spdlog::trace!("Device type lookup for \"{}\" returned {:#04x}", name, code);
            Ok(code)
        }
        _ => {
            spdlog::error!("Unknown device \"{}\"", name);
            Err(ConfigError::UnknownDeviceType(name.to_string()))
        }
    }
}

/// Validate the testboard power limits.
///
/// Each limit is independently capped; negative entries are dropped with an
/// error log and the default limit kept. Limits that end up effectively zero
/// reject the configuration, since powering the device with them would not
/// work.
pub(crate) fn check_testboard_power(
    settings: &[(String, f64)],
) -> Result<PowerLimits, ConfigError> {
    let mut limits = PowerLimits {
        va: VA_LIMIT,
        vd: VD_LIMIT,
        ia: IA_LIMIT,
        id: ID_LIMIT,
    };

    for (name, value) in settings {
        let name = name.to_ascii_lowercase();
        if *value < 0.0 {
            spdlog::error!(
                "Negative value for power setting \"{}\". Using default limit.",
                name
            );
            continue;
        }
        let (slot, cap) = match name.as_str() {
            "va" => (&mut limits.va, VA_LIMIT),
            "vd" => (&mut limits.vd, VD_LIMIT),
            "ia" => (&mut limits.ia, IA_LIMIT),
            "id" => (&mut limits.id, ID_LIMIT),
            _ => {
                spdlog::error!("Unknown power setting \"{}\"! Skipping.", name);
                continue;
            }
        };
        if *value > cap {
            spdlog::warn!("Limiting \"{}\" to {}", name, cap);
        } else {
            *slot = *value;
        }
    }

    if limits.va < POWER_MINIMUM
        || limits.vd < POWER_MINIMUM
        || limits.ia < POWER_MINIMUM
        || limits.id < POWER_MINIMUM
    {
        spdlog::critical!("Power settings are not sufficient. Please check and re-configure!");
        return Err(ConfigError::InsufficientPower);
    }
    Ok(limits)
}

/// Validate the testboard signal delays into a register/value map.
///
/// Unknown signal names are skipped, duplicate entries overwrite with a
/// warning.
pub(crate) fn check_testboard_delays(
    registry: &Registry,
    settings: &[(String, u8)],
) -> BTreeMap<u8, u8> {
    let mut delays = BTreeMap::new();
    for (name, value) in settings {
        let Some((register, value)) = verify_register(registry, name, *value, RegisterSpace::Testboard)
        else {
            continue;
        };
        if let Some(previous) = delays.insert(register, value) {
            spdlog::warn!(
                "Overwriting existing delay setting \"{}\" value {} with {}",
                name,
                previous,
                value
            );
        }
    }
    delays
}

/// Validate a pattern generator program and resolve its signal names.
///
/// Returns the resolved (signal mask, delay) program and the total program
/// delay in clock units.
pub(crate) fn verify_pattern_generator(
    registry: &Registry,
    program: &[(String, u8)],
) -> Result<(Vec<(u16, u8)>, u32), ConfigError> {
    if program.len() > PG_MAX_ENTRIES {
        spdlog::critical!(
            "Pattern too long ({} entries) for pattern generator. Only {} entries allowed!",
            program.len(),
            PG_MAX_ENTRIES
        );
        return Err(ConfigError::PatternTooLong(program.len()));
    }
    spdlog::debug!("Pattern generator setup with {} entries provided", program.len());

    let mut patterns = Vec::with_capacity(program.len());
    let last = program.len().saturating_sub(1);
    for (index, (names, delay)) in program.iter().enumerate() {
        let mut delay = *delay;
        // A zero delay halts the generator; it is only legal on the last
        // entry.
        if delay == 0 && index != last {
            spdlog::critical!(
                "Found delay = 0 on early entry! This stops the pattern generator at position {}.",
                index
            );
            return Err(ConfigError::PatternStopsEarly(index));
        }
        if index == last && delay != 0 {
            spdlog::warn!(
                "No delay = 0 found on last entry. Setting last delay to 0 to stop the pattern generator."
            );
            delay = 0;
        }

        let mut mask: u16 = 0;
        for token in names.to_ascii_lowercase().split(';') {
            let Some(signal) = registry.pattern_signal(token) else {
                spdlog::critical!(
                    "Could not find pattern generator signal \"{}\" in the dictionary!",
                    token
                );
                return Err(ConfigError::UnknownPatternSignal(token.to_string()));
            };
            spdlog::trace!("Found pattern generator signal {} ({:#06x})", token, signal);
            mask += signal;
        }
        patterns.push((mask, delay));
    }

    let sum = pattern_delay_sum(&patterns);
    Ok((patterns, sum))
}

/// Total cycle time of a pattern generator program: each entry costs its
/// delay plus one clock for the command itself, plus one trailing clock.
pub(crate) fn pattern_delay_sum(program: &[(u16, u8)]) -> u32 {
    let sum = program.iter().map(|(_, delay)| u32::from(*delay) + 1).sum::<u32>() + 1;
    spdlog::debug!("Sum of pattern generator delays: {} clk", sum);
    sum
}

/// Build the TBM core configurations, duplicating a single supplied core to
/// the second one by flipping the core-select bit on every register id.
pub(crate) fn build_tbm_configs(
    registry: &Registry,
    tbm_type: &str,
    tbm_regs: &[Vec<(String, u8)>],
) -> Result<Vec<TbmConfig>, ConfigError> {
    let code = if tbm_regs.is_empty() {
        0x0
    } else {
        device_code(registry, tbm_type)?
    };

    let mut tbms = Vec::new();
    for (core, settings) in tbm_regs.iter().enumerate() {
        spdlog::debug!("Processing TBM core {}", core);
        let core_select: u8 = if core % 2 == 0 { 0xE0 } else { 0xF0 };
        let mut regs = BTreeMap::new();
        for (name, value) in settings {
            let Some((register, value)) = verify_register(registry, name, *value, RegisterSpace::Tbm)
            else {
                continue;
            };
            let register = core_select | register;
            if let Some(previous) = regs.insert(register, value) {
                spdlog::warn!(
                    "Overwriting existing register \"{}\" value {} with {}",
                    name,
                    previous,
                    value
                );
            }
        }
        tbms.push(TbmConfig {
            device_code: code,
            regs,
            enable: true,
        });
    }

    if tbms.len() == 1 {
        spdlog::debug!("Only register settings for one TBM core supplied. Duplicating to second core.");
        let twin = TbmConfig {
            device_code: tbms[0].device_code,
            regs: tbms[0]
                .regs
                .iter()
                .map(|(register, value)| (register ^ (1 << 4), *value))
                .collect(),
            enable: true,
        };
        tbms.push(twin);
    }

    Ok(tbms)
}

/// Build the readout chip configurations, assigning bus addresses in input
/// order.
pub(crate) fn build_roc_configs(
    registry: &Registry,
    roc_type: &str,
    roc_dacs: &[Vec<(String, u8)>],
    roc_pixels: &[Vec<PixelConfig>],
) -> Result<Vec<RocConfig>, ConfigError> {
    let code = device_code(registry, roc_type)?;

    let mut rocs = Vec::new();
    for (index, settings) in roc_dacs.iter().enumerate() {
        let mut dacs = BTreeMap::new();
        for (name, value) in settings {
            let Some((register, value)) = verify_register(registry, name, *value, RegisterSpace::Roc)
            else {
                continue;
            };
            if let Some(previous) = dacs.insert(register, value) {
                spdlog::warn!(
                    "Overwriting existing DAC \"{}\" value {} with {}",
                    name,
                    previous,
                    value
                );
            }
        }

        let mut pixels = Vec::with_capacity(roc_pixels[index].len());
        for px in &roc_pixels[index] {
            let mut px = *px;
            if px.trim > TRIM_MAX {
                spdlog::warn!(
                    "Pixel {}, {} trim value {} exceeds limit. Set to {}.",
                    px.column,
                    px.row,
                    px.trim,
                    TRIM_MAX
                );
                px.trim = TRIM_MAX;
            }
            pixels.push(px);
        }

        let i2c_address = index as u8;
        spdlog::debug!("Bus address for the next ROC is: {}", i2c_address);
        rocs.push(RocConfig {
            device_code: code,
            i2c_address,
            dacs,
            pixels,
            enable: true,
        });
    }

    Ok(rocs)
}

/// Check the per-chip pixel lists for structural mistakes.
fn check_pixel_lists(roc_pixels: &[Vec<PixelConfig>]) -> Result<(), ConfigError> {
    for (index, pixels) in roc_pixels.iter().enumerate() {
        if pixels.is_empty() {
            spdlog::warn!("No pixel configured for ROC {}!", index);
        }
        if pixels.len() > ROC_NUM_PIXELS {
            spdlog::critical!(
                "Too many pixels (N_pixel={} > {}) configured for ROC {}!",
                pixels.len(),
                ROC_NUM_PIXELS,
                index
            );
            return Err(ConfigError::TooManyPixels(pixels.len(), index));
        }

        let mut positions = FxHashSet::default();
        let mut duplicates = 0;
        for px in pixels {
            if !positions.insert((px.column, px.row)) {
                spdlog::critical!(
                    "Config for pixel in column {} and row {} present multiple times in ROC {}!",
                    px.column,
                    px.row,
                    index
                );
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            return Err(ConfigError::DuplicatePixels(index));
        }

        if pixels
            .iter()
            .any(|px| px.column >= ROC_NUM_COLS || px.row >= ROC_NUM_ROWS)
        {
            spdlog::critical!(
                "Found pixels with values for column and row outside of valid address range on ROC {}!",
                index
            );
            return Err(ConfigError::PixelOutOfRange(index));
        }
    }
    Ok(())
}

/// Validate a full device description and commit it into the configuration
/// model.
///
/// Nothing is written to `dut` unless the whole description validates.
#[allow(clippy::too_many_arguments)]
pub(crate) fn populate_dut(
    registry: &Registry,
    dut: &mut Dut,
    hub_id: u8,
    tbm_type: &str,
    tbm_regs: &[Vec<(String, u8)>],
    roc_type: &str,
    roc_dacs: &[Vec<(String, u8)>],
    roc_pixels: &[Vec<PixelConfig>],
) -> Result<(), ConfigError> {
    if roc_dacs.len() != roc_pixels.len() {
        spdlog::critical!(
            "Hm, we have {} DAC configs but {} pixel configs. This cannot end well...",
            roc_dacs.len(),
            roc_pixels.len()
        );
        return Err(ConfigError::DacPixelCountMismatch(
            roc_dacs.len(),
            roc_pixels.len(),
        ));
    }
    if roc_dacs.is_empty() {
        spdlog::critical!("No DAC/pixel configurations for any ROC supplied!");
        return Err(ConfigError::NoRocConfigs);
    }
    check_pixel_lists(roc_pixels)?;

    spdlog::debug!(
        "We have {} DAC configs and {} pixel configs, with {} and {} entries for the first ROC, respectively.",
        roc_dacs.len(),
        roc_pixels.len(),
        roc_dacs[0].len(),
        roc_pixels[0].len()
    );
    spdlog::debug!("Received settings for {} TBM cores", tbm_regs.len());

    let tbms = build_tbm_configs(registry, tbm_type, tbm_regs)?;
    let rocs = build_roc_configs(registry, roc_type, roc_dacs, roc_pixels)?;

    dut.hub_id = hub_id;
    dut.tbms = tbms;
    dut.rocs = rocs;
    dut.mark_initialized();
    Ok(())
}
