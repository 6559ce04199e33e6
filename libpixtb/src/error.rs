use thiserror::Error;

/// Errors raised while building or programming a device configuration.
///
/// These all indicate a fixable mistake in the supplied settings and reject
/// the whole configuration step. Conditions that can occur during normal
/// scanning (unknown register names, out-of-range values, empty result
/// streams) are not represented here; those are logged and degraded instead.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Mismatch between number of DAC ({0}) and pixel ({1}) configurations")]
    DacPixelCountMismatch(usize, usize),
    #[error("No DAC/pixel configurations for any ROC supplied")]
    NoRocConfigs,
    #[error("Too many pixels ({0} > 4160) configured for ROC {1}")]
    TooManyPixels(usize, usize),
    #[error("Duplicate pixel configurations present on ROC {0}")]
    DuplicatePixels(usize),
    #[error("Pixel with column/row outside the valid address range on ROC {0}")]
    PixelOutOfRange(usize),
    #[error("Unknown device type \"{0}\"")]
    UnknownDeviceType(String),
    #[error("Pattern too long ({0} entries) for the pattern generator; only 256 entries allowed")]
    PatternTooLong(usize),
    #[error("Delay = 0 at pattern generator entry {0} stops the generator early")]
    PatternStopsEarly(usize),
    #[error("Unknown pattern generator signal \"{0}\"")]
    UnknownPatternSignal(String),
    #[error("Power settings are not sufficient")]
    InsufficientPower,
    #[error("Testboard firmware is not compatible with this library")]
    IncompatibleHardware,
    #[error("Hardware not ready")]
    HardwareNotReady,
    #[error("DUT not initialized")]
    NotInitialized,
    #[error("The testboard can only be flashed before initialization, with all attached devices powered down")]
    FlashNotPermitted,
    #[error("Flashing the testboard firmware failed")]
    FlashFailed,
}

/// Errors raised by the acquisition session state machine.
#[derive(Debug, Clone, Error)]
pub enum DaqError {
    #[error("Instrument or DUT not ready for data acquisition")]
    NotReady,
    #[error("A DAQ session is already running")]
    AlreadyRunning,
    #[error("No DAQ session running")]
    NotRunning,
}
