//! Hardware geometry and engine limits.

/// Number of pixel columns on one readout chip.
pub const ROC_NUM_COLS: u8 = 52;
/// Number of pixel rows on one readout chip.
pub const ROC_NUM_ROWS: u8 = 80;
/// Full pixel matrix size of one readout chip.
pub const ROC_NUM_PIXELS: usize = 4160;

/// Largest value a per-pixel trim offset can carry (4 bits).
pub const TRIM_MAX: u8 = 15;

/// Maximum number of (signal, delay) entries the pattern generator can hold.
pub const PG_MAX_ENTRIES: usize = 256;

/// Size of the testboard-side acquisition FIFO in bytes.
pub const DAQ_BUFFER_SIZE: u32 = 50_000_000;
/// Fraction of the acquisition buffer that may fill up before the session
/// reports backpressure.
pub const DAQ_FILL_LIMIT: f64 = 0.9;

/// Upper caps for the programmable power limits.
pub const VA_LIMIT: f64 = 2.5;
pub const VD_LIMIT: f64 = 3.0;
pub const IA_LIMIT: f64 = 3.0;
pub const ID_LIMIT: f64 = 3.0;
/// Power limits below this are considered a configuration mistake.
pub const POWER_MINIMUM: f64 = 0.01;
