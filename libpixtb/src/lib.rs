//! # libpixtb
//!
//! libpixtb is the control and acquisition engine for a modular pixel
//! detector instrument: a testboard driving one or more detector modules,
//! each made of token-bit-manager (TBM) cores and readout chips (ROCs)
//! carrying a 52x80 pixel matrix.
//!
//! The engine
//!
//! - builds and validates a structured device configuration (the "DUT"),
//! - drives parametric calibration scans by expanding one logical test into
//!   the most efficient sequence of hardware calls for the current
//!   chip/pixel enablement,
//! - manages a buffered, triggerable acquisition session against the
//!   hardware FIFO, with backpressure monitoring,
//! - reduces raw per-trigger event streams into statistically aggregated
//!   per-pixel results: efficiency counts, pulse-height mean/variance, DAC
//!   scan maps and extracted thresholds.
//!
//! Everything around the engine is an external collaborator: the electrical
//! protocol of the testboard lives behind the [`hal::Hal`] trait, register
//! and signal names are resolved through a [`registry::Registry`] handed in
//! at construction, and configuration-file parsing, plotting and user
//! interaction belong to the embedding application. The engine renders
//! nothing and writes no files; it consumes the hardware interface and
//! produces structured numeric results.
//!
//! ## Usage
//!
//! The embedding application implements [`hal::Hal`] for its transport,
//! then drives an [`instrument::Instrument`]:
//!
//! ```text
//! let mut instrument = Instrument::new(my_hal);
//! instrument.init_testboard(&delays, &power, &pattern)?;
//! instrument.init_dut(hub, "tbm08b", &tbm_regs, "psi46dig", &dacs, &pixels)?;
//! let map = instrument.efficiency_map(TestFlags::default(), 10);
//! ```
//!
//! Scan operations degrade instead of panicking: recoverable conditions
//! (unknown register names, out-of-range values, an empty result stream,
//! decoder errors) are logged through `spdlog` and produce clamped values,
//! skipped entries or empty results, so a multi-hour calibration campaign is
//! never aborted over a transient condition. Configuration mistakes
//! (malformed pixel lists, an oversized pattern generator program,
//! insufficient power limits) fail fast with an [`error::ConfigError`].
//!
//! ## Concurrency model
//!
//! The engine is single-threaded and synchronous; every hardware call blocks
//! until the instrument responds. The only shared resource is the
//! hardware-side acquisition FIFO, guarded by a 90% fill threshold: callers
//! poll [`instrument::Instrument::daq_status`] and drain on backpressure.
//! Configuration must not be mutated while a session is running.

pub mod condense;
mod config;
pub mod constants;
pub mod daq;
pub mod dut;
pub mod error;
pub mod events;
pub mod hal;
pub mod instrument;
pub mod loops;
pub mod registry;
pub mod repack;
