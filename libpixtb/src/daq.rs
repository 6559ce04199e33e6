//! Buffered, triggerable acquisition sessions.
//!
//! A session moves the instrument from Idle to Running and back: opening the
//! readout buffer, arming the configured pixels and attaching the columns on
//! start, then unwinding all of it on stop. While running, the caller polls
//! [`Instrument::daq_status`] and is expected to halt triggering and drain
//! once the buffer reports backpressure.

use human_bytes::human_bytes;

use super::constants::DAQ_FILL_LIMIT;
use super::error::DaqError;
use super::events::{Event, RawEvent};
use super::hal::Hal;
use super::instrument::Instrument;
use super::loops;
use super::registry::DESER160_PHASE;

/// Health of a running acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqStatus {
    NotRunning,
    Ok { fill_percent: u8 },
    /// Buffer occupancy crossed the backpressure threshold; halt triggering
    /// and drain before continuing.
    AlmostFull { fill_percent: u8 },
}

impl DaqStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DaqStatus::Ok { .. })
    }

    pub fn fill_percent(&self) -> u8 {
        match self {
            DaqStatus::NotRunning => 0,
            DaqStatus::Ok { fill_percent } => *fill_percent,
            DaqStatus::AlmostFull { fill_percent } => *fill_percent,
        }
    }
}

impl<H: Hal> Instrument<H> {
    /// Open a new acquisition session.
    ///
    /// Clears leftovers of any earlier session, applies the configured
    /// mask/trim state, arms the calibrate bits of all enabled pixels,
    /// attaches all columns to the readout and opens the buffer.
    pub fn daq_start(&mut self) -> Result<(), DaqError> {
        if !self.status() {
            return Err(DaqError::NotReady);
        }
        if self.daq_running {
            return Err(DaqError::AlreadyRunning);
        }

        self.hal.daq_clear();
        spdlog::debug!("Starting new DAQ session...");

        loops::trim_device(&mut self.hal, &self.dut);
        loops::set_calibrate_bits(&mut self.hal, &self.dut, true);

        let addresses = self.dut.all_roc_addresses();
        for i2c in addresses {
            self.hal.all_columns_enable(i2c, true);
        }

        let deser_phase = self
            .dut
            .sig_delays
            .get(&DESER160_PHASE)
            .copied()
            .unwrap_or(0);
        spdlog::info!(
            "Opening acquisition buffer of {}",
            human_bytes(f64::from(self.daq_buffer_size))
        );
        self.hal
            .daq_start(deser_phase, self.dut.n_enabled_tbms(), self.daq_buffer_size);

        self.daq_running = true;
        Ok(())
    }

    pub fn daq_running(&self) -> bool {
        self.daq_running
    }

    /// Session health and buffer occupancy.
    ///
    /// Reports not-ok once the buffer has filled past the backpressure
    /// threshold, even though the session keeps running; the caller halts
    /// the trigger loop, drains, and resumes.
    pub fn daq_status(&mut self) -> DaqStatus {
        if !self.daq_running {
            spdlog::debug!("DAQ not running!");
            return DaqStatus::NotRunning;
        }

        let filled = self.hal.daq_buffer_fill();
        let fill_percent =
            (f64::from(filled) / f64::from(self.daq_buffer_size) * 100.0) as u8;
        if f64::from(filled) > DAQ_FILL_LIMIT * f64::from(self.daq_buffer_size) {
            spdlog::warn!("DAQ buffer about to overflow!");
            return DaqStatus::AlmostFull { fill_percent };
        }

        spdlog::debug!(
            "Everything alright, buffer size {}/{}",
            filled,
            self.daq_buffer_size
        );
        DaqStatus::Ok { fill_percent }
    }

    /// Send a burst of triggers. Returns the effective trigger period, 0 if
    /// the session is not healthy.
    pub fn daq_trigger(&mut self, count: u32, period: u16) -> u16 {
        if !self.daq_status().is_ok() {
            return 0;
        }
        let period = self.clamp_trigger_period(period);
        self.hal.daq_trigger(count, period);
        period
    }

    /// Start continuous self-triggering. Returns the effective trigger
    /// period, 0 if the session is not healthy.
    pub fn daq_trigger_loop(&mut self, period: u16) -> u16 {
        if !self.daq_status().is_ok() {
            return 0;
        }
        let period = self.clamp_trigger_period(period);
        self.hal.daq_trigger_loop(period);
        period
    }

    /// Halt continuous self-triggering; the session stays open.
    pub fn daq_trigger_loop_halt(&mut self) {
        self.hal.daq_trigger_loop_halt();
    }

    /// Close the acquisition session: halt triggers, re-mask the device,
    /// clear the calibrate bits and detach the columns.
    pub fn daq_stop(&mut self) -> Result<(), DaqError> {
        if !self.status() {
            return Err(DaqError::NotReady);
        }
        if !self.daq_running {
            spdlog::info!("No DAQ running, not executing stop command.");
            return Err(DaqError::NotRunning);
        }

        self.daq_running = false;
        self.hal.daq_stop();

        loops::mask_device(&mut self.hal, &self.dut);
        loops::set_calibrate_bits(&mut self.hal, &self.dut, false);
        let addresses = self.dut.all_roc_addresses();
        for i2c in addresses {
            self.hal.all_columns_enable(i2c, false);
        }
        Ok(())
    }

    /// Drain all decoded events from the buffer and refresh the decoder
    /// error tally for this batch.
    pub fn daq_events(&mut self) -> Vec<Event> {
        let data = self.hal.daq_all_events();
        self.record_decoder_errors(&data);
        data
    }

    /// Drain all undecoded frames from the buffer.
    pub fn daq_raw_events(&mut self) -> Vec<RawEvent> {
        self.hal.daq_all_raw_events()
    }

    /// Drain the buffer as raw data words.
    pub fn daq_buffer(&mut self) -> Vec<u16> {
        self.hal.daq_buffer()
    }

    /// Pull the next decoded event, if the session is healthy.
    pub fn daq_next_event(&mut self) -> Option<Event> {
        if !self.daq_status().is_ok() {
            return None;
        }
        self.hal.daq_next_event()
    }

    /// Pull the next undecoded frame, if the session is healthy.
    pub fn daq_next_raw_event(&mut self) -> Option<RawEvent> {
        if !self.daq_status().is_ok() {
            return None;
        }
        self.hal.daq_next_raw_event()
    }

    /// The trigger period cannot undercut the pattern generator cycle time.
    fn clamp_trigger_period(&self, period: u16) -> u16 {
        if u32::from(period) < self.dut.pg_sum {
            let clamped = self.dut.pg_sum.min(u32::from(u16::MAX)) as u16;
            spdlog::warn!(
                "Loop period setting too small for configured pattern generator. Forcing loop delay to {} clk",
                clamped
            );
            spdlog::warn!("To suppress this warning supply a larger delay setting");
            return clamped;
        }
        period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::PixelConfig;
    use crate::hal::mock::{Call, MockHal};

    fn settings(entries: &[(&str, u8)]) -> Vec<(String, u8)> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    fn running_instrument() -> Instrument<MockHal> {
        let mut instrument = Instrument::new(MockHal::default());
        instrument
            .init_testboard(
                &settings(&[("deser160phase", 4)]),
                &[],
                &[("cal".to_string(), 101), ("trg;tok".to_string(), 0)],
            )
            .unwrap();
        instrument
            .init_dut(
                31,
                "tbm08b",
                &[],
                "psi46dig",
                &[settings(&[("vcal", 100)])],
                &[vec![PixelConfig::new(0, 0, 7), PixelConfig::new(1, 2, 8)]],
            )
            .unwrap();
        instrument.hal.calls.clear();
        instrument
    }

    #[test]
    fn test_daq_state_machine() {
        let mut instrument = running_instrument();
        assert!(!instrument.daq_running());
        instrument.daq_start().unwrap();
        assert!(instrument.daq_running());
        assert!(matches!(
            instrument.daq_start(),
            Err(DaqError::AlreadyRunning)
        ));
        instrument.daq_stop().unwrap();
        assert!(!instrument.daq_running());
        assert!(matches!(instrument.daq_stop(), Err(DaqError::NotRunning)));
    }

    #[test]
    fn test_daq_start_requires_ready_device() {
        let mut instrument = running_instrument();
        instrument.hal.ready = false;
        assert!(matches!(instrument.daq_start(), Err(DaqError::NotReady)));
    }

    #[test]
    fn test_daq_start_arms_the_device() {
        let mut instrument = running_instrument();
        instrument.daq_start().unwrap();
        assert_eq!(
            instrument.hal.calls,
            vec![
                Call::DaqClear,
                Call::RocTrimUnmask(0),
                Call::PixelSetCalibrate(0, 0, 0),
                Call::PixelSetCalibrate(0, 1, 2),
                Call::AllColumnsEnable(0, true),
                Call::DaqStart {
                    phase: 4,
                    cores: 0,
                    size: crate::constants::DAQ_BUFFER_SIZE,
                },
            ]
        );
    }

    #[test]
    fn test_daq_stop_unwinds_the_device() {
        let mut instrument = running_instrument();
        instrument.daq_start().unwrap();
        instrument.hal.calls.clear();
        instrument.daq_stop().unwrap();
        assert_eq!(
            instrument.hal.calls,
            vec![
                Call::DaqStop,
                Call::RocMaskAll(0),
                Call::RocClearCalibrate(0),
                Call::AllColumnsEnable(0, false),
            ]
        );
    }

    #[test]
    fn test_backpressure_over_ninety_percent() {
        let mut instrument = running_instrument();
        instrument.daq_start().unwrap();
        instrument.hal.buffer_fill = instrument.daq_buffer_size / 2;
        assert!(instrument.daq_status().is_ok());

        instrument.hal.buffer_fill =
            (f64::from(instrument.daq_buffer_size) * 0.95) as u32;
        let status = instrument.daq_status();
        assert!(!status.is_ok());
        assert!(matches!(status, DaqStatus::AlmostFull { .. }));
        assert_eq!(status.fill_percent(), 95);
        // Session itself keeps running.
        assert!(instrument.daq_running());
    }

    #[test]
    fn test_trigger_period_clamped_to_pattern_generator() {
        let mut instrument = running_instrument();
        // Program: (cal, 101) + (trg;tok, 0) -> 102 + 1 + 1 clocks.
        assert_eq!(instrument.dut().pg_sum, 104);
        instrument.daq_start().unwrap();
        assert_eq!(instrument.daq_trigger(10, 50), 104);
        assert!(instrument
            .hal
            .calls
            .contains(&Call::DaqTrigger(10, 104)));
        assert_eq!(instrument.daq_trigger_loop(500), 500);
        assert!(instrument.hal.calls.contains(&Call::DaqTriggerLoop(500)));
    }

    #[test]
    fn test_trigger_without_session_returns_zero() {
        let mut instrument = running_instrument();
        assert_eq!(instrument.daq_trigger(10, 500), 0);
        assert_eq!(instrument.daq_trigger_loop(500), 0);
        assert!(instrument.hal.calls.is_empty());
    }

    #[test]
    fn test_event_batch_updates_decoder_tally() {
        let mut instrument = running_instrument();
        instrument.daq_start().unwrap();
        instrument.hal.daq_events = vec![
            Event {
                decoder_errors: 2,
                ..Event::default()
            },
            Event {
                decoder_errors: 3,
                ..Event::default()
            },
        ];
        let events = instrument.daq_events();
        assert_eq!(events.len(), 2);
        assert_eq!(instrument.decoder_errors(), 5);

        // The next (clean) batch resets the tally.
        let events = instrument.daq_events();
        assert!(events.is_empty());
        assert_eq!(instrument.decoder_errors(), 0);
    }

    #[test]
    fn test_single_event_pull_requires_healthy_session() {
        let mut instrument = running_instrument();
        instrument.hal.daq_events = vec![Event::default()];
        assert!(instrument.daq_next_event().is_none());
        instrument.daq_start().unwrap();
        assert!(instrument.daq_next_event().is_some());
    }
}
