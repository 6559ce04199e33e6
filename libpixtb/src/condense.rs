use fxhash::FxHashMap;

use super::events::Event;

/// Per-pixel statistic computed when collapsing repeated triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// Count the number of triggers a pixel responded to.
    Efficiency,
    /// Running mean and variance of the pixel's analog response.
    PulseHeight,
}

/// Running Welford accumulator for one pixel.
#[derive(Debug, Clone, Copy)]
struct Moments {
    count: u32,
    mean: f64,
    m2: f64,
}

impl Moments {
    fn first(value: f64) -> Self {
        Moments {
            count: 1,
            mean: value,
            m2: 0.0,
        }
    }

    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample variance; a single observation carries no spread.
    fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }
}

/// Collapse a flat event stream into one aggregated event per block of
/// `triggers` consecutive events.
///
/// Pixels absent from some triggers of a block contribute nothing to the
/// mean; in efficiency mode their occurrence count simply stays lower.
/// Output pixel order is first-seen order within the block. A stream whose
/// length is not a multiple of the trigger count cannot be aggregated and
/// yields an empty result.
pub fn condense_triggers(data: Vec<Event>, triggers: u16, statistic: Statistic) -> Vec<Event> {
    let block_len = triggers as usize;
    if block_len == 0 || data.len() % block_len != 0 {
        spdlog::critical!(
            "Data size {} does not correspond to {} triggers, aborting data processing",
            data.len(),
            triggers
        );
        return Vec::new();
    }

    let mut packed = Vec::with_capacity(data.len() / block_len);
    let mut events = data.into_iter();

    while events.len() > 0 {
        let mut condensed = Event::default();
        // Position of each seen pixel in the output event, and its running
        // statistics.
        let mut seen: FxHashMap<(u8, u8, u8), usize> = FxHashMap::default();
        let mut moments: Vec<Moments> = Vec::new();

        for event in events.by_ref().take(block_len) {
            for px in event.pixels {
                match seen.get(&px.position()) {
                    Some(&slot) => match statistic {
                        Statistic::Efficiency => condensed.pixels[slot].value += 1.0,
                        Statistic::PulseHeight => moments[slot].update(px.value),
                    },
                    None => {
                        seen.insert(px.position(), condensed.pixels.len());
                        let mut first = px;
                        match statistic {
                            Statistic::Efficiency => first.value = 1.0,
                            Statistic::PulseHeight => moments.push(Moments::first(first.value)),
                        }
                        condensed.pixels.push(first);
                    }
                }
            }
        }

        if statistic == Statistic::PulseHeight {
            for (px, stats) in condensed.pixels.iter_mut().zip(&moments) {
                px.value = stats.mean;
                px.variance = Some(stats.variance());
            }
        }
        packed.push(condensed);
    }

    packed
}
