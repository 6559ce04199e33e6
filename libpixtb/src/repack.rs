use fxhash::FxHashMap;

use super::condense::{condense_triggers, Statistic};
use super::constants::{ROC_NUM_COLS, ROC_NUM_ROWS};
use super::events::{Event, Pixel};
use super::loops::TestFlags;

/// Out-of-order pixels are flagged with this value instead of being dropped.
const INVALID_VALUE: f64 = -1.0;

fn bucket_count(min: u8, max: u8, step: u8) -> usize {
    (max - min) as usize / step.max(1) as usize + 1
}

fn sort_pixels(pixels: &mut [Pixel]) {
    pixels.sort_by_key(Pixel::position);
}

/// Flatten a condensed stream into one ordered pixel list.
///
/// With [`TestFlags::CHECK_ORDER`] the events are expected to arrive in
/// strict raster order (row fastest, one position per event); violators are
/// flagged with the invalid sentinel. Unless [`TestFlags::NOSORT`] is given,
/// the result is sorted by (chip, column, row).
pub fn repack_map(
    data: Vec<Event>,
    triggers: u16,
    flags: TestFlags,
    statistic: Statistic,
) -> Vec<Pixel> {
    spdlog::debug!("Map repack of {} data blocks", data.len());
    let packed = condense_triggers(data, triggers, statistic);

    let mut expected_column: u8 = 0;
    let mut expected_row: u8 = 0;
    let mut result = Vec::new();
    for event in packed {
        for mut px in event.pixels {
            if flags.contains(TestFlags::CHECK_ORDER)
                && (px.column != expected_column || px.row != expected_row)
            {
                spdlog::error!(
                    "This pixel doesn't belong here: {}. Expected [{},{}]",
                    px,
                    expected_column,
                    expected_row
                );
                px.value = INVALID_VALUE;
            }
            result.push(px);
        }

        if flags.contains(TestFlags::CHECK_ORDER) {
            expected_row += 1;
            if expected_row >= ROC_NUM_ROWS {
                expected_row = 0;
                expected_column += 1;
            }
            if expected_column >= ROC_NUM_COLS {
                expected_row = 0;
                expected_column = 0;
            }
        }
    }

    if !flags.contains(TestFlags::NOSORT) {
        sort_pixels(&mut result);
    }
    result
}

/// Distribute a condensed stream into per-DAC-setting buckets.
///
/// Buckets are filled round-robin in sweep order, cycling back to the first
/// setting when the stream spans several sweep repetitions. The condensed
/// stream length must be a non-zero multiple of the bucket count.
pub fn repack_dac_scan(
    data: Vec<Event>,
    step: u8,
    min: u8,
    max: u8,
    triggers: u16,
    statistic: Statistic,
) -> Vec<(u8, Vec<Pixel>)> {
    let packed = condense_triggers(data, triggers, statistic);
    let buckets = bucket_count(min, max, step);
    if packed.is_empty() || packed.len() % buckets != 0 {
        spdlog::critical!(
            "Data size not as expected: {} data blocks do not fit {} DAC values",
            packed.len(),
            buckets
        );
        return Vec::new();
    }
    spdlog::debug!(
        "Packing DAC range {} - {} (step size {}), data has {} entries",
        min,
        max,
        step,
        packed.len()
    );

    let mut result: Vec<(u8, Vec<Pixel>)> = (min..=max)
        .step_by(step.max(1) as usize)
        .map(|dac| (dac, Vec::new()))
        .collect();
    for (index, event) in packed.into_iter().enumerate() {
        result[index % buckets].1.extend(event.pixels);
    }
    result
}

/// Distribute a condensed stream into nested (DAC1, DAC2) buckets.
///
/// The first register is the outer scan dimension and varies slowest; the
/// bucket index is `outer × inner_count + inner`.
#[allow(clippy::too_many_arguments)]
pub fn repack_dacdac_scan(
    data: Vec<Event>,
    step1: u8,
    min1: u8,
    max1: u8,
    step2: u8,
    min2: u8,
    max2: u8,
    triggers: u16,
    statistic: Statistic,
) -> Vec<(u8, u8, Vec<Pixel>)> {
    let packed = condense_triggers(data, triggers, statistic);
    let buckets1 = bucket_count(min1, max1, step1);
    let buckets2 = bucket_count(min2, max2, step2);
    let buckets = buckets1 * buckets2;
    if packed.is_empty() || packed.len() % buckets != 0 {
        spdlog::critical!(
            "Data size not as expected: {} data blocks do not fit {} DAC pairs",
            packed.len(),
            buckets
        );
        return Vec::new();
    }
    spdlog::debug!(
        "Packing DAC range [{} - {}, step size {}]x[{} - {}, step size {}], data has {} entries",
        min1,
        max1,
        step1,
        min2,
        max2,
        step2,
        packed.len()
    );

    let mut result: Vec<(u8, u8, Vec<Pixel>)> = Vec::with_capacity(buckets);
    for dac1 in (min1..=max1).step_by(step1.max(1) as usize) {
        for dac2 in (min2..=max2).step_by(step2.max(1) as usize) {
            result.push((dac1, dac2, Vec::new()));
        }
    }
    for (index, event) in packed.into_iter().enumerate() {
        result[index % buckets].2.extend(event.pixels);
    }
    result
}

/// The efficiency count a pixel has to cross to be considered over
/// threshold.
fn threshold_count(triggers: u16, level: u8) -> f64 {
    (f64::from(triggers) * f64::from(level) / 100.0).ceil()
}

/// Extract a per-pixel threshold from a one-dimensional efficiency scan.
///
/// The DAC-bucketed efficiency map is traversed forward in rising-edge mode
/// and backward otherwise. Starting from the expected saturated end and
/// searching backward captures the last crossing even when the efficiency
/// jumps from zero to maximum without intermediate values. A pixel's
/// recorded threshold moves only on a positive-going efficiency step that
/// comes strictly closer to the target count.
#[allow(clippy::too_many_arguments)]
pub fn repack_threshold_map(
    data: Vec<Event>,
    step: u8,
    min: u8,
    max: u8,
    level: u8,
    triggers: u16,
    flags: TestFlags,
) -> Vec<Pixel> {
    let threshold = threshold_count(triggers, level);
    spdlog::debug!(
        "Scanning for threshold level {}, {} edge",
        threshold,
        if flags.contains(TestFlags::RISING_EDGE) {
            "rising"
        } else {
            "falling"
        }
    );

    let mut packed_dac = repack_dac_scan(data, step, min, max, triggers, Statistic::Efficiency);
    if !flags.contains(TestFlags::RISING_EDGE) {
        packed_dac.reverse();
    }

    let mut result: Vec<Pixel> = Vec::new();
    let mut slots: FxHashMap<(u8, u8, u8), usize> = FxHashMap::default();
    let mut last_efficiency: FxHashMap<(u8, u8, u8), f64> = FxHashMap::default();

    for (dac, pixels) in packed_dac {
        for px in pixels {
            match slots.get(&px.position()) {
                Some(&slot) => {
                    let previous = last_efficiency[&px.position()];
                    let delta_old = (previous - threshold).abs();
                    let delta_new = (px.value - threshold).abs();
                    if px.value - previous > 0.0 && delta_new < delta_old {
                        result[slot].value = f64::from(dac);
                        last_efficiency.insert(px.position(), px.value);
                    }
                }
                None => {
                    slots.insert(px.position(), result.len());
                    last_efficiency.insert(px.position(), px.value);
                    let mut first = px;
                    first.value = f64::from(dac);
                    result.push(first);
                }
            }
        }
    }

    if !flags.contains(TestFlags::NOSORT) {
        sort_pixels(&mut result);
    }
    result
}

/// Extract per-pixel thresholds along the first register of a
/// two-dimensional efficiency scan, one result bucket per second-register
/// setting.
#[allow(clippy::too_many_arguments)]
pub fn repack_threshold_dac_scan(
    data: Vec<Event>,
    step1: u8,
    min1: u8,
    max1: u8,
    step2: u8,
    min2: u8,
    max2: u8,
    level: u8,
    triggers: u16,
    flags: TestFlags,
) -> Vec<(u8, Vec<Pixel>)> {
    let threshold = threshold_count(triggers, level);
    spdlog::debug!(
        "Scanning for threshold level {}, {} edge",
        threshold,
        if flags.contains(TestFlags::RISING_EDGE) {
            "rising"
        } else {
            "falling"
        }
    );

    let mut packed = repack_dacdac_scan(
        data,
        step1,
        min1,
        max1,
        step2,
        min2,
        max2,
        triggers,
        Statistic::Efficiency,
    );
    if !flags.contains(TestFlags::RISING_EDGE) {
        packed.reverse();
    }

    let mut result: Vec<(u8, Vec<Pixel>)> = Vec::new();
    let mut buckets: FxHashMap<u8, usize> = FxHashMap::default();
    let mut slots: FxHashMap<(u8, (u8, u8, u8)), usize> = FxHashMap::default();
    let mut last_efficiency: FxHashMap<(u8, (u8, u8, u8)), f64> = FxHashMap::default();

    for (dac1, dac2, pixels) in packed {
        for px in pixels {
            let bucket = *buckets.entry(dac2).or_insert_with(|| {
                result.push((dac2, Vec::new()));
                result.len() - 1
            });
            let key = (dac2, px.position());
            match slots.get(&key) {
                Some(&slot) => {
                    let previous = last_efficiency[&key];
                    let delta_old = (previous - threshold).abs();
                    let delta_new = (px.value - threshold).abs();
                    if px.value - previous > 0.0 && delta_new < delta_old {
                        result[bucket].1[slot].value = f64::from(dac1);
                        last_efficiency.insert(key, px.value);
                    }
                }
                None => {
                    slots.insert(key, result[bucket].1.len());
                    last_efficiency.insert(key, px.value);
                    let mut first = px;
                    first.value = f64::from(dac1);
                    result[bucket].1.push(first);
                }
            }
        }
    }

    if !flags.contains(TestFlags::NOSORT) {
        result.sort_by_key(|(dac2, _)| *dac2);
        for (_, pixels) in &mut result {
            sort_pixels(pixels);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_event(column: u8) -> Event {
        Event {
            pixels: vec![Pixel::new(0, column, 0, 1.0)],
            ..Event::default()
        }
    }

    /// Raw stream of an efficiency scan: for every scan point, `triggers`
    /// events of which the pixel responds in `hits` of them.
    fn efficiency_stream(points: &[u16], triggers: u16) -> Vec<Event> {
        let mut data = Vec::new();
        for &hits in points {
            for trigger in 0..triggers {
                let pixels = if trigger < hits {
                    vec![Pixel::new(0, 7, 8, 1.0)]
                } else {
                    Vec::new()
                };
                data.push(Event {
                    pixels,
                    ..Event::default()
                });
            }
        }
        data
    }

    #[test]
    fn test_dac_scan_distributes_round_robin() {
        // 8 condensed blocks over 4 buckets: two sweep repetitions.
        let data: Vec<Event> = (0..8).map(marker_event).collect();
        let result = repack_dac_scan(data, 1, 0, 3, 1, Statistic::Efficiency);
        assert_eq!(result.len(), 4);
        for (bucket, (dac, pixels)) in result.iter().enumerate() {
            assert_eq!(*dac, bucket as u8);
            let columns: Vec<u8> = pixels.iter().map(|px| px.column).collect();
            assert_eq!(columns, vec![bucket as u8, bucket as u8 + 4]);
        }
    }

    #[test]
    fn test_dac_scan_rejects_mismatched_length() {
        let data: Vec<Event> = (0..6).map(marker_event).collect();
        assert!(repack_dac_scan(data, 1, 0, 3, 1, Statistic::Efficiency).is_empty());
    }

    #[test]
    fn test_dac_scan_honors_step_size() {
        let data: Vec<Event> = (0..3).map(marker_event).collect();
        let result = repack_dac_scan(data, 2, 10, 14, 1, Statistic::Efficiency);
        let dacs: Vec<u8> = result.iter().map(|(dac, _)| *dac).collect();
        assert_eq!(dacs, vec![10, 12, 14]);
    }

    #[test]
    fn test_dacdac_scan_nests_with_outer_slower() {
        let data: Vec<Event> = (0..4).map(marker_event).collect();
        let result = repack_dacdac_scan(data, 1, 0, 1, 1, 5, 6, 1, Statistic::Efficiency);
        let layout: Vec<(u8, u8, u8)> = result
            .iter()
            .map(|(dac1, dac2, pixels)| (*dac1, *dac2, pixels[0].column))
            .collect();
        assert_eq!(
            layout,
            vec![(0, 5, 0), (0, 6, 1), (1, 5, 2), (1, 6, 3)]
        );
    }

    #[test]
    fn test_map_flags_out_of_order_pixels() {
        let data = vec![
            Event {
                pixels: vec![Pixel::new(0, 0, 0, 5.0)],
                ..Event::default()
            },
            Event {
                pixels: vec![Pixel::new(0, 9, 9, 5.0)],
                ..Event::default()
            },
        ];
        let flags = TestFlags::CHECK_ORDER | TestFlags::NOSORT;
        let result = repack_map(data, 1, flags, Statistic::PulseHeight);
        assert_eq!(result[0].value, 5.0);
        // Second event should have carried pixel [0,1].
        assert_eq!(result[1].value, INVALID_VALUE);
    }

    #[test]
    fn test_map_sorts_by_chip_column_row() {
        let data = vec![Event {
            pixels: vec![
                Pixel::new(1, 0, 0, 1.0),
                Pixel::new(0, 4, 2, 1.0),
                Pixel::new(0, 1, 9, 1.0),
            ],
            ..Event::default()
        }];
        let result = repack_map(data, 1, TestFlags::default(), Statistic::Efficiency);
        let positions: Vec<_> = result.iter().map(|px| px.position()).collect();
        assert_eq!(positions, vec![(0, 1, 9), (0, 4, 2), (1, 0, 0)]);
    }

    #[test]
    fn test_threshold_map_falling_edge_picks_transition() {
        // Efficiency falls with the DAC: 100,100,40,0,0 over DACs 10..14.
        // Scanning backward from the empty end, the first pixel sighting is
        // at DAC 12 with 40/100 hits, closest to the 50% target.
        let data = efficiency_stream(&[100, 100, 40, 0, 0], 100);
        let result = repack_threshold_map(data, 1, 10, 14, 50, 100, TestFlags::default());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].value, 12.0);
    }

    #[test]
    fn test_threshold_map_rising_edge_tracks_closest_crossing() {
        // Efficiency creeps up towards the target; each step is closer, so
        // the recorded threshold follows until the last crossing.
        let data = efficiency_stream(&[1, 2, 4, 10, 10], 100);
        let result = repack_threshold_map(data, 1, 10, 14, 5, 100, TestFlags::RISING_EDGE);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].value, 12.0);
    }

    #[test]
    fn test_threshold_dac_scan_buckets_by_second_dac() {
        // Outer register is swept for thresholds, inner register selects the
        // bucket. dac2=5 sits over threshold from the start; dac2=6 creeps
        // up and settles at dac1=12.
        let mut data = Vec::new();
        let hits_for = |dac1: u8, dac2: u8| -> u16 {
            match (dac1, dac2) {
                (_, 5) => 10,
                (10, 6) => 1,
                (11, 6) => 2,
                (12, 6) => 4,
                _ => unreachable!(),
            }
        };
        for dac1 in 10..=12u8 {
            for dac2 in 5..=6u8 {
                let hits = hits_for(dac1, dac2);
                for trigger in 0..10u16 {
                    let pixels = if trigger < hits {
                        vec![Pixel::new(0, 7, 8, 1.0)]
                    } else {
                        Vec::new()
                    };
                    data.push(Event {
                        pixels,
                        ..Event::default()
                    });
                }
            }
        }
        let result = repack_threshold_dac_scan(
            data,
            1,
            10,
            12,
            1,
            5,
            6,
            50,
            10,
            TestFlags::RISING_EDGE,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, 5);
        assert_eq!(result[0].1[0].value, 10.0);
        assert_eq!(result[1].0, 6);
        assert_eq!(result[1].1[0].value, 12.0);
    }
}
