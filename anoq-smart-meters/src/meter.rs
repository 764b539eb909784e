//! The simulated smart meter: a household with a random set of devices
//! whose consumption is advanced one timestep at a time by a background
//! thread, and measured by the query select functions.

use std::sync::{Arc, Mutex};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use anoq_core::data_source::DataSource;

use crate::{
    device::{Device, DeviceConfig},
    fixed_point::FixedPoint,
    UsageVector, MEASURE_CONSUMPTION, MEASURE_DAILY_CONSUMPTION,
    MEASURE_SHIFTABLE_CONSUMPTION, NO_FILTER, SIMULATE_PROJECTED_USAGE, SUM_VECTORS,
};

const MINUTES_PER_DAY: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomeLevel {
    Poor,
    Average,
    Rich,
}

impl IncomeLevel {
    /// Wealthier homes run their devices more.
    fn usage_factor(self) -> f64 {
        match self {
            IncomeLevel::Poor => 0.8,
            IncomeLevel::Average => 1.0,
            IncomeLevel::Rich => 1.3,
        }
    }

    /// Draws an income level from the configured distribution of poor and
    /// rich homes (everyone else is average).
    pub fn generate<G: Rng>(percent_poor: u32, percent_rich: u32, rng: &mut G) -> Self {
        let roll = rng.gen_range(0..100);
        if roll < percent_poor {
            IncomeLevel::Poor
        } else if roll < percent_poor + percent_rich {
            IncomeLevel::Rich
        } else {
            IncomeLevel::Average
        }
    }
}

pub struct SimSmartMeter {
    income_level: IncomeLevel,
    devices: Vec<Device>,
    timestep_min: u32,
    current_timestep: u32,
    consumption: Vec<FixedPoint>,
    shiftable_consumption: Vec<FixedPoint>,
    rng: StdRng,
}

impl SimSmartMeter {
    pub fn new(income_level: IncomeLevel, devices: Vec<Device>, timestep_min: u32) -> Self {
        Self {
            income_level,
            devices,
            timestep_min,
            current_timestep: 0,
            consumption: Vec::new(),
            shiftable_consumption: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Builds a random home: an income level and a device set drawn from
    /// the configured saturations.
    pub fn generate<G: Rng>(
        config: &DeviceConfig,
        percent_poor: u32,
        percent_rich: u32,
        timestep_min: u32,
        rng: &mut G,
    ) -> Self {
        let income_level = IncomeLevel::generate(percent_poor, percent_rich, rng);
        let devices = config.pick_home_devices(rng);
        trace!(?income_level, devices = devices.len(), "generated a home");
        Self::new(income_level, devices, timestep_min)
    }

    fn hour_of_day(&self, timestep: u32) -> usize {
        ((timestep * self.timestep_min / 60) % 24) as usize
    }

    fn is_weekend(&self, timestep: u32) -> bool {
        let day = timestep * self.timestep_min / MINUTES_PER_DAY;
        day % 7 >= 5
    }

    fn timesteps_per_day(&self) -> usize {
        (MINUTES_PER_DAY / self.timestep_min) as usize
    }

    /// One device's expected usage in one timestep, and whether the device
    /// started a run.
    fn device_usage<G: Rng>(
        device: &Device,
        hour: usize,
        weekend: bool,
        timestep_min: u32,
        usage_factor: f64,
        rng: &mut G,
    ) -> FixedPoint {
        let (frequency, hourly) = if weekend {
            (device.weekend_frequency, &device.weekend_hourly_probability)
        } else {
            (device.weekday_frequency, &device.weekday_hourly_probability)
        };
        let hourly_probability = hourly.get(hour).copied().unwrap_or(0.0);
        // A device with k activations per day spreads them over the hours
        // in proportion to its hourly start profile.
        let start_probability =
            (frequency * hourly_probability * usage_factor * f64::from(timestep_min) / 60.0)
                .clamp(0.0, 1.0);

        let mut usage = device.standby_load;
        if !device.load_per_cycle.is_empty() && rng.gen_bool(start_probability) {
            // Average the run's cycles into this timestep rather than
            // tracking per-device run state; at the aggregation grain the
            // difference washes out.
            let total_load: FixedPoint = device.load_per_cycle.iter().copied().sum();
            let total_minutes: u32 = device.time_per_cycle.iter().sum::<u32>().max(1);
            usage += FixedPoint::from_f64(
                total_load.to_f64() * f64::from(timestep_min.min(total_minutes))
                    / f64::from(total_minutes),
            );
        }
        usage
    }

    /// Simulates one timestep of energy usage and appends to the usage
    /// vectors.
    pub fn simulate_usage_timestep(&mut self) {
        let hour = self.hour_of_day(self.current_timestep);
        let weekend = self.is_weekend(self.current_timestep);
        let usage_factor = self.income_level.usage_factor();

        let mut total = FixedPoint::ZERO;
        let mut shiftable = FixedPoint::ZERO;
        for device in &self.devices {
            let usage = Self::device_usage(
                device,
                hour,
                weekend,
                self.timestep_min,
                usage_factor,
                &mut self.rng,
            );
            total += usage;
            // Multi-cycle devices can be interrupted between cycles, so
            // their load is shiftable.
            if device.load_per_cycle.len() > 1 {
                shiftable += usage;
            }
        }
        self.consumption.push(total);
        self.shiftable_consumption.push(shiftable);
        self.current_timestep += 1;
    }

    fn window_timesteps(&self, window_minutes: u32) -> usize {
        ((window_minutes + self.timestep_min - 1) / self.timestep_min) as usize
    }

    fn sum_of_last(values: &[FixedPoint], count: usize) -> FixedPoint {
        let start = values.len().saturating_sub(count);
        values[start..].iter().copied().sum()
    }

    /// Total consumption over the last `window_minutes`.
    pub fn measure_consumption(&self, window_minutes: u32) -> FixedPoint {
        Self::sum_of_last(&self.consumption, self.window_timesteps(window_minutes))
    }

    /// Shiftable consumption over the last `window_minutes`.
    pub fn measure_shiftable_consumption(&self, window_minutes: u32) -> FixedPoint {
        Self::sum_of_last(
            &self.shiftable_consumption,
            self.window_timesteps(window_minutes),
        )
    }

    /// Consumption over the last simulated day.
    pub fn measure_daily_consumption(&self) -> FixedPoint {
        Self::sum_of_last(&self.consumption, self.timesteps_per_day())
    }

    /// Projects usage over the next `window_minutes` by running the
    /// simulation forward on a fork of the current state.
    pub fn simulate_projected_usage(&mut self, window_minutes: u32) -> Vec<FixedPoint> {
        let usage_factor = self.income_level.usage_factor();
        let mut projection = Vec::with_capacity(self.window_timesteps(window_minutes));
        for offset in 0..self.window_timesteps(window_minutes) as u32 {
            let timestep = self.current_timestep + offset;
            let hour = self.hour_of_day(timestep);
            let weekend = self.is_weekend(timestep);
            let mut total = FixedPoint::ZERO;
            for device in &self.devices {
                total += Self::device_usage(
                    device,
                    hour,
                    weekend,
                    self.timestep_min,
                    usage_factor,
                    &mut self.rng,
                );
            }
            projection.push(total);
        }
        projection
    }
}

fn window_arg(args: &[u8]) -> u32 {
    // The window argument is a 4-byte little-endian minute count; a query
    // without one measures over a single hour.
    args.get(..4)
        .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap()))
        .unwrap_or(60)
}

/// Binds a shared meter to the query function tables. The meter keeps
/// simulating on its own thread; select functions read whatever it has
/// accumulated when the query arrives.
pub fn meter_data_source(meter: Arc<Mutex<SimSmartMeter>>) -> DataSource<UsageVector> {
    let measure = meter.clone();
    let measure_shiftable = meter.clone();
    let measure_daily = meter.clone();
    let project = meter;
    DataSource::new()
        .with_select(MEASURE_CONSUMPTION, move |args| {
            let meter = measure.lock().unwrap();
            UsageVector(vec![meter.measure_consumption(window_arg(args))])
        })
        .with_select(MEASURE_SHIFTABLE_CONSUMPTION, move |args| {
            let meter = measure_shiftable.lock().unwrap();
            UsageVector(vec![meter.measure_shiftable_consumption(window_arg(args))])
        })
        .with_select(MEASURE_DAILY_CONSUMPTION, move |_| {
            let meter = measure_daily.lock().unwrap();
            UsageVector(vec![meter.measure_daily_consumption()])
        })
        .with_select(SIMULATE_PROJECTED_USAGE, move |args| {
            let mut meter = project.lock().unwrap();
            UsageVector(meter.simulate_projected_usage(window_arg(args)))
        })
        .with_filter(NO_FILTER, |_, _| true)
        .with_aggregate(SUM_VECTORS, |records, _| {
            let mut sum: Vec<FixedPoint> = Vec::new();
            for UsageVector(values) in records {
                if values.len() > sum.len() {
                    sum.resize(values.len(), FixedPoint::ZERO);
                }
                for (total, value) in sum.iter_mut().zip(values) {
                    *total += *value;
                }
            }
            UsageVector(sum)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        Device {
            name: "heater".into(),
            load_per_cycle: vec![FixedPoint::from_f64(1200.0), FixedPoint::from_f64(600.0)],
            time_per_cycle: vec![30, 30],
            standby_load: FixedPoint::from_f64(2.0),
            weekday_frequency: 2.0,
            weekend_frequency: 2.0,
            weekday_hourly_probability: vec![0.5; 24],
            weekend_hourly_probability: vec![0.5; 24],
        }
    }

    fn test_meter() -> SimSmartMeter {
        SimSmartMeter::new(IncomeLevel::Average, vec![test_device()], 10)
    }

    #[test]
    fn consumption_accumulates_per_timestep() {
        let mut meter = test_meter();
        for _ in 0..12 {
            meter.simulate_usage_timestep();
        }
        // Standby load alone guarantees nonzero usage in every timestep.
        assert!(meter.measure_consumption(120) > FixedPoint::ZERO);
        assert!(meter.measure_consumption(60) <= meter.measure_consumption(120));
    }

    #[test]
    fn daily_measurement_covers_one_day() {
        let mut meter = test_meter();
        for _ in 0..2 * 144 {
            meter.simulate_usage_timestep();
        }
        assert_eq!(
            meter.measure_daily_consumption(),
            meter.measure_consumption(1440)
        );
    }

    #[test]
    fn projection_has_one_entry_per_timestep() {
        let mut meter = test_meter();
        assert_eq!(meter.simulate_projected_usage(60).len(), 6);
    }

    #[test]
    fn data_source_dispatches_all_opcodes() {
        let meter = Arc::new(Mutex::new(test_meter()));
        meter.lock().unwrap().simulate_usage_timestep();
        let source = meter_data_source(meter);

        let window = 60u32.to_le_bytes();
        for opcode in [
            MEASURE_CONSUMPTION,
            MEASURE_SHIFTABLE_CONSUMPTION,
            MEASURE_DAILY_CONSUMPTION,
            SIMULATE_PROJECTED_USAGE,
        ] {
            assert!(source.select(opcode, &window).is_some(), "opcode {}", opcode);
        }
        assert_eq!(source.filter(NO_FILTER, &UsageVector(vec![]), &[]), Some(true));
    }

    #[test]
    fn vector_sum_pads_to_the_longest_record() {
        let source = meter_data_source(Arc::new(Mutex::new(test_meter())));
        let combined = source
            .aggregate(
                SUM_VECTORS,
                &[
                    UsageVector(vec![FixedPoint::from_f64(1.0)]),
                    UsageVector(vec![FixedPoint::from_f64(2.0), FixedPoint::from_f64(3.0)]),
                ],
                &[],
            )
            .unwrap();
        assert_eq!(
            combined,
            UsageVector(vec![FixedPoint::from_f64(3.0), FixedPoint::from_f64(3.0)])
        );
    }
}
