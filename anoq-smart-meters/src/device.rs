//! Household devices and their usage characteristics, loaded from the four
//! data-table files named on the client command line.
//!
//! Each table is one device per line: the device name up to the first tab,
//! then whitespace-separated numbers.
//!
//! - *power*: alternating (load, minutes) pairs describing the device's
//!   usage cycles, ending with the standby load.
//! - *frequency*: weekday and weekend activations per day.
//! - *probability*: an `wd`/`we` marker and 24 hourly start percentages.
//! - *saturation*: the percentage of households owning the device.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{anyhow, Context};
use rand::Rng;

use crate::fixed_point::FixedPoint;

#[derive(Debug, Clone, Default)]
pub struct Device {
    pub name: String,
    /// Load drawn in each cycle of a run, in watts.
    pub load_per_cycle: Vec<FixedPoint>,
    /// Duration of each cycle, in minutes.
    pub time_per_cycle: Vec<u32>,
    pub standby_load: FixedPoint,
    /// Activations per day.
    pub weekday_frequency: f64,
    pub weekend_frequency: f64,
    /// Probability of a run starting in each hour of the day.
    pub weekday_hourly_probability: Vec<f64>,
    pub weekend_hourly_probability: Vec<f64>,
}

/// The set of devices a simulated home can own, with their household
/// saturations.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub possible_devices: BTreeMap<String, Device>,
    /// Device name → saturation percentage.
    pub devices_saturation: BTreeMap<String, f64>,
}

fn split_name_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    // The device name runs up to the first tab; some names contain spaces.
    match line.split_once('\t') {
        Some((name, rest)) => Some((name.trim(), rest)),
        None => Some((line.trim(), "")),
    }
}

fn parse_numbers<T: std::str::FromStr>(fields: &str) -> Result<Vec<T>, anyhow::Error> {
    fields
        .split_whitespace()
        .map(|field| {
            field
                .parse::<T>()
                .map_err(|_| anyhow!("bad number {:?}", field))
        })
        .collect()
}

impl DeviceConfig {
    pub fn load(
        power_file: &Path,
        frequency_file: &Path,
        probability_file: &Path,
        saturation_file: &Path,
    ) -> anyhow::Result<Self> {
        let mut config = DeviceConfig::default();
        config.read_power_data(
            &fs::read_to_string(power_file)
                .with_context(|| format!("cannot read {}", power_file.display()))?,
        )?;
        config.read_frequency_data(
            &fs::read_to_string(frequency_file)
                .with_context(|| format!("cannot read {}", frequency_file.display()))?,
        )?;
        config.read_probability_data(
            &fs::read_to_string(probability_file)
                .with_context(|| format!("cannot read {}", probability_file.display()))?,
        )?;
        config.read_saturation_data(
            &fs::read_to_string(saturation_file)
                .with_context(|| format!("cannot read {}", saturation_file.display()))?,
        )?;
        Ok(config)
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut Device, anyhow::Error> {
        self.possible_devices
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown device {:?}", name))
    }

    fn read_power_data(&mut self, contents: &str) -> anyhow::Result<()> {
        for line in contents.lines() {
            let Some((name, rest)) = split_name_line(line) else {
                continue;
            };
            // Alternating (load, minutes) pairs, then the standby load.
            let mut numbers: Vec<i64> = parse_numbers(rest)
                .with_context(|| format!("power data for {:?}", name))?;
            let standby = numbers
                .pop()
                .ok_or_else(|| anyhow!("power data for {:?} is empty", name))?;
            if numbers.len() % 2 != 0 {
                return Err(anyhow!("odd cycle data for {:?}", name));
            }
            let mut device = Device {
                name: name.to_string(),
                standby_load: FixedPoint::from_f64(standby as f64),
                ..Device::default()
            };
            for pair in numbers.chunks_exact(2) {
                device.load_per_cycle.push(FixedPoint::from_f64(pair[0] as f64));
                device.time_per_cycle.push(pair[1] as u32);
            }
            self.possible_devices.insert(name.to_string(), device);
        }
        Ok(())
    }

    fn read_frequency_data(&mut self, contents: &str) -> anyhow::Result<()> {
        for line in contents.lines() {
            let Some((name, rest)) = split_name_line(line) else {
                continue;
            };
            let numbers: Vec<f64> =
                parse_numbers(rest).with_context(|| format!("frequency data for {:?}", name))?;
            let [weekday, weekend] = numbers[..] else {
                return Err(anyhow!("expected 2 frequencies for {:?}", name));
            };
            let device = self.device_mut(name)?;
            device.weekday_frequency = weekday;
            device.weekend_frequency = weekend;
        }
        Ok(())
    }

    fn read_probability_data(&mut self, contents: &str) -> anyhow::Result<()> {
        for line in contents.lines() {
            let Some((name, rest)) = split_name_line(line) else {
                continue;
            };
            let mut fields = rest.split_whitespace();
            let series_type = fields
                .next()
                .ok_or_else(|| anyhow!("missing series type for {:?}", name))?;
            // Percentages in the file, probabilities in memory.
            let probabilities: Vec<f64> = fields
                .map(|field| {
                    field
                        .parse::<f64>()
                        .map(|percent| percent / 100.0)
                        .map_err(|_| anyhow!("bad probability {:?} for {:?}", field, name))
                })
                .collect::<Result<_, _>>()?;
            if probabilities.len() != 24 {
                return Err(anyhow!(
                    "expected 24 hourly probabilities for {:?}, found {}",
                    name,
                    probabilities.len()
                ));
            }
            let device = self.device_mut(name)?;
            if series_type == "we" {
                device.weekend_hourly_probability = probabilities;
            } else {
                device.weekday_hourly_probability = probabilities;
            }
        }
        Ok(())
    }

    fn read_saturation_data(&mut self, contents: &str) -> anyhow::Result<()> {
        for line in contents.lines() {
            let Some((name, rest)) = split_name_line(line) else {
                continue;
            };
            let numbers: Vec<f64> =
                parse_numbers(rest).with_context(|| format!("saturation data for {:?}", name))?;
            let [saturation] = numbers[..] else {
                return Err(anyhow!("expected 1 saturation for {:?}", name));
            };
            self.devices_saturation.insert(name.to_string(), saturation);
        }
        Ok(())
    }

    /// Randomly picks the devices one home owns, based on their
    /// saturations. Devices whose names end in a digit are "versions" of
    /// the same appliance, and a home owns at most one version; likewise a
    /// home has either a window or a central air conditioner, never both.
    pub fn pick_home_devices<G: Rng>(&self, rng: &mut G) -> Vec<Device> {
        let mut home_devices: Vec<Device> = Vec::new();
        let already_picked = |devices: &[Device], pattern: &str| {
            devices.iter().any(|device| device.name.contains(pattern))
        };
        for (name, saturation) in &self.devices_saturation {
            if name
                .chars()
                .last()
                .map(|last| last.is_ascii_digit())
                .unwrap_or(false)
            {
                let prefix = &name[..name.len() - 1];
                if already_picked(&home_devices, prefix.trim_end()) {
                    continue;
                }
            }
            if name.contains("conditioner") && already_picked(&home_devices, "conditioner") {
                continue;
            }
            if rng.gen_bool((saturation / 100.0).clamp(0.0, 1.0)) {
                if let Some(device) = self.possible_devices.get(name) {
                    home_devices.push(device.clone());
                }
            }
        }
        home_devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POWER: &str = "dishwasher\t1800 30 120 60 3\nfridge 1\t150 60 2\n";
    const FREQUENCY: &str = "dishwasher\t0.7 1.1\nfridge 1\t24 24\n";
    const SATURATION: &str = "dishwasher\t65\nfridge 1\t99\n";

    fn probability() -> String {
        let hours: Vec<String> = (0..24).map(|h| format!("{}", h % 10)).collect();
        format!(
            "dishwasher\twd {0}\ndishwasher\twe {0}\nfridge 1\twd {0}\nfridge 1\twe {0}\n",
            hours.join(" ")
        )
    }

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.read_power_data(POWER).unwrap();
        config.read_frequency_data(FREQUENCY).unwrap();
        config.read_probability_data(&probability()).unwrap();
        config.read_saturation_data(SATURATION).unwrap();
        config
    }

    #[test]
    fn parses_cycles_and_standby() {
        let config = config();
        let dishwasher = &config.possible_devices["dishwasher"];
        assert_eq!(dishwasher.load_per_cycle.len(), 2);
        assert_eq!(dishwasher.time_per_cycle, vec![30, 60]);
        assert_eq!(dishwasher.standby_load, FixedPoint::from_f64(3.0));
        assert_eq!(dishwasher.weekday_frequency, 0.7);
        assert_eq!(config.devices_saturation["fridge 1"], 99.0);
    }

    #[test]
    fn hourly_probabilities_are_fractions() {
        let config = config();
        let fridge = &config.possible_devices["fridge 1"];
        assert_eq!(fridge.weekday_hourly_probability.len(), 24);
        assert!(fridge
            .weekday_hourly_probability
            .iter()
            .all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn full_saturation_device_is_always_picked() {
        let mut config = config();
        config.devices_saturation.insert("fridge 1".into(), 100.0);
        config.devices_saturation.insert("dishwasher".into(), 0.0);
        let devices = config.pick_home_devices(&mut rand::thread_rng());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "fridge 1");
    }
}
