pub mod mode;
pub mod ramp;
pub mod relay;

use std::time::Duration;

/// The 48 V battery bus is energised iff the BMS advertises non-zero charge
/// and discharge current limits.
#[allow(clippy::float_cmp)]
pub fn battery_contactors_closed(charge_limit: f64, discharge_limit: f64) -> bool {
    charge_limit != 0.0 && discharge_limit != 0.0
}

/// Round to one decimal place, the resolution used for currents on the bus.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Convert a wall-clock period into a whole number of control ticks.
#[expect(clippy::cast_possible_truncation)]
#[expect(clippy::cast_sign_loss)]
pub fn ticks_of(period: Duration, timestep: Duration) -> u32 {
    (period.as_secs_f64() / timestep.as_secs_f64()).round().max(1.0) as u32
}
