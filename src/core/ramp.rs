use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{battery_contactors_closed, round_tenth, ticks_of};

/// States of the generator ramp machine.
///
/// The integer values are the wire/snapshot representation.
#[derive(Copy, Clone, Debug, derive_more::Display, PartialEq, Eq)]
#[repr(u8)]
pub enum RampState {
    /// The inverter is unreachable.
    InverterOff = 0,

    /// The inverter is up, no generator start requested.
    InverterOn = 1,

    /// Start requested, waiting for the generator to take the initial load.
    StartRequested = 2,

    /// Ramping from the initial to the warm-up limit.
    InitialRamp = 3,

    /// Holding the warm-up limit while the generator warms up.
    Warmup = 4,

    /// Ramping from the warm-up to the standby limit.
    StandbyRamp = 5,

    /// Ramping from the standby to the prime limit.
    PrimeRamp = 6,

    /// Holding the prime limit.
    Steadystate = 7,
}

impl TryFrom<u8> for RampState {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::InverterOff),
            1 => Ok(Self::InverterOn),
            2 => Ok(Self::StartRequested),
            3 => Ok(Self::InitialRamp),
            4 => Ok(Self::Warmup),
            5 => Ok(Self::StandbyRamp),
            6 => Ok(Self::PrimeRamp),
            7 => Ok(Self::Steadystate),
            _ => Err(raw),
        }
    }
}

/// Readings gathered at the start of a ramp tick, with last-safe substitutes
/// where this tick's read failed.
pub struct RampInputs {
    pub inverter_connected: bool,

    /// Feedback of the generator start-request contact.
    pub start_requested: bool,

    /// AC input current drawn from the generator, amperes.
    pub ac_input_current: f64,

    pub battery_charge_limit: f64,
    pub battery_discharge_limit: f64,

    /// Last-read AC input current limit, `None` while unknown.
    pub ac_input_current_limit: Option<f64>,
}

pub struct RampOutputs {
    /// Current-limit write to issue this tick, if any.
    pub current_limit: Option<f64>,

    /// A transition happened, the state must be persisted now.
    pub state_changed: bool,
}

/// Brings the generator AC input current limit up gradually and backs off to
/// `InverterOn` when the generator stalls.
pub struct RampController {
    state: RampState,
    state_entry: DateTime<Utc>,
    stall_counter: u64,
    target: f64,
    inverter_delay: u32,
    restart_cooldown_ticks: u32,
}

impl RampController {
    const INITIAL_LIMIT: f64 = 3.0; // A
    const INITIAL_RAMP_TIME: f64 = 30.0; // s
    const WARMUP_LIMIT: f64 = 12.0; // A
    const WARMUP_TIME: f64 = 60.0; // s
    const STANDBY_LIMIT: f64 = 34.0; // A
    const STANDBY_RAMP_TIME: f64 = 120.0; // s
    const PRIME_LIMIT: f64 = 40.0; // A
    const PRIME_RAMP_TIME: f64 = 30.0 * 60.0; // s

    /// Inverter cooldown after resuming from a stored snapshot.
    const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

    pub fn new(timestep: Duration, now: DateTime<Utc>) -> Self {
        Self {
            state: RampState::InverterOff,
            state_entry: now,
            stall_counter: 0,
            target: Self::INITIAL_LIMIT,
            inverter_delay: 0,
            restart_cooldown_ticks: ticks_of(Self::RESTART_COOLDOWN, timestep),
        }
    }

    /// Resume from a stored snapshot: adopt the state and its entry time, and
    /// hold the inverter back for the restart cooldown.
    pub fn resume(&mut self, state: RampState, state_entry: DateTime<Utc>) {
        self.state = state;
        self.state_entry = state_entry;
        self.inverter_delay = self.restart_cooldown_ticks;
    }

    pub const fn state(&self) -> RampState {
        self.state
    }

    pub const fn state_entry(&self) -> DateTime<Utc> {
        self.state_entry
    }

    pub const fn target(&self) -> f64 {
        self.target
    }

    pub const fn stall_counter(&self) -> u64 {
        self.stall_counter
    }

    pub const fn inverter_delay(&self) -> u32 {
        self.inverter_delay
    }

    /// Seconds spent in the current state, to one decimal.
    pub fn state_time(&self, now: DateTime<Utc>) -> f64 {
        round_tenth((now - self.state_entry).as_seconds_f64().max(0.0))
    }

    /// Run one control step: advance the state machine, recompute the target
    /// and decide whether the limit needs to be written out.
    pub fn tick(&mut self, inputs: &RampInputs, now: DateTime<Utc>) -> RampOutputs {
        let elapsed = self.state_time(now);
        let next = self.advance(inputs, elapsed);
        let state_changed = next != self.state;
        if state_changed {
            self.state = next;
            self.state_entry = now;
        }
        RampOutputs { current_limit: self.limit_write(inputs), state_changed }
    }

    fn advance(&mut self, inputs: &RampInputs, elapsed: f64) -> RampState {
        match self.state {
            RampState::InverterOff => {
                if inputs.inverter_connected {
                    RampState::InverterOn
                } else {
                    RampState::InverterOff
                }
            }
            RampState::InverterOn => {
                if !inputs.inverter_connected {
                    RampState::InverterOff
                } else if inputs.start_requested {
                    RampState::StartRequested
                } else {
                    RampState::InverterOn
                }
            }
            RampState::StartRequested => {
                self.target = Self::INITIAL_LIMIT;
                if !inputs.inverter_connected {
                    RampState::InverterOff
                } else if !inputs.start_requested {
                    RampState::InverterOn
                } else if inputs.ac_input_current > Self::INITIAL_LIMIT / 2.0 {
                    // The generator has taken the initial load:
                    RampState::InitialRamp
                } else {
                    RampState::StartRequested
                }
            }
            RampState::InitialRamp => {
                self.target = ramp(
                    elapsed,
                    Self::INITIAL_RAMP_TIME,
                    Self::INITIAL_LIMIT,
                    Self::WARMUP_LIMIT,
                );
                self.ramp_exit(inputs, elapsed, Self::INITIAL_RAMP_TIME, RampState::Warmup)
            }
            RampState::Warmup => {
                self.target = Self::WARMUP_LIMIT;
                self.ramp_exit(inputs, elapsed, Self::WARMUP_TIME, RampState::StandbyRamp)
            }
            RampState::StandbyRamp => {
                self.target = ramp(
                    elapsed,
                    Self::STANDBY_RAMP_TIME,
                    Self::WARMUP_LIMIT,
                    Self::STANDBY_LIMIT,
                );
                self.ramp_exit(inputs, elapsed, Self::STANDBY_RAMP_TIME, RampState::PrimeRamp)
            }
            RampState::PrimeRamp => {
                self.target =
                    ramp(elapsed, Self::PRIME_RAMP_TIME, Self::STANDBY_LIMIT, Self::PRIME_LIMIT);
                self.ramp_exit(inputs, elapsed, Self::PRIME_RAMP_TIME, RampState::Steadystate)
            }
            RampState::Steadystate => {
                self.target = Self::PRIME_LIMIT;
                if !inputs.inverter_connected {
                    RampState::InverterOff
                } else if !inputs.start_requested || stalled(inputs.ac_input_current) {
                    // Past the ramp a stall is not counted, the load simply
                    // falls back to the inverter.
                    RampState::InverterOn
                } else {
                    RampState::Steadystate
                }
            }
        }
    }

    /// Common exits of the timed ramp states, in order of precedence:
    /// inverter loss, start-request cleared, ramp time served, stall.
    fn ramp_exit(
        &mut self,
        inputs: &RampInputs,
        elapsed: f64,
        duration: f64,
        done: RampState,
    ) -> RampState {
        if !inputs.inverter_connected {
            RampState::InverterOff
        } else if !inputs.start_requested {
            RampState::InverterOn
        } else if elapsed >= duration {
            done
        } else if stalled(inputs.ac_input_current) {
            self.stall_counter += 1;
            RampState::InverterOn
        } else {
            self.state
        }
    }

    /// Decide whether to write the current limit this tick: the target must
    /// differ from the last-read actual limit, the battery contactors must be
    /// closed and no cooldown may be pending. No minimum-interval throttle
    /// here, the ramp itself only moves gradually.
    #[allow(clippy::float_cmp)]
    fn limit_write(&mut self, inputs: &RampInputs) -> Option<f64> {
        let contactors_closed =
            battery_contactors_closed(inputs.battery_charge_limit, inputs.battery_discharge_limit);
        if contactors_closed {
            self.inverter_delay = self.inverter_delay.saturating_sub(1);
        } else {
            self.inverter_delay = 0;
        }
        if inputs.ac_input_current_limit == Some(self.target) {
            return None;
        }
        if !contactors_closed || self.inverter_delay > 0 {
            return None;
        }
        Some(self.target)
    }
}

/// Linear interpolation from `start` to `stop`, clamped to the segment and
/// rounded to one decimal.
fn ramp(elapsed: f64, duration: f64, start: f64, stop: f64) -> f64 {
    let fraction = (elapsed.max(0.0) / duration).clamp(0.0, 1.0);
    round_tenth((stop - start).mul_add(fraction, start))
}

#[allow(clippy::float_cmp)]
fn stalled(ac_input_current: f64) -> bool {
    ac_input_current == 0.0
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn controller() -> RampController {
        RampController::new(Duration::from_millis(250), at(0))
    }

    fn inputs() -> RampInputs {
        RampInputs {
            inverter_connected: true,
            start_requested: true,
            ac_input_current: 2.0,
            battery_charge_limit: 100.0,
            battery_discharge_limit: 100.0,
            ac_input_current_limit: None,
        }
    }

    #[test]
    fn ramp_is_clamped_to_the_segment() {
        assert_relative_eq!(ramp(-5.0, 30.0, 3.0, 12.0), 3.0);
        assert_relative_eq!(ramp(0.0, 30.0, 3.0, 12.0), 3.0);
        assert_relative_eq!(ramp(100.0, 30.0, 3.0, 12.0), 12.0);
    }

    #[test]
    fn ramp_interpolates_the_midpoint() {
        assert_relative_eq!(ramp(15.0, 30.0, 3.0, 12.0), 7.5);
    }

    #[test]
    fn ramp_is_monotonic() {
        let mut previous = f64::MIN;
        for elapsed in 0..=120 {
            let target = ramp(f64::from(elapsed), 120.0, 12.0, 34.0);
            assert!(target >= previous, "target regressed at {elapsed}s");
            previous = target;
        }
    }

    /// Drive the machine through a complete successful generator start.
    #[test]
    fn full_ramp_sequence() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.start_requested = false;
        assert!(controller.tick(&inputs, at(0)).state_changed);
        assert_eq!(controller.state(), RampState::InverterOn);

        inputs.start_requested = true;
        inputs.ac_input_current = 0.0;
        controller.tick(&inputs, at(1));
        assert_eq!(controller.state(), RampState::StartRequested);

        // Not enough current yet, the initial limit is pushed out:
        let outputs = controller.tick(&inputs, at(2));
        assert_eq!(controller.state(), RampState::StartRequested);
        assert_relative_eq!(outputs.current_limit.unwrap(), 3.0);

        inputs.ac_input_current = 2.0;
        controller.tick(&inputs, at(3));
        assert_eq!(controller.state(), RampState::InitialRamp);

        let outputs = controller.tick(&inputs, at(18));
        assert_eq!(controller.state(), RampState::InitialRamp);
        assert_relative_eq!(outputs.current_limit.unwrap(), 7.5);

        controller.tick(&inputs, at(33));
        assert_eq!(controller.state(), RampState::Warmup);

        controller.tick(&inputs, at(93));
        assert_eq!(controller.state(), RampState::StandbyRamp);

        controller.tick(&inputs, at(213));
        assert_eq!(controller.state(), RampState::PrimeRamp);

        controller.tick(&inputs, at(2013));
        assert_eq!(controller.state(), RampState::Steadystate);

        let outputs = controller.tick(&inputs, at(2014));
        assert_eq!(controller.state(), RampState::Steadystate);
        assert_relative_eq!(outputs.current_limit.unwrap(), 40.0);
    }

    #[test]
    fn stall_during_a_ramp_reverts_and_counts() {
        let mut controller = controller();
        controller.resume(RampState::Warmup, at(0));
        let mut inputs = inputs();

        inputs.ac_input_current = 0.0;
        let outputs = controller.tick(&inputs, at(1));
        assert!(outputs.state_changed);
        assert_eq!(controller.state(), RampState::InverterOn);
        assert_eq!(controller.stall_counter(), 1);
    }

    #[test]
    fn stall_in_steady_state_reverts_without_counting() {
        let mut controller = controller();
        controller.resume(RampState::Steadystate, at(0));
        let mut inputs = inputs();

        inputs.ac_input_current = 0.0;
        controller.tick(&inputs, at(1));
        assert_eq!(controller.state(), RampState::InverterOn);
        assert_eq!(controller.stall_counter(), 0);
    }

    #[test]
    fn inverter_loss_wins_over_everything() {
        let mut controller = controller();
        controller.resume(RampState::PrimeRamp, at(0));
        let mut inputs = inputs();

        inputs.inverter_connected = false;
        inputs.ac_input_current = 0.0;
        controller.tick(&inputs, at(1));
        assert_eq!(controller.state(), RampState::InverterOff);
        assert_eq!(controller.stall_counter(), 0);
    }

    #[test]
    fn cleared_start_request_returns_to_inverter_on() {
        let mut controller = controller();
        controller.resume(RampState::StandbyRamp, at(0));
        let mut inputs = inputs();

        inputs.start_requested = false;
        controller.tick(&inputs, at(1));
        assert_eq!(controller.state(), RampState::InverterOn);
    }

    #[test]
    fn limit_is_not_rewritten_when_it_matches() {
        let mut controller = controller();
        let mut inputs = inputs();
        inputs.start_requested = false;

        controller.tick(&inputs, at(0)); // InverterOn
        inputs.start_requested = true;
        inputs.ac_input_current = 0.0;
        controller.tick(&inputs, at(1)); // StartRequested

        inputs.ac_input_current_limit = Some(3.0);
        assert_eq!(controller.tick(&inputs, at(2)).current_limit, None);

        inputs.ac_input_current_limit = Some(2.9);
        assert_eq!(controller.tick(&inputs, at(3)).current_limit, Some(3.0));
    }

    #[test]
    fn open_contactors_gate_limit_writes() {
        let mut controller = controller();
        let mut inputs = inputs();
        inputs.battery_discharge_limit = 0.0;

        assert_eq!(controller.tick(&inputs, at(0)).current_limit, None);
    }

    #[test]
    fn resuming_primes_the_inverter_cooldown() {
        let mut controller = controller();
        controller.resume(RampState::Steadystate, at(0));
        assert_eq!(controller.state(), RampState::Steadystate);
        assert!(controller.inverter_delay() > 0);

        let inputs = inputs();
        let outputs = controller.tick(&inputs, at(1));
        assert_eq!(outputs.current_limit, None, "cooldown must gate the write");
    }

    #[test]
    fn snapshot_state_values_round_trip() {
        assert_eq!(RampState::try_from(7), Ok(RampState::Steadystate));
        assert_eq!(RampState::try_from(9), Err(9));
    }
}
