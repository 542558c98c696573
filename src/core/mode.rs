use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

use crate::core::{battery_contactors_closed, relay::Relay, ticks_of};

/// Push-buttons on the operator panel.
#[derive(Debug, EnumSetType)]
pub enum Button {
    Off,
    On,
    Charge,
}

/// Operating mode of the installation, as selected on the operator panel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, derive_more::Display, Serialize, Deserialize)]
pub enum OperatingMode {
    Off,
    On,
    ChargeOnly,
}

/// VE.Bus switch-mode values as they appear on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SwitchMode {
    ChargeOnly = 1,
    InvertOnly = 2,
    On = 3,
    Off = 4,
}

impl From<OperatingMode> for SwitchMode {
    fn from(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Off => Self::Off,
            OperatingMode::On => Self::On,
            OperatingMode::ChargeOnly => Self::ChargeOnly,
        }
    }
}

impl TryFrom<u32> for SwitchMode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(Self::ChargeOnly),
            2 => Ok(Self::InvertOnly),
            3 => Ok(Self::On),
            4 => Ok(Self::Off),
            _ => Err(raw),
        }
    }
}

/// Reverse-power hysteresis.
///
/// The counter climbs by one tick while reverse power is detected and falls
/// by one otherwise, capped to the trip threshold and floored at zero. The
/// alarm latches when the counter reaches the threshold and releases only
/// once the installation is switched off and the counter has drained.
#[derive(Debug)]
struct ReversePower {
    trip_ticks: u32,
    counter: u32,
    alarm: bool,
}

impl ReversePower {
    fn new(trip_ticks: u32) -> Self {
        Self { trip_ticks, counter: 0, alarm: false }
    }

    fn update(&mut self, detected: bool, mode: OperatingMode) {
        if detected {
            self.counter = (self.counter + 1).min(self.trip_ticks);
        } else {
            self.counter = self.counter.saturating_sub(1);
        }
        if self.counter >= self.trip_ticks {
            self.alarm = true;
        } else if mode == OperatingMode::Off && self.counter == 0 {
            self.alarm = false;
        }
    }
}

/// Readings gathered at the start of a tick.
pub struct ModeInputs {
    pub buttons: EnumSet<Button>,

    /// Battery state of charge, percent. Zero when the reading failed.
    pub battery_soc: f64,

    /// Inverter AC output power, watts. Zero when the reading failed.
    pub ac_output_power: f64,

    pub battery_charge_limit: f64,
    pub battery_discharge_limit: f64,

    /// Last-read inverter switch mode, `None` while the inverter is
    /// unreachable or reports an unknown value.
    pub switch_mode: Option<SwitchMode>,

    pub inverter_connected: bool,
    pub bms_connected: bool,
}

/// Decisions made by a tick, to be applied to the outside world.
pub struct ModeOutputs {
    /// The full relay output pass, in write order.
    pub relays: [(Relay, bool); 8],

    /// Switch-mode write to issue this tick, if any.
    pub switch_mode: Option<SwitchMode>,

    /// All three buttons are held: run the graceful-restart sequence.
    pub restart_requested: bool,

    /// Standing fault, shown to the operator by blinking the active LED.
    pub fault: bool,
}

/// Owns the operating mode, the reverse-power alarm and the relay outputs.
pub struct ModeController {
    mode: OperatingMode,
    reverse_power: ReversePower,
    bms_disable: bool,
    off_held_ticks: u32,
    blink: bool,
    inverter_delay: u32,
    restart_cooldown_ticks: u32,
    last_switch_write: Option<DateTime<Utc>>,
}

impl ModeController {
    /// Reverse power flows into the generator below this AC output power.
    const REVERSE_POWER_THRESHOLD: f64 = -100.0; // W

    /// Sustained reverse power needed to trip the alarm.
    const REVERSE_POWER_TRIP_AFTER: Duration = Duration::from_secs(10);

    /// Below this state of charge the BMS is allowed to sleep in `Off` mode.
    const BMS_SLEEP_SOC: f64 = 50.0; // %

    /// Holding `Off` this long forces the BMS to sleep regardless of charge.
    const BMS_DISABLE_HOLD_TICKS: u32 = 5;

    /// Minimum spacing between switch-mode writes to the inverter.
    const SWITCH_WRITE_INTERVAL: TimeDelta = TimeDelta::seconds(5);

    /// Inverter cooldown after resuming from a stored snapshot.
    const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

    pub fn new(timestep: Duration) -> Self {
        Self {
            mode: OperatingMode::Off,
            reverse_power: ReversePower::new(ticks_of(Self::REVERSE_POWER_TRIP_AFTER, timestep)),
            bms_disable: false,
            off_held_ticks: 0,
            blink: false,
            inverter_delay: 0,
            restart_cooldown_ticks: ticks_of(Self::RESTART_COOLDOWN, timestep),
            last_switch_write: None,
        }
    }

    /// Resume from a stored snapshot: adopt the mode and hold the inverter
    /// back for the restart cooldown.
    pub fn resume(&mut self, mode: OperatingMode) {
        self.mode = mode;
        self.inverter_delay = self.restart_cooldown_ticks;
    }

    pub const fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub const fn reverse_power_counter(&self) -> u32 {
        self.reverse_power.counter
    }

    pub const fn reverse_power_alarm(&self) -> bool {
        self.reverse_power.alarm
    }

    /// Switch mode the inverter should be in right now.
    pub fn switch_target(&self) -> SwitchMode {
        if self.reverse_power.alarm { SwitchMode::Off } else { self.mode.into() }
    }

    /// Run one control step: interpret the buttons, update the alarm and
    /// derive every output. Inputs must be freshly read.
    pub fn tick(&mut self, inputs: &ModeInputs, now: DateTime<Utc>) -> ModeOutputs {
        self.blink = !self.blink;

        let all_buttons = Button::Off | Button::On | Button::Charge;
        let restart_requested = inputs.buttons == all_buttons;
        let rcd_reset = inputs.buttons.len() == 2 && inputs.buttons.contains(Button::Off);

        self.update_mode(inputs.buttons);
        self.reverse_power
            .update(inputs.ac_output_power < Self::REVERSE_POWER_THRESHOLD, self.mode);

        let fault = !inputs.bms_connected
            || (self.mode != OperatingMode::Off
                && (!inputs.inverter_connected || self.reverse_power.alarm));

        let bms_wake = !(self.mode == OperatingMode::Off
            && (inputs.battery_soc < Self::BMS_SLEEP_SOC || self.bms_disable));

        let relays = [
            (Relay::OffLed, self.led(OperatingMode::Off, fault)),
            (Relay::OnLed, self.led(OperatingMode::On, fault)),
            (Relay::ChargeLed, self.led(OperatingMode::ChargeOnly, fault)),
            (Relay::BmsWake, bms_wake),
            (Relay::DseRemoteStart, self.mode == OperatingMode::On),
            (
                Relay::DseModeRequest,
                matches!(self.mode, OperatingMode::On | OperatingMode::ChargeOnly),
            ),
            (Relay::RcdReset, rcd_reset),
            (Relay::ReversePowerAlarm, self.reverse_power.alarm),
        ];

        let switch_mode = self.update_inverter_switch(inputs, now);

        ModeOutputs { relays, switch_mode, restart_requested, fault }
    }

    /// A single pressed button selects the mode; anything else leaves it
    /// unchanged. `On`/`Charge` release the forced-sleep latch, holding `Off`
    /// sets it.
    fn update_mode(&mut self, buttons: EnumSet<Button>) {
        if buttons == EnumSet::only(Button::Off) {
            self.off_held_ticks += 1;
            if self.off_held_ticks >= Self::BMS_DISABLE_HOLD_TICKS {
                self.bms_disable = true;
            }
        } else {
            self.off_held_ticks = 0;
        }
        if buttons.len() != 1 {
            return; // released or ambiguous, the mode is sticky
        }
        match buttons.iter().next() {
            Some(Button::Off) => self.mode = OperatingMode::Off,
            Some(Button::On) => {
                self.mode = OperatingMode::On;
                self.bms_disable = false;
            }
            Some(Button::Charge) => {
                self.mode = OperatingMode::ChargeOnly;
                self.bms_disable = false;
            }
            None => {}
        }
    }

    /// Steady mode indication, blinking while a fault is standing.
    fn led(&self, mode: OperatingMode, fault: bool) -> bool {
        let lit = self.mode == mode;
        if fault && lit { self.blink } else { lit }
    }

    /// Decide whether to (re)write the inverter switch mode this tick.
    ///
    /// The write is skipped unless the target differs from the last-read
    /// actual mode, the battery contactors are closed, no cooldown is pending
    /// and the previous write is old enough.
    fn update_inverter_switch(
        &mut self,
        inputs: &ModeInputs,
        now: DateTime<Utc>,
    ) -> Option<SwitchMode> {
        let contactors_closed =
            battery_contactors_closed(inputs.battery_charge_limit, inputs.battery_discharge_limit);
        if contactors_closed {
            self.inverter_delay = self.inverter_delay.saturating_sub(1);
        } else {
            self.inverter_delay = 0;
        }

        let target = self.switch_target();
        if inputs.switch_mode == Some(target) {
            return None;
        }
        if !contactors_closed || self.inverter_delay > 0 {
            return None;
        }
        if let Some(written_at) = self.last_switch_write
            && now - written_at < Self::SWITCH_WRITE_INTERVAL
        {
            return None;
        }
        self.last_switch_write = Some(now);
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ModeController {
        ModeController::new(Duration::from_secs(1))
    }

    fn inputs() -> ModeInputs {
        ModeInputs {
            buttons: EnumSet::new(),
            battery_soc: 80.0,
            ac_output_power: 0.0,
            battery_charge_limit: 100.0,
            battery_discharge_limit: 100.0,
            switch_mode: Some(SwitchMode::Off),
            inverter_connected: true,
            bms_connected: true,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn relay(outputs: &ModeOutputs, relay: Relay) -> bool {
        outputs.relays.iter().find(|(candidate, _)| *candidate == relay).unwrap().1
    }

    #[test]
    fn single_button_selects_the_mode_and_it_is_sticky() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        controller.tick(&inputs, at(0));
        assert_eq!(controller.mode(), OperatingMode::On);

        inputs.buttons = EnumSet::new();
        controller.tick(&inputs, at(1));
        assert_eq!(controller.mode(), OperatingMode::On, "released buttons must not change it");

        inputs.buttons = Button::On | Button::Charge;
        controller.tick(&inputs, at(2));
        assert_eq!(controller.mode(), OperatingMode::On, "ambiguous combo must not change it");
    }

    /// The full combo routing table: two-button combos containing `Off` pulse
    /// the RCD reset, all three request a restart, anything else does neither.
    #[test]
    fn button_combo_routing() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::Off | Button::On;
        let outputs = controller.tick(&inputs, at(0));
        assert!(relay(&outputs, Relay::RcdReset));
        assert!(!outputs.restart_requested);
        assert_eq!(controller.mode(), OperatingMode::Off, "combos must not change the mode");

        inputs.buttons = Button::Off | Button::Charge;
        let outputs = controller.tick(&inputs, at(1));
        assert!(relay(&outputs, Relay::RcdReset));
        assert!(!outputs.restart_requested);

        inputs.buttons = Button::On | Button::Charge;
        let outputs = controller.tick(&inputs, at(2));
        assert!(!relay(&outputs, Relay::RcdReset));
        assert!(!outputs.restart_requested);

        inputs.buttons = Button::Off | Button::On | Button::Charge;
        let outputs = controller.tick(&inputs, at(3));
        assert!(!relay(&outputs, Relay::RcdReset));
        assert!(outputs.restart_requested);

        inputs.buttons = EnumSet::new();
        let outputs = controller.tick(&inputs, at(4));
        assert!(!relay(&outputs, Relay::RcdReset));
        assert!(!outputs.restart_requested);
    }

    #[test]
    fn reverse_power_counter_is_bounded() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.ac_output_power = -250.0;
        for tick in 0..30 {
            controller.tick(&inputs, at(tick));
        }
        assert_eq!(controller.reverse_power_counter(), 10, "capped at the trip threshold");

        inputs.ac_output_power = 0.0;
        for tick in 30..60 {
            controller.tick(&inputs, at(tick));
        }
        assert_eq!(controller.reverse_power_counter(), 0, "floored at zero");
    }

    #[test]
    fn alarm_latches_and_clears_only_in_off_with_a_drained_counter() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        controller.tick(&inputs, at(0));
        inputs.buttons = EnumSet::new();

        inputs.ac_output_power = -250.0;
        for tick in 1..=10 {
            controller.tick(&inputs, at(tick));
        }
        assert!(controller.reverse_power_alarm());

        // The flow normalised, but the installation is still `On`:
        inputs.ac_output_power = 0.0;
        for tick in 11..=25 {
            controller.tick(&inputs, at(tick));
        }
        assert_eq!(controller.reverse_power_counter(), 0);
        assert!(controller.reverse_power_alarm(), "must not clear outside `Off`");

        inputs.buttons = Button::Off.into();
        controller.tick(&inputs, at(26));
        assert!(!controller.reverse_power_alarm());
    }

    #[test]
    fn alarm_forces_the_inverter_off() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        controller.tick(&inputs, at(0));
        inputs.buttons = EnumSet::new();
        inputs.switch_mode = Some(SwitchMode::On);

        inputs.ac_output_power = -250.0;
        let mut last = None;
        for tick in 1..=10 {
            last = controller.tick(&inputs, at(tick)).switch_mode;
        }
        assert_eq!(controller.switch_target(), SwitchMode::Off);
        assert_eq!(last, Some(SwitchMode::Off));
    }

    #[test]
    fn bms_wake_follows_the_charge_in_off_mode() {
        let mut controller = controller();
        let mut inputs = inputs();

        let outputs = controller.tick(&inputs, at(0));
        assert!(relay(&outputs, Relay::BmsWake), "healthy charge keeps the BMS awake");

        inputs.battery_soc = 40.0;
        let outputs = controller.tick(&inputs, at(1));
        assert!(!relay(&outputs, Relay::BmsWake), "low charge lets the BMS sleep");
    }

    #[test]
    fn holding_off_forces_the_bms_to_sleep() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::Off.into();
        let mut outputs = controller.tick(&inputs, at(0));
        for tick in 1..5 {
            outputs = controller.tick(&inputs, at(tick));
        }
        assert!(!relay(&outputs, Relay::BmsWake), "long press overrides the healthy charge");

        // A single `On` press releases the latch:
        inputs.buttons = Button::On.into();
        controller.tick(&inputs, at(5));
        inputs.buttons = Button::Off.into();
        let outputs = controller.tick(&inputs, at(6));
        assert!(relay(&outputs, Relay::BmsWake));
    }

    #[test]
    fn standing_fault_blinks_the_active_led() {
        let mut controller = controller();
        let mut inputs = inputs();
        inputs.bms_connected = false;

        let first = controller.tick(&inputs, at(0));
        let second = controller.tick(&inputs, at(1));
        assert!(first.fault);
        assert_ne!(relay(&first, Relay::OffLed), relay(&second, Relay::OffLed));
        assert!(!relay(&first, Relay::OnLed));
        assert!(!relay(&second, Relay::OnLed));
    }

    #[test]
    fn switch_writes_are_throttled() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        let outputs = controller.tick(&inputs, at(0));
        assert_eq!(outputs.switch_mode, Some(SwitchMode::On));

        // The inverter did not pick it up yet, the target still differs:
        inputs.buttons = EnumSet::new();
        assert_eq!(controller.tick(&inputs, at(1)).switch_mode, None);
        assert_eq!(controller.tick(&inputs, at(6)).switch_mode, Some(SwitchMode::On));
    }

    #[test]
    fn open_contactors_gate_switch_writes() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        inputs.battery_charge_limit = 0.0;
        assert_eq!(controller.tick(&inputs, at(0)).switch_mode, None);
    }

    #[test]
    fn resuming_primes_the_inverter_cooldown() {
        let mut controller = controller();
        controller.resume(OperatingMode::On);
        assert_eq!(controller.mode(), OperatingMode::On);

        let inputs = inputs();
        for tick in 0..9 {
            assert_eq!(controller.tick(&inputs, at(tick)).switch_mode, None, "tick {tick}");
        }
        assert_eq!(controller.tick(&inputs, at(9)).switch_mode, Some(SwitchMode::On));
    }

    /// End-to-end `On` scenario: every derived output follows the mode.
    #[test]
    fn switching_on_drives_all_outputs() {
        let mut controller = controller();
        let mut inputs = inputs();

        inputs.buttons = Button::On.into();
        let outputs = controller.tick(&inputs, at(0));

        assert_eq!(controller.mode(), OperatingMode::On);
        assert!(relay(&outputs, Relay::OnLed));
        assert!(!relay(&outputs, Relay::OffLed));
        assert!(relay(&outputs, Relay::BmsWake));
        assert!(relay(&outputs, Relay::DseRemoteStart));
        assert!(relay(&outputs, Relay::DseModeRequest));
        assert_eq!(outputs.switch_mode, Some(SwitchMode::On));
    }
}
