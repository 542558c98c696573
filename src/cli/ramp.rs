use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bon::Builder;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::time::{MissedTickBehavior, interval, sleep};

use crate::{
    api::bus::{Bus, Item},
    core::{
        mode::SwitchMode,
        ramp::{RampController, RampInputs, RampState},
        relay::Relay,
        round_tenth,
    },
    fmt::StatusLog,
    prelude::*,
    store::{RampSnapshot, Store, system_uptime},
};

#[derive(Parser)]
pub struct RampArgs {
    /// Control loop timestep.
    #[clap(long, env = "RAMP_TIMESTEP", default_value = "250ms")]
    timestep: humantime::Duration,

    /// Snapshot file used to survive service restarts.
    #[clap(long, env = "RAMP_STATE_FILE", default_value = "/data/genctl/ramp.json")]
    state_file: PathBuf,
}

impl RampArgs {
    /// Give the bus services a moment to come up before the first tick.
    const STARTUP_SETTLE: Duration = Duration::from_secs(5);

    pub async fn run(self) -> Result {
        info!("waiting {:?} for the system to start up…", Self::STARTUP_SETTLE);
        sleep(Self::STARTUP_SETTLE).await;

        let store = Store::new(self.state_file);
        let now = Utc::now();
        let mut controller = RampController::new(self.timestep.into(), now);
        if let Some(snapshot) = store.read::<RampSnapshot>() {
            if snapshot.is_resumable(now, system_uptime()?) {
                match RampState::try_from(snapshot.state) {
                    Ok(state) if snapshot.state_entry_time.timestamp() >= 0 => {
                        info!(%state, "resuming from the stored snapshot");
                        controller.resume(state, snapshot.state_entry_time);
                    }
                    Ok(_) => warn!("invalid state entry time, starting afresh"),
                    Err(raw) => warn!(raw, "unknown ramp state, starting afresh"),
                }
            } else {
                info!("the stored snapshot is stale or a reboot intervened, starting afresh");
            }
        }

        let mut driver = RampLoop::builder()
            .bus(Bus::connect().await?)
            .store(store)
            .controller(controller)
            .timestep(self.timestep)
            .build();
        let result = driver.run().await;
        if let Err(error) = &result {
            error!("fatal control error: {error:#}");
            driver.fail_safe().await;
        }
        result
    }
}

#[derive(Builder)]
struct RampLoop {
    bus: Bus,
    store: Store,
    controller: RampController,

    #[builder(skip)]
    status: StatusLog,

    #[builder(into)]
    timestep: Duration,

    /// Last-safe substitutes for readings that failed this tick.
    #[builder(skip)]
    last_start_requested: bool,
    #[builder(skip)]
    last_ac_input_current: f64,
    #[builder(skip)]
    last_limit: Option<f64>,
}

impl RampLoop {
    async fn run(&mut self) -> Result {
        let should_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&should_terminate))?;

        let mut interval = interval(self.timestep);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !should_terminate.load(Ordering::Relaxed) {
            interval.tick().await;
            self.tick().await?;
        }
        info!("terminating on signal");
        self.persist(Utc::now());
        Ok(())
    }

    /// One control step: read the bus, advance the machine and apply its
    /// outputs. Reads always precede the computation, outputs always precede
    /// persistence.
    async fn tick(&mut self) -> Result {
        let charge_limit = self.bus.get_f64(Item::BatteryChargeLimit).await?;
        let discharge_limit = self.bus.get_f64(Item::BatteryDischargeLimit).await?;
        let bms_connected = charge_limit.is_some() && discharge_limit.is_some();
        if !bms_connected {
            warn!("did not receive the battery current limits");
        }

        let switch_mode = self.bus.get_switch_mode().await?;

        // The device only accepts the limit while inverting or charging:
        if matches!(switch_mode, Some(SwitchMode::On | SwitchMode::ChargeOnly)) {
            self.last_limit = self.bus.get_f64(Item::AcInputCurrentLimit).await?.map(round_tenth);
        }
        if let Some(requested) = self.bus.get_bool(Item::Relay(Relay::GeneratorStart)).await? {
            self.last_start_requested = requested;
        } else {
            warn!("did not receive the start-request feedback");
        }
        if let Some(current) = self.bus.get_f64(Item::AcInputCurrent).await? {
            self.last_ac_input_current = round_tenth(current);
        } else {
            warn!("did not receive the AC input current");
        }

        let inputs = RampInputs {
            inverter_connected: switch_mode.is_some(),
            start_requested: self.last_start_requested,
            ac_input_current: self.last_ac_input_current,
            battery_charge_limit: charge_limit.unwrap_or(0.0),
            battery_discharge_limit: discharge_limit.unwrap_or(0.0),
            ac_input_current_limit: self.last_limit,
        };
        let now = Utc::now();
        let previous_state = self.controller.state();
        let outputs = self.controller.tick(&inputs, now);

        if let Some(target) = outputs.current_limit {
            if self.bus.set_f64(Item::AcInputCurrentLimit, target).await? {
                info!(from = ?self.last_limit, to = target, "updating the AC input current limit");
            } else {
                warn!(target, "failed to update the AC input current limit");
            }
        } else if self.controller.inverter_delay() > 0 {
            debug!(ticks = self.controller.inverter_delay(), "holding the current limit back");
        }

        if outputs.state_changed {
            info!(from = %previous_state, to = %self.controller.state(), "ramp state changed");
            self.persist(now);
        }

        let fault =
            !bms_connected || (switch_mode != Some(SwitchMode::Off) && switch_mode.is_none());
        self.status.push(format!(
            "state {} | switch {switch_mode:?} | BMS {:.1}A/{:.1}A | start {} | AC in {:.1}A | limit {:?}A | target {:.1}A | ramp {:.1}s | delay {} | fault {fault} | stalls {}",
            self.controller.state(),
            inputs.battery_charge_limit,
            inputs.battery_discharge_limit,
            inputs.start_requested,
            inputs.ac_input_current,
            self.last_limit,
            self.controller.target(),
            self.controller.state_time(now),
            self.controller.inverter_delay(),
            self.controller.stall_counter(),
        ));
        Ok(())
    }

    /// Best-effort fail-safe before dying on a fatal error.
    async fn fail_safe(&mut self) {
        warn!("storing the ramp state before going down");
        self.persist(Utc::now());
        sleep(Duration::from_secs(5)).await;
    }

    fn persist(&self, now: DateTime<Utc>) {
        let snapshot = RampSnapshot {
            state: self.controller.state() as u8,
            state_entry_time: self.controller.state_entry(),
            time: now,
        };
        if let Err(error) = self.store.write(&snapshot) {
            warn!("failed to store the ramp state: {error:#}");
        }
    }
}
