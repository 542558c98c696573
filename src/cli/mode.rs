use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bon::Builder;
use chrono::Utc;
use clap::Parser;
use tokio::time::{MissedTickBehavior, interval, sleep};

use crate::{
    api::{
        bus::{Bus, Item},
        gpio,
    },
    core::{
        mode::{ModeController, ModeInputs, ModeOutputs},
        relay::Relay,
    },
    fmt::StatusLog,
    prelude::*,
    store::{ModeSnapshot, Store, system_uptime},
};

#[derive(Parser)]
pub struct ModeArgs {
    /// Control loop timestep.
    #[clap(long, env = "MODE_TIMESTEP", default_value = "1s")]
    timestep: humantime::Duration,

    /// Snapshot file used to survive service restarts.
    #[clap(long, env = "MODE_STATE_FILE", default_value = "/data/genctl/mode.json")]
    state_file: PathBuf,

    /// Root of the exported GPIO value files.
    #[clap(long, env = "GPIO_ROOT", default_value = "/dev/gpio")]
    gpio_root: PathBuf,
}

impl ModeArgs {
    pub async fn run(self) -> Result {
        let store = Store::new(self.state_file);
        let mut controller = ModeController::new(self.timestep.into());
        if let Some(snapshot) = store.read::<ModeSnapshot>() {
            if snapshot.is_resumable(Utc::now(), system_uptime()?) {
                info!(mode = %snapshot.mode, "resuming from the stored snapshot");
                controller.resume(snapshot.mode);
            } else {
                info!("the stored snapshot is stale or a reboot intervened, starting afresh");
            }
        }

        let mut driver = ModeLoop::builder()
            .bus(Bus::connect().await?)
            .inputs(gpio::Inputs::new(self.gpio_root))
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
struct ModeLoop {
    bus: Bus,
    inputs: gpio::Inputs,
    store: Store,
    controller: ModeController,

    #[builder(skip)]
    status: StatusLog,

    #[builder(into)]
    timestep: Duration,
}

impl ModeLoop {
    /// Drain period of the graceful-restart and fail-safe sequences.
    const DRAIN: Duration = Duration::from_secs(5);

    async fn run(&mut self) -> Result {
        let should_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&should_terminate))?;

        let mut interval = interval(self.timestep);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !should_terminate.load(Ordering::Relaxed) {
            interval.tick().await;
            if self.tick().await?.is_break() {
                return self.restart().await;
            }
        }
        info!("terminating on signal");
        self.persist();
        Ok(())
    }

    /// One control step: read the panel and the bus, run the controller and
    /// apply its outputs. Reads always precede the computation, outputs
    /// always precede persistence.
    async fn tick(&mut self) -> Result<ControlFlow<()>> {
        let buttons = self.inputs.read_buttons()?;
        let panel = self.inputs.read_panel()?;

        let charge_limit = self.bus.get_f64(Item::BatteryChargeLimit).await?;
        let discharge_limit = self.bus.get_f64(Item::BatteryDischargeLimit).await?;
        let bms_connected = charge_limit.is_some() && discharge_limit.is_some();
        if !bms_connected {
            warn!("did not receive the battery current limits");
        }

        let battery_soc = self.bus.get_f64(Item::BatterySoc).await?;
        if battery_soc.is_none() {
            warn!("did not receive the battery state of charge");
        }
        let ac_output_power = self.bus.get_f64(Item::AcOutputPower).await?;
        if ac_output_power.is_none() {
            warn!("did not receive the inverter output power");
        }
        let switch_mode = self.bus.get_switch_mode().await?;

        let mut feedback = HashMap::new();
        for relay in Relay::OUTPUTS {
            feedback.insert(relay, self.bus.get_bool(Item::Relay(relay)).await?);
        }

        let inputs = ModeInputs {
            buttons,
            battery_soc: battery_soc.unwrap_or(0.0),
            ac_output_power: ac_output_power.unwrap_or(0.0),
            battery_charge_limit: charge_limit.unwrap_or(0.0),
            battery_discharge_limit: discharge_limit.unwrap_or(0.0),
            switch_mode,
            inverter_connected: switch_mode.is_some(),
            bms_connected,
        };
        let outputs = self.controller.tick(&inputs, Utc::now());

        if outputs.restart_requested {
            return Ok(ControlFlow::Break(()));
        }

        self.drive_relays(&outputs, &feedback).await?;

        if let Some(target) = outputs.switch_mode {
            if self.bus.set_u32(Item::InverterSwitchMode, target as u32).await? {
                info!(?target, "switched the inverter");
            } else {
                warn!(?target, "failed to switch the inverter");
            }
        }

        self.status.push(format!(
            "mode {} | SOC {:.0}% | AC out {:.0}W | switch {:?} | reverse {:.0}s | alarm {} | fault {} | panel {}/{}/{}/{}",
            self.controller.mode(),
            inputs.battery_soc,
            inputs.ac_output_power,
            self.controller.switch_target(),
            self.timestep.as_secs_f64() * f64::from(self.controller.reverse_power_counter()),
            self.controller.reverse_power_alarm(),
            outputs.fault,
            u8::from(panel.off_led),
            u8::from(panel.on_led),
            u8::from(panel.charge_led),
            u8::from(panel.bms_wake),
        ));
        Ok(ControlFlow::Continue(()))
    }

    /// Relay control is safety-critical: a partially applied pass leaves the
    /// installation in an undefined state, so any failure is escalated.
    async fn drive_relays(
        &mut self,
        outputs: &ModeOutputs,
        feedback: &HashMap<Relay, Option<bool>>,
    ) -> Result {
        let mut failures = 0_u32;
        for (relay, value) in outputs.relays {
            if feedback.get(&relay).copied().flatten() == Some(value) {
                continue; // already in the requested state
            }
            if self.bus.set_relay(relay, value).await? {
                debug!(%relay, value, "relay driven");
            } else {
                failures += 1;
            }
        }
        ensure!(failures == 0, "{failures} relay write(s) failed");
        Ok(())
    }

    /// Graceful service restart: light all three LEDs, store the mode and
    /// drain before handing control back to the supervisor.
    async fn restart(&mut self) -> Result {
        info!("service restart requested, going down in {:?}", Self::DRAIN);
        self.force_leds_on().await;
        self.persist();
        sleep(Self::DRAIN).await;
        Ok(())
    }

    /// Best-effort fail-safe sequence before dying on a fatal error.
    async fn fail_safe(&mut self) {
        warn!("forcing the status LEDs on before going down");
        self.force_leds_on().await;
        self.persist();
        sleep(Self::DRAIN).await;
    }

    async fn force_leds_on(&mut self) {
        for relay in [Relay::OffLed, Relay::OnLed, Relay::ChargeLed] {
            if !matches!(self.bus.set_relay(relay, true).await, Ok(true)) {
                warn!(%relay, "failed to force the LED on");
            }
        }
    }

    fn persist(&self) {
        let snapshot = ModeSnapshot { mode: self.controller.mode(), time: Utc::now() };
        if let Err(error) = self.store.write(&snapshot) {
            warn!("failed to store the mode: {error:#}");
        }
    }
}
