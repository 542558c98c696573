use std::{
    collections::{HashMap, hash_map::Entry},
    env,
    time::Duration,
};

use tokio::time::timeout;
use zbus::{Connection, Proxy, zvariant::Value};

use crate::{
    core::{mode::SwitchMode, relay::Relay},
    prelude::*,
};

/// Catalog of the remote properties the controllers work with.
///
/// Every item maps to one D-Bus object speaking the `BusItem` interface;
/// absence of a handle is an explicit state, not a missing key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Item {
    BatterySoc,
    BatteryChargeLimit,
    BatteryDischargeLimit,
    AcOutputPower,
    AcInputCurrent,
    AcInputCurrentLimit,
    InverterSwitchMode,
    Relay(Relay),
}

impl Item {
    const SYSTEM_SERVICE: &'static str = "com.victronenergy.system";
    const BATTERY_SERVICE: &'static str = "com.victronenergy.battery.socketcan_vecan0";
    const VEBUS_SERVICE: &'static str = "com.victronenergy.vebus.ttyS2";

    const fn service(self) -> &'static str {
        match self {
            Self::BatterySoc | Self::Relay(_) => Self::SYSTEM_SERVICE,
            Self::BatteryChargeLimit | Self::BatteryDischargeLimit => Self::BATTERY_SERVICE,
            Self::AcOutputPower
            | Self::AcInputCurrent
            | Self::AcInputCurrentLimit
            | Self::InverterSwitchMode => Self::VEBUS_SERVICE,
        }
    }

    fn path(self) -> String {
        match self {
            Self::BatterySoc => "/Dc/Battery/Soc".to_string(),
            Self::BatteryChargeLimit => "/Info/MaxChargeCurrent".to_string(),
            Self::BatteryDischargeLimit => "/Info/MaxDischargeCurrent".to_string(),
            Self::AcOutputPower => "/Ac/Out/L1/P".to_string(),
            Self::AcInputCurrent => "/Ac/ActiveIn/L1/I".to_string(),
            Self::AcInputCurrentLimit => "/Ac/In/1/CurrentLimit".to_string(),
            Self::InverterSwitchMode => "/Mode".to_string(),
            Self::Relay(relay) => format!("/Relay/{}/State", relay.index()),
        }
    }
}

/// Typed access to the remote property bus.
///
/// Item handles are created lazily and dropped on any call failure, so a
/// flapping service is re-resolved on the next tick instead of poisoning the
/// cache. A call that exceeds [`Bus::CALL_TIMEOUT`] is beyond what the
/// control loop can absorb and is escalated as fatal.
pub struct Bus {
    connection: Connection,
    items: HashMap<Item, Proxy<'static>>,
}

impl Bus {
    const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    const ITEM_INTERFACE: &'static str = "com.victronenergy.BusItem";

    pub async fn connect() -> Result<Self> {
        let connection = if env::var_os("DBUS_SESSION_BUS_ADDRESS").is_some() {
            Connection::session().await.context("failed to connect to the session bus")?
        } else {
            Connection::system().await.context("failed to connect to the system bus")?
        };
        Ok(Self { connection, items: HashMap::new() })
    }

    /// Read the item as a float.
    ///
    /// `Ok(None)` is a transient failure or an invalid reading: a failed
    /// handle has been invalidated and will be recreated on the next call.
    #[instrument(skip(self))]
    pub async fn get_f64(&mut self, item: Item) -> Result<Option<f64>> {
        let Some(proxy) = self.item(item).await else {
            return Ok(None);
        };
        match timeout(Self::CALL_TIMEOUT, proxy.call_method("GetValue", &())).await {
            Err(_) => bail!(
                "getting {item:?} took more than {:?}, the bus is unrecoverable",
                Self::CALL_TIMEOUT,
            ),
            Ok(Ok(reply)) => {
                let body = reply.body();
                match body.deserialize::<Value<'_>>() {
                    Ok(value) => Ok(scalar(&value)),
                    Err(error) => {
                        warn!(?item, "failed to decode the value: {error}");
                        self.items.remove(&item);
                        Ok(None)
                    }
                }
            }
            Ok(Err(error)) => {
                warn!(?item, "failed to get the value: {error}");
                self.items.remove(&item);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    #[expect(clippy::cast_possible_truncation)]
    #[expect(clippy::cast_sign_loss)]
    pub async fn get_u32(&mut self, item: Item) -> Result<Option<u32>> {
        Ok(self.get_f64(item).await?.map(|value| value.round() as u32))
    }

    #[instrument(skip(self))]
    #[allow(clippy::float_cmp)]
    pub async fn get_bool(&mut self, item: Item) -> Result<Option<bool>> {
        Ok(self.get_f64(item).await?.map(|value| value != 0.0))
    }

    /// Write the item. `Ok(false)` is a transient failure, `Err` a timeout.
    #[instrument(skip(self, value))]
    pub async fn set(&mut self, item: Item, value: Value<'_>) -> Result<bool> {
        let Some(proxy) = self.item(item).await else {
            return Ok(false);
        };
        match timeout(Self::CALL_TIMEOUT, proxy.call_method("SetValue", &value)).await {
            Err(_) => bail!(
                "setting {item:?} took more than {:?}, the bus is unrecoverable",
                Self::CALL_TIMEOUT,
            ),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(error)) => {
                warn!(?item, "failed to set the value: {error}");
                self.items.remove(&item);
                Ok(false)
            }
        }
    }

    /// Read and validate the inverter switch mode.
    ///
    /// `None` doubles as the inverter-connectivity probe: an unreachable
    /// inverter and an unknown mode value are both treated as disconnected.
    pub async fn get_switch_mode(&mut self) -> Result<Option<SwitchMode>> {
        match self.get_u32(Item::InverterSwitchMode).await? {
            Some(raw) => match SwitchMode::try_from(raw) {
                Ok(mode) => Ok(Some(mode)),
                Err(raw) => {
                    warn!(raw, "unknown inverter switch mode");
                    Ok(None)
                }
            },
            None => {
                warn!("did not receive the inverter switch mode");
                Ok(None)
            }
        }
    }

    pub async fn set_relay(&mut self, relay: Relay, closed: bool) -> Result<bool> {
        self.set(Item::Relay(relay), Value::I32(i32::from(closed))).await
    }

    pub async fn set_u32(&mut self, item: Item, value: u32) -> Result<bool> {
        self.set(item, Value::U32(value)).await
    }

    pub async fn set_f64(&mut self, item: Item, value: f64) -> Result<bool> {
        self.set(item, Value::F64(value)).await
    }

    /// Look up the item handle, creating it on first use.
    async fn item(&mut self, item: Item) -> Option<&Proxy<'static>> {
        match self.items.entry(item) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!(?item, "creating the bus item…");
                let proxy = Proxy::new(
                    &self.connection,
                    item.service(),
                    item.path(),
                    Self::ITEM_INTERFACE,
                )
                .await;
                match proxy {
                    Ok(proxy) => Some(entry.insert(proxy)),
                    Err(error) => {
                        warn!(?item, "failed to create the bus item: {error}");
                        None
                    }
                }
            }
        }
    }
}

/// Unwrap a numeric bus value. Victron publishes these as varying integer and
/// float variants, and an invalid reading as an empty container.
#[expect(clippy::cast_precision_loss)]
fn scalar(value: &Value<'_>) -> Option<f64> {
    match value {
        Value::Bool(value) => Some(f64::from(u8::from(*value))),
        Value::U8(value) => Some(f64::from(*value)),
        Value::I16(value) => Some(f64::from(*value)),
        Value::U16(value) => Some(f64::from(*value)),
        Value::I32(value) => Some(f64::from(*value)),
        Value::U32(value) => Some(f64::from(*value)),
        Value::I64(value) => Some(*value as f64),
        Value::U64(value) => Some(*value as f64),
        Value::F64(value) => Some(*value),
        Value::Value(value) => scalar(value),
        _ => None,
    }
}
