use derive_more::Display;

/// Relays of the installation, named after the lines they drive.
///
/// The GX device exposes them as numbered `/Relay/<n>/State` items; the
/// numbering is a wiring detail that stays confined to [`Relay::index`].
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Relay {
    /// Generator start-request contact, read back as an input by the ramp
    /// controller.
    GeneratorStart,

    /// "Off" mode indicator LED.
    OffLed,

    /// "On" mode indicator LED.
    OnLed,

    /// "Charge only" mode indicator LED.
    ChargeLed,

    /// Keeps the BMS awake while the installation is active.
    BmsWake,

    /// DSE remote-start line.
    DseRemoteStart,

    /// DSE mode-request line.
    DseModeRequest,

    /// Pulses the RCD reset mechanism.
    RcdReset,

    /// External reverse-power alarm indicator.
    ReversePowerAlarm,
}

impl Relay {
    /// The relay outputs driven by the mode controller, in write order.
    pub const OUTPUTS: [Self; 8] = [
        Self::OffLed,
        Self::OnLed,
        Self::ChargeLed,
        Self::BmsWake,
        Self::DseRemoteStart,
        Self::DseModeRequest,
        Self::RcdReset,
        Self::ReversePowerAlarm,
    ];

    /// Relay number on the GX device.
    pub const fn index(self) -> u8 {
        match self {
            Self::GeneratorStart => 0,
            Self::OffLed => 2,
            Self::OnLed => 3,
            Self::ChargeLed => 4,
            Self::BmsWake => 5,
            Self::DseRemoteStart => 6,
            Self::DseModeRequest => 7,
            Self::RcdReset => 8,
            Self::ReversePowerAlarm => 9,
        }
    }
}
