use std::{fs, path::PathBuf};

use enumset::EnumSet;

use crate::{core::mode::Button, prelude::*};

/// Digital input lines of the operator panel, already debounced in hardware.
#[derive(Copy, Clone, Debug)]
pub enum Line {
    OffButton,
    OnButton,
    ChargeButton,
    OffLedFeedback,
    OnLedFeedback,
    ChargeLedFeedback,
    BmsWakeFeedback,
}

impl Line {
    /// Directory of the line under the GPIO root.
    const fn directory(self) -> &'static str {
        match self {
            Self::OffButton => "digital_input_5",
            Self::OnButton => "digital_input_6",
            Self::ChargeButton => "digital_input_7",
            Self::OffLedFeedback => "digital_input_8",
            Self::OnLedFeedback => "digital_input_9",
            Self::ChargeLedFeedback => "digital_input_a",
            Self::BmsWakeFeedback => "digital_input_b",
        }
    }
}

/// Reads the panel lines from the kernel's exported GPIO value files.
pub struct Inputs {
    root: PathBuf,
}

impl Inputs {
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn read(&self, line: Line) -> Result<bool> {
        let path = self.root.join(line.directory()).join("value");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read `{}`", path.display()))?;
        Ok(raw.trim() == "1")
    }

    pub fn read_buttons(&self) -> Result<EnumSet<Button>> {
        let mut buttons = EnumSet::new();
        if self.read(Line::OffButton)? {
            buttons |= Button::Off;
        }
        if self.read(Line::OnButton)? {
            buttons |= Button::On;
        }
        if self.read(Line::ChargeButton)? {
            buttons |= Button::Charge;
        }
        Ok(buttons)
    }

    pub fn read_panel(&self) -> Result<PanelFeedback> {
        Ok(PanelFeedback {
            off_led: self.read(Line::OffLedFeedback)?,
            on_led: self.read(Line::OnLedFeedback)?,
            charge_led: self.read(Line::ChargeLedFeedback)?,
            bms_wake: self.read(Line::BmsWakeFeedback)?,
        })
    }
}

/// Feedback contacts of the panel LEDs and the BMS-wake line.
#[derive(Copy, Clone, Debug)]
pub struct PanelFeedback {
    pub off_led: bool,
    pub on_led: bool,
    pub charge_led: bool,
    pub bms_wake: bool,
}
