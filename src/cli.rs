mod mode;
mod ramp;

use clap::{Parser, Subcommand};

pub use self::{mode::ModeArgs, ramp::RampArgs};

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
#[must_use]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Operating-mode, fault and relay controller.
    #[clap(name = "mode")]
    Mode(Box<ModeArgs>),

    /// Generator AC input current-limit ramp controller.
    #[clap(name = "ramp")]
    Ramp(Box<RampArgs>),
}
