//! Power status state machine
//!
//! Tracks the last reported power status, suppresses repeats and classifies
//! every inbound frame as a repeat, a power loss, a power restoration or an
//! unexpected value. Evaluation and commit are split so the coordinator can
//! dispatch the workflow before the new status becomes the reference.

use crate::models::StatusFrame;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerStatus {
    On,
    Off,
    /// Anything else the detector reports, lowercased
    Other(String),
}

impl PowerStatus {
    /// Case-insensitive, whitespace-trimmed
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "on" => PowerStatus::On,
            "off" => PowerStatus::Off,
            _ => PowerStatus::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PowerStatus::On => "on",
            PowerStatus::Off => "off",
            PowerStatus::Other(s) => s,
        }
    }

    pub fn to_frame(&self) -> StatusFrame {
        StatusFrame { status: self.as_str().to_string() }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Same value as last time: echo only
    Repeat,
    /// on -> off
    PowerLost,
    /// off -> on
    PowerRestored,
    /// Any other change; committed but inert
    Unexpected { from: PowerStatus, to: PowerStatus },
}

#[derive(Debug)]
pub struct StatusMachine {
    last: PowerStatus,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    /// Power is assumed on at startup
    pub fn new() -> Self {
        Self { last: PowerStatus::On }
    }

    pub fn last(&self) -> &PowerStatus {
        &self.last
    }

    pub fn evaluate(&self, status: &PowerStatus) -> Transition {
        if *status == self.last {
            return Transition::Repeat;
        }

        match (&self.last, status) {
            (PowerStatus::On, PowerStatus::Off) => Transition::PowerLost,
            (PowerStatus::Off, PowerStatus::On) => Transition::PowerRestored,
            (from, to) => Transition::Unexpected { from: from.clone(), to: to.clone() },
        }
    }

    pub fn commit(&mut self, status: PowerStatus) {
        self.last = status;
    }
}
