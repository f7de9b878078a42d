//! Trait abstraction for the device link to enable testing

use crate::error::Result;
use crate::protocol::{Command, DeviceMessage};

/// Trait for the packetized link to the flight controller
///
/// The link is unreliable: commands may be lost and replies may arrive out of
/// order or not at all. Implementations must never block.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceLink {
    /// Queue a command for transmission
    fn send(&mut self, command: Command) -> Result<()>;

    /// Take the next inbound message, if one has arrived
    fn recv(&mut self) -> Option<DeviceMessage>;

    /// Last known value of a device parameter
    fn param(&self, name: &str) -> Option<f32>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::LogDumpError;
    use std::collections::{HashMap, VecDeque};

    /// Recording link for testing
    #[derive(Debug, Default)]
    pub struct RecordingLink {
        pub sent: Vec<Command>,
        pub inbound: VecDeque<DeviceMessage>,
        pub params: HashMap<String, f32>,
        pub fail_sends: bool,
    }

    impl RecordingLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_param(mut self, name: &str, value: f32) -> Self {
            self.params.insert(name.to_string(), value);
            self
        }

        pub fn push(&mut self, message: DeviceMessage) {
            self.inbound.push_back(message);
        }

        pub fn take_sent(&mut self) -> Vec<Command> {
            std::mem::take(&mut self.sent)
        }
    }

    impl DeviceLink for RecordingLink {
        fn send(&mut self, command: Command) -> Result<()> {
            if self.fail_sends {
                return Err(LogDumpError::Link("mock send error".to_string()));
            }
            if let Command::ParamSet { name, value } = &command {
                self.params.insert(name.clone(), *value);
            }
            self.sent.push(command);
            Ok(())
        }

        fn recv(&mut self) -> Option<DeviceMessage> {
            self.inbound.pop_front()
        }

        fn param(&self, name: &str) -> Option<f32> {
            self.params.get(name).copied()
        }
    }
}
