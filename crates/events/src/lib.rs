//! Control-plane messaging: commands, envelopes and the notifier abstraction.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{Notifier, NotifyError, Subscription};
pub use command::ControlCommand;
pub use envelope::ControlEnvelope;
pub use in_memory_bus::InMemoryNotifier;
