pub mod leveraged;

pub use leveraged::{BrokerError, LeveragedBroker, LeveragedBrokerConfig, SubmitOutcome};
