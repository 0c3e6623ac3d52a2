//! Connection recovery.

pub mod manager;
pub mod notifier;

pub use manager::{
    DisconnectOutcome, Reconnector, RecoveryEvent, RecoveryManager, RecoveryRecord, RecoveryState,
    RegistryReconnector,
};
pub use notifier::run_recovery_notifier;
