//! State change broadcasting.

pub mod broadcaster;
pub mod throttle;

pub use broadcaster::StateBroadcaster;
pub use throttle::ThrottleScheduler;
