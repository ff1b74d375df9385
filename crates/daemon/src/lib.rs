pub mod event_loop;
pub mod ledger;
pub mod notify;
pub mod policy;
pub mod polkit;
#[cfg(feature = "udev-monitor")]
pub mod udev_monitor;

pub use event_loop::DeviceEventLoop;
pub use ledger::DecisionLedger;
pub use notify::{DesktopNotifier, NotificationDispatcher};
pub use policy::InterceptionEngine;
