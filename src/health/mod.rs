//! Health checking for registered proxies
//!
//! A [`HealthScheduler`] sweeps every probe-eligible proxy through a [`Prober`],
//! persists the outcome and feeds it to the [`FailureTracker`], which moves proxies
//! in and out of quarantine and raises alerts through the [`AlertEmitter`].

pub mod alert;
pub mod prober;
pub mod scheduler;
pub mod tracker;
pub mod transport;

pub use alert::{AlertEmitter, AlertNotifier};
pub use prober::{Prober, TransportProber};
pub use scheduler::{HealthScheduler, SchedulerHandle, SweepReport};
pub use tracker::{FailureTracker, TrackerOutcome};
pub use transport::{ProbeTarget, ProxyTransport};
