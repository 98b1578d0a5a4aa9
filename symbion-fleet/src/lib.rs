//! Symbion Fleet - control plane for a fleet of remote agents.
//!
//! Hosts are organized into groups, identified with trust-on-first-use,
//! classified at self-registration by ordered rules, and receive scripts on
//! demand or on cron schedules. [`kernel::FleetKernel`] wires the services
//! together and exposes the operations.

pub mod classifier;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod inventory;
pub mod kernel;
pub mod membership;
pub mod models;
pub mod mqtt;
pub mod reachability;
pub mod registration;
pub mod scheduler;
pub mod schedules;
pub mod state;
pub mod store;
pub mod transport;
pub mod trust;

pub use error::{ErrorClass, FleetError, Result};
pub use kernel::{FleetKernel, FleetStores, KernelOptions};
