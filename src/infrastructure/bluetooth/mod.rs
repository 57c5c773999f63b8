//! Bluetooth Module
//!
//! BLE access for the host bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       BleSession                         │
//! │   (one per host session - public API for the bridge)     │
//! └──────┬──────────────┬────────────────┬──────────────────┘
//!        │              │                │
//!        ▼              ▼                ▼
//! ┌────────────┐ ┌──────────────┐ ┌───────────────┐
//! │  Scanner   │ │ Subscriptions│ │   Resolver    │
//! │            │ │              │ │               │
//! │ - watchers │ │ - CCCD       │ │ - device →    │
//! │ - sink     │ │ - handlers   │ │   service →   │
//! │            │ │              │ │   char        │
//! └─────┬──────┘ └──────┬───────┘ └───────┬───────┘
//!       │               │                 ▼
//!       │               │         ┌───────────────┐
//!       │               │         │     Cache     │
//!       │               │         └───────┬───────┘
//!       ▼               ▼                 ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        ScanBackend / GattBackend (WinRT or mock)         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backend`] - OS stack traits
//! - [`cache`] - Handle cache keyed by address and UUIDs
//! - [`resolver`] - Cached lookups and fresh enumerations
//! - [`scanner`] - Advertisement and device scans
//! - [`subscriptions`] - Notification registrations
//! - [`shutdown`] - Quit flag and blocking-caller wakeup
//! - [`session`] - Main coordinator

pub mod backend;
pub mod cache;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod shutdown;
pub mod subscriptions;

#[cfg(test)]
pub mod mock;

#[cfg(windows)]
pub mod winrt;

pub use session::{BleSession, SessionOptions};
