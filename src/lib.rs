//! WinRT Bluetooth LE bridge
//!
//! A native library that lets a host application scan for BLE peripherals,
//! resolve their GATT services and characteristics, subscribe to
//! notifications and read or write values through a flat C interface.

pub mod domain;
pub mod ffi;
pub mod infrastructure;
