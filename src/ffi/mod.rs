//! C ABI surface for the host application.

pub mod bridge;
pub mod carriers;

#[cfg(windows)]
pub mod exports;
