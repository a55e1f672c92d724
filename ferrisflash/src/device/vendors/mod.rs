//! Per-vendor model drivers.

pub mod adtran;
pub mod comtrend;
