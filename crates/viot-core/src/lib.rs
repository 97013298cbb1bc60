//! viot-core: Shared record types and address-range utilities for the viot scanner.
//!
//! This crate provides the leaf pieces every scanner component builds on:
//! - Identified-device records and their identity keys
//! - Protocol and instance-type classification enums
//! - Pure CIDR / address-range helpers
//! - Common error types

pub mod cidr;
pub mod error;
pub mod types;

pub use error::RangeError;
