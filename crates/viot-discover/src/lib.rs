//! viot-discover: Device discovery and identification for data-center rooms.
//!
//! Sweeps configured room ranges with fping, identifies live hosts over
//! SNMP, cascades into Modbus sweeps behind identified gateways, and appends
//! new devices to CSV pending lists.

pub mod arp;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identify;
pub mod library;
pub mod liveness;
pub mod modbus;
pub mod persist;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod snmp;
