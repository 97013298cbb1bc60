//! IPv4 range helpers.
//!
//! Rooms are configured as a start/end address pair. The liveness sweep wants
//! a single CIDR block, so [`covering_cidr`] computes the smallest block that
//! contains both endpoints. [`AddressRange`] answers membership questions
//! against the exact configured range.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::RangeError;

/// An inclusive IPv4 range with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// Parse a start/end pair, rejecting non-IPv4 input and reversed ranges.
    pub fn parse(start: &str, end: &str) -> Result<Self, RangeError> {
        let start_addr = parse_ipv4(start)?;
        let end_addr = parse_ipv4(end)?;
        let (start_int, end_int) = (u32::from(start_addr), u32::from(end_addr));

        if start_int > end_int {
            return Err(RangeError::RangeOrder {
                start: start.trim().to_string(),
                end: end.trim().to_string(),
            });
        }

        Ok(Self {
            start: start_int,
            end: end_int,
        })
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }

    /// A range always holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let value = u32::from(ip);
        value >= self.start && value <= self.end
    }

    /// Smallest CIDR block containing the whole range.
    pub fn covering_net(&self) -> Ipv4Net {
        let prefix = (self.start ^ self.end).leading_zeros() as u8;
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        let network = Ipv4Addr::from(self.start & mask);
        // prefix is derived from leading_zeros of a u32, so it is always <= 32.
        Ipv4Net::new(network, prefix)
            .unwrap_or_else(|_| Ipv4Net::from(network))
            .trunc()
    }

    /// Iterate over every address in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }
}

/// Smallest CIDR block whose address range contains both endpoints.
pub fn covering_cidr(start: &str, end: &str) -> Result<Ipv4Net, RangeError> {
    Ok(AddressRange::parse(start, end)?.covering_net())
}

/// Every address between `start` and `end` inclusive, ascending.
pub fn expand_range(start: &str, end: &str) -> Result<Vec<Ipv4Addr>, RangeError> {
    Ok(AddressRange::parse(start, end)?.iter().collect())
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr, RangeError> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| RangeError::InvalidAddress(raw.to_string()))
}
