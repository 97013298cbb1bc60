//! MAC address resolution from the kernel neighbor table.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

/// Resolves an IPv4 address to a MAC address. Best effort.
#[async_trait]
pub trait MacResolver: Send + Sync {
    async fn resolve(&self, ip: Ipv4Addr) -> std::io::Result<Option<String>>;
}

/// Reads a `/proc/net/arp`-format table on every lookup.
///
/// Hosts were just probed by fping and SNMP, so their entries are fresh.
pub struct NeighborTableResolver {
    path: PathBuf,
}

impl NeighborTableResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MacResolver for NeighborTableResolver {
    async fn resolve(&self, ip: Ipv4Addr) -> std::io::Result<Option<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_neighbor_table(&content).remove(&ip))
    }
}

/// Parse complete entries from a `/proc/net/arp` listing.
pub fn parse_neighbor_table(content: &str) -> HashMap<Ipv4Addr, String> {
    let mut map = HashMap::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [ip, _hw_type, flags, mac, ..] = parts.as_slice() else {
            continue;
        };
        let Ok(ip) = ip.parse::<Ipv4Addr>() else {
            continue;
        };
        // 0x0 marks an incomplete entry.
        if *flags == "0x0" || mac.len() != 17 || *mac == "00:00:00:00:00:00" {
            continue;
        }
        map.insert(ip, mac.to_uppercase());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
10.1.1.1         0x1         0x2         00:18:23:aa:bb:01     *        eth0
10.1.1.2         0x1         0x0         00:00:00:00:00:00     *        eth0
10.1.1.3         0x1         0x2         00:18:23:aa:bb:03     *        eth1
garbage line
";

    #[test]
    fn parses_complete_entries_only() {
        let map = parse_neighbor_table(TABLE);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&Ipv4Addr::new(10, 1, 1, 1)], "00:18:23:AA:BB:01");
        assert!(!map.contains_key(&Ipv4Addr::new(10, 1, 1, 2)));
    }

    #[tokio::test]
    async fn resolver_reads_table_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();

        let resolver = NeighborTableResolver::new(file.path());
        let mac = resolver.resolve(Ipv4Addr::new(10, 1, 1, 3)).await.unwrap();
        assert_eq!(mac.as_deref(), Some("00:18:23:AA:BB:03"));
        assert_eq!(resolver.resolve(Ipv4Addr::new(10, 9, 9, 9)).await.unwrap(), None);
    }
}
