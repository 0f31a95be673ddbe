//! Geolocation backed by a TOML table of CIDR networks.
//!
//! The table is loaded explicitly with [`TableResolver::open`] and released with
//! [`TableResolver::close`]. Lookups pick the longest matching prefix.
//!
//! ```toml
//! [[network]]
//! cidr = "203.0.113.0/24"
//! country = "Netherlands"
//! iso = "NL"
//! city = "Amsterdam"
//! asn = "AS64500 Example Transit"
//! ```

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::RwLock;

use log::{debug, info, warn};
use serde::Deserialize;

use super::resolver::{CountryInfo, GeoResolver, UNAVAILABLE, UNKNOWN};
use crate::error_handling::types::ConfigError;

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    network: Vec<TableRow>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    cidr: String,
    country: Option<String>,
    iso: Option<String>,
    city: Option<String>,
    asn: Option<String>,
}

#[derive(Debug, Clone)]
struct Network {
    base: IpAddr,
    prefix: u8,
    country: Option<String>,
    iso: Option<String>,
    city: Option<String>,
    asn: Option<String>,
}

impl Network {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(base) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), ConfigError> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };
    let base: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("bad network address '{}'", cidr)))?;
    let max = if base.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p
            .trim()
            .parse::<u8>()
            .map_err(|_| ConfigError::InvalidValue(format!("bad prefix length in '{}'", cidr)))?,
        None => max,
    };
    if prefix > max {
        return Err(ConfigError::NotInRange(format!(
            "prefix length {} exceeds {} in '{}'",
            prefix, max, cidr
        )));
    }
    Ok((base, prefix))
}

/// Longest-prefix geolocation table with an explicit open/close lifecycle.
#[derive(Debug, Default)]
pub struct TableResolver {
    networks: RwLock<Option<Vec<Network>>>,
}

impl TableResolver {
    /// Creates a closed resolver; every lookup answers [`UNAVAILABLE`] until [`open`](Self::open).
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the table at `path`, replacing any table already open.
    ///
    /// On failure the resolver stays (or becomes) closed.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let loaded = Self::load(path);
        let mut guard = match self.networks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match loaded {
            Ok(networks) => {
                let count = networks.len();
                *guard = Some(networks);
                info!("Geolocation table {} loaded with {} networks", path.display(), count);
                Ok(count)
            }
            Err(e) => {
                *guard = None;
                warn!("Unable to load geolocation table {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Releases the table. Idempotent.
    pub fn close(&self) {
        let mut guard = match self.networks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            debug!("Geolocation table closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.networks.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn load(path: &Path) -> Result<Vec<Network>, ConfigError> {
        let content = fs::read_to_string(path)?;
        let file: TableFile =
            toml::from_str(&content).map_err(|e| ConfigError::TomlError(e.to_string()))?;

        file.network
            .into_iter()
            .map(|row| {
                let (base, prefix) = parse_cidr(&row.cidr)?;
                Ok(Network {
                    base,
                    prefix,
                    country: row.country,
                    iso: row.iso,
                    city: row.city,
                    asn: row.asn,
                })
            })
            .collect()
    }

    /// Runs `pick` on the best match. `None` when closed, `Some(None)` on a miss.
    fn lookup<F>(&self, ip: IpAddr, pick: F) -> Option<Option<String>>
    where
        F: Fn(&Network) -> Option<String>,
    {
        let guard = self.networks.read().ok()?;
        let networks = guard.as_ref()?;
        // IPv4-mapped IPv6 remotes match IPv4 rows
        let ip = ip.to_canonical();
        let best = networks
            .iter()
            .filter(|n| n.contains(ip))
            .max_by_key(|n| n.prefix);
        Some(best.and_then(|n| pick(n).filter(|v| !v.is_empty())))
    }

    fn lookup_or_sentinel<F>(&self, ip: IpAddr, pick: F) -> String
    where
        F: Fn(&Network) -> Option<String>,
    {
        match self.lookup(ip, pick) {
            None => UNAVAILABLE.to_string(),
            Some(None) => UNKNOWN.to_string(),
            Some(Some(value)) => value,
        }
    }
}

impl GeoResolver for TableResolver {
    fn resolve_country(&self, ip: IpAddr) -> CountryInfo {
        CountryInfo {
            name: self.lookup_or_sentinel(ip, |n| n.country.clone()),
            iso: self.lookup_or_sentinel(ip, |n| n.iso.clone()),
        }
    }

    fn resolve_city(&self, ip: IpAddr) -> String {
        self.lookup_or_sentinel(ip, |n| n.city.clone())
    }

    fn resolve_asn(&self, ip: IpAddr) -> String {
        self.lookup_or_sentinel(ip, |n| n.asn.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABLE: &str = r#"
[[network]]
cidr = "203.0.113.0/24"
country = "Netherlands"
iso = "NL"
city = "Amsterdam"
asn = "AS64500 Example Transit"

[[network]]
cidr = "203.0.113.128/25"
country = "Belgium"
iso = "BE"

[[network]]
cidr = "2001:db8::/32"
country = "Germany"
iso = "DE"
city = "Frankfurt"
"#;

    fn table_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_closed_resolver_is_unavailable() {
        let resolver = TableResolver::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert!(!resolver.is_open());
        assert_eq!(resolver.resolve_city(ip), UNAVAILABLE);
        assert_eq!(resolver.resolve_country(ip).iso, UNAVAILABLE);
    }

    #[test]
    fn test_lookup_prefers_longest_prefix() {
        let file = table_file(TABLE);
        let resolver = TableResolver::new();
        assert_eq!(resolver.open(file.path()).unwrap(), 3);

        let geo = resolver.resolve("203.0.113.5".parse().unwrap());
        assert_eq!(geo.country, "Netherlands");
        assert_eq!(geo.city, "Amsterdam");

        let geo = resolver.resolve("203.0.113.200".parse().unwrap());
        assert_eq!(geo.country, "Belgium");
        assert_eq!(geo.country_iso, "BE");
        // the /25 row has no city
        assert_eq!(geo.city, UNKNOWN);

        let geo = resolver.resolve("2001:db8::1".parse().unwrap());
        assert_eq!(geo.city, "Frankfurt");
        assert_eq!(geo.asn, UNKNOWN);
    }

    #[test]
    fn test_ipv4_mapped_address_matches_ipv4_rows() {
        let file = table_file(TABLE);
        let resolver = TableResolver::new();
        resolver.open(file.path()).unwrap();

        let geo = resolver.resolve("::ffff:203.0.113.5".parse().unwrap());
        assert_eq!(geo.country, "Netherlands");
        assert_eq!(geo.asn, "AS64500 Example Transit");
    }

    #[test]
    fn test_miss_is_unknown_and_close_is_idempotent() {
        let file = table_file(TABLE);
        let resolver = TableResolver::new();
        resolver.open(file.path()).unwrap();

        assert_eq!(resolver.resolve_asn("198.51.100.7".parse().unwrap()), UNKNOWN);

        resolver.close();
        resolver.close();
        assert_eq!(resolver.resolve_asn("203.0.113.5".parse().unwrap()), UNAVAILABLE);
    }

    #[test]
    fn test_bad_table_leaves_resolver_closed() {
        let file = table_file("[[network]]\ncidr = \"10.0.0.0/40\"\n");
        let resolver = TableResolver::new();

        assert!(matches!(resolver.open(file.path()), Err(ConfigError::NotInRange(_))));
        assert!(!resolver.is_open());

        assert!(resolver.open("/nonexistent/geo.toml").is_err());
    }

    #[test]
    fn test_parse_cidr_without_prefix() {
        let (base, prefix) = parse_cidr("192.0.2.1").unwrap();
        assert_eq!(base, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(prefix, 32);
        assert!(parse_cidr("not-an-ip/8").is_err());
    }
}
