use std::net::IpAddr;

use crate::flow_tracking::types::GeoInfo;

/// Returned when a lookup misses or the backing table fails.
pub const UNKNOWN: &str = "N/A";

/// Returned when the resolver has no database open.
pub const UNAVAILABLE: &str = "Unavailable";

/// Country name and ISO code of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryInfo {
    pub name: String,
    pub iso: String,
}

/// Geolocation lookups used when a flow first enters the view.
///
/// Implementations never fail and never block on retries: a miss yields [`UNKNOWN`] and a
/// resolver without a database yields [`UNAVAILABLE`].
pub trait GeoResolver: Send + Sync {
    fn resolve_country(&self, ip: IpAddr) -> CountryInfo;
    fn resolve_city(&self, ip: IpAddr) -> String;
    fn resolve_asn(&self, ip: IpAddr) -> String;

    fn resolve(&self, ip: IpAddr) -> GeoInfo {
        let country = self.resolve_country(ip);
        GeoInfo {
            country: country.name,
            country_iso: country.iso,
            city: self.resolve_city(ip),
            asn: self.resolve_asn(ip),
        }
    }
}

/// Resolver used when no geolocation database is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl GeoResolver for NullResolver {
    fn resolve_country(&self, _ip: IpAddr) -> CountryInfo {
        CountryInfo {
            name: UNAVAILABLE.to_string(),
            iso: UNAVAILABLE.to_string(),
        }
    }

    fn resolve_city(&self, _ip: IpAddr) -> String {
        UNAVAILABLE.to_string()
    }

    fn resolve_asn(&self, _ip: IpAddr) -> String {
        UNAVAILABLE.to_string()
    }
}
