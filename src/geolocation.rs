//! Geolocation of remote peers.
//!
//! The resolver is an explicitly constructed service handed to the aggregation core, so it can
//! be swapped for a mock in tests and closed when monitoring ends.

pub mod resolver;
pub mod table_resolver;

pub use resolver::{CountryInfo, GeoResolver, NullResolver, UNAVAILABLE, UNKNOWN};
pub use table_resolver::TableResolver;
