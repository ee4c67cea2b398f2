//! Mullvad relay list parsing and filtering
//!
//! Reads the `relays.json` cache file maintained by the Mullvad VPN app,
//! flattens it into [`Location`] records and applies the user's filters
//! (server type, anti-censorship transport, DAITA, address family).

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors produced while locating or parsing the relay list.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The current operating system has no known relay cache location.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),

    /// The relay file does not exist at the expected path.
    #[error("relays.json not found at {0}")]
    NotFound(PathBuf),

    /// Reading the relay file failed.
    #[error("failed to read relays file: {0}")]
    Io(#[from] std::io::Error),

    /// The relay file is not valid JSON or has an unexpected shape.
    #[error("failed to parse relays file: {0}")]
    Json(#[from] serde_json::Error),
}

/// IP protocol version used for probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    /// IPv4 addressing
    #[default]
    V4,
    /// IPv6 addressing
    V6,
}

impl IpVersion {
    /// Returns true for [`IpVersion::V6`].
    pub fn is_v6(self) -> bool {
        self == IpVersion::V6
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "ipv4"),
            IpVersion::V6 => write!(f, "ipv6"),
        }
    }
}

/// Type of VPN server a relay provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// WireGuard server
    WireGuard,
    /// Bridge server
    Bridge,
    /// OpenVPN server
    OpenVpn,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::WireGuard => write!(f, "wireguard"),
            ServerType::Bridge => write!(f, "bridge"),
            ServerType::OpenVpn => write!(f, "openvpn"),
        }
    }
}

/// Anti-censorship transport offered by a WireGuard relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiCensorship {
    /// No anti-censorship filter
    #[default]
    None,
    /// LWO transport
    Lwo,
    /// QUIC transport
    Quic,
    /// Shadowsocks transport
    Shadowsocks,
}

/// Root structure of the `relays.json` file.
#[derive(Debug, Deserialize)]
pub struct RelayFile {
    /// All countries with relay presence.
    pub countries: Vec<Country>,
}

/// A country in the relay file.
#[derive(Debug, Deserialize)]
pub struct Country {
    /// Human-readable country name.
    pub name: String,
    /// Two-letter country code.
    pub code: String,
    /// Cities with relays in this country.
    pub cities: Vec<City>,
}

/// A city within a country.
#[derive(Debug, Deserialize)]
pub struct City {
    /// Human-readable city name.
    pub name: String,
    /// City code.
    pub code: String,
    /// City latitude in degrees.
    pub latitude: f64,
    /// City longitude in degrees.
    pub longitude: f64,
    /// Relays hosted in this city.
    pub relays: Vec<Relay>,
}

/// A single relay server entry.
#[derive(Debug, Deserialize)]
pub struct Relay {
    /// Relay hostname, e.g. `se-got-wg-001`.
    pub hostname: String,
    /// Ingress IPv4 address, if any.
    #[serde(default)]
    pub ipv4_addr_in: String,
    /// Ingress IPv6 address, if any.
    #[serde(default)]
    pub ipv6_addr_in: String,
    /// Whether the relay is currently in service.
    pub active: bool,
    /// Whether the relay hardware is owned by Mullvad.
    #[serde(default)]
    pub owned: bool,
    /// Hosting provider name.
    #[serde(default)]
    pub provider: String,
    /// Whether the relay participates in country-level selection.
    #[serde(default = "default_true")]
    pub include_in_country: bool,
    /// Protocol-specific endpoint data; either the string `"openvpn"` /
    /// `"bridge"` or a WireGuard object. Kept raw because unknown formats
    /// must be skipped per relay, not fail the whole file.
    #[serde(default)]
    pub endpoint_data: serde_json::Value,
    /// Geographic information for this relay.
    pub location: RelayLocation,
}

fn default_true() -> bool {
    true
}

/// Geographic information for a relay.
#[derive(Debug, Deserialize)]
pub struct RelayLocation {
    /// Country name.
    pub country: String,
    /// City name.
    pub city: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// WireGuard-specific endpoint data.
#[derive(Debug, Default, Deserialize)]
pub struct WireGuardEndpoint {
    /// The relay's WireGuard public key.
    #[serde(default)]
    pub public_key: String,
    /// Whether DAITA (defence against AI traffic analysis) is available.
    #[serde(default)]
    pub daita: bool,
    /// Whether the LWO transport is available.
    #[serde(default)]
    pub lwo: bool,
    /// Present when the QUIC transport is available.
    #[serde(default)]
    pub quic: Option<serde_json::Value>,
    /// Extra ingress addresses for the Shadowsocks transport.
    #[serde(default)]
    pub shadowsocks_extra_addr_in: Vec<String>,
}

#[derive(Debug)]
struct RelayEndpoint {
    server_type: ServerType,
    wireguard: WireGuardEndpoint,
}

/// A flattened relay record, the unit the latency scanner operates on.
#[derive(Debug, Clone)]
pub struct Location {
    /// Relay hostname (the opaque identity carried through a scan).
    pub hostname: String,
    /// Ingress IPv4 address; empty when the relay has none.
    pub ipv4_addr: String,
    /// Ingress IPv6 address; empty when the relay has none.
    pub ipv6_addr: String,
    /// Country name.
    pub country: String,
    /// City name.
    pub city: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Kind of VPN server.
    pub server_type: ServerType,
    /// Whether the relay hardware is owned by Mullvad.
    pub owned: bool,
    /// Hosting provider name.
    pub provider: String,
    /// Distance from the user's location in kilometers, once computed.
    pub distance_km: Option<f64>,
    /// Measured round-trip latency in milliseconds; `None` means no usable
    /// measurement (timeout, unreachable, cancelled), never zero latency.
    pub latency_ms: Option<f64>,
}

impl Location {
    /// The address to probe for the given family; empty if the relay has no
    /// address in that family.
    pub fn address(&self, ip_version: IpVersion) -> &str {
        match ip_version {
            IpVersion::V4 => &self.ipv4_addr,
            IpVersion::V6 => &self.ipv6_addr,
        }
    }
}

/// Filters applied while flattening the relay file into locations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationFilter {
    /// Keep only this server type, if set.
    pub server_type: Option<ServerType>,
    /// Keep only WireGuard relays offering this transport.
    pub anti_censorship: AntiCensorship,
    /// Keep only WireGuard relays with DAITA.
    pub daita: bool,
    /// Keep only relays with an address in this family.
    pub ip_version: IpVersion,
}

/// Platform-specific path to the Mullvad app's cached `relays.json`.
pub fn default_relays_path() -> Result<PathBuf, RelayError> {
    let path = if cfg!(target_os = "linux") {
        PathBuf::from("/var/cache/mullvad-vpn/relays.json")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Caches/mullvad-vpn/relays.json")
    } else if cfg!(target_os = "windows") {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string());
        [&program_data, "Mullvad VPN", "cache", "relays.json"]
            .iter()
            .collect()
    } else {
        return Err(RelayError::UnsupportedPlatform(std::env::consts::OS));
    };

    if !path.exists() {
        return Err(RelayError::NotFound(path));
    }
    Ok(path)
}

/// Read and parse a `relays.json` file.
pub fn load_relays_file(path: &Path) -> Result<RelayFile, RelayError> {
    let data = std::fs::read(path)?;
    let file: RelayFile = serde_json::from_slice(&data)?;
    Ok(file)
}

/// Flatten the relay file into [`Location`] records matching `filter`.
///
/// Returns the locations together with the number of relays skipped because
/// their `endpoint_data` had an unrecognized format.
pub fn collect_locations(file: &RelayFile, filter: &LocationFilter) -> (Vec<Location>, usize) {
    let mut locations = Vec::new();
    let mut skipped_unknown = 0usize;

    for country in &file.countries {
        for city in &country.cities {
            for relay in &city.relays {
                let Some(endpoint) = interpret_endpoint(&relay.endpoint_data) else {
                    skipped_unknown += 1;
                    continue;
                };
                if relay_matches(relay, &endpoint, filter) {
                    locations.push(Location {
                        hostname: relay.hostname.clone(),
                        ipv4_addr: relay.ipv4_addr_in.clone(),
                        ipv6_addr: relay.ipv6_addr_in.clone(),
                        country: relay.location.country.clone(),
                        city: relay.location.city.clone(),
                        latitude: relay.location.latitude,
                        longitude: relay.location.longitude,
                        server_type: endpoint.server_type,
                        owned: relay.owned,
                        provider: relay.provider.clone(),
                        distance_km: None,
                        latency_ms: None,
                    });
                }
            }
        }
    }

    (locations, skipped_unknown)
}

fn relay_matches(relay: &Relay, endpoint: &RelayEndpoint, filter: &LocationFilter) -> bool {
    if !relay.active || !relay.include_in_country {
        return false;
    }
    // Bridges are not VPN entry points; never worth pinging.
    if endpoint.server_type == ServerType::Bridge {
        return false;
    }
    // DAITA and anti-censorship transports only exist on WireGuard relays,
    // so either filter implies WireGuard.
    if filter.daita && (endpoint.server_type != ServerType::WireGuard || !endpoint.wireguard.daita)
    {
        return false;
    }
    if filter.anti_censorship != AntiCensorship::None {
        if endpoint.server_type != ServerType::WireGuard {
            return false;
        }
        let wg = &endpoint.wireguard;
        let offered = match filter.anti_censorship {
            AntiCensorship::Lwo => wg.lwo,
            AntiCensorship::Quic => wg.quic.is_some(),
            AntiCensorship::Shadowsocks => !wg.shadowsocks_extra_addr_in.is_empty(),
            AntiCensorship::None => true,
        };
        if !offered {
            return false;
        }
    }
    if let Some(server_type) = filter.server_type {
        if endpoint.server_type != server_type {
            return false;
        }
    }
    // The scanner never falls back between families; a relay without an
    // address in the requested family is excluded here.
    !relay.address_for(filter.ip_version).is_empty()
}

impl Relay {
    fn address_for(&self, ip_version: IpVersion) -> &str {
        match ip_version {
            IpVersion::V4 => &self.ipv4_addr_in,
            IpVersion::V6 => &self.ipv6_addr_in,
        }
    }
}

fn interpret_endpoint(endpoint_data: &serde_json::Value) -> Option<RelayEndpoint> {
    if let serde_json::Value::String(name) = endpoint_data {
        let server_type = match name.as_str() {
            "openvpn" => ServerType::OpenVpn,
            "bridge" => ServerType::Bridge,
            _ => return None,
        };
        return Some(RelayEndpoint {
            server_type,
            wireguard: WireGuardEndpoint::default(),
        });
    }

    #[derive(Deserialize)]
    struct WireGuardWrapper {
        wireguard: WireGuardEndpoint,
    }

    let wrapper: WireGuardWrapper = serde_json::from_value(endpoint_data.clone()).ok()?;
    if wrapper.wireguard.public_key.is_empty() {
        return None;
    }
    Some(RelayEndpoint {
        server_type: ServerType::WireGuard,
        wireguard: wrapper.wireguard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> RelayFile {
        let json = serde_json::json!({
            "countries": [{
                "name": "Sweden",
                "code": "se",
                "cities": [{
                    "name": "Gothenburg",
                    "code": "got",
                    "latitude": 57.70887,
                    "longitude": 11.97456,
                    "relays": [
                        {
                            "hostname": "se-got-wg-001",
                            "ipv4_addr_in": "185.213.154.66",
                            "ipv6_addr_in": "2a03:1b20:1:f011::a01f",
                            "active": true,
                            "owned": true,
                            "provider": "31173",
                            "include_in_country": true,
                            "endpoint_data": {
                                "wireguard": {
                                    "public_key": "aaaabbbb",
                                    "daita": true,
                                    "lwo": true,
                                    "quic": {"addr_in": ["185.213.154.66"]},
                                    "shadowsocks_extra_addr_in": []
                                }
                            },
                            "location": {
                                "country": "Sweden",
                                "city": "Gothenburg",
                                "latitude": 57.70887,
                                "longitude": 11.97456
                            }
                        },
                        {
                            "hostname": "se-got-wg-002",
                            "ipv4_addr_in": "185.213.154.67",
                            "ipv6_addr_in": "",
                            "active": true,
                            "owned": false,
                            "provider": "31173",
                            "include_in_country": true,
                            "endpoint_data": {
                                "wireguard": {"public_key": "ccccdddd"}
                            },
                            "location": {
                                "country": "Sweden",
                                "city": "Gothenburg",
                                "latitude": 57.70887,
                                "longitude": 11.97456
                            }
                        },
                        {
                            "hostname": "se-got-br-001",
                            "ipv4_addr_in": "185.213.154.68",
                            "active": true,
                            "include_in_country": true,
                            "endpoint_data": "bridge",
                            "location": {
                                "country": "Sweden",
                                "city": "Gothenburg",
                                "latitude": 57.70887,
                                "longitude": 11.97456
                            }
                        },
                        {
                            "hostname": "se-got-ov-001",
                            "ipv4_addr_in": "185.213.154.69",
                            "active": false,
                            "include_in_country": true,
                            "endpoint_data": "openvpn",
                            "location": {
                                "country": "Sweden",
                                "city": "Gothenburg",
                                "latitude": 57.70887,
                                "longitude": 11.97456
                            }
                        },
                        {
                            "hostname": "se-got-xx-001",
                            "ipv4_addr_in": "185.213.154.70",
                            "active": true,
                            "include_in_country": true,
                            "endpoint_data": {"mystery": true},
                            "location": {
                                "country": "Sweden",
                                "city": "Gothenburg",
                                "latitude": 57.70887,
                                "longitude": 11.97456
                            }
                        }
                    ]
                }]
            }]
        });
        serde_json::from_value(json).expect("sample relays json must parse")
    }

    #[test]
    fn collects_active_relays_and_counts_unknown_formats() {
        let file = sample_file();
        let (locations, skipped) = collect_locations(&file, &LocationFilter::default());
        let hostnames: Vec<&str> = locations.iter().map(|l| l.hostname.as_str()).collect();
        // Bridge excluded, inactive openvpn excluded, unknown format skipped.
        assert_eq!(hostnames, ["se-got-wg-001", "se-got-wg-002"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn daita_filter_keeps_only_wireguard_with_daita() {
        let file = sample_file();
        let filter = LocationFilter {
            daita: true,
            ..LocationFilter::default()
        };
        let (locations, _) = collect_locations(&file, &filter);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].hostname, "se-got-wg-001");
    }

    #[test]
    fn anti_censorship_filters_by_offered_transport() {
        let file = sample_file();
        for (transport, expected) in [
            (AntiCensorship::Lwo, 1),
            (AntiCensorship::Quic, 1),
            (AntiCensorship::Shadowsocks, 0),
        ] {
            let filter = LocationFilter {
                anti_censorship: transport,
                ..LocationFilter::default()
            };
            let (locations, _) = collect_locations(&file, &filter);
            assert_eq!(locations.len(), expected, "transport {transport:?}");
        }
    }

    #[test]
    fn ipv6_filter_drops_relays_without_ipv6_address() {
        let file = sample_file();
        let filter = LocationFilter {
            ip_version: IpVersion::V6,
            ..LocationFilter::default()
        };
        let (locations, _) = collect_locations(&file, &filter);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].hostname, "se-got-wg-001");
        assert_eq!(
            locations[0].address(IpVersion::V6),
            "2a03:1b20:1:f011::a01f"
        );
    }

    #[test]
    fn server_type_filter_matches_exactly() {
        let file = sample_file();
        let filter = LocationFilter {
            server_type: Some(ServerType::OpenVpn),
            ..LocationFilter::default()
        };
        let (locations, _) = collect_locations(&file, &filter);
        // The only openvpn relay in the sample is inactive.
        assert!(locations.is_empty());
    }

    #[test]
    fn location_address_selects_family() {
        let file = sample_file();
        let (locations, _) = collect_locations(&file, &LocationFilter::default());
        let loc = &locations[0];
        assert_eq!(loc.address(IpVersion::V4), "185.213.154.66");
        assert_eq!(loc.address(IpVersion::V6), "2a03:1b20:1:f011::a01f");
        // A relay without an IPv6 address yields an empty string, which the
        // prober treats as unparseable (absent measurement, no I/O).
        assert_eq!(locations[1].address(IpVersion::V6), "");
    }

    #[test]
    fn ip_version_display_and_default() {
        assert_eq!(IpVersion::default(), IpVersion::V4);
        assert_eq!(IpVersion::V4.to_string(), "ipv4");
        assert_eq!(IpVersion::V6.to_string(), "ipv6");
        assert!(IpVersion::V6.is_v6());
        assert!(!IpVersion::V4.is_v6());
    }

    #[test]
    fn load_relays_file_reports_missing_file() {
        let err = load_relays_file(Path::new("/definitely/not/here/relays.json"))
            .expect_err("missing file must error");
        assert!(matches!(err, RelayError::Io(_)));
    }
}
