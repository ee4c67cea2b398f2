//! Output formatting
//!
//! Renders scan results as a column-aligned table or as a compact
//! best-server summary. An absent latency always renders as the literal
//! `timeout`, never as zero or an empty cell.

use crate::api::UserLocation;
use crate::relays::{IpVersion, Location};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Sort locations by latency ascending with absent measurements last,
/// tie-broken by distance, then country, then city. The sort is stable so
/// equal entries keep their relative order.
pub fn sort_by_latency(locations: &mut [Location]) {
    locations.sort_by(|a, b| {
        match (a.latency_ms, b.latency_ms) {
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(la), Some(lb)) => {
                let ord = la.total_cmp(&lb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => {}
        }
        if let (Some(da), Some(db)) = (a.distance_km, b.distance_km) {
            let ord = da.total_cmp(&db);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.country
            .cmp(&b.country)
            .then_with(|| a.city.cmp(&b.city))
    });
}

fn format_latency(latency_ms: Option<f64>) -> String {
    match latency_ms {
        Some(ms) => format!("{ms:.2}"),
        None => "timeout".to_string(),
    }
}

fn format_distance(distance_km: Option<f64>) -> String {
    match distance_km {
        Some(km) => format!("{km:.0}"),
        None => String::new(),
    }
}

/// Render locations as a plain-text table.
pub fn format_table(locations: &[Location], ip_version: IpVersion) -> String {
    if locations.is_empty() {
        return String::new();
    }

    let headers = [
        "Country",
        "City",
        "Type",
        "IP",
        "Hostname",
        "Distance (km)",
        "Latency (ms)",
    ];
    let rows: Vec<[String; 7]> = locations
        .iter()
        .map(|loc| {
            [
                loc.country.clone(),
                loc.city.clone(),
                loc.server_type.to_string(),
                loc.address(ip_version).to_string(),
                loc.hostname.clone(),
                format_distance(loc.distance_km),
                format_latency(loc.latency_ms),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut output = String::new();
    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| pad_right(h, *w))
        .collect();
    let _ = writeln!(output, "{}", header_line.join("   "));
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let _ = writeln!(output, "{}", separator.join("   "));
    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(c, w)| pad_right(c, *w))
            .collect();
        let _ = writeln!(output, "{}", cells.join("   "));
    }

    output
}

fn pad_right(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_string();
    }
    let mut padded = s.to_string();
    padded.extend(std::iter::repeat(' ').take(width - len));
    padded
}

/// Render the single best relay in a compact summary.
pub fn format_best_server(server: &Location, ip_version: IpVersion) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Country:    {}", server.country);
    let _ = writeln!(output, "City:       {}", server.city);
    let _ = writeln!(output, "Distance:   {} km", format_distance(server.distance_km));
    let _ = writeln!(output, "Hostname:   {}", server.hostname);
    let _ = writeln!(output, "IP:         {}", server.address(ip_version));
    let _ = writeln!(output, "Latency:    {} ms", format_latency(server.latency_ms));
    output
}

/// Render the user's detected location.
pub fn format_user_location(loc: &UserLocation) -> String {
    let mullvad = if loc.mullvad_exit_ip { "Yes" } else { "No" };
    let mut output = String::new();
    let _ = writeln!(output, "Country:                    {}", loc.country);
    let _ = writeln!(output, "City:                       {}", loc.city);
    let _ = writeln!(output, "Latitude:                   {:.6}", loc.latitude);
    let _ = writeln!(output, "Longitude:                  {:.6}", loc.longitude);
    let _ = writeln!(output, "IP:                         {}", loc.ip);
    let _ = writeln!(output, "Connected to Mullvad VPN:   {mullvad}");
    output
}
