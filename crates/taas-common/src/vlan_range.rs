//! VLAN range codec.
//!
//! Converts between the compact textual form used on the wire and in sysfs
//! (`"4,6,10-13,25-27"`) and a sorted, deduplicated set of VLAN ids.
//!
//! Ranges are inclusive. A range whose start is greater than its end parses
//! to nothing rather than failing.

use std::collections::BTreeSet;

use itertools::Itertools;

use crate::error::{TaasError, TaasResult};

/// Highest VLAN id.
pub const MAX_VLAN: u16 = 4095;

/// Textual form of "every VLAN".
pub const ALL_VLANS: &str = "0-4095";

/// A canonical VLAN set: sorted and deduplicated.
pub type VlanSet = BTreeSet<u16>;

/// Parses a comma-separated list of VLAN ids and inclusive `a-b` ranges.
/// Ids above [`MAX_VLAN`] are malformed.
///
/// # Example
///
/// ```
/// use taas_common::vlan_range;
///
/// let set = vlan_range::parse("4,6,10-12").unwrap();
/// assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![4, 6, 10, 11, 12]);
/// ```
pub fn parse(s: &str) -> TaasResult<VlanSet> {
    let mut set = VlanSet::new();
    for token in s.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((start, end)) => {
                let start = parse_id(start, token)?;
                let end = parse_id(end, token)?;
                set.extend(start..=end);
            }
            None => {
                set.insert(parse_id(token, token)?);
            }
        }
    }
    Ok(set)
}

fn parse_id(part: &str, token: &str) -> TaasResult<u16> {
    part.trim()
        .parse::<u16>()
        .ok()
        .filter(|id| *id <= MAX_VLAN)
        .ok_or_else(|| TaasError::malformed_range(token))
}

/// Formats VLAN ids as a sorted, maximally merged range string.
///
/// # Example
///
/// ```
/// use taas_common::vlan_range;
///
/// assert_eq!(vlan_range::format([13, 4, 11, 12]), "4,11-13");
/// ```
pub fn format<I>(values: I) -> String
where
    I: IntoIterator<Item = u16>,
{
    let sorted: VlanSet = values.into_iter().collect();
    let mut runs: Vec<(u16, u16)> = Vec::new();
    for vlan in sorted {
        match runs.last_mut() {
            Some((_, last)) if u32::from(*last) + 1 == u32::from(vlan) => *last = vlan,
            _ => runs.push((vlan, vlan)),
        }
    }

    runs.into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .join(",")
}

/// Every VLAN id, `0..=4095`.
pub fn all_vlans() -> VlanSet {
    (0..=MAX_VLAN).collect()
}

/// Parses an optional range string; absent or blank means every VLAN.
pub fn parse_or_all(s: Option<&str>) -> TaasResult<VlanSet> {
    match s.map(str::trim) {
        Some(s) if !s.is_empty() => parse(s),
        _ => Ok(all_vlans()),
    }
}

/// Intersects two optional range strings, substituting every VLAN for an
/// absent side.
pub fn common(a: Option<&str>, b: Option<&str>) -> TaasResult<VlanSet> {
    let a = parse_or_all(a)?;
    let b = parse_or_all(b)?;
    Ok(a.intersection(&b).copied().collect())
}
