//! Expansion of the range-compressed `clusterHostInfo` block.
//!
//! The coordinator ships host lists as index ranges into `all_hosts`
//! (`"0-2,5"`) and per-host attributes as value-to-range mappings
//! (`"/rack1:0-2,4"`). Scripts expect both spelled out.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::command::JsonMap;

/// Host names every other list indexes into.
pub const HOSTS_LIST_KEY: &str = "all_hosts";
const PING_PORTS_KEY: &str = "all_ping_ports";
const RACKS_KEY: &str = "all_racks";
const IPV4_ADDRESSES_KEY: &str = "all_ipv4_ips";

/// Server endpoint settings carried through as they are.
const PASSTHROUGH_KEYS: [&str; 3] = [
    "ambari_server_host",
    "ambari_server_port",
    "ambari_server_use_ssl",
];

/// Spell out every compressed list in `info`.
///
/// Role lists become host names, rack and address mappings become one value
/// per host index, and ping ports become strings.
pub fn decompress(info: &JsonMap) -> AgentResult<JsonMap> {
    let hosts = info
        .get(HOSTS_LIST_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(format!("'{HOSTS_LIST_KEY}' is missing or not a list")))?;

    let mut expanded = JsonMap::new();
    for (key, value) in info {
        let decoded = match key.as_str() {
            HOSTS_LIST_KEY => continue,
            PING_PORTS_KEY => Value::Array(
                expand_mapped(key, value)?
                    .into_iter()
                    .map(|port| match port {
                        Value::String(s) => Value::String(s),
                        other => Value::String(other.to_string()),
                    })
                    .collect(),
            ),
            RACKS_KEY | IPV4_ADDRESSES_KEY => Value::Array(expand_mapped(key, value)?),
            k if PASSTHROUGH_KEYS.contains(&k) => value.clone(),
            _ => Value::Array(
                expand_ranges(key, value)?
                    .into_iter()
                    .map(|index| {
                        hosts.get(index).cloned().ok_or_else(|| {
                            malformed(format!(
                                "'{key}' refers to host {index}, but only {} hosts are listed",
                                hosts.len()
                            ))
                        })
                    })
                    .collect::<AgentResult<_>>()?,
            ),
        };
        expanded.insert(key.clone(), decoded);
    }
    expanded.insert(HOSTS_LIST_KEY.to_string(), Value::Array(hosts.clone()));
    Ok(expanded)
}

fn malformed(message: String) -> AgentError {
    AgentError::MalformedHostInfo(message)
}

/// Range strings of one entry. A bare string counts as a one-element list.
fn entries<'a>(key: &str, value: &'a Value) -> AgentResult<Vec<&'a str>> {
    match value {
        Value::String(s) => Ok(vec![s.as_str()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| malformed(format!("'{key}' holds a non-string entry {item}")))
            })
            .collect(),
        other => Err(malformed(format!("'{key}' is not a list: {other}"))),
    }
}

/// `"m-n"` or `"m"` to the indexes it covers.
fn parse_range(key: &str, range: &str) -> AgentResult<std::ops::RangeInclusive<usize>> {
    let broken = || {
        malformed(format!(
            "'{key}': expected \"m-n\" or \"m\", got \"{range}\""
        ))
    };
    let index = |raw: &str| raw.trim().parse::<usize>().map_err(|_| broken());
    let bounds: Vec<&str> = range.split('-').collect();
    match bounds.as_slice() {
        [single] => {
            let i = index(single)?;
            Ok(i..=i)
        }
        [start, end] => Ok(index(start)?..=index(end)?),
        _ => Err(broken()),
    }
}

/// `["1-3,5"]` to `[1, 2, 3, 5]`.
fn expand_ranges(key: &str, value: &Value) -> AgentResult<Vec<usize>> {
    let mut indexes = Vec::new();
    for entry in entries(key, value)? {
        for range in entry.split(',') {
            indexes.extend(parse_range(key, range)?);
        }
    }
    Ok(indexes)
}

/// `["1:0-2,4", "42:3"]` to `[1, 1, 1, 42, 1]`, ordered by host index.
///
/// All-digit values become numbers, anything else stays a string.
fn expand_mapped(key: &str, value: &Value) -> AgentResult<Vec<Value>> {
    let mut by_index = BTreeMap::new();
    for entry in entries(key, value)? {
        let Some((raw, ranges)) = entry.split_once(':').filter(|(_, r)| !r.contains(':')) else {
            return Err(malformed(format!(
                "'{key}': expected \"value:m-n\", got \"{entry}\""
            )));
        };
        let mapped = if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            raw.parse::<u64>()
                .map_or_else(|_| Value::String(raw.to_string()), Value::from)
        } else {
            Value::String(raw.to_string())
        };
        for range in ranges.split(',') {
            for index in parse_range(key, range)? {
                by_index.insert(index, mapped.clone());
            }
        }
    }
    Ok(by_index.into_values().collect())
}
