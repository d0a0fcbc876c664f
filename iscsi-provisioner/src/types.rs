//! Type-safe wrappers for provisioner domain types.

use std::fmt;
use std::time::Duration;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default iSCSI portal port.
pub const ISCSI_PORT: u16 = 3260;

/// An iSCSI portal address in the form "host" or "host:port".
///
/// The text is kept as given since it is copied onto the PV, where
/// the kubelet applies the default port itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetPortal(String);

impl TargetPortal {
    /// Parse a portal address.
    ///
    /// IPv6 hosts must be bracketed when a port is given ("[fd00::1]:3260").
    pub fn parse(portal: impl Into<String>) -> Result<Self, Error> {
        let portal = portal.into();
        let invalid = |reason: &str| Error::InvalidParameter {
            name: "targetPortal",
            reason: format!("{portal:?}: {reason}"),
        };

        let (host, port) = split_host_port(&portal);
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if let Some(port) = port {
            port.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("port must be in 1-65535"))?;
        }

        Ok(Self(portal))
    }

    pub fn host(&self) -> &str {
        split_host_port(&self.0).0
    }

    /// The explicit port, or the iSCSI default.
    pub fn port(&self) -> u16 {
        split_host_port(&self.0)
            .1
            .and_then(|p| p.parse().ok())
            .unwrap_or(ISCSI_PORT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn split_host_port(portal: &str) -> (&str, Option<&str>) {
    if let Some(rest) = portal.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => ("", None),
        };
    }
    // A bare IPv6 address has more than one colon and no port.
    if portal.matches(':').count() > 1 {
        return (portal, None);
    }
    match portal.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (portal, None),
    }
}

impl fmt::Display for TargetPortal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// iSCSI qualified name of a target created for a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iqn(String);

impl Iqn {
    /// Derive the target name for a claim: `iqn.YYYY-MM.k8s.<namespace>:<name>`.
    ///
    /// Re-provisioning the same claim in the same month yields the same IQN.
    pub fn for_claim(date: impl Datelike, namespace: &str, name: &str) -> Self {
        Self(format!(
            "iqn.{}-{:02}.k8s.{}:{}",
            date.year(),
            date.month(),
            namespace,
            name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse a Kubernetes resource quantity ("10Gi", "500M", "1.5Gi", "1e9") into bytes.
///
/// Fractional results are rounded up to the next byte.
pub fn parse_quantity_bytes(quantity: &str) -> Result<u64, Error> {
    let invalid = |reason: &'static str| Error::InvalidCapacity {
        quantity: quantity.to_string(),
        reason,
    };

    let trimmed = quantity.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let (numerator, denominator) = parse_decimal(number).ok_or_else(|| invalid("not a number"))?;

    let (multiplier, divisor): (u128, u128) = match suffix {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "m" => (1, 1000),
        "k" => (10u128.pow(3), 1),
        "M" => (10u128.pow(6), 1),
        "G" => (10u128.pow(9), 1),
        "T" => (10u128.pow(12), 1),
        "P" => (10u128.pow(15), 1),
        "E" => (10u128.pow(18), 1),
        s if s.starts_with(['e', 'E']) => {
            let exponent: i32 = s[1..].parse().map_err(|_| invalid("unknown suffix"))?;
            let scale = 10u128
                .checked_pow(exponent.unsigned_abs())
                .ok_or_else(|| invalid("exponent out of range"))?;
            if exponent >= 0 { (scale, 1) } else { (1, scale) }
        }
        _ => return Err(invalid("unknown suffix")),
    };

    let bytes = numerator
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("too large"))?
        .div_ceil(denominator.saturating_mul(divisor));

    u64::try_from(bytes).map_err(|_| invalid("too large"))
}

/// Split "12.50" into (1250, 100).
fn parse_decimal(number: &str) -> Option<(u128, u128)> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.contains('.') || fraction.len() > 18 {
        return None;
    }
    let digits = format!("{whole}{fraction}");
    let numerator = digits.parse::<u128>().ok()?;
    let denominator = 10u128.pow(fraction.len() as u32);
    Some((numerator, denominator))
}

/// Parse a flag value the way Kubernetes components do: "1", "t", "true",
/// "TRUE", "True" are true. Anything unparsable reads as false.
pub fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(str::trim),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True")
    )
}

/// Parse a duration such as "15s", "500ms", "2m", "1h30m" or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            unit => return Err(format!("unknown unit {unit:?} in duration {value:?}")),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration {value:?} out of range"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
