//! VID:PID device filters
//!
//! Filters use the form `0xVID:0xPID`, where either side may be `*`. A bare
//! `*` matches every device.

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Match on vendor and product ID; `None` is a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Match every device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Match every product of one vendor
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// True when no filters are given or any of them matches
    pub fn allows(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }
}

fn parse_hex_id(id: &str, name: &str) -> Result<Option<u16>, HostError> {
    if id == "*" {
        return Ok(None);
    }

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            HostError::InvalidArgument(format!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name, id
            ))
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(HostError::InvalidArgument(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }

    u16::from_str_radix(hex_part, 16).map(Some).map_err(|_| {
        HostError::InvalidArgument(format!("Invalid {} '{}', not a valid hex number", name, id))
    })
}

impl FromStr for DeviceFilter {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::any());
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(HostError::InvalidArgument(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                s
            )));
        }

        Ok(Self {
            vendor_id: parse_hex_id(parts[0], "VID")?,
            product_id: parse_hex_id(parts[1], "PID")?,
        })
    }
}

impl TryFrom<String> for DeviceFilter {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceFilter> for String {
    fn from(filter: DeviceFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vendor_id, self.product_id) {
            (None, None) => write!(f, "*"),
            (vid, pid) => {
                match vid {
                    Some(v) => write!(f, "{:#06x}", v)?,
                    None => write!(f, "*")?,
                }
                write!(f, ":")?;
                match pid {
                    Some(p) => write!(f, "{:#06x}", p),
                    None => write!(f, "*"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters: Vec<DeviceFilter> = ["0x1234:0x5678", "0xABCD:*"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        // Exact and wildcard PID
        assert!(DeviceFilter::allows(&filters, 0x1234, 0x5678));
        assert!(DeviceFilter::allows(&filters, 0xABCD, 0x1111));

        assert!(!DeviceFilter::allows(&filters, 0x1234, 0x9999));
        assert!(!DeviceFilter::allows(&filters, 0x9999, 0x5678));

        // Empty filters = allow all
        assert!(DeviceFilter::allows(&[], 0x1234, 0x5678));
    }

    #[test]
    fn test_parse_valid() {
        assert_eq!("*".parse::<DeviceFilter>().unwrap(), DeviceFilter::any());
        assert_eq!("*:*".parse::<DeviceFilter>().unwrap(), DeviceFilter::any());
        assert_eq!(
            "0x0555:0x000c".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::new(0x0555, 0x000c)
        );
        assert_eq!(
            "*:0x5678".parse::<DeviceFilter>().unwrap().product_id,
            Some(0x5678)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for filter in [
            DeviceFilter::any(),
            DeviceFilter::new(0x0555, 0x000c),
            DeviceFilter::vendor(0x04f9),
        ] {
            assert_eq!(filter.to_string().parse::<DeviceFilter>().unwrap(), filter);
        }
        assert_eq!(DeviceFilter::new(0x0555, 0x000c).to_string(), "0x0555:0x000c");
    }
}
