//! Device facts read off the CLI.

use serde::{Deserialize, Serialize};

/// What a driver could learn about the device.
///
/// Every field is optional: models expose different subsets, and gathering
/// is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model string the device reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Running firmware version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,

    /// Serial number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// Base MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    /// WiFi network name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,

    /// WiFi passphrase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_key: Option<String>,
}

impl DeviceInfo {
    /// Whether nothing was learned.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill fields still unset from `other`.
    pub fn merge(&mut self, other: DeviceInfo) {
        fn fill(slot: &mut Option<String>, value: Option<String>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.model, other.model);
        fill(&mut self.firmware_version, other.firmware_version);
        fill(&mut self.serial_number, other.serial_number);
        fill(&mut self.mac_address, other.mac_address);
        fill(&mut self.wifi_ssid, other.wifi_ssid);
        fill(&mut self.wifi_key, other.wifi_key);
    }
}

/// Value after the first `separator` in `line`, trimmed of whitespace and
/// surrounding quotes. Empty values are `None`.
pub(crate) fn value_after(line: &str, separator: char) -> Option<String> {
    let (_, value) = line.split_once(separator)?;
    let value = value.trim().trim_matches(|c| c == '\'' || c == '"').trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_after() {
        assert_eq!(value_after("Serial Number: CX1234", ':'), Some("CX1234".into()));
        assert_eq!(
            value_after("wireless.i5g.ssid='Home-5G'", '='),
            Some("Home-5G".into())
        );
        assert_eq!(
            value_after("MAC: 00:11:22:33:44:55", ':'),
            Some("00:11:22:33:44:55".into())
        );
        assert_eq!(value_after("Model:", ':'), None);
        assert_eq!(value_after("no separator", '='), None);
    }

    #[test]
    fn test_merge_keeps_existing() {
        let mut info = DeviceInfo {
            firmware_version: Some("1.0".into()),
            ..Default::default()
        };
        info.merge(DeviceInfo {
            firmware_version: Some("2.0".into()),
            serial_number: Some("SN".into()),
            ..Default::default()
        });
        assert_eq!(info.firmware_version.as_deref(), Some("1.0"));
        assert_eq!(info.serial_number.as_deref(), Some("SN"));
        assert!(!info.is_empty());
        assert!(DeviceInfo::default().is_empty());
    }
}
