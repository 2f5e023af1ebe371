use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;

use super::PciAddress;
use super::PciConfigError;

const MAX_LABEL_LEN: usize = 200;

/// One entry of the operator's passthrough device list, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PciDeviceConfig {
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
}

/// A validated passthrough device of this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceRecord {
    pub host: String,
    pub label: String,
    pub address: PciAddress,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
}

fn is_four_hex_digits(value: &str) -> bool {
    value.len() == 4 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse and validate the JSON device list of `host`.
///
/// The whole list is rejected on the first invalid entry.
///
/// # Errors
///
/// - [`PciConfigError::Json`] if the text is not a list of device objects
/// - [`PciConfigError::InvalidLabel`] if a label is empty or longer than 200 characters
/// - [`PciConfigError::InvalidAddress`] if an address is not `DDDD:BB:SS.F`
/// - [`PciConfigError::InvalidVendorId`] / [`PciConfigError::InvalidProductId`] if an id
///   is present but not four hex digits
/// - [`PciConfigError::DuplicateAddress`] if two entries name the same device
pub fn validate_and_parse(config: &str, host: &str) -> Result<Vec<PciDeviceRecord>, PciConfigError> {
    let entries: Vec<PciDeviceConfig> =
        serde_json::from_str(config).map_err(|e| PciConfigError::Json {
            reason: e.to_string(),
        })?;

    let mut seen = HashSet::with_capacity(entries.len());
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let label_len = entry.label.chars().count();
        if label_len == 0 || label_len > MAX_LABEL_LEN {
            return Err(PciConfigError::InvalidLabel {
                label: entry.label,
                length: label_len,
            });
        }

        let address = PciAddress::parse(&entry.address)?;

        if let Some(vendor_id) = &entry.vendor_id {
            if !is_four_hex_digits(vendor_id) {
                return Err(PciConfigError::InvalidVendorId {
                    address: entry.address,
                    value: vendor_id.clone(),
                });
            }
        }
        if let Some(product_id) = &entry.product_id {
            if !is_four_hex_digits(product_id) {
                return Err(PciConfigError::InvalidProductId {
                    address: entry.address,
                    value: product_id.clone(),
                });
            }
        }

        if !seen.insert(address) {
            return Err(PciConfigError::DuplicateAddress {
                host: host.to_string(),
                address: address.to_string(),
            });
        }

        records.push(PciDeviceRecord {
            host: host.to_string(),
            label: entry.label,
            address,
            vendor_id: entry.vendor_id,
            product_id: entry.product_id,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn empty_list_is_valid() {
        assert_eq!(validate_and_parse("[]", "host1"), Ok(Vec::new()));
    }

    #[test]
    fn parses_full_entries() {
        let config = r#"[
            {"label": "fpga", "address": "0000:03:00.1", "vendor_id": "10DE", "product_id": "1db4"},
            {"label": "nvme", "address": "0000:04:00.0"}
        ]"#;

        let records = validate_and_parse(config, "host1").expect("config should be valid");

        assert_eq!(
            records,
            vec![
                PciDeviceRecord {
                    host: "host1".to_string(),
                    label: "fpga".to_string(),
                    address: PciAddress {
                        domain: 0,
                        bus: 3,
                        slot: 0,
                        function: 1
                    },
                    vendor_id: Some("10DE".to_string()),
                    product_id: Some("1db4".to_string()),
                },
                PciDeviceRecord {
                    host: "host1".to_string(),
                    label: "nvme".to_string(),
                    address: PciAddress {
                        domain: 0,
                        bus: 4,
                        slot: 0,
                        function: 0
                    },
                    vendor_id: None,
                    product_id: None,
                },
            ]
        );
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let config = r#"[
            {"label": "first", "address": "AAAA:AA:AA.1"},
            {"label": "second", "address": "aaaa:aa:aa.1"}
        ]"#;

        let err = validate_and_parse(config, "host1").unwrap_err();

        assert_eq!(
            err,
            PciConfigError::DuplicateAddress {
                host: "host1".to_string(),
                address: "aaaa:aa:aa.1".to_string(),
            }
        );
    }

    #[test]
    fn each_violation_names_its_field() {
        let long_label = "x".repeat(201);
        let cases = [
            (
                r#"[{"label": "", "address": "0000:00:00.0"}]"#.to_string(),
                "label",
            ),
            (
                format!(r#"[{{"label": "{long_label}", "address": "0000:00:00.0"}}]"#),
                "label",
            ),
            (
                r#"[{"label": "a", "address": "0000:00:00.8"}]"#.to_string(),
                "address",
            ),
            (
                r#"[{"label": "a", "address": "0000:00:00.0", "vendor_id": "10d"}]"#.to_string(),
                "vendor_id",
            ),
            (
                r#"[{"label": "a", "address": "0000:00:00.0", "product_id": "zzzz"}]"#.to_string(),
                "product_id",
            ),
        ];

        for (config, field) in cases {
            let err = validate_and_parse(&config, "host1").unwrap_err();
            assert!(
                err.to_string().contains(field),
                "error `{err}` should name `{field}`"
            );
        }
    }

    #[test]
    fn unknown_fields_and_missing_required_fields_are_rejected() {
        for config in [
            r#"[{"label": "a", "address": "0000:00:00.0", "speed": "fast"}]"#,
            r#"[{"label": "a"}]"#,
            r#"{"label": "a", "address": "0000:00:00.0"}"#,
            "not json",
        ] {
            assert!(
                matches!(
                    validate_and_parse(config, "host1"),
                    Err(PciConfigError::Json { .. })
                ),
                "`{config}` should be rejected as malformed"
            );
        }
    }
}
