//! Device-count intent of an instance.
//!
//! An instance can ask for devices in two places: its own metadata (a per-instance
//! override) and its flavor's extra specs (the flavor declaration). The larger of
//! the two wins.

use api_types::StringMap;

use super::allocation::AllocationError;

/// Metadata and extra-spec key for Infiniband functions.
pub const IB_DEVICES_KEY: &str = "ib_devices";
/// Metadata and extra-spec key for GPUs.
pub const GPUS_KEY: &str = "gpus";
/// Extra-spec key listing passthrough PCI labels as a JSON array.
pub const PCI_LABELS_KEY: &str = "pci_passthrough:labels";

/// Count requested through instance metadata, a plain integer.
pub fn metadata_count(key: &str, metadata: &StringMap) -> Result<Option<usize>, AllocationError> {
    metadata
        .get(key)
        .map(|value| parse_count(key, value.trim(), value))
        .transpose()
}

/// Count requested through flavor extra specs.
///
/// Values look like `"= 2"` or `">= 1"`, or are a bare integer. The count is the
/// last whitespace-separated token.
pub fn extra_spec_count(
    key: &str,
    extra_specs: &StringMap,
) -> Result<Option<usize>, AllocationError> {
    extra_specs
        .get(key)
        .map(|value| {
            let token = value.split_whitespace().last().unwrap_or_default();
            parse_count(key, token, value)
        })
        .transpose()
}

/// `max(metadata, extra specs)`, zero when neither source mentions `key`.
pub fn requested_device_count(
    key: &str,
    metadata: &StringMap,
    extra_specs: &StringMap,
) -> Result<usize, AllocationError> {
    let from_metadata = metadata_count(key, metadata)?.unwrap_or(0);
    let from_flavor = extra_spec_count(key, extra_specs)?.unwrap_or(0);
    Ok(from_metadata.max(from_flavor))
}

/// Passthrough labels an instance type asks for. Labels may repeat.
pub fn requested_pci_labels(extra_specs: &StringMap) -> Result<Vec<String>, AllocationError> {
    let Some(raw) = extra_specs.get(PCI_LABELS_KEY) else {
        return Ok(Vec::new());
    };
    serde_json::from_str::<Vec<String>>(raw).map_err(|e| AllocationError::InvalidRequest {
        key: PCI_LABELS_KEY.to_string(),
        reason: format!("expected a JSON list of labels: {e}"),
    })
}

fn parse_count(key: &str, token: &str, raw: &str) -> Result<usize, AllocationError> {
    token
        .parse::<usize>()
        .map_err(|_| AllocationError::InvalidRequest {
            key: key.to_string(),
            reason: format!("`{raw}` is not a device count"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> StringMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn larger_source_wins() {
        let metadata = map(&[("ib_devices", "1")]);
        let extra_specs = map(&[("ib_devices", "= 3")]);

        let count = requested_device_count(IB_DEVICES_KEY, &metadata, &extra_specs)
            .expect("should parse both sources");

        assert_eq!(count, 3);
    }

    #[test]
    fn absent_everywhere_means_zero() {
        let count = requested_device_count(GPUS_KEY, &StringMap::new(), &StringMap::new())
            .expect("absent keys are fine");
        assert_eq!(count, 0);
    }

    #[test]
    fn extra_spec_accepts_bare_and_operator_forms() {
        assert_eq!(
            extra_spec_count(GPUS_KEY, &map(&[("gpus", "2")])),
            Ok(Some(2))
        );
        assert_eq!(
            extra_spec_count(GPUS_KEY, &map(&[("gpus", ">= 4")])),
            Ok(Some(4))
        );
    }

    #[test]
    fn garbage_is_an_invalid_request() {
        let err = requested_device_count(GPUS_KEY, &map(&[("gpus", "many")]), &StringMap::new())
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidRequest { ref key, .. } if key == "gpus"));

        let err = extra_spec_count(GPUS_KEY, &map(&[("gpus", "")])).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidRequest { .. }));
    }

    #[test]
    fn pci_labels_are_a_json_list() {
        let labels = requested_pci_labels(&map(&[(
            "pci_passthrough:labels",
            r#"["fpga", "fpga", "nvme"]"#,
        )]))
        .expect("should parse labels");
        assert_eq!(labels, vec!["fpga", "fpga", "nvme"]);

        assert!(requested_pci_labels(&StringMap::new())
            .expect("absent key is fine")
            .is_empty());
        assert!(requested_pci_labels(&map(&[("pci_passthrough:labels", "fpga")])).is_err());
    }
}
