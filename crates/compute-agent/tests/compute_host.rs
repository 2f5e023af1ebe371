use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use api_types::InstanceSpec;
use compute_agent::allocation::AllocationError;
use compute_agent::allocation::AllocationStore;
use compute_agent::capability::CapabilityDescriptor;
use compute_agent::gpu::GpuAllocator;
use compute_agent::gpu::GpuDeviceNodes;
use compute_agent::infiniband::InfinibandAllocator;
use compute_agent::pci::PciPassthroughRegistry;
use compute_agent::platform::InMemoryPciDeviceStore;
use compute_agent::platform::InstanceIsolation;
use compute_agent::platform::PlatformError;
use compute_agent::reporter::ResourceLedger;
use compute_agent::ComputeHost;
use error_stack::Report;
use similar_asserts::assert_eq;
use tempfile::TempDir;

const HOST: &str = "host1";
const PCI_DEVICES: &str = r#"[
    {"label": "fpga", "address": "0000:04:00.0"},
    {"label": "fpga", "address": "0000:04:00.1"},
    {"label": "nvme", "address": "0000:05:00.0"}
]"#;

#[derive(Default)]
struct FlakyIsolation {
    fail_for: Mutex<HashSet<String>>,
}

impl InstanceIsolation for FlakyIsolation {
    fn grant_device_access(
        &self,
        instance: &InstanceSpec,
        _major: u32,
        _minor: u32,
    ) -> Result<(), Report<PlatformError>> {
        if self
            .fail_for
            .lock()
            .expect("lock should not be poisoned")
            .contains(&instance.uuid)
        {
            return Err(Report::new(PlatformError::Io {
                path: format!("/sys/fs/cgroup/devices/lxc/{}/devices.allow", instance.name),
            }));
        }
        Ok(())
    }

    fn write_guest_environment(
        &self,
        _instance: &InstanceSpec,
        _key: &str,
        _value: &str,
    ) -> Result<(), Report<PlatformError>> {
        Ok(())
    }
}

struct TestHost {
    host: ComputeHost,
    isolation: Arc<FlakyIsolation>,
    pci: Arc<PciPassthroughRegistry>,
}

fn capabilities() -> CapabilityDescriptor {
    CapabilityDescriptor::parse([
        "cpu_arch:x86_64",
        "ib_bus:0x81",
        "ib_device_range:0-1",
        "ib_function_range:0-1",
        "gpus:4",
    ])
    .expect("test capabilities should parse")
}

fn open_host(dir: &TempDir, live: &HashSet<String>) -> TestHost {
    let descriptor = capabilities();
    let isolation = Arc::new(FlakyIsolation::default());
    let infiniband = Arc::new(
        InfinibandAllocator::init(
            &descriptor,
            AllocationStore::new(dir.path().join("ibs_allocated.json")),
            live,
        )
        .expect("Infiniband allocator should initialize"),
    );
    let gpus = Arc::new(
        GpuAllocator::init(
            &descriptor,
            GpuDeviceNodes::default(),
            AllocationStore::new(dir.path().join("gpus_allocated.json")),
            isolation.clone(),
            live,
        )
        .expect("GPU allocator should initialize"),
    );
    let pci = Arc::new(PciPassthroughRegistry::new(
        HOST,
        PCI_DEVICES,
        Arc::new(InMemoryPciDeviceStore::default()),
    ));
    pci.sync("node-1", false).expect("PCI devices should register");

    TestHost {
        host: ComputeHost::new(
            infiniband,
            gpus,
            pci.clone(),
            Arc::new(ResourceLedger::default()),
        ),
        isolation,
        pci,
    }
}

fn instance(n: u32, extra_specs: &[(&str, &str)]) -> InstanceSpec {
    InstanceSpec {
        uuid: format!("00000000-0000-4000-8000-{n:012}"),
        name: format!("instance-{n:08x}"),
        vcpus: 2,
        memory_mb: 2048,
        local_gb: 10,
        extra_specs: extra_specs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

#[test]
fn conservation_and_no_double_allocation() {
    // Arrange
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());
    let specs: Vec<_> = (1..=4)
        .map(|n| instance(n, &[("ib_devices", "= 1"), ("gpus", "1")]))
        .collect();

    // Act
    let assignments: Vec<_> = specs
        .iter()
        .map(|spec| test.host.prepare_instance(spec).expect("should prepare"))
        .collect();
    test.host.release_instance(&specs[1].uuid);
    let report = test.host.allocations();

    // Assert
    let functions: BTreeSet<_> = assignments
        .iter()
        .filter_map(|a| a.infiniband)
        .map(|f| (f.device, f.function))
        .collect();
    assert_eq!(functions.len(), 4, "every instance should get a distinct function");
    let gpus: BTreeSet<_> = assignments.iter().flat_map(|a| a.gpus.clone()).collect();
    assert_eq!(gpus, BTreeSet::from([0, 1, 2, 3]));

    let held_functions: usize = report.infiniband.iter().map(|e| e.handles.len()).sum();
    let held_gpus: usize = report.gpus.iter().map(|e| e.handles.len()).sum();
    assert_eq!(held_functions + report.infiniband_free, 4, "functions are conserved");
    assert_eq!(held_gpus + report.gpus_free, 4, "GPUs are conserved");
    assert_eq!(report.gpus_free, 1);
}

#[test]
fn release_is_idempotent() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());
    let spec = instance(1, &[("gpus", "2"), ("pci_passthrough:labels", r#"["fpga"]"#)]);
    test.host.prepare_instance(&spec).expect("should prepare");

    let first = test.host.release_instance(&spec.uuid);
    let after_first = test.host.allocations();
    let second = test.host.release_instance(&spec.uuid);

    assert_eq!(first.gpus_released, 2);
    assert_eq!(first.pci_devices_released, 1);
    assert_eq!(second.gpus_released, 0);
    assert_eq!(second.pci_devices_released, 0);
    assert_eq!(test.host.allocations(), after_first);
}

#[test]
fn restart_keeps_live_instances_and_frees_dead_ones() {
    // Arrange
    let dir = tempfile::tempdir().expect("should create temp dir");
    let alive = instance(1, &[("ib_devices", "1"), ("gpus", "2")]);
    let dead = instance(2, &[("ib_devices", "1"), ("gpus", "1")]);
    let kept = {
        let test = open_host(&dir, &HashSet::new());
        let kept = test.host.prepare_instance(&alive).expect("should prepare");
        test.host.prepare_instance(&dead).expect("should prepare");
        kept
    };

    // Act
    let live = HashSet::from([alive.uuid.clone()]);
    let reopened = open_host(&dir, &live);
    let report = reopened.host.allocations();

    // Assert
    assert_eq!(report.gpus.len(), 1, "only the live instance keeps GPUs");
    assert_eq!(report.gpus[0].instance_id, alive.uuid);
    assert_eq!(report.gpus[0].handles, kept.gpus);
    assert_eq!(report.gpus_free, 2);
    assert_eq!(report.infiniband.len(), 1);
    assert_eq!(report.infiniband_free, 3);
}

#[test]
fn overcommit_boundary() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());

    let err = test
        .host
        .prepare_instance(&instance(1, &[("gpus", "5")]))
        .unwrap_err();
    assert_eq!(
        err,
        AllocationError::Overcommit {
            requested: 5,
            available: 4
        }
    );
    assert_eq!(test.host.allocations().gpus_free, 4, "pool is untouched");

    let exact = test
        .host
        .prepare_instance(&instance(2, &[("gpus", "4")]))
        .expect("requesting the whole pool should succeed");
    assert_eq!(exact.gpus.len(), 4);
    assert_eq!(test.host.allocations().gpus_free, 0);
}

#[test]
fn failed_gpu_exposure_rolls_back_infiniband() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());
    let spec = instance(1, &[("ib_devices", "1"), ("gpus", "1")]);
    test.isolation
        .fail_for
        .lock()
        .expect("lock should not be poisoned")
        .insert(spec.uuid.clone());

    let err = test.host.prepare_instance(&spec).unwrap_err();

    assert!(matches!(err, AllocationError::Isolation { .. }));
    let report = test.host.allocations();
    assert!(report.infiniband.is_empty(), "function should be returned");
    assert!(report.gpus.is_empty());
    assert_eq!(report.infiniband_free, 4);
    assert_eq!(report.gpus_free, 4);
}

#[test]
fn unavailable_pci_label_rolls_back_everything() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());
    let spec = instance(
        1,
        &[
            ("ib_devices", "1"),
            ("gpus", "2"),
            ("pci_passthrough:labels", r#"["fpga", "gpu-x"]"#),
        ],
    );

    let err = test.host.prepare_instance(&spec).unwrap_err();

    assert_eq!(
        err,
        AllocationError::PciDeviceUnavailable {
            label: "gpu-x".to_string()
        }
    );
    let report = test.host.allocations();
    assert!(report.infiniband.is_empty());
    assert!(report.gpus.is_empty());
    assert!(report.pci_devices.is_empty());
    assert_eq!(
        report.pci_free_labels,
        vec!["fpga".to_string(), "fpga".to_string(), "nvme".to_string()]
    );
}

#[test]
fn repeated_prepare_keeps_first_assignment() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());
    let spec = instance(1, &[("gpus", "1")]);
    let first = test.host.prepare_instance(&spec).expect("should prepare");

    let err = test.host.prepare_instance(&spec).unwrap_err();

    assert!(matches!(err, AllocationError::AlreadyAllocated { .. }));
    let report = test.host.allocations();
    assert_eq!(report.gpus.len(), 1);
    assert_eq!(report.gpus[0].handles, first.gpus);
}

#[test]
fn pci_labels_are_claimed_as_multiset() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());

    let assignment = test
        .host
        .prepare_instance(&instance(1, &[("pci_passthrough:labels", r#"["fpga", "fpga"]"#)]))
        .expect("both fpga devices are free");

    let addresses: Vec<_> = assignment
        .pci_devices
        .iter()
        .map(|d| d.address.as_str())
        .collect();
    assert_eq!(addresses, vec!["0000:04:00.0", "0000:04:00.1"]);
    assert_eq!(test.pci.free_labels(), vec!["nvme".to_string()]);
}

#[test]
fn unparseable_request_touches_nothing() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let test = open_host(&dir, &HashSet::new());

    let err = test
        .host
        .prepare_instance(&instance(1, &[("gpus", ">= two")]))
        .unwrap_err();

    assert!(matches!(err, AllocationError::InvalidRequest { ref key, .. } if key == "gpus"));
    assert_eq!(test.host.allocations().gpus_free, 4);
}
