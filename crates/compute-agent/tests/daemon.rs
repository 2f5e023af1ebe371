use clap::Parser;
use api_types::InstanceSpec;
use compute_agent::allocation::AllocationError;
use compute_agent::allocation::AllocationStore;
use compute_agent::allocation::AllocationTable;
use compute_agent::app::ApplicationBuilder;
use compute_agent::config::DaemonArgs;
use compute_agent::infiniband::IbFunction;
use similar_asserts::assert_eq;
use tempfile::TempDir;

const FPGA: &str = r#"[{"label": "fpga", "address": "0000:04:00.0"}]"#;
const INSTANCE_A: &str = "00000000-0000-4000-8000-00000000000a";

fn daemon_args(dir: &TempDir, extra: &[&str]) -> DaemonArgs {
    let state_path = dir.path().join("state");
    let instances_path = dir.path().join("instances");
    let cgroups_path = dir.path().join("cgroups");
    let mut argv = vec![
        "compute-agent".to_string(),
        "--host".to_string(),
        "host1".to_string(),
        "--capability".to_string(),
        "cpu_arch:x86_64;ib_bus:0x81;ib_device_range:0-0;ib_function_range:0-3;gpus:2".to_string(),
        "--state-path".to_string(),
        state_path.display().to_string(),
        "--instances-path".to_string(),
        instances_path.display().to_string(),
        "--dev-cgroups-path".to_string(),
        cgroups_path.display().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    DaemonArgs::try_parse_from(argv).expect("daemon arguments should parse")
}

#[test_log::test(tokio::test)]
async fn build_reconciles_persisted_tables() {
    // Arrange
    let dir = tempfile::tempdir().expect("should create temp dir");
    let live = "00000000-0000-4000-8000-000000000001";
    let dead = "00000000-0000-4000-8000-000000000002";
    std::fs::create_dir_all(dir.path().join("instances").join(live))
        .expect("should create instance dir");
    let args = daemon_args(&dir, &[]);
    let table: AllocationTable<IbFunction> = [
        (live.to_string(), vec![IbFunction { device: 0, function: 3 }]),
        (dead.to_string(), vec![IbFunction { device: 0, function: 2 }]),
    ]
    .into_iter()
    .collect();
    AllocationStore::new(args.ib_usage_path())
        .save(&table)
        .expect("should persist table");

    // Act
    let app = ApplicationBuilder::new(args)
        .build()
        .await
        .expect("application should build");

    // Assert
    let report = app.services().host.allocations();
    assert_eq!(report.infiniband.len(), 1, "dead instance should be dropped");
    assert_eq!(report.infiniband[0].instance_id, live);
    assert_eq!(report.infiniband_free, 3);
    assert_eq!(report.gpus_free, 2);
}

#[tokio::test]
async fn duplicate_pci_address_fails_build() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let args = daemon_args(
        &dir,
        &[
            "--pci-passthrough-devices",
            r#"[{"label": "a", "address": "0000:04:00.0"}, {"label": "b", "address": "0000:04:00.0"}]"#,
        ],
    );

    let result = ApplicationBuilder::new(args).build().await;

    assert!(result.is_err(), "duplicate PCI addresses should be rejected");
}

#[tokio::test]
async fn invalid_capability_fails_build() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let args = daemon_args(&dir, &["--capability", "no-separator"]);

    let result = ApplicationBuilder::new(args).build().await;

    assert!(result.is_err());
}

fn instance(uuid: &str, vcpus: u64) -> InstanceSpec {
    InstanceSpec {
        uuid: uuid.to_string(),
        name: format!("instance-{vcpus}"),
        vcpus,
        memory_mb: 2048,
        extra_specs: [("pci_passthrough:labels".to_string(), r#"["fpga"]"#.to_string())]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn restart_keeps_pci_owner_and_ledger_of_live_instance() {
    // Arrange
    let dir = tempfile::tempdir().expect("should create temp dir");
    std::fs::create_dir_all(dir.path().join("instances").join(INSTANCE_A))
        .expect("should create instance dir");
    let first = ApplicationBuilder::new(daemon_args(&dir, &["--pci-passthrough-devices", FPGA]))
        .build()
        .await
        .expect("application should build");
    first
        .services()
        .host
        .prepare_instance(&instance(INSTANCE_A, 4))
        .expect("instance should be prepared");
    drop(first);

    // Act
    let restarted = ApplicationBuilder::new(daemon_args(&dir, &["--pci-passthrough-devices", FPGA]))
        .build()
        .await
        .expect("application should rebuild");

    // Assert
    let services = restarted.services();
    let report = services.host.allocations();
    assert_eq!(report.pci_devices.len(), 1);
    assert_eq!(report.pci_devices[0].instance_id, INSTANCE_A);
    assert!(report.pci_free_labels.is_empty(), "owned device must not be advertised");
    assert_eq!(services.pci.pending().len(), 1);

    let snapshot = services.reporter.build_snapshot();
    assert_eq!(snapshot.vcpus_used, 4);
    assert_eq!(snapshot.memory_mb_used, 2048);

    let err = services
        .host
        .prepare_instance(&instance("00000000-0000-4000-8000-00000000000b", 2))
        .unwrap_err();
    assert_eq!(
        err,
        AllocationError::PciDeviceUnavailable {
            label: "fpga".to_string()
        }
    );
}

#[test_log::test(tokio::test)]
async fn restart_frees_pci_device_and_ledger_of_dead_instance() {
    // Arrange
    let dir = tempfile::tempdir().expect("should create temp dir");
    let instance_dir = dir.path().join("instances").join(INSTANCE_A);
    std::fs::create_dir_all(&instance_dir).expect("should create instance dir");
    let first = ApplicationBuilder::new(daemon_args(&dir, &["--pci-passthrough-devices", FPGA]))
        .build()
        .await
        .expect("application should build");
    first
        .services()
        .host
        .prepare_instance(&instance(INSTANCE_A, 4))
        .expect("instance should be prepared");
    drop(first);
    std::fs::remove_dir_all(&instance_dir).expect("should remove instance dir");

    // Act
    let restarted = ApplicationBuilder::new(daemon_args(&dir, &["--pci-passthrough-devices", FPGA]))
        .build()
        .await
        .expect("application should rebuild");

    // Assert
    let services = restarted.services();
    let report = services.host.allocations();
    assert!(report.pci_devices.is_empty());
    assert_eq!(report.pci_free_labels, vec!["fpga".to_string()]);
    assert!(services.pci.pending().is_empty());
    assert_eq!(services.reporter.build_snapshot().vcpus_used, 0);
}
