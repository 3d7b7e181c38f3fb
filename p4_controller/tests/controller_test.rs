use futures::StreamExt;
use p4_controller::program::{self, counter_line, FilterKey, Protocol};
use p4_controller::{Controller, ControllerError, SwitchConfig, Targets, Topology};
use p4ext::sim::{SimNetwork, SimSwitch};
use p4ext::{
    testing,
    CounterSample,
    ElectionId,
    MacAddr,
    P4Error,
    PipelineConfig,
    SchemaRegistry,
    SessionOptions,
    SessionState,
    SwitchSession,
    TableEntry,
    UpdateType,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;
use tracing_test::traced_test;

fn options() -> SessionOptions {
    SessionOptions {
        arbitration_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_millis(500),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::load(&testing::demo_p4info_bytes()).unwrap())
}

fn pipeline() -> PipelineConfig {
    PipelineConfig::new(testing::demo_p4info_bytes(), b"{}".to_vec())
}

fn switches() -> Vec<SwitchConfig> {
    vec![
        SwitchConfig::new("s1", "127.0.0.1:50051", 0),
        SwitchConfig::new("s2", "127.0.0.1:50052", 1),
    ]
}

// A network where every configured switch is reachable.
fn network(configs: &[SwitchConfig]) -> (SimNetwork, Vec<SimSwitch>) {
    let network = SimNetwork::new();
    let switches = configs
        .iter()
        .map(|s| network.add_switch(&s.address, s.device_id))
        .collect();
    (network, switches)
}

fn controller(network: &SimNetwork, configs: Vec<SwitchConfig>) -> Controller {
    Controller::new(registry(), Arc::new(network.clone()), configs, options()).unwrap()
}

fn forwarding_entry(registry: &SchemaRegistry, port: u16) -> TableEntry {
    let mac: MacAddr = "00:00:00:00:01:01".parse().unwrap();
    program::forwarding_rule(registry, Ipv4Addr::new(10, 0, 1, 1), mac, port).unwrap()
}

#[tokio::test]
#[traced_test]
async fn unreachable_switch_does_not_block_the_rest() {
    let network = SimNetwork::new();
    let s1 = network.add_switch("127.0.0.1:50051", 0);
    let mut controller = controller(&network, switches());

    match controller.connect_all().await {
        Err(ControllerError::Connect(e)) => {
            assert_eq!(e.switches(), vec!["s2"]);
            assert!(matches!(e.failures[0].1, P4Error::Timeout { .. }));
        }
        other => panic!("expected a connect error, got {:?}", other),
    }
    assert!(logs_contain("could not connect"));
    assert!(controller.is_connected("s1"));
    assert!(!controller.is_connected("s2"));

    let report = controller.install_program(Targets::All, &pipeline()).await.unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.succeeded().collect::<Vec<_>>(), vec!["s1"]);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "s2");
    assert!(matches!(failed[0].1, P4Error::NotConnected));

    let entry = forwarding_entry(controller.registry(), 1);
    controller.write("s1", &entry, UpdateType::Insert).await.unwrap();
    assert_eq!(s1.table_entries().len(), 1);
    assert!(matches!(
        controller.write("s2", &entry, UpdateType::Insert).await,
        Err(ControllerError::NotConnected(name)) if name == "s2"
    ));

    // The switch comes up later; only it is retried.
    network.add_switch("127.0.0.1:50052", 1);
    assert_eq!(controller.connect("s2").await.unwrap(), SessionState::Master);
    assert!(controller.is_connected("s2"));
    controller.connect_all().await.unwrap();
}

#[tokio::test]
async fn install_on_a_subset() {
    let configs = switches();
    let (network, sims) = network(&configs);
    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();

    let report = controller
        .install_program(Targets::Only(&["s2"]), &pipeline())
        .await
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(report.outcomes.keys().collect::<Vec<_>>(), vec!["s2"]);
    assert!(!sims[0].has_pipeline());
    assert!(sims[1].has_pipeline());

    // s1 is still only master, so writes wait for a program.
    let entry = forwarding_entry(controller.registry(), 1);
    match controller.write("s1", &entry, UpdateType::Insert).await {
        Err(ControllerError::Switch { switch, source }) => {
            assert_eq!(switch, "s1");
            assert!(matches!(source, P4Error::NoPipeline { device_id: 0 }));
        }
        other => panic!("expected NoPipeline, got {:?}", other),
    }

    assert!(matches!(
        controller.install_program(Targets::Only(&["s9"]), &pipeline()).await,
        Err(ControllerError::UnknownSwitch(name)) if name == "s9"
    ));
}

#[tokio::test]
async fn one_rejected_install_does_not_affect_others() {
    let configs = switches();
    let (network, _sims) = network(&configs);

    // Another controller already owns s2.
    let mut rival = SwitchSession::new(
        "rival",
        "127.0.0.1:50052",
        1,
        SessionOptions {
            election_id: ElectionId(10),
            ..options()
        },
    );
    rival.open(&network).unwrap();
    assert_eq!(rival.request_mastership().await.unwrap(), SessionState::Master);

    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();
    assert_eq!(controller.session("s2").unwrap().state(), SessionState::Standby);

    let report = controller.install_program(Targets::All, &pipeline()).await.unwrap();
    assert_eq!(report.succeeded().collect::<Vec<_>>(), vec!["s1"]);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].1, P4Error::NotMaster { device_id: 1 }));
    assert_eq!(controller.session("s1").unwrap().state(), SessionState::Active);
}

#[tokio::test]
async fn shutdown_closes_everything_once() {
    let configs = switches();
    let (network, sims) = network(&configs);
    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();
    controller.install_program(Targets::All, &pipeline()).await.unwrap();

    controller.shutdown().await.unwrap();
    assert!(!controller.is_connected("s1"));
    assert!(!controller.is_connected("s2"));
    controller.shutdown().await.unwrap();

    let entry = forwarding_entry(controller.registry(), 1);
    assert!(matches!(
        controller.write("s1", &entry, UpdateType::Insert).await,
        Err(ControllerError::NotConnected(_))
    ));
    for sim in &sims {
        for _ in 0..100 {
            if sim.connected_controllers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sim.connected_controllers(), 0);
    }
}

#[test]
fn duplicate_switches_are_rejected() {
    let network = SimNetwork::new();
    let mut configs = switches();
    configs[1].name = "s1".into();
    assert!(matches!(
        Controller::new(registry(), Arc::new(network.clone()), configs, options()),
        Err(ControllerError::Config(_))
    ));

    let mut configs = switches();
    configs[1].address = configs[0].address.clone();
    configs[1].device_id = configs[0].device_id;
    assert!(matches!(
        Controller::new(registry(), Arc::new(network), configs, options()),
        Err(ControllerError::Config(_))
    ));
}

#[test]
fn device_ids_are_unique_across_addresses() {
    let network = SimNetwork::new();
    let configs = vec![
        SwitchConfig::new("s1", "127.0.0.1:50051", 0),
        SwitchConfig::new("s2", "127.0.0.1:50052", 0),
    ];
    match Controller::new(registry(), Arc::new(network), configs, options()) {
        Err(ControllerError::Config(message)) => {
            assert!(message.contains("s1"));
            assert!(message.contains("s2"));
        }
        _ => panic!("switches sharing a device id were accepted"),
    }
}

#[tokio::test]
async fn rules_read_back_by_name() {
    let configs = switches();
    let (network, _sims) = network(&configs);
    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();
    controller.install_program(Targets::All, &pipeline()).await.unwrap();

    let forward = forwarding_entry(controller.registry(), 1);
    controller.write("s1", &forward, UpdateType::Insert).await.unwrap();
    for entry in program::filtering_rules(controller.registry(), Protocol::Tcp, 1234).unwrap() {
        controller.write("s1", &entry, UpdateType::Insert).await.unwrap();
    }

    let lines: Vec<String> = controller
        .read_table_entries("s1", None)
        .await
        .unwrap()
        .map(|e| controller.describe(&e.unwrap()).unwrap().to_string())
        .collect()
        .await;
    assert_eq!(
        lines,
        vec![
            "MyIngress.ipv4_lpm: hdr.ipv4.dstAddr=10.0.1.1/32 -> MyIngress.ipv4_forward(dstAddr=00:00:00:00:01:01, port=1)",
            "MyEgress.table_tcp_srcPort_exact: hdr.tcp.srcPort=1234 -> MyEgress.action_clone_e2e()",
            "MyEgress.table_tcp_dstPort_exact: hdr.tcp.dstPort=1234 -> MyEgress.action_clone_e2e()",
        ]
    );

    let only_lpm: Vec<_> = controller
        .read_table_entries("s1", Some("MyIngress.ipv4_lpm"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(only_lpm.len(), 1);

    let empty: Vec<_> = controller.read_table_entries("s2", None).await.unwrap().collect().await;
    assert!(empty.is_empty());

    assert!(matches!(
        controller.read_table_entries("s1", Some("MyIngress.nope")).await,
        Err(ControllerError::Switch { source: P4Error::NotFound { .. }, .. })
    ));

    // Deleting twice is a switch rejection; the session stays usable.
    controller.write("s1", &forward, UpdateType::Delete).await.unwrap();
    match controller.write("s1", &forward, UpdateType::Delete).await {
        Err(ControllerError::Switch { source, .. }) => assert_eq!(source.rpc_code(), Some(Code::NotFound)),
        other => panic!("expected a switch error, got {:?}", other),
    }
    assert_eq!(controller.session("s1").unwrap().state(), SessionState::Active);
}

#[tokio::test]
async fn counters_print_one_line_per_cell() {
    let configs = switches();
    let (network, _sims) = network(&configs);
    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();
    controller.install_program(Targets::All, &pipeline()).await.unwrap();

    for index in [3, 4] {
        let sample = CounterSample {
            counter_id: testing::INGRESS_COUNTER_ID,
            index,
            packet_count: 10 * index,
            byte_count: 640 * index,
        };
        controller.write_counter("s1", &sample).await.unwrap();
    }

    let counter = "MyIngress.ingressPktCounter";
    let lines: Vec<String> = controller
        .read_counters("s1", counter, p4ext::ALL_INDEXES)
        .await
        .unwrap()
        .map(|s| counter_line("s1", counter, &s.unwrap()))
        .collect()
        .await;
    assert_eq!(
        lines,
        vec![
            "s1 MyIngress.ingressPktCounter 3: 30 packets (1920 bytes)",
            "s1 MyIngress.ingressPktCounter 4: 40 packets (2560 bytes)",
        ]
    );
}

#[tokio::test]
async fn per_switch_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("s1-p4runtime-requests.txt");
    let mut configs = switches();
    configs[0].election_id = Some(9);
    configs[0].proto_dump_file = Some(dump.clone());
    let (network, _sims) = network(&configs);
    let mut controller = controller(&network, configs);
    controller.connect_all().await.unwrap();

    let s1 = controller.session("s1").unwrap();
    assert_eq!(s1.election_id(), ElectionId(9));
    assert_eq!(s1.request_log(), Some(dump.as_path()));
    assert_eq!(controller.session("s2").unwrap().election_id(), ElectionId(1));

    controller.install_program(Targets::All, &pipeline()).await.unwrap();
    controller.shutdown().await.unwrap();
    let contents = std::fs::read_to_string(&dump).unwrap();
    assert!(contents.contains("StreamChannel"));
    assert!(contents.contains("SetForwardingPipelineConfig"));
}

#[test]
fn filter_keys_name_real_tables() {
    let registry = registry();
    for key in FilterKey::ALL {
        let field = registry.resolve_match_field(key.table_name(), key.field_name()).unwrap();
        assert_eq!(field.bit_width, 16);
    }

    let rules = program::filtering_rules(&registry, Protocol::Udp, 53).unwrap();
    let tables: Vec<&str> = rules
        .iter()
        .map(|r| registry.table_name(r.table_id).unwrap())
        .collect();
    assert_eq!(
        tables,
        vec!["MyEgress.table_udp_srcPort_exact", "MyEgress.table_udp_dstPort_exact"]
    );
    assert_eq!(rules[0].action.as_ref().unwrap().action_id, testing::CLONE_E2E_ID);
}

#[test]
fn topology_documents() {
    let demo = Topology::demo();
    demo.validate().unwrap();
    assert_eq!(demo.switches.len(), 3);
    assert_eq!(demo.switches[2].address, "127.0.0.1:50053");
    assert_eq!(demo.switches[2].device_id, 2);
    assert_eq!(demo.forwarding.len(), 4);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topology.json");
    std::fs::write(
        &path,
        r#"{
            "switches": [{"name": "s1", "address": "10.0.0.1:9559", "device_id": 5}],
            "filtering": [{"switch": "s1", "protocol": "udp", "port": 53}]
        }"#,
    )
    .unwrap();
    let topology = Topology::load(&path).unwrap();
    topology.validate().unwrap();
    assert_eq!(topology.switches[0].election_id, None);
    assert_eq!(topology.filtering[0].protocol, Protocol::Udp);
    assert!(topology.forwarding.is_empty());

    std::fs::write(&path, r#"{"switches": [], "mirror_sessions": [{"switch": "s7", "session_id": 1, "egress_port": 3}]}"#)
        .unwrap();
    let topology = Topology::load(&path).unwrap();
    assert!(matches!(topology.validate(), Err(ControllerError::UnknownSwitch(name)) if name == "s7"));

    std::fs::write(&path, r#"{"switches": [], "hosts": []}"#).unwrap();
    assert!(matches!(Topology::load(&path), Err(ControllerError::Config(_))));
}
