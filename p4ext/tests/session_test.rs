use futures::StreamExt;
use p4ext::sim::{SimNetwork, SimSwitch};
use p4ext::testing;
use p4ext::{
    build_mirror_session,
    build_table_entry,
    CounterSample,
    ElectionId,
    MatchValue,
    P4Error,
    PipelineConfig,
    SchemaRegistry,
    SessionOptions,
    SessionState,
    SwitchSession,
    TableEntry,
    UpdateType,
    Value,
    ALL_INDEXES,
    ALL_TABLES,
};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tonic::Code;
use tracing_test::traced_test;

const ADDRESS: &str = "127.0.0.1:50051";

fn options(election_id: u128) -> SessionOptions {
    SessionOptions {
        election_id: ElectionId(election_id),
        arbitration_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_secs(1),
        close_timeout: Duration::from_millis(500),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

fn registry() -> SchemaRegistry {
    SchemaRegistry::load(&testing::demo_p4info_bytes()).unwrap()
}

fn pipeline() -> PipelineConfig {
    PipelineConfig::new(testing::demo_p4info_bytes(), b"{}".to_vec())
}

fn network() -> (SimNetwork, SimSwitch) {
    let network = SimNetwork::new();
    let switch = network.add_switch(ADDRESS, 0);
    (network, switch)
}

async fn connect(network: &SimNetwork, name: &str, election_id: u128) -> SwitchSession {
    let mut session = SwitchSession::new(name, ADDRESS, 0, options(election_id));
    session.open(network).unwrap();
    session.request_mastership().await.unwrap();
    session
}

async fn active_session(network: &SimNetwork) -> SwitchSession {
    let mut session = connect(network, "s1", 1).await;
    session.set_forwarding_pipeline_config(&pipeline()).await.unwrap();
    session
}

// Polls `condition`, giving background tasks a chance to run in between.
async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn forwarding_entry(registry: &SchemaRegistry, last_octet: u8, port: u16) -> TableEntry {
    build_table_entry(
        registry,
        "MyIngress.ipv4_lpm",
        &[("hdr.ipv4.dstAddr", MatchValue::lpm(Ipv4Addr::new(10, 0, 1, last_octet), 32))],
        "MyIngress.ipv4_forward",
        &[
            ("dstAddr", "00:00:00:00:01:01".parse().unwrap()),
            ("port", Value::from(port)),
        ],
        0,
    )
    .unwrap()
}

fn filter_entry(registry: &SchemaRegistry, table: &str, field: &str, port: u16) -> TableEntry {
    build_table_entry(
        registry,
        table,
        &[(field, MatchValue::exact(port))],
        "MyEgress.action_clone_e2e",
        &[],
        0,
    )
    .unwrap()
}

#[tokio::test]
async fn install_then_write_and_read_back() {
    let (network, switch) = network();
    let registry = registry();
    let mut session = connect(&network, "s1", 1).await;
    assert_eq!(session.state(), SessionState::Master);

    session.set_forwarding_pipeline_config(&pipeline()).await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert!(switch.has_pipeline());

    let entry = forwarding_entry(&registry, 1, 1);
    session.write_table_entry(&entry, UpdateType::Insert).await.unwrap();
    assert_eq!(session.write_seqno(), 1);
    assert_eq!(switch.table_entries().len(), 1);

    let entries: Vec<TableEntry> = session
        .read_table_entries(ALL_TABLES)
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;
    assert_eq!(entries, vec![entry]);
}

#[tokio::test]
async fn undecodable_p4info_is_not_sent() {
    let (network, switch) = network();
    let mut session = connect(&network, "s1", 1).await;
    let config = PipelineConfig::new(vec![0xff, 0xff], b"{}".to_vec());
    let error = session.set_forwarding_pipeline_config(&config).await.unwrap_err();
    assert!(matches!(error, P4Error::Schema(_)), "{:?}", error);
    assert_eq!(session.state(), SessionState::Master);
    assert!(!switch.has_pipeline());
}

#[tokio::test]
async fn highest_election_id_is_the_only_master() {
    let (network, switch) = network();
    let low = connect(&network, "low", 3).await;
    let high = connect(&network, "high", 7).await;
    let middle = connect(&network, "middle", 5).await;

    assert_eq!(switch.primary(), Some(7));
    assert!(wait_until(|| low.state() == SessionState::Standby).await);
    assert_eq!(high.state(), SessionState::Master);
    assert_eq!(middle.state(), SessionState::Standby);
    assert_eq!(middle.primary(), Some(ElectionId(7)));
}

#[tokio::test]
async fn standby_reads_but_cannot_write() {
    let (network, _switch) = network();
    let registry = registry();
    let mut primary = connect(&network, "primary", 2).await;
    primary.set_forwarding_pipeline_config(&pipeline()).await.unwrap();
    let entry = forwarding_entry(&registry, 1, 1);
    primary.write_table_entry(&entry, UpdateType::Insert).await.unwrap();

    let mut standby = connect(&network, "standby", 1).await;
    assert_eq!(standby.state(), SessionState::Standby);

    let other = forwarding_entry(&registry, 2, 2);
    assert!(matches!(
        standby.write_table_entry(&other, UpdateType::Insert).await,
        Err(P4Error::NotMaster { device_id: 0 })
    ));
    assert!(matches!(
        standby.set_forwarding_pipeline_config(&pipeline()).await,
        Err(P4Error::NotMaster { .. })
    ));
    assert_eq!(standby.write_seqno(), 0);

    let table_id = registry.resolve_table("MyIngress.ipv4_lpm").unwrap();
    let entries: Vec<_> = standby.read_table_entries(table_id).await.unwrap().collect().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].as_ref().unwrap(), &entry);
}

#[tokio::test]
#[traced_test]
async fn losing_and_regaining_mastership() {
    let (network, _switch) = network();
    let registry = registry();
    let mut first = active_session(&network).await;

    let mut second = connect(&network, "s2", 2).await;
    assert_eq!(second.state(), SessionState::Master);
    assert!(wait_until(|| first.state() == SessionState::Standby).await);
    assert!(matches!(
        first
            .write_table_entry(&forwarding_entry(&registry, 1, 1), UpdateType::Insert)
            .await,
        Err(P4Error::NotMaster { .. })
    ));

    second.close().await.unwrap();
    // The pipeline is still installed, so the promoted session is Active.
    assert!(wait_until(|| first.state() == SessionState::Active).await);
    first
        .write_table_entry(&forwarding_entry(&registry, 1, 1), UpdateType::Insert)
        .await
        .unwrap();
    assert!(logs_contain("became master"));
}

#[tokio::test]
async fn rejected_writes_report_the_switch_code() {
    let (network, switch) = network();
    let registry = registry();
    let mut session = active_session(&network).await;
    let entry = forwarding_entry(&registry, 1, 1);

    session.write_table_entry(&entry, UpdateType::Insert).await.unwrap();
    let duplicate = session.write_table_entry(&entry, UpdateType::Insert).await.unwrap_err();
    assert_eq!(duplicate.rpc_code(), Some(Code::AlreadyExists));

    session.write_table_entry(&entry, UpdateType::Delete).await.unwrap();
    let missing = session.write_table_entry(&entry, UpdateType::Delete).await.unwrap_err();
    assert_eq!(missing.rpc_code(), Some(Code::NotFound));
    assert!(switch.table_entries().is_empty());

    let modified = forwarding_entry(&registry, 1, 7);
    let missing = session.write_table_entry(&modified, UpdateType::Modify).await.unwrap_err();
    assert_eq!(missing.rpc_code(), Some(Code::NotFound));

    // The session stays usable after rejected writes.
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.write_seqno(), 5);
}

#[tokio::test]
async fn full_table_is_resource_exhausted() {
    let (network, _switch) = network();
    let registry = registry();
    let mut session = active_session(&network).await;
    for priority in 1..=testing::ACL_SIZE as i32 + 1 {
        let entry = build_table_entry(
            &registry,
            "MyIngress.acl",
            &[("hdr.ipv4.protocol", MatchValue::ternary(6u8, 0xffu8))],
            "MyIngress.drop",
            &[],
            priority,
        )
        .unwrap();
        let result = session.write_table_entry(&entry, UpdateType::Insert).await;
        if priority as i64 <= testing::ACL_SIZE {
            result.unwrap();
        } else {
            assert_eq!(result.unwrap_err().rpc_code(), Some(Code::ResourceExhausted));
        }
    }
}

#[tokio::test]
async fn master_needs_pipeline_before_writes() {
    let (network, _switch) = network();
    let mut session = connect(&network, "s1", 1).await;
    let entry = forwarding_entry(&registry(), 1, 1);
    assert!(matches!(
        session.write_table_entry(&entry, UpdateType::Insert).await,
        Err(P4Error::NoPipeline { .. })
    ));

    session.mark_pipeline_installed().unwrap();
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn reinstalling_the_same_program_keeps_entries() {
    let (network, switch) = network();
    let mut session = active_session(&network).await;
    session
        .write_table_entry(&forwarding_entry(&registry(), 1, 1), UpdateType::Insert)
        .await
        .unwrap();
    session.set_forwarding_pipeline_config(&pipeline()).await.unwrap();
    assert_eq!(switch.table_entries().len(), 1);
}

#[tokio::test]
async fn unreachable_switch_times_out() {
    let network = SimNetwork::new();
    let mut session = SwitchSession::new("s9", "127.0.0.1:50059", 0, options(1));
    session.open(&network).unwrap();

    let started = Instant::now();
    let error = session.request_mastership().await.unwrap_err();
    assert!(matches!(error, P4Error::Timeout { .. }), "{:?}", error);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(session.request_mastership().await, Err(P4Error::Closed)));
}

#[tokio::test]
async fn operations_need_an_open_session() {
    let mut session = SwitchSession::new("s1", ADDRESS, 0, options(1));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.request_mastership().await, Err(P4Error::NotConnected)));
    assert!(matches!(session.read_table_entries(ALL_TABLES).await, Err(P4Error::NotConnected)));
}

#[tokio::test]
async fn duplicate_election_id_is_refused() {
    let (network, _switch) = network();
    let _first = connect(&network, "s1", 4).await;
    let mut second = SwitchSession::new("s1-again", ADDRESS, 0, options(4));
    second.open(&network).unwrap();
    let error = second.request_mastership().await.unwrap_err();
    assert_eq!(error.rpc_code(), Some(Code::InvalidArgument));
    assert_eq!(second.state(), SessionState::Closed);
}

#[tokio::test]
async fn counters_read_by_index_or_all() {
    let (network, _switch) = network();
    let mut session = active_session(&network).await;
    for index in [1, 2, 5] {
        let sample = CounterSample {
            counter_id: testing::INGRESS_COUNTER_ID,
            index,
            packet_count: index * 10,
            byte_count: index * 1500,
        };
        session.write_counter(&sample).await.unwrap();
    }

    let all: Vec<CounterSample> = session
        .read_counters(testing::INGRESS_COUNTER_ID, ALL_INDEXES)
        .await
        .unwrap()
        .map(|s| s.unwrap())
        .collect()
        .await;
    assert_eq!(all.iter().map(|s| s.index).collect::<Vec<_>>(), vec![1, 2, 5]);

    let one: Vec<CounterSample> = session
        .read_counters(testing::INGRESS_COUNTER_ID, 2)
        .await
        .unwrap()
        .map(|s| s.unwrap())
        .collect()
        .await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].packet_count, 20);
    assert_eq!(one[0].byte_count, 3000);

    assert!(matches!(
        session.read_counters(testing::INGRESS_COUNTER_ID, -1).await,
        Err(P4Error::InvalidValue(_))
    ));
}

#[tokio::test]
async fn read_failure_ends_stream_after_partial_results() {
    let (network, switch) = network();
    let registry = registry();
    let mut session = active_session(&network).await;
    let filters = [
        ("MyEgress.table_tcp_srcPort_exact", "hdr.tcp.srcPort"),
        ("MyEgress.table_tcp_dstPort_exact", "hdr.tcp.dstPort"),
        ("MyEgress.table_udp_srcPort_exact", "hdr.udp.srcPort"),
    ];
    for (table, field) in filters {
        let entry = filter_entry(&registry, table, field, 1234);
        session.write_table_entry(&entry, UpdateType::Insert).await.unwrap();
    }

    switch.fail_reads_after(Some(2));
    let results: Vec<_> = session.read_table_entries(ALL_TABLES).await.unwrap().collect().await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert_eq!(results[2].as_ref().unwrap_err().rpc_code(), Some(Code::Unavailable));

    switch.fail_reads_after(None);
    let results: Vec<_> = session.read_table_entries(ALL_TABLES).await.unwrap().collect().await;
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn mirror_session_dry_run_sends_nothing() {
    let (network, switch) = network();
    let log = tempfile::tempdir().unwrap();
    let path = log.path().join("logs/s1-p4runtime-requests.txt");
    let mut session = SwitchSession::new(
        "s1",
        ADDRESS,
        0,
        SessionOptions {
            request_log: Some(path.clone()),
            ..options(1)
        },
    );
    session.open(&network).unwrap();
    session.request_mastership().await.unwrap();
    session.set_forwarding_pipeline_config(&pipeline()).await.unwrap();

    let mirror = build_mirror_session(1, 3, None).unwrap();
    session.write_mirror_session(&mirror, true).await.unwrap();
    assert!(switch.clone_session(1).is_none());
    assert_eq!(switch.writes(), 0);
    assert_eq!(session.write_seqno(), 0);

    session.write_mirror_session(&mirror, false).await.unwrap();
    let installed = switch.clone_session(1).unwrap();
    assert_eq!(installed.replicas.len(), 1);
    assert_eq!(installed.replicas[0].egress_port, 3);
    assert_eq!(installed.replicas[0].instance, 1);

    session.close().await.unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("SetForwardingPipelineConfig"));
    assert!(contents.contains("p4info_bytes"));
    assert_eq!(contents.matches("CloneSessionEntry {").count(), 2);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (network, switch) = network();
    let mut session = active_session(&network).await;
    assert_eq!(switch.connected_controllers(), 1);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    session.close().await.unwrap();
    assert!(wait_until(|| switch.connected_controllers() == 0).await);

    let entry = forwarding_entry(&registry(), 1, 1);
    assert!(matches!(
        session.write_table_entry(&entry, UpdateType::Insert).await,
        Err(P4Error::Closed)
    ));
    assert!(matches!(session.read_table_entries(ALL_TABLES).await, Err(P4Error::Closed)));
}

#[tokio::test]
async fn stream_loss_closes_session() {
    let (network, switch) = network();
    let session = active_session(&network).await;
    switch.drop_streams();
    assert!(wait_until(|| session.state() == SessionState::Closed).await);
}
