use std::time::Duration;
use strand::{Agent, AgentConfig, LogClient, LogConfig, RaftConfig, Record};
use tempfile::TempDir;

fn single_node(tmp: &TempDir) -> Agent {
    let agent = Agent::new(AgentConfig {
        data_dir: tmp.path().join("node-0"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        node_name: "node-0".to_string(),
        bootstrap: true,
        log_config: LogConfig::default(),
        raft: RaftConfig {
            snapshot_threshold: 0,
            ..Default::default()
        },
        server_tls: None,
        peer_tls: None,
    })
    .unwrap();
    agent.log().wait_for_leader(Duration::from_secs(10)).unwrap();
    agent
}

#[test]
fn produce_then_consume_round_trip() {
    let tmp = TempDir::new().unwrap();
    let agent = single_node(&tmp);
    let mut client = LogClient::connect(agent.local_addr()).unwrap();

    let offset = client.produce(&Record::new("hello world")).unwrap();
    assert_eq!(offset, 0);
    let record = client.consume(0).unwrap();
    assert_eq!(record.value, b"hello world");
    assert_eq!(record.offset, 0);

    agent.shutdown().unwrap();
}

#[test]
fn consume_past_tail_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let agent = single_node(&tmp);
    let mut client = LogClient::connect(agent.local_addr()).unwrap();

    client.produce(&Record::new("hello world")).unwrap();
    let err = client.consume(1).unwrap_err();
    assert!(matches!(err, strand::NetError::NotFound(_)));
    assert!(err.to_string().contains('1'));

    agent.shutdown().unwrap();
}

#[test]
fn produce_stream_acknowledges_each_record() {
    let tmp = TempDir::new().unwrap();
    let agent = single_node(&tmp);
    let mut client = LogClient::connect(agent.local_addr()).unwrap();

    let records = vec![
        Record::new("first"),
        Record::new("second"),
        Record::new("third"),
    ];
    let offsets = client.produce_stream(records).unwrap();
    assert_eq!(offsets, vec![0, 1, 2]);

    agent.shutdown().unwrap();
}

#[test]
fn consume_stream_tails_the_log() {
    let tmp = TempDir::new().unwrap();
    let agent = single_node(&tmp);

    let mut producer = LogClient::connect(agent.local_addr()).unwrap();
    producer.produce(&Record::new("first")).unwrap();
    producer.produce(&Record::new("second")).unwrap();

    let streamer = LogClient::connect(agent.local_addr()).unwrap();
    let mut stream = streamer.consume_stream(0).unwrap();
    assert_eq!(stream.next().unwrap().unwrap().value, b"first");
    assert_eq!(stream.next().unwrap().unwrap().value, b"second");

    // The stream waits at the tail and picks up later records.
    producer.produce(&Record::new("third")).unwrap();
    assert_eq!(stream.next().unwrap().unwrap().value, b"third");

    agent.shutdown().unwrap();
}
