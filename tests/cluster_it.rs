use std::thread;
use std::time::Duration;
use strand::{Agent, AgentConfig, LogClient, LogConfig, RaftConfig, Record};
use tempfile::TempDir;

fn agent_config(tmp: &TempDir, name: &str, bootstrap: bool) -> AgentConfig {
    AgentConfig {
        data_dir: tmp.path().join(name),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        node_name: name.to_string(),
        bootstrap,
        log_config: LogConfig::default(),
        raft: RaftConfig {
            snapshot_threshold: 0,
            ..Default::default()
        },
        server_tls: None,
        peer_tls: None,
    }
}

#[test]
fn replicates_produced_records_across_three_nodes() {
    let tmp = TempDir::new().unwrap();
    let leader = Agent::new(agent_config(&tmp, "node-0", true)).unwrap();
    leader.log().wait_for_leader(Duration::from_secs(10)).unwrap();

    let follower_a = Agent::new(agent_config(&tmp, "node-1", false)).unwrap();
    let follower_b = Agent::new(agent_config(&tmp, "node-2", false)).unwrap();
    leader
        .join("node-1", follower_a.local_addr().to_string())
        .unwrap();
    leader
        .join("node-2", follower_b.local_addr().to_string())
        .unwrap();

    let mut client = LogClient::connect(leader.local_addr()).unwrap();
    let offset = client.produce(&Record::new("dummy")).unwrap();
    assert_eq!(offset, 0);

    thread::sleep(Duration::from_secs(3));

    for follower in [&follower_a, &follower_b] {
        let mut client = LogClient::connect(follower.local_addr()).unwrap();
        let record = client.consume(0).unwrap();
        assert_eq!(record.value, b"dummy");
        assert_eq!(record.offset, 0);
    }

    leader.shutdown().unwrap();
    follower_a.shutdown().unwrap();
    follower_b.shutdown().unwrap();
}

#[test]
fn followers_reject_produce() {
    let tmp = TempDir::new().unwrap();
    let leader = Agent::new(agent_config(&tmp, "node-0", true)).unwrap();
    leader.log().wait_for_leader(Duration::from_secs(10)).unwrap();

    let follower = Agent::new(agent_config(&tmp, "node-1", false)).unwrap();
    leader
        .join("node-1", follower.local_addr().to_string())
        .unwrap();
    thread::sleep(Duration::from_secs(1));

    let mut client = LogClient::connect(follower.local_addr()).unwrap();
    let err = client.produce(&Record::new("nope")).unwrap_err();
    assert!(err.to_string().contains("not the leader"));

    leader.shutdown().unwrap();
    follower.shutdown().unwrap();
}

#[test]
fn lagging_follower_catches_up_from_snapshot() {
    let tmp = TempDir::new().unwrap();
    // One record per segment so journal compaction actually drops
    // segments, forcing the fresh follower onto the snapshot path.
    let mut config = agent_config(&tmp, "node-0", true);
    config.log_config = LogConfig {
        max_store_bytes: 64,
        ..Default::default()
    };
    config.raft.snapshot_threshold = 4;
    let leader = Agent::new(config).unwrap();
    leader.log().wait_for_leader(Duration::from_secs(10)).unwrap();

    let mut client = LogClient::connect(leader.local_addr()).unwrap();
    for want in 0..10u64 {
        assert_eq!(client.produce(&Record::new("hello world")).unwrap(), want);
    }

    let mut config = agent_config(&tmp, "node-1", false);
    config.log_config = LogConfig {
        max_store_bytes: 64,
        ..Default::default()
    };
    let follower = Agent::new(config).unwrap();
    leader
        .join("node-1", follower.local_addr().to_string())
        .unwrap();

    thread::sleep(Duration::from_secs(3));

    let mut client = LogClient::connect(follower.local_addr()).unwrap();
    for offset in 0..10u64 {
        assert_eq!(client.consume(offset).unwrap().value, b"hello world");
    }

    leader.shutdown().unwrap();
    follower.shutdown().unwrap();
}

#[test]
fn single_node_survives_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let agent = Agent::new(agent_config(&tmp, "node-0", true)).unwrap();
        agent.log().wait_for_leader(Duration::from_secs(10)).unwrap();
        let mut client = LogClient::connect(agent.local_addr()).unwrap();
        for want in 0..3u64 {
            assert_eq!(client.produce(&Record::new("hello world")).unwrap(), want);
        }
        agent.shutdown().unwrap();
    }

    let agent = Agent::new(agent_config(&tmp, "node-0", true)).unwrap();
    agent.log().wait_for_leader(Duration::from_secs(10)).unwrap();
    for offset in 0..3u64 {
        assert_eq!(agent.log().read(offset).unwrap().value, b"hello world");
    }
    let mut client = LogClient::connect(agent.local_addr()).unwrap();
    assert_eq!(client.produce(&Record::new("after restart")).unwrap(), 3);
    agent.shutdown().unwrap();
}
