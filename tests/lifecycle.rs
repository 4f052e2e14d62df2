//! End-to-end lifecycle tests against a scripted command runner.

use async_trait::async_trait;
use gpurent::{Error, Instance, InstanceConfig, InstanceType, Marketplace, Offer};
use gpurent_api::{CmdOutput, CommandRunner, HttpError, Table};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runner that answers `show instances` from a queue of scripted listings
/// (the last one repeats) and confirms mutations with the expected
/// prefixes.
struct ScriptedRunner {
    listings: Mutex<VecDeque<Vec<Value>>>,
    show_calls: AtomicUsize,
    argvs: Mutex<Vec<Vec<String>>>,
    new_contract: i64,
}

impl ScriptedRunner {
    fn new(listings: Vec<Vec<Value>>, new_contract: i64) -> Arc<Self> {
        Arc::new(Self {
            listings: Mutex::new(listings.into()),
            show_calls: AtomicUsize::new(0),
            argvs: Mutex::new(Vec::new()),
            new_contract,
        })
    }

    fn show_calls(&self) -> usize {
        self.show_calls.load(Ordering::SeqCst)
    }

    fn argv_for(&self, verb: &str) -> Option<Vec<String>> {
        self.argvs
            .lock()
            .unwrap()
            .iter()
            .find(|argv| argv.iter().any(|a| a == verb))
            .cloned()
    }
}

fn line(text: String) -> CmdOutput {
    CmdOutput {
        lines: vec![text],
        tables: Vec::new(),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, argv: &[String]) -> Result<CmdOutput, HttpError> {
        self.argvs.lock().unwrap().push(argv.to_vec());
        let has = |token: &str| argv.iter().any(|a| a == token);
        let target = argv.last().cloned().unwrap_or_default();

        if has("show") && has("instances") {
            self.show_calls.fetch_add(1, Ordering::SeqCst);
            let mut listings = self.listings.lock().unwrap();
            let records = if listings.len() > 1 {
                listings.pop_front().unwrap()
            } else {
                listings.front().cloned().unwrap_or_default()
            };
            return Ok(CmdOutput {
                lines: Vec::new(),
                tables: vec![Table { records }],
            });
        }
        if has("create") {
            return Ok(line(format!(
                "Started. {{\"success\": true, \"new_contract\": {}}}",
                self.new_contract
            )));
        }
        if has("destroy") {
            return Ok(line(format!("destroying instance {}.", target)));
        }
        if has("start") {
            return Ok(line(format!("starting instance {}.", target)));
        }
        if has("stop") {
            return Ok(line(format!("stopping instance {}.", target)));
        }
        if has("copy") {
            return Ok(line("Remote to Remote copy initiated".to_string()));
        }
        Ok(CmdOutput::default())
    }
}

fn market(runner: Arc<ScriptedRunner>) -> Marketplace {
    Marketplace::new(runner, Some("k-test".to_string()), None)
}

fn fast_config(instance_type: InstanceType) -> InstanceConfig {
    InstanceConfig {
        instance_type,
        poll_interval: Duration::from_millis(10),
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn row(id: i64, machine_id: i64, status: &str, msg: &str) -> Value {
    json!({
        "id": id,
        "machine_id": machine_id,
        "actual_status": status,
        "intended_status": "running",
        "next_state": "running",
        "status_msg": msg,
        "ssh_host": "127.0.0.1",
        "ssh_port": 1,
        "dph_total": 0.10,
        "min_bid": 0.05,
        "is_bid": true,
        "start_date": unix_now() - 3600.0,
    })
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

fn test_offer(id: i64, machine_id: i64, min_bid: f64) -> Offer {
    serde_json::from_value(json!({
        "id": id,
        "machine_id": machine_id,
        "dph_total": 0.10,
        "min_bid": min_bid,
    }))
    .unwrap()
}

#[tokio::test]
async fn create_submits_min_bid_plus_epsilon() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "loading", "Loading...")]],
        500,
    );
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );

    inst.create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap();

    let argv = runner.argv_for("create").unwrap();
    let price_at = argv.iter().position(|a| a == "--price").unwrap();
    assert_eq!(argv[price_at + 1], "0.0501");

    assert!(inst.created());
    assert_eq!(inst.id(), Some(500));
    assert_eq!(inst.machine_id(), Some(70));

    inst.destroy().await.unwrap();
}

#[tokio::test]
async fn create_omits_price_for_on_demand() {
    let runner = ScriptedRunner::new(
        vec![vec![row(501, 71, "loading", "Loading...")]],
        501,
    );
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::OnDemand),
    );

    inst.create(None, Some(test_offer(99, 71, 0.05)))
        .await
        .unwrap();

    let argv = runner.argv_for("create").unwrap();
    assert!(!argv.iter().any(|a| a == "--price"));

    inst.destroy().await.unwrap();
}

#[tokio::test]
async fn create_keeps_binding_when_listing_lags() {
    let listings = vec![
        Vec::new(), // listing has not caught up with the create yet
        vec![row(500, 70, "loading", "Loading...")],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );

    let err = inst
        .create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // The binding survives so the billed resource stays reachable.
    assert!(inst.created());
    assert_eq!(inst.id(), Some(500));

    // The next poll sees the row and recovers.
    inst.refresh().await.unwrap();
    assert_eq!(inst.machine_id(), Some(70));

    inst.destroy().await.unwrap();
}

#[tokio::test]
async fn created_tracks_binding_and_destroy_is_terminal() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "loading", "Loading...")]],
        500,
    );
    let mut inst = Instance::new(
        market(runner),
        fast_config(InstanceType::Interruptible),
    );

    assert!(!inst.created());
    inst.create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap();
    assert!(inst.created());

    inst.destroy().await.unwrap();
    assert!(!inst.created());
    assert_eq!(inst.id(), None);
    // Destroying an unbound instance is a no-op.
    inst.destroy().await.unwrap();
}

#[tokio::test]
async fn create_on_bound_instance_is_rejected() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "loading", "Loading...")]],
        500,
    );
    let mut inst = Instance::new(
        market(runner),
        fast_config(InstanceType::Interruptible),
    );

    inst.create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap();
    let err = inst
        .create(None, Some(test_offer(98, 71, 0.05)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyBound));

    inst.destroy().await.unwrap();
}

#[tokio::test]
async fn max_cost_never_decreases() {
    let mut cheap = row(500, 70, "running", "ok");
    cheap["dph_total"] = json!(0.02); // price dropped mid-rental
    let listings = vec![
        vec![row(500, 70, "running", "ok")],
        vec![row(500, 70, "running", "ok")],
        vec![cheap],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::attach(
        market(runner),
        fast_config(InstanceType::Interruptible),
        Some(500),
        None,
    )
    .await
    .unwrap();

    let first = inst.max_cost();
    assert!(first > 0.0);
    inst.refresh().await.unwrap();
    assert!(inst.max_cost() >= first);
}

#[tokio::test]
async fn outbid_terminates_wait() {
    let mut outbid_row = row(500, 70, "loading", "Loading...");
    outbid_row["min_bid"] = json!(0.15); // above the 0.10 we pay
    let listings = vec![
        vec![row(500, 70, "loading", "Loading...")],
        vec![row(500, 70, "loading", "Loading...")],
        vec![outbid_row],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::attach(
        market(runner),
        fast_config(InstanceType::Interruptible),
        Some(500),
        None,
    )
    .await
    .unwrap();

    assert!(!inst.outbid());
    let err = inst.wait(Some("running")).await.unwrap_err();
    assert!(matches!(err, Error::Outbid));
    assert!(inst.outbid());
}

#[tokio::test]
async fn wait_returns_immediately_when_already_converged() {
    let mut stopped = row(500, 70, "exited", "Exited");
    stopped["intended_status"] = json!("exited");
    let runner = ScriptedRunner::new(vec![vec![stopped]], 500);
    let mut inst = Instance::attach(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
        Some(500),
        None,
    )
    .await
    .unwrap();

    let polls_before = runner.show_calls();
    inst.wait(Some("exited")).await.unwrap();
    assert_eq!(runner.show_calls(), polls_before);
}

#[tokio::test]
async fn wait_surfaces_error_status() {
    let listings = vec![
        vec![row(500, 70, "loading", "Loading...")],
        vec![row(500, 70, "loading", "Loading...")],
        vec![row(500, 70, "loading", "Error: CUDA driver mismatch")],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::attach(
        market(runner),
        fast_config(InstanceType::Interruptible),
        Some(500),
        None,
    )
    .await
    .unwrap();

    let err = inst.wait(Some("running")).await.unwrap_err();
    match err {
        Error::ErrorStatus {
            machine_id,
            message,
        } => {
            assert_eq!(machine_id, 70);
            assert!(message.contains("CUDA driver mismatch"));
        }
        other => panic!("expected ErrorStatus, got {}", other),
    }
}

#[tokio::test]
async fn wait_blocks_until_service_port_opens() {
    let live = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let live_port = live.local_addr().unwrap().port();
    let dead_port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let with_port = |status: &str, port: u16| {
        let mut r = row(500, 70, status, "Booting");
        r["ssh_port"] = json!(port);
        r
    };
    let listings = vec![
        vec![with_port("queued", dead_port)],
        vec![with_port("queued", dead_port)],
        vec![with_port("initializing", dead_port)],
        vec![with_port("running", dead_port)],
        vec![with_port("running", live_port)],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::attach(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
        Some(500),
        None,
    )
    .await
    .unwrap();

    inst.wait(None).await.unwrap();

    // attach consumed two listings; reaching running with a closed port
    // must not end the wait, so all five scripted listings were fetched.
    assert_eq!(runner.show_calls(), 5);
    assert!(inst.running());
    assert!(inst.connectable().await);
}

#[tokio::test]
async fn wait_on_unbound_instance_is_a_no_op() {
    let runner = ScriptedRunner::new(vec![], 500);
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );
    inst.wait(None).await.unwrap();
    assert_eq!(runner.show_calls(), 0);
}

#[tokio::test]
async fn attach_round_trips_snapshot_fields() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "running", "ok")]],
        500,
    );
    let mut creator = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );
    creator
        .create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap();

    let attached = Instance::attach(
        market(runner),
        fast_config(InstanceType::Interruptible),
        creator.id(),
        None,
    )
    .await
    .unwrap();

    assert!(attached.is_detached());
    assert_eq!(attached.machine_id(), creator.machine_id());
    let a = attached.snapshot().unwrap();
    let c = creator.snapshot().unwrap();
    assert_eq!(a.id, c.id);
    assert_eq!(a.actual_status, c.actual_status);

    creator.destroy().await.unwrap();
}

#[tokio::test]
async fn attach_fails_for_unknown_instance() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "running", "ok")]],
        500,
    );
    let err = Instance::attach(
        market(runner),
        fast_config(InstanceType::Interruptible),
        Some(999),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn failed_wait_in_create_and_wait_destroys_the_instance() {
    let listings = vec![
        vec![row(500, 70, "loading", "Loading...")],
        vec![row(500, 70, "loading", "Loading...")],
        vec![row(500, 70, "loading", "Error: image pull failed")],
    ];
    let runner = ScriptedRunner::new(listings, 500);
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );

    let err = inst
        .create_and_wait(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ErrorStatus { .. }));

    // cleanup ran: the instance was destroyed and the binding cleared
    assert!(runner.argv_for("destroy").is_some());
    assert!(!inst.created());
}

#[tokio::test]
async fn upload_and_download_address_the_instance_by_id() {
    let runner = ScriptedRunner::new(
        vec![vec![row(500, 70, "running", "ok")]],
        500,
    );
    let mut inst = Instance::new(
        market(runner.clone()),
        fast_config(InstanceType::Interruptible),
    );
    inst.create(None, Some(test_offer(99, 70, 0.05)))
        .await
        .unwrap();

    inst.upload("/data/set", "/workspace/set").await.unwrap();
    let argv = runner.argv_for("copy").unwrap();
    assert!(argv.contains(&"/data/set".to_string()));
    assert!(argv.contains(&"500:/workspace/set".to_string()));

    inst.destroy().await.unwrap();
}
