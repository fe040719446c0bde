//! Integration tests for the coordinator, fan-out and direct header source

use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;
use quai_mining_client::{
    client::{NodeClient, Subscription, TierClients},
    coordinator::{Dispatch, MiningCoordinator},
    engine::SealEngine,
    fanout::ResultFanout,
    feed::{DirectSource, Endpoint, PendingHeaderSource, SubmitOutcome},
    miner::Miner,
    order, Error, Header, Result, Tier,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Engine that records dispatches and never solves on its own
#[derive(Default)]
struct RecordingEngine {
    dispatched: Mutex<Vec<(Header, CancellationToken)>>,
}

impl SealEngine for RecordingEngine {
    fn seal(&self, header: Header, _results: mpsc::Sender<Header>, stop: CancellationToken) -> Result<()> {
        self.dispatched.lock().push((header, stop));
        Ok(())
    }

    fn hashrate(&self) -> f64 {
        0.0
    }
}

/// Engine that "solves" every header immediately unless already stopped
struct InstantEngine;

impl SealEngine for InstantEngine {
    fn seal(&self, mut header: Header, results: mpsc::Sender<Header>, stop: CancellationToken) -> Result<()> {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !stop.is_cancelled() {
                header.nonce = 7;
                let _ = results.send(header).await;
            }
        });
        Ok(())
    }

    fn hashrate(&self) -> f64 {
        1.0
    }
}

/// Node stub recording submissions, optionally holding them until released
struct MockNode {
    name: &'static str,
    pending: Header,
    pushed: Option<Header>,
    submitted: Mutex<Vec<Header>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockNode {
    fn new(name: &'static str, pending: Header) -> Self {
        Self {
            name,
            pending,
            pushed: None,
            submitted: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn submissions(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[async_trait]
impl NodeClient for MockNode {
    fn endpoint(&self) -> &str {
        self.name
    }

    async fn get_pending_header(&self) -> Result<Header> {
        Ok(self.pending.clone())
    }

    async fn receive_mined_header(&self, header: &Header) -> Result<()> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|_| Error::rpc(self.name, "closed"))?;
        }
        self.submitted.lock().push(header.clone());
        Ok(())
    }

    async fn subscribe_pending_header(
        &self,
        updates: mpsc::Sender<Header>,
        shutdown: CancellationToken,
    ) -> Result<Subscription> {
        let token = shutdown.child_token();
        let task_token = token.clone();
        let pushed = self.pushed.clone();
        let handle = tokio::spawn(async move {
            if let Some(header) = pushed {
                let _ = updates.send(header).await;
            }
            task_token.cancelled().await;
        });
        Ok(Subscription::new(handle, token))
    }
}

/// Source recording what the fan-out hands it
struct RecordingSource {
    initial: Header,
    submitted: Mutex<Vec<(Header, Tier)>>,
}

#[async_trait]
impl PendingHeaderSource for RecordingSource {
    async fn start(&self, updates: mpsc::Sender<Header>, shutdown: CancellationToken) -> Result<()> {
        updates
            .send(self.initial.clone())
            .await
            .map_err(|_| Error::channel_closed("update"))?;
        shutdown.cancelled().await;
        Ok(())
    }

    async fn next_header(&self) -> Result<Option<Header>> {
        Ok(Some(self.initial.clone()))
    }

    async fn submit(&self, header: &Header, order: Tier) -> Vec<SubmitOutcome> {
        self.submitted.lock().push((header.clone(), order));
        vec![SubmitOutcome {
            endpoint: Endpoint::Proxy,
            result: Ok(()),
        }]
    }
}

fn big(bits: usize) -> BigUint {
    BigUint::from(1u8) << bits
}

/// Header whose hash can only meet tiers with difficulty one
fn header(numbers: [u64; 3], difficulty: [BigUint; 3]) -> Header {
    Header {
        number: numbers,
        difficulty,
        coinbase: vec![0x11; 20],
        ..Header::default()
    }
}

fn zone_only(numbers: [u64; 3]) -> Header {
    header(numbers, [big(200), big(200), BigUint::from(1u8)])
}

fn region_order(numbers: [u64; 3]) -> Header {
    header(numbers, [big(200), BigUint::from(1u8), BigUint::from(1u8)])
}

struct Slice {
    nodes: [Arc<MockNode>; 3],
    clients: TierClients,
}

fn slice(pending: Header, gate: Option<Arc<Semaphore>>) -> Slice {
    let make = |name| {
        let mut node = MockNode::new(name, pending.clone());
        node.gate = gate.clone();
        Arc::new(node)
    };
    let nodes = [make("prime"), make("region"), make("zone")];
    let clients = TierClients::new([
        Some(nodes[0].clone() as Arc<dyn NodeClient>),
        Some(nodes[1].clone() as Arc<dyn NodeClient>),
        Some(nodes[2].clone() as Arc<dyn NodeClient>),
    ]);
    Slice { nodes, clients }
}

#[tokio::test]
async fn test_region_solution_submitted_to_region_and_zone() {
    let work = region_order([10, 5, 100]);
    assert_eq!(order::resolve(Some(&work)).unwrap(), Tier::Region);

    let slice = slice(work.clone(), None);
    let source = DirectSource::new(slice.clients.clone(), Duration::from_secs(60));

    let outcomes = source.submit(&work, Tier::Region).await;
    let endpoints: Vec<_> = outcomes.iter().map(|o| o.endpoint).collect();
    assert_eq!(endpoints, vec![Endpoint::Tier(Tier::Region), Endpoint::Tier(Tier::Zone)]);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    assert_eq!(slice.nodes[0].submissions(), 0);
    assert_eq!(slice.nodes[1].submissions(), 1);
    assert_eq!(slice.nodes[2].submissions(), 1);
}

#[tokio::test]
async fn test_missing_tier_endpoint_is_skipped() {
    let work = zone_only([1, 1, 1]);
    let zone = Arc::new(MockNode::new("zone", work.clone()));
    let clients = TierClients::new([None, None, Some(zone.clone() as Arc<dyn NodeClient>)]);
    let source = DirectSource::new(clients, Duration::from_secs(60));

    let outcomes = source.submit(&work, Tier::Prime).await;
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0].result, Err(Error::Config { .. })));
    assert!(matches!(outcomes[1].result, Err(Error::Config { .. })));
    assert!(outcomes[2].result.is_ok());
    assert_eq!(zone.submissions(), 1);
}

#[tokio::test]
async fn test_zone_solution_reinjected_before_submission_completes() {
    let work = zone_only([10, 5, 100]);
    let gate = Arc::new(Semaphore::new(0));
    let slice = slice(work.clone(), Some(gate.clone()));
    let source: Arc<dyn PendingHeaderSource> =
        Arc::new(DirectSource::new(slice.clients.clone(), Duration::from_secs(60)));

    let engine = Arc::new(RecordingEngine::default());
    let (result_tx, _result_rx) = mpsc::channel(10);
    let (update_tx, mut update_rx) = mpsc::channel(10);
    let mut coordinator = MiningCoordinator::new(engine.clone(), result_tx);
    let fanout = ResultFanout::new(source, update_tx, coordinator.subscribe());

    assert_eq!(coordinator.handle_header(work.clone()), Dispatch::Started);
    let mut solved = engine.dispatched.lock()[0].0.clone();
    solved.nonce = 99;

    let submission = fanout.handle_result(solved).await.expect("zone order");

    // Current work is back on the update channel while the zone node still holds the submission
    let resumed = update_rx.try_recv().expect("re-injected header");
    assert_eq!(resumed.seal_hash(), work.seal_hash());
    assert!(!submission.is_finished());
    assert_eq!(slice.nodes[2].submissions(), 0);

    gate.add_permits(10);
    let outcomes = submission.await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].endpoint, Endpoint::Tier(Tier::Zone));
    assert_eq!(slice.nodes[0].submissions(), 0);
    assert_eq!(slice.nodes[1].submissions(), 0);
    assert_eq!(slice.nodes[2].submissions(), 1);
}

#[tokio::test]
async fn test_solved_header_restarts_after_reinjection() {
    let work = zone_only([10, 5, 100]);
    let slice = slice(work.clone(), None);
    let source: Arc<dyn PendingHeaderSource> =
        Arc::new(DirectSource::new(slice.clients.clone(), Duration::from_secs(60)));

    let engine = Arc::new(RecordingEngine::default());
    let (result_tx, _result_rx) = mpsc::channel(10);
    let (update_tx, mut update_rx) = mpsc::channel(10);
    let mut coordinator = MiningCoordinator::new(engine.clone(), result_tx);
    let fanout = ResultFanout::new(source, update_tx, coordinator.subscribe());

    coordinator.handle_header(work.clone());
    let solved = engine.dispatched.lock()[0].0.clone();
    fanout.handle_result(solved).await;

    // The solved attempt is finished, so the same header is sealed again
    let resumed = update_rx.recv().await.unwrap();
    assert_eq!(coordinator.handle_header(resumed), Dispatch::Started);

    let dispatched = engine.dispatched.lock();
    assert_eq!(dispatched.len(), 2);
    assert!(dispatched[0].1.is_cancelled());
    assert!(!dispatched[1].1.is_cancelled());
}

#[tokio::test]
async fn test_stale_solution_does_not_disturb_current_work() {
    let a = zone_only([10, 5, 100]);
    let b = zone_only([10, 5, 101]);
    let slice = slice(a.clone(), None);
    let source: Arc<dyn PendingHeaderSource> =
        Arc::new(DirectSource::new(slice.clients.clone(), Duration::from_secs(60)));

    let engine = Arc::new(RecordingEngine::default());
    let (result_tx, _result_rx) = mpsc::channel(10);
    let (update_tx, mut update_rx) = mpsc::channel(10);
    let mut coordinator = MiningCoordinator::new(engine.clone(), result_tx);
    let fanout = ResultFanout::new(source, update_tx, coordinator.subscribe());

    assert_eq!(coordinator.handle_header(a.clone()), Dispatch::Started);
    assert_eq!(coordinator.handle_header(b.clone()), Dispatch::Started);
    let solved_a = engine.dispatched.lock()[0].0.clone();

    fanout.handle_result(solved_a).await;

    // B is re-injected and still in flight, so it is not restarted
    let resumed = update_rx.recv().await.unwrap();
    assert_eq!(resumed.number, [10, 5, 101]);
    assert_eq!(coordinator.handle_header(resumed), Dispatch::Duplicate);
    assert_eq!(engine.dispatched.lock().len(), 2);
}

async fn wait_for_dispatches(engine: &RecordingEngine, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.dispatched.lock().len() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("dispatch");
}

#[tokio::test]
async fn test_newer_header_replaces_attempt_in_flight() {
    let engine = Arc::new(RecordingEngine::default());
    let (result_tx, _result_rx) = mpsc::channel(10);
    let (update_tx, update_rx) = mpsc::channel(10);
    let coordinator = MiningCoordinator::new(engine.clone(), result_tx);
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(coordinator.run(update_rx, shutdown.clone()));

    update_tx.send(zone_only([10, 5, 100])).await.unwrap();
    wait_for_dispatches(&engine, 1).await;
    update_tx.send(zone_only([10, 5, 100])).await.unwrap();
    update_tx.send(zone_only([10, 5, 101])).await.unwrap();
    wait_for_dispatches(&engine, 2).await;

    shutdown.cancel();
    run.await.unwrap().unwrap();

    let dispatched = engine.dispatched.lock();
    assert_eq!(dispatched.len(), 2);
    assert_eq!(dispatched[0].0.number, [10, 5, 100]);
    assert_eq!(dispatched[1].0.number, [10, 5, 101]);
    assert!(dispatched[0].1.is_cancelled());
    // Shutdown stops B as well
    assert!(dispatched[1].1.is_cancelled());
}

#[tokio::test]
async fn test_invalid_solution_not_submitted_but_work_resumes() {
    let work = header([1, 1, 1], [BigUint::default(), BigUint::default(), BigUint::default()]);
    let slice = slice(work.clone(), None);
    let source: Arc<dyn PendingHeaderSource> =
        Arc::new(DirectSource::new(slice.clients.clone(), Duration::from_secs(60)));

    let current = zone_only([1, 1, 2]);
    let engine = Arc::new(RecordingEngine::default());
    let (result_tx, _result_rx) = mpsc::channel(10);
    let (update_tx, mut update_rx) = mpsc::channel(10);
    let mut coordinator = MiningCoordinator::new(engine, result_tx);
    let fanout = ResultFanout::new(source, update_tx, coordinator.subscribe());
    coordinator.handle_header(current.clone());

    assert!(fanout.handle_result(work).await.is_none());
    assert_eq!(update_rx.recv().await.unwrap().seal_hash(), current.seal_hash());
    assert!(slice.nodes.iter().all(|n| n.submissions() == 0));
}

#[tokio::test]
async fn test_direct_source_fetches_then_follows_pushes() {
    let first = zone_only([1, 1, 1]);
    let second = zone_only([1, 1, 2]);
    let mut zone = MockNode::new("zone", first.clone());
    zone.pushed = Some(second.clone());
    let clients = TierClients::new([None, None, Some(Arc::new(zone) as Arc<dyn NodeClient>)]);
    let source = Arc::new(DirectSource::new(clients, Duration::from_secs(60)));

    let (tx, mut rx) = mpsc::channel(10);
    let shutdown = CancellationToken::new();
    let feed = {
        let source = source.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { source.start(tx, shutdown).await })
    };

    assert_eq!(rx.recv().await.unwrap().number, [1, 1, 1]);
    assert_eq!(rx.recv().await.unwrap().number, [1, 1, 2]);

    shutdown.cancel();
    assert!(feed.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_direct_source_without_zone_fails() {
    let source = DirectSource::new(TierClients::default(), Duration::from_secs(60));
    let (tx, _rx) = mpsc::channel(1);
    let result = source.start(tx, CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn test_miner_keeps_sealing_until_shutdown() {
    let work = zone_only([3, 3, 3]);
    let source = Arc::new(RecordingSource {
        initial: work.clone(),
        submitted: Mutex::new(Vec::new()),
    });
    let miner = Miner::new(source.clone(), Arc::new(InstantEngine), Duration::from_secs(60));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(miner.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(10), async {
        while source.submitted.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("solutions keep flowing");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("miner joins its workers")
        .unwrap()
        .unwrap();

    for (header, order) in source.submitted.lock().iter() {
        assert_eq!(*order, Tier::Zone);
        assert_eq!(header.nonce, 7);
        assert_eq!(header.seal_hash(), work.seal_hash());
    }
}
