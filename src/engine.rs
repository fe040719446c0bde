//! Sealing engines
//!
//! The coordinator hands headers to a [`SealEngine`], which searches for a
//! nonce in the background and delivers solved headers on the result
//! channel. [`CpuEngine`] is the built-in multi-threaded blake3 engine.

use crate::order::target_for_difficulty;
use crate::types::{pow_hash, Hash32, Header};
use crate::{Error, Result};
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Nonces hashed between cancellation checks
const BATCH_SIZE: u64 = 4096;

/// Proof-of-work engine
pub trait SealEngine: Send + Sync {
    /// Start searching for a nonce for `header`
    ///
    /// Returns immediately. A solved header is sent on `results`; the search
    /// stops once `stop` is cancelled.
    fn seal(
        &self,
        header: Header,
        results: mpsc::Sender<Header>,
        stop: CancellationToken,
    ) -> Result<()>;

    /// Hashes per second since the previous call
    fn hashrate(&self) -> f64;
}

/// Hash counter sampled by the hashrate reporter
#[derive(Debug)]
struct HashMeter {
    total: AtomicU64,
    last_sample: Mutex<(Instant, u64)>,
}

impl HashMeter {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            last_sample: Mutex::new((Instant::now(), 0)),
        }
    }

    fn record(&self, hashes: u64) {
        self.total.fetch_add(hashes, Ordering::Relaxed);
    }

    fn rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        let now = Instant::now();
        let mut sample = self.last_sample.lock();
        let elapsed = now.duration_since(sample.0).as_secs_f64();
        let hashes = total.saturating_sub(sample.1);
        *sample = (now, total);

        if elapsed > 0.0 {
            hashes as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Multi-threaded CPU sealing engine
#[derive(Debug)]
pub struct CpuEngine {
    thread_count: usize,
    meter: Arc<HashMeter>,
}

impl CpuEngine {
    /// Create a new CPU engine; zero threads means one per core
    pub fn new(thread_count: usize) -> Self {
        let thread_count = if thread_count == 0 {
            num_cpus::get()
        } else {
            thread_count
        };

        info!("Creating CPU engine with {} threads", thread_count);

        Self {
            thread_count,
            meter: Arc::new(HashMeter::new()),
        }
    }

    /// Number of search threads
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

/// Target of the easiest tier with a positive difficulty, as 32 big-endian bytes
pub fn easiest_target(header: &Header) -> Option<Hash32> {
    let easiest = header
        .difficulty
        .iter()
        .filter(|d| **d > BigUint::default())
        .min()?;
    let target = target_for_difficulty(easiest)?;

    let bytes = target.to_bytes_be();
    if bytes.len() > 32 {
        return Some([0xff; 32]);
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(out)
}

struct SearchJob {
    thread_id: usize,
    start_nonce: u64,
    prefix: Vec<u8>,
    target: Hash32,
    header: Header,
    results: mpsc::Sender<Header>,
    stop: CancellationToken,
    claimed: Arc<AtomicBool>,
    meter: Arc<HashMeter>,
}

impl SearchJob {
    fn run(self) {
        let mut nonce = self.start_nonce;
        debug!("Search thread {} starting at nonce {}", self.thread_id, nonce);

        while !self.stop.is_cancelled() {
            for _ in 0..BATCH_SIZE {
                if pow_hash(&self.prefix, nonce) <= self.target {
                    self.deliver(nonce);
                    return;
                }
                nonce = nonce.wrapping_add(1);
            }
            self.meter.record(BATCH_SIZE);
        }

        debug!("Search thread {} stopped", self.thread_id);
    }

    fn deliver(self, nonce: u64) {
        if self.stop.is_cancelled() {
            debug!("Search thread {} dropping nonce for a cancelled attempt", self.thread_id);
            return;
        }
        // Only the first finder reports; the rest are told to stop
        if self.claimed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();

        let mut header = self.header;
        header.nonce = nonce;
        debug!("Search thread {} found nonce {}", self.thread_id, nonce);

        if self.results.blocking_send(header).is_err() {
            warn!("Result channel closed, dropping sealed header");
        }
    }
}

impl SealEngine for CpuEngine {
    fn seal(
        &self,
        header: Header,
        results: mpsc::Sender<Header>,
        stop: CancellationToken,
    ) -> Result<()> {
        let target = easiest_target(&header)
            .ok_or_else(|| Error::seal("header has no positive difficulty"))?;

        let prefix = header.pow_prefix();
        let search = stop.child_token();
        let claimed = Arc::new(AtomicBool::new(false));
        let seed: u64 = rand::random();
        let stride = u64::MAX / self.thread_count as u64;

        for thread_id in 0..self.thread_count {
            let job = SearchJob {
                thread_id,
                start_nonce: seed.wrapping_add(stride.wrapping_mul(thread_id as u64)),
                prefix: prefix.clone(),
                target,
                header: header.clone(),
                results: results.clone(),
                stop: search.clone(),
                claimed: Arc::clone(&claimed),
                meter: Arc::clone(&self.meter),
            };
            tokio::task::spawn_blocking(move || job.run());
        }

        Ok(())
    }

    fn hashrate(&self) -> f64 {
        self.meter.rate()
    }
}
