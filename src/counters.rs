use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

const BUCKET_DURATION: Duration = Duration::from_millis(500);
const BUCKET_COUNT: usize = 4;
const WINDOW: Duration = Duration::from_secs(2);

/// Cumulative byte counter with a short rate window.
///
/// The window is a ring of half-second buckets covering the last two
/// seconds. Counters chain to an optional parent so torrent-wide
/// aggregates stay in sync with every per-connection add.
#[derive(Debug)]
pub struct TransferCounter {
    parent: Option<Arc<TransferCounter>>,
    total: AtomicU64,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    buckets: [u64; BUCKET_COUNT],
    head: usize,
    head_started: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            head: 0,
            head_started: Instant::now(),
        }
    }

    /// Rotate stale buckets out before any read or write
    fn advance(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.head_started);
        let steps = (elapsed.as_millis() / BUCKET_DURATION.as_millis()) as usize;
        for _ in 0..steps.min(BUCKET_COUNT) {
            self.head = (self.head + 1) % BUCKET_COUNT;
            self.buckets[self.head] = 0;
        }
        if steps > 0 {
            self.head_started += BUCKET_DURATION * steps as u32;
        }
    }

    fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

impl TransferCounter {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            total: AtomicU64::new(0),
            window: Mutex::new(Window::new()),
        })
    }

    pub fn with_parent(parent: &Arc<TransferCounter>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            total: AtomicU64::new(0),
            window: Mutex::new(Window::new()),
        })
    }

    pub fn add(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        {
            let mut window = self.window.lock().unwrap();
            window.advance(Instant::now());
            let head = window.head;
            window.buckets[head] += bytes;
        }
        if let Some(parent) = &self.parent {
            parent.add(bytes);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes seen inside the rate window
    pub fn window_total(&self) -> u64 {
        let mut window = self.window.lock().unwrap();
        window.advance(Instant::now());
        window.total()
    }

    /// Bytes per second over the rate window
    pub fn rate(&self) -> u64 {
        self.window_total() / WINDOW.as_secs()
    }
}

/// Torrent-wide aggregates one coordinator owns. Every connection hooks
/// its own counters beneath these.
#[derive(Debug)]
pub struct TorrentCounters {
    pub protocol_download: Arc<TransferCounter>,
    pub protocol_upload: Arc<TransferCounter>,
    pub block_download: Arc<TransferCounter>,
    pub block_upload: Arc<TransferCounter>,
}

impl TorrentCounters {
    pub fn new() -> Self {
        Self {
            protocol_download: TransferCounter::root(),
            protocol_upload: TransferCounter::root(),
            block_download: TransferCounter::root(),
            block_upload: TransferCounter::root(),
        }
    }
}

impl Default for TorrentCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection counters parented to the torrent aggregates
#[derive(Debug, Clone)]
pub struct ConnectionCounters {
    pub protocol_download: Arc<TransferCounter>,
    pub protocol_upload: Arc<TransferCounter>,
    pub block_download: Arc<TransferCounter>,
    pub block_upload: Arc<TransferCounter>,
}

impl ConnectionCounters {
    pub fn for_connection(parents: &TorrentCounters) -> Self {
        Self {
            protocol_download: TransferCounter::with_parent(&parents.protocol_download),
            protocol_upload: TransferCounter::with_parent(&parents.protocol_upload),
            block_download: TransferCounter::with_parent(&parents.block_download),
            block_upload: TransferCounter::with_parent(&parents.block_upload),
        }
    }

    /// Detached counters, used before a connection is bound to a torrent
    pub fn detached() -> Self {
        Self {
            protocol_download: TransferCounter::root(),
            protocol_upload: TransferCounter::root(),
            block_download: TransferCounter::root(),
            block_upload: TransferCounter::root(),
        }
    }
}
