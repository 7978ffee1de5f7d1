use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tqdm::tqdm;
use tqdm::Tqdm;

/// A progress bar driven from the training loop.
///
/// Increments are sent over a channel to a background thread that owns the
/// actual `tqdm` redraws, so a slow terminal never stalls a batch.
pub struct Progress {
    total: usize,
    progress: Arc<Mutex<Tqdm<Range<usize>>>>,
    count: AtomicUsize,
    sender: mpsc::Sender<usize>,
    progress_thread: Option<thread::JoinHandle<()>>,
}

impl Progress {
    /// # Example
    /// ```
    /// use ania_mic::utils::logging::Progress;
    /// let progress = Progress::new(4, "[trial 1/2] Epoch 1");
    /// for _ in 0..4 {
    ///     progress.inc();
    /// }
    /// progress.finish();
    /// ```
    pub fn new(total: usize, description: &str) -> Self {
        let progress = Arc::new(Mutex::new(tqdm(0..total).desc(Some(description))));
        let count = AtomicUsize::new(0);

        let (tx, rx) = mpsc::channel::<usize>();
        let progress_clone = Arc::clone(&progress);

        let handle = thread::spawn(move || {
            for step in rx {
                if let Ok(mut bar) = progress_clone.lock() {
                    let _ = bar.update(step);
                }
            }
        });

        Self {
            total,
            progress,
            count,
            sender: tx,
            progress_thread: Some(handle),
        }
    }

    pub fn inc(&self) {
        let new_count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if new_count > self.total {
            log::trace!(
                "[Progress] received update {} beyond total {}; ignoring",
                new_count,
                self.total
            );
            return;
        }
        let _ = self.sender.send(1);
    }

    pub fn update_description(&self, new_desc: &str) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.set_desc(Some(new_desc));
        }
    }

    /// Closes the channel and waits for every pending redraw.
    pub fn finish(self) {
        drop(self.sender);
        if let Some(handle) = self.progress_thread {
            let _ = handle.join();
        }
    }
}

/// Resident memory bookkeeping around a top-level invocation.
///
/// Candle does not expose allocator counters for its devices, so the process
/// resident set size stands in for the allocated/peak statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub baseline_bytes: u64,
    pub current_bytes: u64,
    pub peak_bytes: u64,
}

impl MemoryStats {
    /// Starts a new measurement window at the current resident size.
    pub fn reset() -> Self {
        let now = get_rss_memory();
        Self {
            baseline_bytes: now,
            current_bytes: now,
            peak_bytes: now,
        }
    }

    /// Samples the resident size and updates the peak.
    pub fn record(&mut self) -> u64 {
        self.current_bytes = get_rss_memory();
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        self.current_bytes
    }

    pub fn log(&self, stage: &str) {
        log::info!(
            "[Memory] {}: current {:.2} MB, peak {:.2} MB, delta {:+.2} MB",
            stage,
            to_mb(self.current_bytes),
            to_mb(self.peak_bytes),
            to_mb(self.current_bytes) - to_mb(self.baseline_bytes)
        );
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Returns the resident set size of this process in bytes.
pub fn get_rss_memory() -> u64 {
    let mut sys = System::new();
    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}
