//! Ring-buffered perf-event reader
//!
//! Single consumer over the per-CPU rings of one perf-event-array map. Each
//! CPU has a producer task that drains its ring into a bounded channel;
//! [`PerfReader::read`] pulls one record at a time with a 100 ms poll
//! deadline so cancellation is observed promptly. Records from the same CPU
//! arrive in production order; cross-CPU order is unspecified.

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::Map;
use aya::Pod;
use bytes::BytesMut;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{AgentError, Result};

/// Poll deadline: how long a single wait may block before cancellation is
/// re-checked.
const POLL_DEADLINE: Duration = Duration::from_millis(100);

/// Per-call scratch buffers handed to the kernel ring.
const EVENTS_PER_WAKEUP: usize = 16;

/// Bounded record queue between the per-CPU producers and the reader.
const CHANNEL_CAPACITY: usize = 512;

pub struct PerfReader {
    records: mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
    lost: Arc<AtomicU64>,
}

impl PerfReader {
    /// Attach a consumer to every online CPU's ring of `map`.
    ///
    /// `per_cpu_buffer` is in bytes and is rounded up to a power-of-two page
    /// count.
    pub fn new(map: Map, per_cpu_buffer: usize, parent: &CancellationToken) -> Result<PerfReader> {
        let mut array = AsyncPerfEventArray::try_from(map)?;
        let cpus = aya::util::online_cpus().map_err(|(_, e)| AgentError::Io(e))?;

        let pages = (per_cpu_buffer / 4096).next_power_of_two().max(1);
        let token = parent.child_token();
        let lost = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        for cpu in cpus {
            let mut ring = array.open(cpu, Some(pages))?;
            let tx = tx.clone();
            let token = token.clone();
            let lost = Arc::clone(&lost);
            tokio::spawn(async move {
                let mut buffers = (0..EVENTS_PER_WAKEUP)
                    .map(|_| BytesMut::with_capacity(256))
                    .collect::<Vec<_>>();
                loop {
                    let events = tokio::select! {
                        () = token.cancelled() => break,
                        events = ring.read_events(&mut buffers) => events,
                    };
                    let events = match events {
                        Ok(events) => events,
                        Err(e) => {
                            debug!("perf ring on cpu {cpu} closed: {e}");
                            break;
                        }
                    };
                    if events.lost > 0 {
                        lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                    }
                    for buf in buffers.iter_mut().take(events.read) {
                        let record = buf.split().to_vec();
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }

        Ok(PerfReader { records: rx, token, lost })
    }

    /// Read one record and decode it with a length-checked native-endian
    /// copy.
    ///
    /// Blocks until a record arrives, the cancellation token fires
    /// ([`AgentError::Canceled`]), or the reader is closed (also
    /// [`AgentError::Canceled`], the close cancels the token). Lost samples
    /// never surface here; they are counted on [`PerfReader::lost_samples`].
    #[allow(unsafe_code)]
    pub async fn read<T: Pod>(&mut self) -> Result<T> {
        loop {
            if self.token.is_cancelled() {
                return Err(AgentError::Canceled);
            }

            match tokio::time::timeout(POLL_DEADLINE, self.records.recv()).await {
                // poll deadline, go back and check cancellation
                Err(_) => continue,
                // every producer exited: the reader was closed
                Ok(None) => return Err(AgentError::Canceled),
                Ok(Some(bytes)) => {
                    if bytes.len() < std::mem::size_of::<T>() {
                        return Err(AgentError::MalformedRecord {
                            source_name: "perf".to_string(),
                            reason: format!(
                                "record is {} bytes, need {}",
                                bytes.len(),
                                std::mem::size_of::<T>()
                            ),
                        });
                    }
                    // SAFETY: length checked above and T: Pod makes any bit
                    // pattern a valid value.
                    let value = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
                    return Ok(value);
                }
            }
        }
    }

    /// Total lost-sample count across all CPUs.
    #[must_use]
    pub fn lost_samples(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Cancel the inner token and let the producers release their rings.
    /// Subsequent reads return immediately with a cancellation error.
    pub fn close(&mut self) {
        self.token.cancel();
    }
}

impl Drop for PerfReader {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader whose producers are all gone behaves like a closed reader:
    /// every read returns the cancellation error.
    #[tokio::test]
    async fn test_read_after_close_is_canceled() {
        let (_tx, rx) = mpsc::channel(1);
        let mut reader = PerfReader {
            records: rx,
            token: CancellationToken::new(),
            lost: Arc::new(AtomicU64::new(0)),
        };
        reader.close();
        let err = reader.read::<u64>().await.unwrap_err();
        assert!(err.is_canceled());
        let err = reader.read::<u64>().await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_read_decodes_record() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = PerfReader {
            records: rx,
            token: CancellationToken::new(),
            lost: Arc::new(AtomicU64::new(0)),
        };
        tx.send(0x1122_3344_5566_7788u64.to_ne_bytes().to_vec()).await.unwrap();
        let value: u64 = reader.read().await.unwrap();
        assert_eq!(value, 0x1122_3344_5566_7788);
    }

    #[tokio::test]
    async fn test_short_record_is_malformed() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = PerfReader {
            records: rx,
            token: CancellationToken::new(),
            lost: Arc::new(AtomicU64::new(0)),
        };
        tx.send(vec![1, 2, 3]).await.unwrap();
        let err = reader.read::<u64>().await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedRecord { .. }));
    }

    /// The poll deadline loops rather than erroring while the channel is
    /// quiet, and a cancellation mid-wait surfaces promptly.
    #[tokio::test]
    async fn test_cancellation_observed_within_deadline() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let token = CancellationToken::new();
        let mut reader =
            PerfReader { records: rx, token: token.clone(), lost: Arc::new(AtomicU64::new(0)) };

        let cancel = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                token.cancel();
            }
        });

        let started = std::time::Instant::now();
        let err = reader.read::<u64>().await.unwrap_err();
        assert!(err.is_canceled());
        // one deadline of slack past the cancel point
        assert!(started.elapsed() < Duration::from_millis(400));
        cancel.await.unwrap();
        drop(tx);
    }
}
