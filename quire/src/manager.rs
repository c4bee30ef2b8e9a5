//! The request coordinator between the chunked source and the network layer.

use crate::chunk::ChunkedSource;
use crate::error::{Error, Result};
use log::debug;
use rustc_hash::FxHashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

/// The network layer: fetches a byte range of the document.
///
/// Implementations back this with whatever transfer mechanism the host has,
/// typically HTTP range requests. Requests are always chunk-aligned, with
/// contiguous chunks merged into one call.
pub trait RangeTransport: Send + Sync {
    /// Fetch the bytes `begin..end` of the document.
    fn fetch(
        &self,
        begin: usize,
        end: usize,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + '_>>;
}

struct Waiter {
    /// Chunks that still have to arrive before this request is satisfied.
    needed: FxHashSet<usize>,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct State {
    /// Chunks handed to the transport whose bytes have not arrived yet.
    requested: FxHashSet<usize>,
    pending: Vec<Waiter>,
    aborted: Option<String>,
}

/// Coordinates chunk requests against a [`RangeTransport`].
///
/// Concurrent requests for overlapping ranges share in-flight transport
/// calls: each chunk is fetched at most once, and every caller waiting on it
/// is woken when it arrives. With prefetching enabled, receiving data
/// schedules a request for the next missing chunk in the background; the
/// very first received chunk additionally schedules the last chunk of the
/// document, where the cross-reference machinery lives.
pub struct ChunkManager {
    source: Arc<ChunkedSource>,
    transport: Arc<dyn RangeTransport>,
    prefetch: bool,
    weak: Weak<Self>,
    state: Mutex<State>,
}

impl ChunkManager {
    /// Create a new manager for the given source and transport.
    pub fn new(
        source: Arc<ChunkedSource>,
        transport: Arc<dyn RangeTransport>,
        prefetch: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            source,
            transport,
            prefetch,
            weak: weak.clone(),
            state: Mutex::new(State::default()),
        })
    }

    /// The source this manager fills.
    pub fn source(&self) -> &Arc<ChunkedSource> {
        &self.source
    }

    /// Ensure the bytes `begin..end` are resident, fetching what is missing.
    pub async fn request_range(&self, begin: usize, end: usize) -> Result<()> {
        let chunks: Vec<usize> = self.source.chunks_spanning(begin, end).collect();

        self.request_chunks(&chunks).await
    }

    /// Ensure several byte ranges are resident with one round of requests.
    pub async fn request_ranges(&self, ranges: &[(usize, usize)]) -> Result<()> {
        let mut chunks: Vec<usize> = ranges
            .iter()
            .flat_map(|&(begin, end)| self.source.chunks_spanning(begin, end))
            .collect();
        chunks.sort_unstable();
        chunks.dedup();

        self.request_chunks(&chunks).await
    }

    /// Ensure the given chunks are resident.
    ///
    /// Chunks already in flight are not requested again; the call waits for
    /// their arrival instead. Newly requested chunks are grouped into
    /// maximal contiguous runs, one transport call per run.
    pub async fn request_chunks(&self, chunks: &[usize]) -> Result<()> {
        let (rx, groups) = {
            let mut state = self.state.lock().unwrap();

            if let Some(reason) = &state.aborted {
                return Err(Error::Aborted(reason.clone()));
            }

            let needed: FxHashSet<usize> = chunks
                .iter()
                .copied()
                .filter(|&c| !self.source.is_resident(c))
                .collect();

            if needed.is_empty() {
                return Ok(());
            }

            let mut to_fetch: Vec<usize> = needed
                .iter()
                .copied()
                .filter(|&c| state.requested.insert(c))
                .collect();
            to_fetch.sort_unstable();

            let (tx, rx) = oneshot::channel();
            state.pending.push(Waiter { needed, tx });

            (rx, contiguous_runs(&to_fetch))
        };

        for (first, last) in groups {
            let begin = self.source.chunk_bounds(first).0;
            let end = self.source.chunk_bounds(last).1;

            debug!("requesting bytes {begin}..{end} (chunks {first}..={last})");

            match self.transport.fetch(begin, end).await {
                Ok(bytes) => {
                    self.source.receive_chunk(begin, &bytes);
                    self.on_chunks_received(first..=last);
                }
                Err(e) => {
                    self.on_chunks_failed(first..=last, Error::Transport(e.to_string()));
                }
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Aborted("request coordinator shut down".into())),
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn abort(&self, reason: &str) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.aborted = Some(reason.to_string());
            state.requested.clear();

            std::mem::take(&mut state.pending)
        };

        for waiter in pending {
            let _ = waiter.tx.send(Err(Error::Aborted(reason.to_string())));
        }
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted.is_some()
    }

    fn on_chunks_received(&self, chunks: impl IntoIterator<Item = usize> + Clone) {
        let mut last = 0;
        let satisfied = {
            let mut state = self.state.lock().unwrap();

            for chunk in chunks.clone() {
                last = chunk;
                state.requested.remove(&chunk);

                for waiter in &mut state.pending {
                    waiter.needed.remove(&chunk);
                }
            }

            let pending = std::mem::take(&mut state.pending);
            let mut satisfied = vec![];

            for waiter in pending {
                if waiter.needed.is_empty() {
                    satisfied.push(waiter.tx);
                } else {
                    state.pending.push(waiter);
                }
            }

            satisfied
        };

        for tx in satisfied {
            let _ = tx.send(Ok(()));
        }

        if self.prefetch {
            self.schedule_prefetch(last + 1);
        }
    }

    fn on_chunks_failed(&self, chunks: impl IntoIterator<Item = usize>, error: Error) {
        let failed: FxHashSet<usize> = chunks.into_iter().collect();

        let affected = {
            let mut state = self.state.lock().unwrap();

            for chunk in &failed {
                state.requested.remove(chunk);
            }

            let pending = std::mem::take(&mut state.pending);
            let mut affected = vec![];

            for waiter in pending {
                if waiter.needed.is_disjoint(&failed) {
                    state.pending.push(waiter);
                } else {
                    affected.push(waiter.tx);
                }
            }

            affected
        };

        for tx in affected {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Request one more chunk in the background. Needs a live runtime; on a
    /// plain thread the prefetch is skipped.
    fn schedule_prefetch(&self, after: usize) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        // Only prefetch on a quiet line; outstanding requests keep the
        // transport to themselves.
        {
            let state = self.state.lock().unwrap();

            if !state.requested.is_empty() || !state.pending.is_empty() {
                return;
            }
        }

        let num_chunks = self.source.num_chunks();

        let target = if self.source.resident_chunks() == 1
            && num_chunks > 1
            && !self.source.is_resident(num_chunks - 1)
        {
            // The first data just arrived; pull the document tail next so
            // the cross-reference machinery becomes parseable early.
            num_chunks - 1
        } else {
            match self.source.next_missing_chunk(after % num_chunks.max(1)) {
                Some(chunk) => chunk,
                None => return,
            }
        };

        handle.spawn(async move {
            let _ = manager.request_chunks(&[target]).await;
        });
    }
}

/// Split a sorted chunk list into maximal `(first, last)` runs.
fn contiguous_runs(chunks: &[usize]) -> Vec<(usize, usize)> {
    let mut runs = vec![];
    let mut iter = chunks.iter().copied();

    let Some(mut first) = iter.next() else {
        return runs;
    };
    let mut last = first;

    for chunk in iter {
        if chunk == last + 1 {
            last = chunk;
        } else {
            runs.push((first, last));
            first = chunk;
            last = chunk;
        }
    }

    runs.push((first, last));
    runs
}
