// THEORY:
// The per-frame computations of this engine are independent of each other, so the
// parallelism is coarse: the time axis is cut into contiguous chunks and every chunk
// is handed to a blocking worker on the tokio runtime. Workers share immutable
// inputs through `Arc` and each one writes only its private output.
//
// Chunks carry their index and frame range. Results are collected in submission
// order, never completion order, so concatenating them rebuilds the time axis.

use crate::core_modules::progress::ProgressObserver;
use crate::error::{PipelineError, Result};
use futures::future::join_all;
use ndarray::{Array3, Axis, s};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Upper bound on the worker count, whatever the core count.
pub const MAX_WORKERS: usize = 16;

/// The output of one chunk together with the frames it covers.
#[derive(Debug, Clone)]
pub struct FrameChunk<T> {
    pub index: usize,
    pub frames: Range<usize>,
    pub output: T,
}

/// Splits `0..total` into at most `parts` contiguous, non-empty ranges whose
/// lengths differ by at most one. Every frame lands in exactly one range.
pub fn partition_frames(total: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1).min(total.max(1));
    let base = total / parts;
    let extra = total % parts;

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// A fixed-size pool of blocking workers for frame-chunked jobs.
#[derive(Debug, Clone)]
pub struct ChunkWorkerPool {
    workers: usize,
}

impl ChunkWorkerPool {
    /// Sizes the pool to the available cores, capped at `max_workers` (or `MAX_WORKERS`).
    pub fn new(max_workers: Option<usize>) -> Self {
        let cap = max_workers.unwrap_or(MAX_WORKERS).max(1);
        Self {
            workers: num_cpus::get().clamp(1, cap),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `job` once per chunk of `0..total_frames` and returns the chunks in order.
    pub async fn map_chunks<T, F>(
        &self,
        total_frames: usize,
        job: F,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Vec<FrameChunk<T>>>
    where
        F: Fn(Range<usize>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let job = Arc::new(job);
        let chunks = partition_frames(total_frames, self.workers);
        let total_chunks = chunks.len();
        let completed = Arc::new(AtomicUsize::new(0));
        debug!(total_frames, chunks = total_chunks, workers = self.workers, "dispatching frame chunks");

        let handles = chunks.into_iter().enumerate().map(|(index, frames)| {
            let job = Arc::clone(&job);
            let observer = Arc::clone(&observer);
            let completed = Arc::clone(&completed);
            tokio::task::spawn_blocking(move || {
                let output = job(frames.clone());
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                observer.on_progress(done, total_chunks);
                FrameChunk { index, frames, output }
            })
        });

        // join_all keeps the order of the handles it was given.
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.map_err(|e| PipelineError::Worker(e.to_string())))
            .collect()
    }
}

/// Writes chunked `(t, x, y)` outputs back into one volume of shape `dim`.
pub fn concatenate_frames<A: Clone + Default>(chunks: &[FrameChunk<Array3<A>>], dim: (usize, usize, usize)) -> Result<Array3<A>> {
    let mut full = Array3::<A>::default(dim);
    for chunk in chunks {
        if chunk.output.len_of(Axis(0)) != chunk.frames.len() {
            return Err(PipelineError::Worker(format!(
                "chunk {} returned {} frames for range {:?}",
                chunk.index,
                chunk.output.len_of(Axis(0)),
                chunk.frames
            )));
        }
        full.slice_mut(s![chunk.frames.clone(), .., ..]).assign(&chunk.output);
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::progress::NoProgress;

    #[test]
    fn partition_covers_every_frame_once() {
        for total in 0..40 {
            for parts in 1..20 {
                let ranges = partition_frames(total, parts);
                let mut next = 0;
                for r in &ranges {
                    assert_eq!(r.start, next);
                    assert!(!r.is_empty());
                    next = r.end;
                }
                assert_eq!(next, total);
                let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
                if let (Some(min), Some(max)) = (lens.iter().min(), lens.iter().max()) {
                    assert!(max - min <= 1);
                }
            }
        }
    }

    #[test]
    fn partition_matches_even_split() {
        assert_eq!(partition_frames(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition_frames(2, 5), vec![0..1, 1..2]);
    }

    #[test]
    fn pool_is_capped() {
        assert_eq!(ChunkWorkerPool::new(Some(1)).workers(), 1);
        assert!(ChunkWorkerPool::new(None).workers() <= MAX_WORKERS);
    }

    #[tokio::test]
    async fn chunks_come_back_in_submission_order() {
        let pool = ChunkWorkerPool::new(Some(4));
        let chunks = pool
            .map_chunks(
                23,
                |frames: Range<usize>| {
                    // Earlier chunks sleep longer so completion order is reversed.
                    std::thread::sleep(std::time::Duration::from_millis(20 - frames.start as u64 / 2));
                    frames.clone().collect::<Vec<usize>>()
                },
                Arc::new(NoProgress),
            )
            .await
            .expect("chunks");

        let flat: Vec<usize> = chunks.iter().flat_map(|c| c.output.clone()).collect();
        assert_eq!(flat, (0..23).collect::<Vec<_>>());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[tokio::test]
    async fn concatenation_rebuilds_the_volume() {
        let pool = ChunkWorkerPool::new(Some(3));
        let chunks = pool
            .map_chunks(
                7,
                |frames: Range<usize>| {
                    let mut out = Array3::<u32>::zeros((frames.len(), 2, 2));
                    for (i, t) in frames.enumerate() {
                        out.index_axis_mut(Axis(0), i).fill(t as u32);
                    }
                    out
                },
                Arc::new(NoProgress),
            )
            .await
            .expect("chunks");
        let full = concatenate_frames(&chunks, (7, 2, 2)).expect("concatenate");
        for t in 0..7 {
            assert!(full.index_axis(Axis(0), t).iter().all(|&v| v == t as u32));
        }
    }
}
