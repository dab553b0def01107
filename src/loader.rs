//! Multi-threaded augmentation over a [`SampleSource`].
//!
//! [`Augmenter`] runs a pool of worker threads that pull indices from a
//! shared queue, build samples, augment them and push them through a bounded
//! channel. One call to [`Augmenter::restart`] prepares one epoch: every
//! index is produced exactly once, in shuffled order when shuffling is on.
//!
//! ```ignore
//! let dataset = Arc::new(PairedVolumeDataset::new(entries, config)?);
//! let mut augmenter = Augmenter::wrap(dataset, 4, false).seed(7);
//! for epoch in 0..epochs {
//!     augmenter.restart()?;
//!     for batch in augmenter.batches(8) {
//!         train_step(&batch?);
//!     }
//! }
//! ```

use crate::dataset::{Sample, SampleSource};
use crate::error::{Error, Result};
use crate::transforms::AugmentPipeline;
use ndarray::{Array1, Array2, Array5, ArrayView1, ArrayView5, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Samples collated along the batch axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[batch, 3, z, y, x]`.
    pub image: Array5<f32>,
    /// `[batch, fields]`.
    pub metadata: Array2<f32>,
    /// `[batch, 1, z, y, x]`.
    pub segmentation: Option<Array5<i8>>,
    /// `[batch]`.
    pub label: Option<Array1<f32>>,
    /// Seed of each sample.
    pub seeds: Vec<u64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

/// Concatenate samples along the batch axis.
///
/// Masks and labels must be present on all samples or on none.
pub fn collate(samples: Vec<Sample>) -> Result<Batch> {
    if samples.is_empty() {
        return Err(Error::ShapeMismatch("cannot collate an empty batch".into()));
    }

    let images: Vec<ArrayView5<'_, f32>> = samples.iter().map(|s| s.image.view()).collect();
    let image = ndarray::concatenate(Axis(0), &images)
        .map_err(|e| Error::ShapeMismatch(format!("image shapes differ within batch: {e}")))?;

    let metadata: Vec<ArrayView1<'_, f32>> = samples.iter().map(|s| s.metadata.view()).collect();
    let metadata = ndarray::stack(Axis(0), &metadata)
        .map_err(|e| Error::ShapeMismatch(format!("metadata lengths differ within batch: {e}")))?;

    let segmentation = match all_or_none(&samples, "segmentation", |s| s.segmentation.as_ref())? {
        Some(masks) => {
            let views: Vec<ArrayView5<'_, i8>> = masks.iter().map(|m| m.view()).collect();
            Some(
                ndarray::concatenate(Axis(0), &views)
                    .map_err(|e| Error::ShapeMismatch(format!("mask shapes differ within batch: {e}")))?,
            )
        }
        None => None,
    };

    let label = all_or_none(&samples, "label", |s| s.label)?.map(Array1::from);
    let seeds = samples.iter().map(|s| s.seed).collect();

    Ok(Batch {
        image,
        metadata,
        segmentation,
        label,
        seeds,
    })
}

fn all_or_none<'a, T>(
    samples: &'a [Sample],
    what: &str,
    get: impl Fn(&'a Sample) -> Option<T>,
) -> Result<Option<Vec<T>>> {
    let values: Vec<T> = samples.iter().filter_map(&get).collect();
    if values.is_empty() {
        Ok(None)
    } else if values.len() == samples.len() {
        Ok(Some(values))
    } else {
        Err(Error::ShapeMismatch(format!(
            "{} present on {} of {} samples",
            what,
            values.len(),
            samples.len()
        )))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct WorkerPool {
    receiver: Receiver<Result<Sample>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the receiver unblocks workers waiting on a full channel.
        drop(self.receiver);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::warn!("augmentation worker panicked");
            }
        }
    }
}

/// Worker pool that augments samples from a [`SampleSource`].
pub struct Augmenter<D: SampleSource + 'static> {
    dataset: Arc<D>,
    num_threads: usize,
    disable: bool,
    pipeline: Arc<AugmentPipeline>,
    shuffle: bool,
    prefetch: usize,
    rng: ChaCha8Rng,
    epoch: usize,
    pool: Option<WorkerPool>,
    warned: bool,
}

impl<D: SampleSource + 'static> Augmenter<D> {
    /// Wrap `dataset` with `num_threads` workers (at least one). With
    /// `disable`, samples are forwarded untouched.
    ///
    /// No work starts until [`restart`](Self::restart) is called.
    pub fn wrap(dataset: Arc<D>, num_threads: usize, disable: bool) -> Self {
        Self {
            dataset,
            num_threads: num_threads.max(1),
            disable,
            pipeline: Arc::new(AugmentPipeline::default()),
            shuffle: true,
            prefetch: 16,
            rng: ChaCha8Rng::from_entropy(),
            epoch: 0,
            pool: None,
            warned: false,
        }
    }

    /// Set the augmentation pipeline.
    pub fn pipeline(mut self, pipeline: AugmentPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    /// Shuffle sample order each epoch (default: true).
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Seed the epoch shuffles.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Set prefetch buffer size (default: 16).
    pub fn prefetch(mut self, size: usize) -> Self {
        self.prefetch = size.max(1);
        self
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    /// Samples per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of epochs started so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Stop any running workers and start a new epoch.
    pub fn restart(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let queue = Arc::new(Mutex::new(VecDeque::from(order)));
        let (sender, receiver) = mpsc::sync_channel(self.prefetch);
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(self.num_threads);
        for worker in 0..self.num_threads {
            let worker_sender = sender.clone();
            let worker_stop = Arc::clone(&stop);
            let queue = Arc::clone(&queue);
            let dataset = Arc::clone(&self.dataset);
            let pipeline = (!self.disable).then(|| Arc::clone(&self.pipeline));

            let spawned = thread::Builder::new()
                .name(format!("mpmri-augment-{worker}"))
                .spawn(move || loop {
                    if worker_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let index = {
                        let Ok(mut q) = queue.lock() else { break };
                        q.pop_front()
                    };
                    let Some(index) = index else { break };

                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        dataset.get(index).and_then(|sample| match &pipeline {
                            Some(pipeline) => {
                                pipeline.apply(sample).map_err(|source| Error::Sample {
                                    index,
                                    source: Box::new(source),
                                })
                            }
                            None => Ok(sample),
                        })
                    }))
                    .unwrap_or_else(|payload| {
                        Err(Error::Sample {
                            index,
                            source: Box::new(Error::WorkerPanic(panic_message(payload.as_ref()))),
                        })
                    });
                    if worker_sender.send(result).is_err() {
                        break;
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(sender);
                    WorkerPool {
                        receiver,
                        handles,
                        stop,
                    }
                    .shutdown();
                    return Err(Error::Io(e));
                }
            }
        }
        // Workers hold the remaining senders; the channel closes when the
        // queue is drained.
        drop(sender);

        self.epoch += 1;
        self.warned = false;
        tracing::info!(
            epoch = self.epoch,
            samples = self.dataset.len(),
            workers = self.num_threads,
            augment = !self.disable,
            "augmenter restarted"
        );

        self.pool = Some(WorkerPool {
            receiver,
            handles,
            stop,
        });
        Ok(())
    }

    /// Iterate over collated batches of up to `batch_size` samples. The last
    /// batch of an epoch may be short. A failed sample ends its batch with
    /// the error.
    pub fn batches(&mut self, batch_size: usize) -> Batches<'_, D> {
        Batches {
            augmenter: self,
            batch_size: batch_size.max(1),
        }
    }
}

impl<D: SampleSource + 'static> Iterator for Augmenter<D> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        match &self.pool {
            Some(pool) => pool.receiver.recv().ok(),
            None => {
                if !self.warned {
                    tracing::warn!("augmenter iterated before restart(); no samples produced");
                    self.warned = true;
                }
                None
            }
        }
    }
}

impl<D: SampleSource + 'static> Drop for Augmenter<D> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

impl<D: SampleSource + 'static> std::fmt::Debug for Augmenter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Augmenter")
            .field("samples", &self.dataset.len())
            .field("num_threads", &self.num_threads)
            .field("disable", &self.disable)
            .field("shuffle", &self.shuffle)
            .field("prefetch", &self.prefetch)
            .field("epoch", &self.epoch)
            .field("running", &self.pool.is_some())
            .finish()
    }
}

/// Iterator over batches from an [`Augmenter`].
pub struct Batches<'a, D: SampleSource + 'static> {
    augmenter: &'a mut Augmenter<D>,
    batch_size: usize,
}

impl<D: SampleSource + 'static> Iterator for Batches<'_, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.augmenter.next() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if samples.is_empty() {
            None
        } else {
            Some(collate(samples))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::BTreeSet;

    /// In-memory source whose sample `i` has label `i` and voxels `i`.
    #[derive(Debug)]
    struct Synthetic {
        len: usize,
        fail_at: Option<usize>,
        panic_at: Option<usize>,
    }

    impl Synthetic {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                len,
                fail_at: None,
                panic_at: None,
            })
        }
    }

    impl SampleSource for Synthetic {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize) -> Result<Sample> {
            if index >= self.len {
                return Err(Error::IndexOutOfRange {
                    index,
                    len: self.len,
                });
            }
            if self.fail_at == Some(index) {
                return Err(Error::ShapeMismatch("synthetic failure".into()));
            }
            if self.panic_at == Some(index) {
                panic!("corrupt subject {}", index);
            }
            let image = Array5::from_shape_fn((1, 3, 2, 4, 4), |(_, c, z, y, x)| {
                (index * 1000 + c * 100 + z * 16 + y * 4 + x) as f32
            });
            let segmentation = image.slice(ndarray::s![.., 0..1, .., .., ..]).mapv(|v| (v as i64 % 5) as i8);
            Ok(Sample {
                image,
                metadata: Array1::from(vec![index as f32, 0.5]),
                segmentation: Some(segmentation),
                label: Some(index as f32),
                seed: index as u64 * 31 + 1,
            })
        }
    }

    #[test]
    fn test_iterating_before_restart_yields_nothing() {
        let mut augmenter = Augmenter::wrap(Synthetic::new(3), 2, false);
        assert!(augmenter.next().is_none());
        assert_eq!(augmenter.epoch(), 0);
    }

    #[test]
    fn test_epoch_covers_every_index_once() {
        let mut augmenter = Augmenter::wrap(Synthetic::new(10), 3, false).seed(5);
        for epoch in 1..=2 {
            augmenter.restart().unwrap();
            let labels: Vec<usize> = augmenter
                .by_ref()
                .map(|s| s.unwrap().label.unwrap() as usize)
                .collect();
            assert_eq!(labels.len(), 10);
            assert_eq!(labels.iter().copied().collect::<BTreeSet<_>>(), (0..10).collect());
            assert_eq!(augmenter.epoch(), epoch);
        }
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let order = |seed| {
            let mut augmenter = Augmenter::wrap(Synthetic::new(8), 1, true).seed(seed);
            augmenter.restart().unwrap();
            augmenter
                .map(|s| s.unwrap().label.unwrap() as usize)
                .collect::<Vec<_>>()
        };
        assert_eq!(order(3), order(3));

        let mut unshuffled = Augmenter::wrap(Synthetic::new(8), 1, true).shuffle(false);
        unshuffled.restart().unwrap();
        let labels: Vec<usize> = unshuffled.map(|s| s.unwrap().label.unwrap() as usize).collect();
        assert_eq!(labels, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let dataset = Synthetic::new(4);
        let mut augmenter = Augmenter::wrap(Arc::clone(&dataset), 2, true);
        augmenter.restart().unwrap();
        for sample in augmenter {
            let sample = sample.unwrap();
            let index = sample.label.unwrap() as usize;
            assert_eq!(sample, dataset.get(index).unwrap());
        }
    }

    #[test]
    fn test_enabled_augments_image_and_keeps_mask_aligned() {
        let dataset = Synthetic::new(4);
        let pipeline = AugmentPipeline::new().flip_prob(1.0).no_noise().no_shift();
        let mut augmenter = Augmenter::wrap(Arc::clone(&dataset), 2, false).pipeline(pipeline);
        augmenter.restart().unwrap();
        for sample in augmenter {
            let sample = sample.unwrap();
            let original = dataset.get(sample.label.unwrap() as usize).unwrap();
            assert_ne!(sample.image, original.image);
            let flipped = crate::transforms::flip(
                original.segmentation.unwrap(),
                &crate::transforms::SPATIAL_AXES,
            )
            .unwrap();
            assert_eq!(sample.segmentation.unwrap(), flipped);
        }
    }

    #[test]
    fn test_batches() {
        let mut augmenter = Augmenter::wrap(Synthetic::new(5), 2, true);
        augmenter.restart().unwrap();
        let batches: Vec<Batch> = augmenter.batches(2).map(|b| b.unwrap()).collect();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);

        let first = &batches[0];
        assert_eq!(first.image.shape(), &[2, 3, 2, 4, 4]);
        assert_eq!(first.metadata.shape(), &[2, 2]);
        assert_eq!(first.segmentation.as_ref().unwrap().shape(), &[2, 1, 2, 4, 4]);
        assert_eq!(first.label.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_errors_are_forwarded() {
        let dataset = Arc::new(Synthetic {
            len: 4,
            fail_at: Some(2),
            panic_at: None,
        });
        let mut augmenter = Augmenter::wrap(dataset, 2, false);
        augmenter.restart().unwrap();
        let results: Vec<_> = augmenter.by_ref().collect();
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[test]
    fn test_panicking_sample_is_reported_as_error() {
        let dataset = Arc::new(Synthetic {
            len: 4,
            fail_at: None,
            panic_at: Some(2),
        });
        for disable in [true, false] {
            let mut augmenter = Augmenter::wrap(Arc::clone(&dataset), 2, disable);
            augmenter.restart().unwrap();
            let results: Vec<_> = augmenter.by_ref().collect();
            assert_eq!(results.len(), 4);

            let errors: Vec<&Error> = results.iter().filter_map(|r| r.as_ref().err()).collect();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].kind(), ErrorKind::Data);
            let message = errors[0].to_string();
            assert!(message.contains("sample 2"), "{}", message);
            assert!(message.contains("corrupt subject 2"), "{}", message);
        }
    }

    #[test]
    fn test_drop_mid_epoch_does_not_hang() {
        let mut augmenter = Augmenter::wrap(Synthetic::new(64), 4, false).prefetch(1);
        augmenter.restart().unwrap();
        assert!(augmenter.next().is_some());
        drop(augmenter);
    }

    #[test]
    fn test_restart_mid_epoch_starts_fresh() {
        let mut augmenter = Augmenter::wrap(Synthetic::new(6), 2, true).prefetch(1);
        augmenter.restart().unwrap();
        let _ = augmenter.next();
        augmenter.restart().unwrap();
        assert_eq!(augmenter.by_ref().count(), 6);
    }

    #[test]
    fn test_collate_rejects_mixed_presence() {
        let dataset = Synthetic::new(2);
        let a = dataset.get(0).unwrap();
        let mut b = dataset.get(1).unwrap();
        b.segmentation = None;
        let err = collate(vec![a.clone(), b]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);

        let mut c = dataset.get(1).unwrap();
        c.metadata = Array1::from(vec![1.0]);
        assert!(collate(vec![a, c]).is_err());
        assert!(collate(Vec::new()).is_err());
    }
}
