use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::error::CollectiveErr;

/// The call contract of the distributed transport.
///
/// Every worker must issue the same sequence of collective calls; the calls block until
/// all peers have joined. Rank 0 is the primary worker and the root of every broadcast.
pub trait Collective: Send + Sync {
    /// Returns true for the worker that computes primary-only values.
    fn is_primary(&self) -> bool;

    /// Number of workers taking part in the collectives.
    fn size(&self) -> usize;

    /// Replaces `buf` on every worker with the element-wise sum across workers.
    ///
    /// # Errors
    /// `CollectiveErr` if the peers disagree on the buffer length or the group broke.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<(), CollectiveErr>;

    /// Replaces `buf` on every worker with the primary worker's bytes.
    fn broadcast_bytes(&self, buf: &mut Vec<u8>) -> Result<(), CollectiveErr>;

    /// Broadcasts a fixed-size float buffer from the primary worker.
    fn broadcast_f32(&self, buf: &mut [f32]) -> Result<(), CollectiveErr> {
        let mut bytes = bytemuck::cast_slice::<f32, u8>(buf).to_vec();
        self.broadcast_bytes(&mut bytes)?;
        if bytes.len() != size_of_val(buf) {
            return Err(CollectiveErr::LengthMismatch {
                got: bytes.len(),
                expected: size_of_val(buf),
            });
        }
        for (dst, chunk) in buf.iter_mut().zip(bytes.chunks_exact(size_of::<f32>())) {
            *dst = bytemuck::pod_read_unaligned(chunk);
        }
        Ok(())
    }

    /// Broadcasts a counter from the primary worker.
    fn broadcast_usize(&self, value: &mut usize) -> Result<(), CollectiveErr> {
        let mut bytes = (*value as u64).to_le_bytes().to_vec();
        self.broadcast_bytes(&mut bytes)?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CollectiveErr::LengthMismatch {
                got: bytes.len(),
                expected: 8,
            })?;
        *value = u64::from_le_bytes(raw) as usize;
        Ok(())
    }

    /// Broadcasts a text blob from the primary worker.
    fn broadcast_string(&self, text: &mut String) -> Result<(), CollectiveErr> {
        let mut bytes = std::mem::take(text).into_bytes();
        self.broadcast_bytes(&mut bytes)?;
        *text = String::from_utf8(bytes).map_err(|e| CollectiveErr::Other(e.to_string()))?;
        Ok(())
    }
}

/// A group made of this process only. Every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl Collective for Solo {
    fn is_primary(&self) -> bool {
        true
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<(), CollectiveErr> {
        Ok(())
    }

    fn broadcast_bytes(&self, _buf: &mut Vec<u8>) -> Result<(), CollectiveErr> {
        Ok(())
    }
}

struct Shared {
    barrier: Barrier,
    sum: Mutex<Vec<f32>>,
    lengths: Mutex<Vec<usize>>,
    bytes: Mutex<Vec<u8>>,
}

/// In-process workers sharing one memory slot, one handle per worker thread.
///
/// Collectives are phased with a barrier: contribute, wait, read, wait. All workers read the
/// same accumulated buffer, so results are bit-identical across ranks.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the handles of a group of `size` workers.
    ///
    /// # Args
    /// * `size` - The amount of workers; handle `i` has rank `i`.
    ///
    /// # Returns
    /// One handle per worker, to be moved into the worker threads.
    pub fn new(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            sum: Mutex::new(Vec::new()),
            lengths: Mutex::new(vec![0; size]),
            bytes: Mutex::new(Vec::new()),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl Collective for LocalGroup {
    fn is_primary(&self) -> bool {
        self.rank == 0
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<(), CollectiveErr> {
        self.shared.lengths.lock()[self.rank] = buf.len();
        if self.shared.barrier.wait().is_leader() {
            let mut sum = self.shared.sum.lock();
            sum.clear();
            sum.resize(buf.len(), 0.0);
        }
        self.shared.barrier.wait();

        // Contributions are added in rank order so the sum does not depend on thread timing.
        for rank in 0..self.size {
            if rank == self.rank {
                let mut sum = self.shared.sum.lock();
                for (acc, x) in sum.iter_mut().zip(buf.iter()) {
                    *acc += *x;
                }
            }
            self.shared.barrier.wait();
        }

        let mismatch = self
            .shared
            .lengths
            .lock()
            .iter()
            .copied()
            .find(|len| *len != buf.len());
        if mismatch.is_none() {
            buf.copy_from_slice(&self.shared.sum.lock()[..buf.len()]);
        }
        self.shared.barrier.wait();

        match mismatch {
            Some(got) => Err(CollectiveErr::LengthMismatch {
                got,
                expected: buf.len(),
            }),
            None => Ok(()),
        }
    }

    fn broadcast_bytes(&self, buf: &mut Vec<u8>) -> Result<(), CollectiveErr> {
        if self.is_primary() {
            let mut bytes = self.shared.bytes.lock();
            bytes.clear();
            bytes.extend_from_slice(buf);
        }
        self.shared.barrier.wait();

        if !self.is_primary() {
            let bytes = self.shared.bytes.lock();
            buf.clear();
            buf.extend_from_slice(&bytes);
        }
        self.shared.barrier.wait();
        Ok(())
    }
}
