/// Global memory of the software device.
/// Buffers are arrays of 64-bit atomic words so concurrently running
/// work-groups can update counters without locking. Narrower values live in
/// the little-endian halves of a word, matching how the host sees the bytes.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::BufferId;
use crate::error::DeviceError;
use crate::memory::{DeviceMemoryRegion, MemoryTier};
use crate::software::kernel::KernelFault;

/// One device buffer.
#[derive(Debug)]
pub struct DeviceAllocation {
    pub tier: MemoryTier,
    bytes: usize,
    words: Box<[AtomicU64]>,
}

impl DeviceAllocation {
    /// Zero-filled buffer of `bytes` bytes
    pub fn new(tier: MemoryTier, bytes: usize) -> Self {
        let words = (0..bytes.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        DeviceAllocation { tier, bytes, words }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Overwrite the buffer from host bytes. `src` must cover the whole buffer.
    pub fn write_bytes(&self, src: &[u8]) -> Result<(), DeviceError> {
        if src.len() != self.bytes {
            return Err(DeviceError::TransferSize {
                buffer: self.bytes,
                host: src.len(),
            });
        }
        for (word, chunk) in self.words.iter().zip(src.chunks(8)) {
            let mut le = [0u8; 8];
            le[..chunk.len()].copy_from_slice(chunk);
            word.store(u64::from_le_bytes(le), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy the whole buffer out. `dst` must be exactly the buffer's size.
    pub fn read_bytes(&self, dst: &mut [u8]) -> Result<(), DeviceError> {
        if dst.len() != self.bytes {
            return Err(DeviceError::TransferSize {
                buffer: self.bytes,
                host: dst.len(),
            });
        }
        for (word, chunk) in self.words.iter().zip(dst.chunks_mut(8)) {
            let le = word.load(Ordering::Acquire).to_le_bytes();
            chunk.copy_from_slice(&le[..chunk.len()]);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Typed access for kernels
    // -----------------------------------------------------------------------

    pub fn len_u64(&self) -> usize {
        self.bytes / 8
    }

    pub fn len_u32(&self) -> usize {
        self.bytes / 4
    }

    pub fn fetch_add_u64(&self, index: usize, value: u64) -> Result<u64, KernelFault> {
        self.check(index, self.len_u64(), "u64")?;
        Ok(self.words[index].fetch_add(value, Ordering::AcqRel))
    }

    pub fn load_u64(&self, index: usize) -> Result<u64, KernelFault> {
        self.check(index, self.len_u64(), "u64")?;
        Ok(self.words[index].load(Ordering::Acquire))
    }

    pub fn load_u32(&self, index: usize) -> Result<u32, KernelFault> {
        self.check(index, self.len_u32(), "u32")?;
        let (word, shift) = half(index);
        Ok((self.words[word].load(Ordering::Acquire) >> shift) as u32)
    }

    /// Atomically decrement the u32 at `index` unless it is already zero.
    /// Returns the value before the decrement, or `None` at zero.
    pub fn decrement_u32(&self, index: usize) -> Result<Option<u32>, KernelFault> {
        self.check(index, self.len_u32(), "u32")?;
        let (word, shift) = half(index);
        let prev = self.words[word].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            if (w >> shift) as u32 == 0 {
                None
            } else {
                Some(w - (1u64 << shift))
            }
        });
        Ok(prev.ok().map(|w| (w >> shift) as u32))
    }

    pub fn store_f32(&self, index: usize, value: f32) -> Result<(), KernelFault> {
        self.check(index, self.len_u32(), "f32")?;
        let (word, shift) = half(index);
        let mask = 0xffff_ffffu64 << shift;
        let bits = (value.to_bits() as u64) << shift;
        // fetch_update only fails when the closure returns None
        let _ = self.words[word].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            Some((w & !mask) | bits)
        });
        Ok(())
    }

    pub fn load_f32(&self, index: usize) -> Result<f32, KernelFault> {
        self.load_u32(index).map(f32::from_bits)
    }

    fn check(&self, index: usize, len: usize, what: &'static str) -> Result<(), KernelFault> {
        if index < len {
            Ok(())
        } else {
            Err(KernelFault::OutOfBounds { what, index, len })
        }
    }
}

/// Word index and bit shift of 32-bit slot `index`
fn half(index: usize) -> (usize, u32) {
    (index / 2, (index % 2) as u32 * 32)
}

// ---------------------------------------------------------------------------
// Memory pool
// ---------------------------------------------------------------------------

/// Handle table and capacity accounting for global memory.
#[derive(Debug)]
pub struct MemoryPool {
    pub capacity: usize,
    used: usize,
    next_id: u64,
    buffers: HashMap<u64, Arc<DeviceAllocation>>,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Self {
        MemoryPool {
            capacity,
            used: 0,
            next_id: 1,
            buffers: HashMap::new(),
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn allocate(
        &mut self,
        region: &DeviceMemoryRegion,
        host_data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        let available = self.capacity - self.used;
        if region.bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: region.bytes,
                available,
            });
        }
        let alloc = DeviceAllocation::new(region.tier, region.bytes);
        if let Some(data) = host_data {
            alloc.write_bytes(data)?;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.used += region.bytes;
        self.buffers.insert(id, Arc::new(alloc));
        Ok(BufferId(id))
    }

    /// Drop the pool's reference. A launch still holding the buffer keeps
    /// it alive until the launch ends.
    pub fn release(&mut self, id: BufferId) -> bool {
        match self.buffers.remove(&id.0) {
            Some(alloc) => {
                self.used -= alloc.bytes();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: BufferId) -> Result<Arc<DeviceAllocation>, DeviceError> {
        self.buffers
            .get(&id.0)
            .cloned()
            .ok_or(DeviceError::UnknownHandle {
                kind: "buffer",
                id: id.0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AccessMode;

    #[test]
    fn bytes_round_trip_through_words() {
        let alloc = DeviceAllocation::new(MemoryTier::Diagnostic, 12);
        let src: Vec<u8> = (1..=12).collect();
        alloc.write_bytes(&src).unwrap();
        let mut dst = vec![0u8; 12];
        alloc.read_bytes(&mut dst).unwrap();
        assert_eq!(dst, src);
        assert!(matches!(
            alloc.read_bytes(&mut [0u8; 8]),
            Err(DeviceError::TransferSize { buffer: 12, host: 8 })
        ));
    }

    #[test]
    fn u32_halves_are_little_endian() {
        let alloc = DeviceAllocation::new(MemoryTier::PerRunGlobal, 8);
        alloc.write_bytes(&[5, 0, 0, 0, 9, 0, 0, 0]).unwrap();
        assert_eq!(alloc.load_u32(0).unwrap(), 5);
        assert_eq!(alloc.load_u32(1).unwrap(), 9);
        alloc.store_f32(1, 2.5).unwrap();
        assert_eq!(alloc.load_f32(1).unwrap(), 2.5);
        assert_eq!(alloc.load_u32(0).unwrap(), 5);
    }

    #[test]
    fn decrement_stops_at_zero() {
        let alloc = DeviceAllocation::new(MemoryTier::PerRunGlobal, 4);
        alloc.write_bytes(&2u32.to_le_bytes()).unwrap();
        assert_eq!(alloc.decrement_u32(0).unwrap(), Some(2));
        assert_eq!(alloc.decrement_u32(0).unwrap(), Some(1));
        assert_eq!(alloc.decrement_u32(0).unwrap(), None);
        assert_eq!(alloc.load_u32(0).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let alloc = DeviceAllocation::new(MemoryTier::PerRunGlobal, 16);
        assert!(alloc.fetch_add_u64(1, 1).is_ok());
        assert_eq!(
            alloc.fetch_add_u64(2, 1),
            Err(KernelFault::OutOfBounds {
                what: "u64",
                index: 2,
                len: 2
            })
        );
    }

    #[test]
    fn pool_tracks_capacity() {
        let mut pool = MemoryPool::new(100);
        let region = DeviceMemoryRegion::new(MemoryTier::PerRunGlobal, 64, AccessMode::ReadWrite);
        let a = pool.allocate(&region, None).unwrap();
        assert_eq!(pool.used(), 64);
        assert!(matches!(
            pool.allocate(&region, None),
            Err(DeviceError::OutOfMemory { requested: 64, available: 36 })
        ));
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.used(), 0);
        assert!(pool.get(a).is_err());
    }
}
