//! Fixed set of capture buffers for one configuration.
//!
//! The slot table is a dense array indexed by device buffer index plus a
//! reverse map from the caller's buffer key, so both `requeue(index)` and
//! `requeue_handle(key)` are O(1). Every slot is in exactly one of two
//! states: `Queued` (owned by the driver) or `Held` (owned by userspace,
//! optionally lent to a consumer). The table lock is never held across a
//! device call.

use crate::device::{CaptureDevice, SlotMemory};
use crate::error::{CameraError, Result};
use crate::format::MemoryKind;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Caller-side identity of a buffer, e.g. a gralloc handle id.
pub type BufferKey = u64;

/// A caller-provided buffer to correlate with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalBuffer {
    pub key: BufferKey,
    /// Handle to import when the pool uses `MemoryKind::DmaBuf`.
    pub fd: Option<RawFd>,
    pub canvas: Option<u32>,
}

impl ExternalBuffer {
    pub fn keyed(key: BufferKey) -> Self {
        Self {
            key,
            fd: None,
            canvas: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Queued,
    Held { lease: Option<u64> },
}

struct Slot {
    key: BufferKey,
    memory: Option<Arc<dyn SlotMemory>>,
    import: Option<RawFd>,
    canvas: Option<u32>,
    state: SlotState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: usize,
    pub queued: usize,
    pub held: usize,
    pub lent: usize,
    pub dequeued: u64,
    pub requeued: u64,
}

/// Identifies one lending of one slot. Stale tickets are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTicket {
    pub index: u32,
    generation: u64,
    ticket: u64,
}

/// A slot just handed back by the driver, now `Held`.
pub struct DequeuedSlot {
    pub index: u32,
    pub key: BufferKey,
    pub canvas: Option<u32>,
    pub generation: u64,
    pub bytes_used: u32,
    pub length: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub memory: Arc<dyn SlotMemory>,
}

impl DequeuedSlot {
    /// Raw formats must fill the whole buffer.
    pub fn is_short(&self) -> bool {
        self.bytes_used != self.length
    }
}

struct SlotTable {
    slots: Vec<Slot>,
    by_key: HashMap<BufferKey, u32>,
    memory: MemoryKind,
    generation: u64,
    next_ticket: u64,
    /// Slots go to the driver only while armed; cleared by `unmap_all`.
    armed: bool,
    /// Set by `close` after a fatal device error. Never cleared.
    closed: bool,
    dequeued: u64,
    requeued: u64,
}

impl SlotTable {
    fn count(&self, state: impl Fn(&SlotState) -> bool) -> usize {
        self.slots.iter().filter(|s| state(&s.state)).count()
    }

    /// Marks a held slot queued and returns what the device call needs.
    /// When disarmed the slot is only unlent.
    fn prepare_requeue(&mut self, index: u32) -> Result<Option<(MemoryKind, Option<RawFd>)>> {
        self.ensure_open()?;
        let armed = self.armed;
        let memory = self.memory;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| CameraError::invalid_state(format!("no buffer slot {index}")))?;
        if slot.state == SlotState::Queued {
            return Err(CameraError::invalid_state(format!(
                "buffer {index} is already queued"
            )));
        }
        if !armed {
            slot.state = SlotState::Held { lease: None };
            return Ok(None);
        }
        slot.state = SlotState::Queued;
        Ok(Some((memory, slot.import)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(CameraError::SessionClosed);
        }
        Ok(())
    }

    fn revert(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.state = SlotState::Held { lease: None };
        }
    }
}

pub struct BufferPool {
    device: Arc<dyn CaptureDevice>,
    table: Mutex<SlotTable>,
}

impl BufferPool {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            table: Mutex::new(SlotTable {
                slots: Vec::new(),
                by_key: HashMap::new(),
                memory: MemoryKind::Mmap,
                generation: 0,
                next_ticket: 0,
                armed: false,
                closed: false,
                dequeued: 0,
                requeued: 0,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `VIDIOC_REQBUFS`. All granted slots start `Held` and unmapped.
    pub fn allocate(&self, count: u32, memory: MemoryKind) -> Result<u32> {
        {
            let table = self.table();
            table.ensure_open()?;
            if table.armed {
                return Err(CameraError::invalid_state("cannot allocate while streaming"));
            }
            if !table.slots.is_empty() {
                return Err(CameraError::invalid_state("buffers already allocated"));
            }
        }
        if count == 0 {
            return Err(CameraError::BufferAllocFailed {
                requested: count,
                reason: "zero buffers requested".to_string(),
            });
        }

        let granted = self
            .device
            .request_buffers(count, memory)
            .map_err(|e| CameraError::BufferAllocFailed {
                requested: count,
                reason: e.to_string(),
            })?;
        if granted == 0 {
            return Err(CameraError::BufferAllocFailed {
                requested: count,
                reason: "device granted no buffers".to_string(),
            });
        }
        if granted != count {
            tracing::warn!(requested = count, granted, "Device adjusted buffer count");
        }

        let mut table = self.table();
        table.memory = memory;
        table.slots = (0..granted)
            .map(|index| Slot {
                key: index as BufferKey,
                memory: None,
                import: None,
                canvas: None,
                state: SlotState::Held { lease: None },
            })
            .collect();
        table.by_key = (0..granted).map(|i| (i as BufferKey, i)).collect();
        tracing::debug!(granted, ?memory, generation = table.generation, "Buffers allocated");
        Ok(granted)
    }

    /// `VIDIOC_QUERYBUF` plus mmap or import, correlating the slot with `external`.
    pub fn map_slot(&self, index: u32, external: Option<ExternalBuffer>) -> Result<()> {
        let (memory, import) = {
            let table = self.table();
            let slot = table
                .slots
                .get(index as usize)
                .ok_or_else(|| CameraError::invalid_state(format!("no buffer slot {index}")))?;
            let import = external.and_then(|e| e.fd).or(slot.import);
            (table.memory, import)
        };
        if memory == MemoryKind::DmaBuf && import.is_none() {
            return Err(CameraError::invalid_parameter(
                "buffer",
                format!("slot {index} needs an imported handle"),
            ));
        }

        let mapping = self
            .device
            .map_buffer(index, memory, import)
            .map_err(|source| CameraError::MapFailed { index, source })?;

        let mut table = self.table();
        let table = &mut *table;
        let Some(slot) = table.slots.get_mut(index as usize) else {
            return Err(CameraError::invalid_state("pool released while mapping"));
        };
        slot.memory = Some(mapping);
        slot.import = import;
        if let Some(external) = external {
            table.by_key.remove(&slot.key);
            slot.key = external.key;
            slot.canvas = external.canvas;
            table.by_key.insert(external.key, index);
        }
        Ok(())
    }

    /// Maps every slot, pairing slot `i` with `externals[i]` when present.
    pub fn map_all(&self, externals: &[ExternalBuffer]) -> Result<()> {
        for index in 0..self.len() as u32 {
            self.map_slot(index, externals.get(index as usize).copied())?;
        }
        Ok(())
    }

    /// Re-maps slots whose mapping was dropped by `unmap_all`.
    pub fn remap(&self) -> Result<()> {
        let missing: Vec<u32> = {
            let table = self.table();
            (0..table.slots.len() as u32)
                .filter(|&i| table.slots[i as usize].memory.is_none())
                .collect()
        };
        for index in missing {
            self.map_slot(index, None)?;
        }
        Ok(())
    }

    /// Queues every held slot that is not lent and arms the pool.
    pub fn queue_idle(&self) -> Result<usize> {
        let (memory, pending) = {
            let mut table = self.table();
            table.ensure_open()?;
            table.armed = true;
            let memory = table.memory;
            let mut pending = Vec::new();
            for (index, slot) in table.slots.iter_mut().enumerate() {
                if slot.state == (SlotState::Held { lease: None }) {
                    slot.state = SlotState::Queued;
                    pending.push((index as u32, slot.import));
                }
            }
            (memory, pending)
        };

        for (n, &(index, import)) in pending.iter().enumerate() {
            if let Err(e) = self.device.queue_buffer(index, memory, import) {
                let mut table = self.table();
                for &(rest, _) in &pending[n..] {
                    table.revert(rest);
                }
                return Err(CameraError::from_io("VIDIOC_QBUF", e));
            }
        }
        Ok(pending.len())
    }

    /// `VIDIOC_DQBUF`. `Ok(None)` when nothing arrived within `timeout`.
    pub fn dequeue(&self, timeout: Duration) -> Result<Option<DequeuedSlot>> {
        let memory = {
            let table = self.table();
            table.ensure_open()?;
            if table.slots.is_empty() {
                return Err(CameraError::invalid_state("no buffers allocated"));
            }
            if table.count(|s| *s == SlotState::Queued) == 0 {
                return Err(CameraError::invalid_state("no buffers queued"));
            }
            table.memory
        };

        let buffer = match self.device.dequeue_buffer(memory, timeout) {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return Ok(None),
            Err(e) => match CameraError::from_io("VIDIOC_DQBUF", e) {
                CameraError::WouldBlock => return Ok(None),
                other => return Err(other),
            },
        };

        let mut table = self.table();
        let generation = table.generation;
        let Some(slot) = table.slots.get_mut(buffer.index as usize) else {
            return Err(CameraError::invalid_state(format!(
                "device returned unknown buffer {}",
                buffer.index
            )));
        };
        if slot.state != SlotState::Queued {
            return Err(CameraError::invalid_state(format!(
                "device returned buffer {} that was not queued",
                buffer.index
            )));
        }
        slot.state = SlotState::Held { lease: None };
        let Some(mapping) = slot.memory.clone() else {
            return Err(CameraError::invalid_state(format!(
                "buffer {} is not mapped",
                buffer.index
            )));
        };
        let dequeued = DequeuedSlot {
            index: buffer.index,
            key: slot.key,
            canvas: slot.canvas,
            generation,
            bytes_used: buffer.bytes_used,
            length: buffer.length,
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
            memory: mapping,
        };
        table.dequeued += 1;
        Ok(Some(dequeued))
    }

    /// Hands a held slot to the driver again.
    pub fn requeue(&self, index: u32) -> Result<()> {
        let pending = self.table().prepare_requeue(index)?;
        self.submit(index, pending)
    }

    /// Returns a slot that was dequeued but never lent. Nothing happens when
    /// the table was released since, or the slot is already back in the queue.
    pub fn requeue_dequeued(&self, slot: &DequeuedSlot) -> Result<()> {
        let pending = {
            let mut table = self.table();
            if table.generation != slot.generation {
                return Ok(());
            }
            let queued = table
                .slots
                .get(slot.index as usize)
                .is_some_and(|s| s.state == SlotState::Queued);
            if queued {
                return Ok(());
            }
            table.prepare_requeue(slot.index)?
        };
        self.submit(slot.index, pending)
    }

    /// Requeue by the caller's buffer key.
    pub fn requeue_handle(&self, key: BufferKey) -> Result<()> {
        let index = {
            let table = self.table();
            table.ensure_open()?;
            table
                .by_key
                .get(&key)
                .copied()
                .ok_or_else(|| CameraError::invalid_parameter("buffer", format!("unknown key {key}")))?
        };
        self.requeue(index)
    }

    fn submit(&self, index: u32, pending: Option<(MemoryKind, Option<RawFd>)>) -> Result<()> {
        let Some((memory, import)) = pending else {
            return Ok(());
        };
        match self.device.queue_buffer(index, memory, import) {
            Ok(()) => {
                self.table().requeued += 1;
                Ok(())
            }
            Err(e) => {
                self.table().revert(index);
                Err(CameraError::from_io("VIDIOC_QBUF", e))
            }
        }
    }

    /// Marks a dequeued slot as lent to a consumer.
    pub fn lend(&self, slot: &DequeuedSlot) -> Option<LeaseTicket> {
        let mut table = self.table();
        if table.generation != slot.generation {
            return None;
        }
        let ticket = table.next_ticket;
        let entry = table.slots.get_mut(slot.index as usize)?;
        if entry.state != (SlotState::Held { lease: None }) {
            return None;
        }
        entry.state = SlotState::Held {
            lease: Some(ticket),
        };
        table.next_ticket += 1;
        Some(LeaseTicket {
            index: slot.index,
            generation: slot.generation,
            ticket,
        })
    }

    /// Returns a lent slot. Tickets from an older generation, or for a slot
    /// already reclaimed through `requeue_handle`, are ignored.
    pub fn return_lease(&self, lease: LeaseTicket) -> Result<()> {
        let pending = {
            let mut table = self.table();
            if table.generation != lease.generation {
                return Ok(());
            }
            let current = table.slots.get(lease.index as usize).map(|s| s.state);
            if current != Some(SlotState::Held { lease: Some(lease.ticket) }) {
                return Ok(());
            }
            table.prepare_requeue(lease.index)?
        };
        self.submit(lease.index, pending)
    }

    /// Drops every mapping after stream-off. Queued slots return to `Held`;
    /// lent slots stay lent and keep their memory alive through the lease.
    pub fn unmap_all(&self) {
        let mut table = self.table();
        table.armed = false;
        table.dequeued = 0;
        table.requeued = 0;
        for slot in table.slots.iter_mut() {
            slot.memory = None;
            if slot.state == SlotState::Queued {
                slot.state = SlotState::Held { lease: None };
            }
        }
    }

    /// Unmaps everything, frees the driver's table and invalidates leases.
    pub fn release(&self) -> Result<()> {
        let (had_slots, memory) = {
            let mut table = self.table();
            let had_slots = !table.slots.is_empty();
            table.slots.clear();
            table.by_key.clear();
            table.generation += 1;
            table.armed = false;
            table.dequeued = 0;
            table.requeued = 0;
            (had_slots, table.memory)
        };
        if had_slots {
            self.device
                .request_buffers(0, memory)
                .map_err(|e| CameraError::from_io("VIDIOC_REQBUFS", e))?;
        }
        Ok(())
    }

    /// Fatal teardown. Drops every slot and refuses all further buffer
    /// traffic. The device is likely gone, so freeing its table is best effort.
    pub fn close(&self) {
        let (had_slots, memory) = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            let had_slots = !table.slots.is_empty();
            table.slots.clear();
            table.by_key.clear();
            table.generation += 1;
            table.armed = false;
            (had_slots, table.memory)
        };
        if had_slots {
            if let Err(e) = self.device.request_buffers(0, memory) {
                tracing::debug!(error = %e, "Buffer table not freed on close");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    pub fn counts(&self) -> PoolCounts {
        let table = self.table();
        PoolCounts {
            total: table.slots.len(),
            queued: table.count(|s| *s == SlotState::Queued),
            held: table.count(|s| matches!(s, SlotState::Held { .. })),
            lent: table.count(|s| matches!(s, SlotState::Held { lease: Some(_) })),
            dequeued: table.dequeued,
            requeued: table.requeued,
        }
    }

    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.table().generation
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.table().memory
    }

    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.table().slots.get(index as usize).map(|s| s.state)
    }

    pub fn index_of(&self, key: BufferKey) -> Option<u32> {
        self.table().by_key.get(&key).copied()
    }

    pub fn is_mapped(&self, index: u32) -> bool {
        self.table()
            .slots
            .get(index as usize)
            .is_some_and(|s| s.memory.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualDevice;
    use crate::format::{FormatDescriptor, PixelFormat};

    const WAIT: Duration = Duration::from_millis(500);

    fn setup(count: u32) -> (Arc<VirtualDevice>, BufferPool) {
        let device = VirtualDevice::builder().fps(500).build();
        device
            .set_format(&FormatDescriptor::new(320, 240, PixelFormat::Nv21))
            .unwrap();
        let pool = BufferPool::new(device.clone());
        pool.allocate(count, MemoryKind::Mmap).unwrap();
        pool.map_all(&[]).unwrap();
        (device, pool)
    }

    fn assert_balanced(pool: &BufferPool, device: &VirtualDevice) {
        let c = pool.counts();
        assert_eq!(c.queued + c.held, c.total);
        assert_eq!(c.queued, device.queued_count());
    }

    #[test]
    fn test_queued_plus_held_is_constant() {
        let (device, pool) = setup(4);
        assert_balanced(&pool, &device);
        assert_eq!(pool.queue_idle().unwrap(), 4);
        assert_balanced(&pool, &device);
        device.stream_on().unwrap();

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.dequeue(WAIT).unwrap().unwrap());
            assert_balanced(&pool, &device);
        }
        for slot in held {
            pool.requeue(slot.index).unwrap();
            assert_balanced(&pool, &device);
        }
        assert_eq!(pool.counts().queued, 4);
    }

    #[test]
    fn test_double_queue_rejected() {
        let (device, pool) = setup(2);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        pool.requeue(slot.index).unwrap();
        let err = pool.requeue(slot.index).unwrap_err();
        assert!(matches!(err, CameraError::InvalidState(_)));
        assert_balanced(&pool, &device);
    }

    #[test]
    fn test_unlent_slot_returned_once() {
        let (device, pool) = setup(3);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();

        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        pool.requeue_handle(slot.key).unwrap();
        assert!(pool.lend(&slot).is_none());
        pool.requeue_dequeued(&slot).unwrap();
        assert_eq!(pool.counts().queued, 3);
        assert_balanced(&pool, &device);

        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        pool.requeue_dequeued(&slot).unwrap();
        assert_eq!(pool.counts().queued, 3);
        assert_balanced(&pool, &device);
    }

    #[test]
    fn test_dequeue_without_queued_buffers_fails_fast() {
        let (_device, pool) = setup(2);
        let err = pool.dequeue(WAIT).err().unwrap();
        assert!(matches!(err, CameraError::InvalidState(_)));
    }

    #[test]
    fn test_lease_returns_slot_once() {
        let (device, pool) = setup(2);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        let ticket = pool.lend(&slot).unwrap();
        assert_eq!(pool.counts().lent, 1);

        pool.return_lease(ticket).unwrap();
        pool.return_lease(ticket).unwrap();
        assert_eq!(pool.counts().queued, 2);
        assert_balanced(&pool, &device);
    }

    #[test]
    fn test_requeue_by_handle_cancels_lease() {
        let device = VirtualDevice::builder().fps(500).build();
        let pool = BufferPool::new(device.clone());
        pool.allocate(2, MemoryKind::Mmap).unwrap();
        pool.map_all(&[ExternalBuffer::keyed(100), ExternalBuffer::keyed(101)])
            .unwrap();
        assert_eq!(pool.index_of(101), Some(1));
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();

        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        let ticket = pool.lend(&slot).unwrap();
        pool.requeue_handle(slot.key).unwrap();

        // The slot comes back and is lent again; the old ticket must not touch it.
        let again = loop {
            let s = pool.dequeue(WAIT).unwrap().unwrap();
            if s.index == slot.index {
                break s;
            }
            pool.requeue(s.index).unwrap();
        };
        let _fresh = pool.lend(&again).unwrap();
        pool.return_lease(ticket).unwrap();
        assert_eq!(pool.slot_state(again.index), Some(SlotState::Held { lease: Some(1) }));
    }

    #[test]
    fn test_release_invalidates_leases() {
        let (device, pool) = setup(2);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        let ticket = pool.lend(&slot).unwrap();

        device.stream_off().unwrap();
        pool.release().unwrap();
        assert_eq!(device.buffer_count(), 0);
        pool.return_lease(ticket).unwrap();
        assert_eq!(pool.counts(), PoolCounts::default());
        assert_eq!(pool.generation(), 1);
    }

    #[test]
    fn test_unmap_keeps_lent_slots() {
        let (device, pool) = setup(3);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        let ticket = pool.lend(&slot).unwrap();

        device.stream_off().unwrap();
        pool.unmap_all();
        assert!(!pool.is_mapped(0));
        let c = pool.counts();
        assert_eq!((c.queued, c.held, c.lent), (0, 3, 1));

        // Returned while stopped: unlent but not queued.
        pool.return_lease(ticket).unwrap();
        assert_eq!(pool.counts().queued, 0);
        assert_eq!(pool.counts().lent, 0);

        pool.remap().unwrap();
        assert_eq!(pool.queue_idle().unwrap(), 3);
        assert_balanced(&pool, &device);
    }

    #[test]
    fn test_start_skips_lent_slots() {
        let (device, pool) = setup(3);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();
        let _ticket = pool.lend(&slot).unwrap();

        device.stream_off().unwrap();
        pool.unmap_all();
        pool.remap().unwrap();
        assert_eq!(pool.queue_idle().unwrap(), 2);
        assert_balanced(&pool, &device);
    }

    #[test]
    fn test_dmabuf_requires_handle() {
        let device = VirtualDevice::builder().build();
        let pool = BufferPool::new(device);
        pool.allocate(1, MemoryKind::DmaBuf).unwrap();
        let err = pool.map_slot(0, None).unwrap_err();
        assert!(matches!(err, CameraError::InvalidParameter { .. }));
    }

    #[test]
    fn test_closed_pool_refuses_traffic() {
        let (device, pool) = setup(2);
        pool.queue_idle().unwrap();
        device.stream_on().unwrap();
        let slot = pool.dequeue(WAIT).unwrap().unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.requeue(slot.index), Err(CameraError::SessionClosed)));
        assert!(matches!(pool.dequeue(WAIT), Err(CameraError::SessionClosed)));
        assert!(matches!(pool.requeue_handle(slot.key), Err(CameraError::SessionClosed)));
        assert_eq!(pool.counts().total, 0);
    }

    #[test]
    fn test_allocate_twice_rejected() {
        let (_device, pool) = setup(2);
        let err = pool.allocate(2, MemoryKind::Mmap).unwrap_err();
        assert!(matches!(err, CameraError::InvalidState(_)));
    }
}
