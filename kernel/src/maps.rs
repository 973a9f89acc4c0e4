//! BPF map definitions for NFS tracing
//!
//! Defines the in-flight correlation maps, the completed-event queues
//! drained by userspace, and the adapters that expose them to the
//! correlation core as stores and sinks.

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    macros::map,
    maps::{Array, HashMap, PerCpuArray, Queue},
};
use nfsdig_common::{constants::*, types::*, CorrelationStore, EmitError, EventSink, StoreError};

// ============================================================================
// In-flight State
// ============================================================================

/// VFS read/write in flight, keyed by thread
#[map]
pub static IO_STARTS: HashMap<ThreadKey, IoStart> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// Client operations in flight, keyed by thread
#[map]
pub static OP_STARTS: HashMap<ThreadKey, OpStart> = HashMap::with_max_entries(MAX_OP_STARTS, 0);

/// Server operations in flight, keyed by (op, pid)
#[map]
pub static NFSD_OP_STARTS: HashMap<NfsdOpKey, NfsdOpStart> =
    HashMap::with_max_entries(MAX_ENTRIES, 0);

/// RPC tasks, keyed by (task id, client id); task id 0 until bound
#[map]
pub static RPC_TASKS: HashMap<RpcKey, RpcRecord> = HashMap::with_max_entries(MAX_ENTRIES, 0);

// ============================================================================
// IOPS Linking
// ============================================================================

/// pid -> start of the latest VFS I/O
#[map]
pub static LINK_BEGIN: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// task id -> I/O that caused the task
#[map]
pub static WAITING_RPC: HashMap<u32, RpcTaskInfo> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// pid -> start of an I/O whose RPC completed; drained by userspace
#[map]
pub static LINK_END: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

// ============================================================================
// Completed Events
// ============================================================================

#[map]
pub static IO_EVENTS: Queue<IoEvent> = Queue::with_max_entries(MAX_QUEUE_ENTRIES, 0);

#[map]
pub static OP_EVENTS: Queue<OpEvent> = Queue::with_max_entries(MAX_QUEUE_ENTRIES, 0);

#[map]
pub static NFSD_OP_EVENTS: Queue<NfsdOpEvent> = Queue::with_max_entries(MAX_QUEUE_ENTRIES, 0);

#[map]
pub static RPC_EVENTS: Queue<RpcRecord> = Queue::with_max_entries(MAX_QUEUE_ENTRIES, 0);

#[map]
pub static ERROR_EVENTS: Queue<ErrorEvent> = Queue::with_max_entries(MAX_QUEUE_ENTRIES, 0);

// ============================================================================
// Packet Classifier
// ============================================================================

/// One record per classified packet, keyed by PACKET_COUNTER
#[map]
pub static PACKET_RECORDS: HashMap<u32, PacketRecord> =
    HashMap::with_max_entries(MAX_PACKET_RECORDS, 0);

/// COMPOUND calls aggregated by transaction id
#[map]
pub static XID_RECORDS: HashMap<u32, PacketRecord> =
    HashMap::with_max_entries(MAX_PACKET_RECORDS, 0);

/// Next per-packet key (single element, updated atomically)
#[map]
pub static PACKET_COUNTER: Array<u32> = Array::with_max_entries(1, 0);

/// Running packet counters, summed over CPUs by userspace
#[map]
pub static PACKET_STATS: PerCpuArray<PacketStats> = PerCpuArray::with_max_entries(1, 0);

// ============================================================================
// Probe Health
// ============================================================================

/// Statistics counters (see STAT_* constants)
#[map]
pub static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_STATS, 0);

// ============================================================================
// Adapters
// ============================================================================

/// A BPF hash map seen as a correlation store
pub struct MapStore<K: 'static, V: 'static>(pub &'static HashMap<K, V>);

impl<K: 'static, V: Copy + 'static> CorrelationStore<K, V> for MapStore<K, V> {
    #[inline(always)]
    fn put(&mut self, key: &K, value: &V) -> Result<(), StoreError> {
        self.0.insert(key, value, 0).map_err(|_| StoreError::Full)
    }

    #[inline(always)]
    fn get(&self, key: &K) -> Option<V> {
        unsafe { self.0.get(key).copied() }
    }

    #[inline(always)]
    fn take(&mut self, key: &K) -> Option<V> {
        let value = unsafe { self.0.get(key).copied() }?;
        let _ = self.0.remove(key);
        Some(value)
    }

    #[inline(always)]
    fn get_or_init(&mut self, key: &K, default: &V) -> Option<V> {
        // Fails with EEXIST when another CPU got there first
        let _ = self.0.insert(key, default, BPF_NOEXIST as u64);
        self.get(key)
    }

    #[inline(always)]
    fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> Option<V> {
        let ptr = unsafe { self.0.get_ptr_mut(key) }?;
        unsafe {
            f(&mut *ptr);
            Some(*ptr)
        }
    }

    #[inline(always)]
    fn remove(&mut self, key: &K) {
        let _ = self.0.remove(key);
    }
}

/// A BPF queue seen as an event sink
pub struct QueueSink<T: 'static>(pub &'static Queue<T>);

impl<T: 'static> EventSink<T> for QueueSink<T> {
    #[inline(always)]
    fn push(&mut self, event: &T) -> Result<(), EmitError> {
        self.0.push(event, 0).map_err(|_| EmitError::Full)
    }
}
