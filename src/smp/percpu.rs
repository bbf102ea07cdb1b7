// ============================================================================
// src/smp/percpu.rs - Per-CPU Registry and Bring-up Context
// ============================================================================
//!
//! Fixed-capacity per-CPU descriptors, the kernel stack cursor and the
//! running CPU count, owned by one [`BringupContext`].
//!
//! Every mutation goes through `&mut BringupContext`, so only the holder of
//! the context (the BSP during bring-up) can write. On top of that the
//! context checks that a running processor's descriptor is never rewritten
//! and that nothing registers after bring-up has completed.

use core::ops::Range;

use log::trace;
use x86_64::VirtAddr;
use x86_64::structures::tss::TaskStateSegment;

use super::bootstrap::Platform;
use crate::panic_handler::escalate;

/// Per-CPU bookkeeping record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorDescriptor {
    /// Logical CPU number (0 = BSP)
    pub cpu_number: u32,
    /// Top of this CPU's kernel stack
    pub kernel_stack: VirtAddr,
    /// Process currently running on this CPU
    pub current_process: Option<u64>,
    /// Thread currently running on this CPU
    pub current_thread: Option<u64>,
    /// Local APIC ID
    pub lapic_id: u32,
    /// Scheduler must rebuild its per-CPU state
    pub reset_scheduler: bool,
}

impl ProcessorDescriptor {
    pub fn is_bsp(&self) -> bool {
        self.cpu_number == 0
    }

    /// Address range of the kernel stack slice, given the slice size
    pub fn stack_range(&self, stack_size: u64) -> Range<u64> {
        let top = self.kernel_stack.as_u64();
        top - stack_size..top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing registered yet; the BSP goes first
    Bsp,
    /// BSP running, APs being started
    Aps,
    /// Bring-up finished; the registry is read-only
    Complete,
}

/// Registry, stack cursor and running count for one bring-up pass
pub struct BringupContext<const N: usize> {
    descriptors: [Option<ProcessorDescriptor>; N],
    task_states: [TaskStateSegment; N],
    stack_cursor: VirtAddr,
    stack_size: u64,
    running: usize,
    phase: Phase,
}

impl<const N: usize> BringupContext<N> {
    /// `stack_top` is the top of the BSP's slice; each started CPU takes
    /// the next `stack_size` bytes below.
    pub fn new(stack_top: VirtAddr, stack_size: u64) -> Self {
        BringupContext {
            descriptors: [None; N],
            task_states: [const { TaskStateSegment::new() }; N],
            stack_cursor: stack_top,
            stack_size,
            running: 0,
            phase: Phase::Bsp,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Write the descriptor for `index` from the current stack cursor.
    ///
    /// An index at or beyond capacity escalates: the slot does not exist.
    pub fn register(&mut self, index: usize, lapic_id: u32) -> &ProcessorDescriptor {
        if index >= N {
            escalate("smp: CPU limit exceeded", self.running as u64, Some(&lapic_id));
        }
        assert!(
            self.phase != Phase::Complete,
            "smp: registry is read-only after bring-up"
        );
        assert!(
            index >= self.running,
            "smp: descriptor {} belongs to a running CPU",
            index
        );

        let stack = self.stack_cursor;
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = stack;
        self.task_states[index] = tss;

        trace!(
            "[SMP] Registered CPU {} (LAPIC {}) stack {:#x}",
            index,
            lapic_id,
            stack.as_u64()
        );

        self.descriptors[index].insert(ProcessorDescriptor {
            cpu_number: index as u32,
            kernel_stack: stack,
            current_process: None,
            current_thread: None,
            lapic_id,
            reset_scheduler: false,
        })
    }

    /// Mark the most recently registered CPU as running and consume its
    /// stack slice.
    pub fn commit_started(&mut self, index: usize) {
        assert_eq!(index, self.running, "smp: CPUs must start in index order");
        assert!(self.descriptors[index].is_some(), "smp: CPU {} not registered", index);

        self.stack_cursor -= self.stack_size;
        self.running += 1;
        self.phase = Phase::Aps;
    }

    /// Register the calling processor as CPU 0 and install its per-CPU state
    pub fn init_bsp<P: Platform + ?Sized>(&mut self, lapic_id: u32, platform: &mut P) {
        assert_eq!(self.phase, Phase::Bsp, "smp: BSP already registered");

        let descriptor = *self.register(0, lapic_id);
        platform.load_cpu_local(&descriptor, &self.task_states[0]);
        self.commit_started(0);
    }

    /// Close the registry; later registrations are rejected
    pub fn finish(&mut self) {
        self.phase = Phase::Complete;
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// BSP plus every AP that reached Started
    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn has_bsp(&self) -> bool {
        self.running > 0
    }

    /// Descriptor of a running CPU
    pub fn descriptor(&self, index: usize) -> Option<ProcessorDescriptor> {
        self.descriptors[..self.running].get(index).copied().flatten()
    }

    /// Descriptors of all running CPUs in logical order
    pub fn descriptors(&self) -> impl Iterator<Item = &ProcessorDescriptor> + '_ {
        self.descriptors[..self.running].iter().flatten()
    }

    /// Pointer to the descriptor slot handed to a starting AP
    pub(crate) fn descriptor_ptr(&self, index: usize) -> *const ProcessorDescriptor {
        self.descriptors[index]
            .as_ref()
            .map_or(core::ptr::null(), |d| d as *const _)
    }

    pub fn task_state(&self, index: usize) -> Option<&TaskStateSegment> {
        if index < self.running {
            self.task_states.get(index)
        } else {
            None
        }
    }

    pub(crate) fn task_state_ptr(&self, index: usize) -> *const TaskStateSegment {
        &self.task_states[index]
    }

    /// Top of the next unassigned stack slice
    pub fn stack_cursor(&self) -> VirtAddr {
        self.stack_cursor
    }

    pub fn stack_size(&self) -> u64 {
        self.stack_size
    }
}
