//! SMP Module
//!
//! Symmetric Multi-Processing bring-up:
//! - Per-CPU registry and kernel stack assignment (`percpu`)
//! - AP bootstrap (INIT-SIPI-SIPI) and AP entry (`bootstrap`)
//! - Timing and stack layout (`config`)

pub mod bootstrap;
pub mod config;
pub mod percpu;

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::info;
use spin::Mutex;
use x86_64::VirtAddr;

pub use bootstrap::{
    ApState, BootstrapBlock, BringupReport, Platform, Sequencer, ap_handoff, ap_kernel_entry,
};
pub use config::BringupConfig;
pub use percpu::{BringupContext, ProcessorDescriptor};

use crate::error::{GeneralError, KernelResult};
use crate::io::apic::{InterruptController, LocalApic};
use crate::time::{PitSleep, Sleep};

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 64;

/// Ordered local APIC IDs of the discovered processors, BSP included
pub trait TopologySource {
    fn len(&self) -> usize;

    fn controller_id(&self, index: usize) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TopologySource for [u32] {
    fn len(&self) -> usize {
        <[u32]>::len(self)
    }

    fn controller_id(&self, index: usize) -> u32 {
        self[index]
    }
}

impl<const N: usize> TopologySource for [u32; N] {
    fn len(&self) -> usize {
        N
    }

    fn controller_id(&self, index: usize) -> u32 {
        self[index]
    }
}

/// Set by a starting AP once it runs kernel code; consumed by the BSP
#[derive(Debug, Default)]
pub struct AliveFlag(AtomicBool);

impl AliveFlag {
    pub const fn new() -> Self {
        AliveFlag(AtomicBool::new(false))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Observe the flag and reset it in one step
    pub fn check_and_clear(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Global state
// ============================================================================

/// Alive flag shared with `ap_kernel_entry`
pub static AP_ALIVE: AliveFlag = AliveFlag::new();

/// Virtual address of the local APIC page, published for the APs
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Running CPU count after bring-up (1 until then)
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

static CONTEXT: Mutex<Option<BringupContext<MAX_CPUS>>> = Mutex::new(None);

/// Local APIC of the calling processor
///
/// # Safety
/// `init_smp` must have published a mapped local APIC base.
pub(crate) unsafe fn local_apic() -> LocalApic {
    let base = VirtAddr::new_truncate(LAPIC_BASE.load(Ordering::Acquire));
    // SAFETY: guaranteed by the caller.
    unsafe { LocalApic::new(base) }
}

/// Get total CPU count (BSP + started APs)
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Descriptor of running CPU `index`
pub fn descriptor(index: usize) -> Option<ProcessorDescriptor> {
    CONTEXT.lock().as_ref()?.descriptor(index)
}

/// Bring up every processor in `topology` from the calling BSP
///
/// Runs once; a second call fails with `AlreadyInitialized`.
///
/// # Safety
/// `lapic_base` must map this processor's local APIC uncached, the PIT must
/// be free for busy-waiting, and `platform` must place a working trampoline.
pub unsafe fn init_smp<T, P>(
    topology: &T,
    platform: P,
    lapic_base: VirtAddr,
    config: BringupConfig,
) -> KernelResult<BringupReport>
where
    T: TopologySource + ?Sized,
    P: Platform,
{
    if CONTEXT.lock().is_some() {
        return Err(GeneralError::AlreadyInitialized.into());
    }

    LAPIC_BASE.store(lapic_base.as_u64(), Ordering::Release);
    // SAFETY: guaranteed by the caller.
    let (lapic, sleep) = unsafe { (LocalApic::new(lapic_base), PitSleep::new()) };
    let bsp_id = lapic.id();

    init_smp_with(topology, platform, lapic, bsp_id, sleep, config)
}

/// `init_smp` over explicit controller and timer capabilities
///
/// Registers `bsp_lapic_id` as CPU 0, runs the sequencer against the shared
/// alive flag, then publishes the registry and the running count.
pub fn init_smp_with<T, P, C, S>(
    topology: &T,
    mut platform: P,
    lapic: C,
    bsp_lapic_id: u32,
    sleep: S,
    config: BringupConfig,
) -> KernelResult<BringupReport>
where
    T: TopologySource + ?Sized,
    P: Platform,
    C: InterruptController,
    S: Sleep,
{
    let mut guard = CONTEXT.lock();
    if guard.is_some() {
        return Err(GeneralError::AlreadyInitialized.into());
    }

    info!(
        "[SMP] {} processor(s) discovered, BSP LAPIC {}",
        topology.len(),
        bsp_lapic_id
    );

    let ctx = guard.insert(BringupContext::new(config.stack_top, config.stack_size));
    ctx.init_bsp(bsp_lapic_id, &mut platform);

    let report = Sequencer::new(lapic, sleep, platform, &AP_ALIVE, config).run(ctx, topology);
    CPU_COUNT.store(ctx.running_count(), Ordering::Release);

    Ok(report)
}
