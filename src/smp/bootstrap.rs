//! SMP Bootstrap Module
//!
//! Brings up Application Processors (APs) one at a time with the
//! INIT / STARTUP / STARTUP-retry handshake, then hands each started AP to
//! [`ap_kernel_entry`].

use alloc::vec::Vec;

use log::{debug, info, trace, warn};
use x86_64::structures::paging::PhysFrame;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::PhysAddr;

use super::config::BringupConfig;
use super::percpu::{BringupContext, ProcessorDescriptor};
use super::{AliveFlag, TopologySource};
use crate::error::SmpError;
use crate::io::apic::{InterruptController, Ipi, StartupVector, send_ipi};
use crate::time::Sleep;

/// AP bring-up state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApState {
    /// Descriptor and bootstrap block being prepared
    Idle = 0,
    /// INIT sent, settling
    InitSent = 1,
    /// First STARTUP sent
    StartupSent = 2,
    /// Polling the alive flag after the first STARTUP
    WaitingFlag = 3,
    /// AP is running kernel code
    Started = 4,
    /// Second STARTUP sent
    StartupRetried = 5,
    /// Polling the alive flag after the retry
    WaitingFlagRetry = 6,
    /// AP never answered; skipped
    Failed = 7,
}

impl ApState {
    /// Successor state. `alive` is the flag observation and only matters
    /// in the two waiting states.
    pub fn next(self, alive: bool) -> ApState {
        match self {
            ApState::Idle => ApState::InitSent,
            ApState::InitSent => ApState::StartupSent,
            ApState::StartupSent => ApState::WaitingFlag,
            ApState::WaitingFlag if alive => ApState::Started,
            ApState::WaitingFlag => ApState::StartupRetried,
            ApState::StartupRetried => ApState::WaitingFlagRetry,
            ApState::WaitingFlagRetry if alive => ApState::Started,
            ApState::WaitingFlagRetry => ApState::Failed,
            ApState::Started | ApState::Failed => self,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ApState::Started | ApState::Failed)
    }
}

/// Data the trampoline needs to reach [`ap_kernel_entry`]
///
/// Layout is shared with the real-mode trampoline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapBlock {
    /// Address of the 64-bit entry routine
    pub entry: u64,
    /// Physical address of the active PML4 (CR3)
    pub page_table: u64,
    /// Stack pointer for this AP
    pub stack_top: u64,
    /// This AP's descriptor, passed to the entry routine
    pub cpu_local: *const ProcessorDescriptor,
    /// This AP's task-state segment
    pub tss: *const TaskStateSegment,
}

/// Memory-manager services used during bring-up
pub trait Platform {
    /// Page-table root shared by every AP
    fn page_table_root(&self) -> PhysFrame;

    /// Copy the trampoline and `block` into low memory; returns the
    /// trampoline's physical address (page-aligned, below 1 MiB).
    fn prepare_trampoline(&mut self, block: &BootstrapBlock) -> PhysAddr;

    /// Install the calling CPU's per-CPU data and task-state segment
    fn load_cpu_local(&mut self, descriptor: &ProcessorDescriptor, tss: &TaskStateSegment);
}

impl<P: Platform + ?Sized> Platform for &mut P {
    fn page_table_root(&self) -> PhysFrame {
        (**self).page_table_root()
    }

    fn prepare_trampoline(&mut self, block: &BootstrapBlock) -> PhysAddr {
        (**self).prepare_trampoline(block)
    }

    fn load_cpu_local(&mut self, descriptor: &ProcessorDescriptor, tss: &TaskStateSegment) {
        (**self).load_cpu_local(descriptor, tss)
    }
}

/// Outcome of one bring-up pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringupReport {
    /// Candidates tried (BSP excluded)
    pub attempted: usize,
    /// Candidates that reached Started
    pub started: usize,
    /// LAPIC IDs of candidates that never answered
    pub failed: Vec<u32>,
}

/// Address of the entry routine placed in every bootstrap block
pub fn ap_entry_address() -> u64 {
    ap_kernel_entry as usize as u64
}

/// Drives the INIT/STARTUP handshake for each candidate, strictly in order
pub struct Sequencer<'a, C, S, P> {
    lapic: C,
    sleep: S,
    platform: P,
    alive: &'a AliveFlag,
    config: BringupConfig,
    entry: u64,
}

impl<'a, C, S, P> Sequencer<'a, C, S, P>
where
    C: InterruptController,
    S: Sleep,
    P: Platform,
{
    pub fn new(lapic: C, sleep: S, platform: P, alive: &'a AliveFlag, config: BringupConfig) -> Self {
        Sequencer {
            lapic,
            sleep,
            platform,
            alive,
            config,
            entry: ap_entry_address(),
        }
    }

    /// Idle step: write the descriptor and stage the bootstrap block
    fn prepare<const N: usize>(
        &mut self,
        ctx: &mut BringupContext<N>,
        index: usize,
        lapic_id: u32,
    ) -> Result<StartupVector, SmpError> {
        let stack_top = ctx.register(index, lapic_id).kernel_stack;

        let block = BootstrapBlock {
            entry: self.entry,
            page_table: self.platform.page_table_root().start_address().as_u64(),
            stack_top: stack_top.as_u64(),
            cpu_local: ctx.descriptor_ptr(index),
            tss: ctx.task_state_ptr(index),
        };

        let trampoline = self.platform.prepare_trampoline(&block);
        StartupVector::try_from(trampoline)
    }

    /// Bring up one AP as logical CPU `ctx.running_count()`.
    ///
    /// Returns the logical index on success. A failed candidate consumes no
    /// stack slice and its index goes to the next candidate.
    pub fn start_ap<const N: usize>(
        &mut self,
        ctx: &mut BringupContext<N>,
        lapic_id: u32,
    ) -> Result<usize, SmpError> {
        let index = ctx.running_count();
        let mut state = ApState::Idle;

        let vector = match self.prepare(ctx, index, lapic_id) {
            Ok(vector) => vector,
            Err(e) => {
                warn!("[SMP] CPU {} (LAPIC {}): {}", index, lapic_id, e);
                return Err(e);
            }
        };
        self.alive.clear();

        let mut alive = false;
        while !state.is_terminal() {
            state = state.next(alive);
            trace!("[SMP] LAPIC {}: {:?}", lapic_id, state);

            match state {
                ApState::InitSent => {
                    send_ipi(&mut self.lapic, Ipi::Init { destination: lapic_id });
                    self.sleep.sleep_ms(self.config.init_settle_ms);
                }
                ApState::StartupSent => {
                    send_ipi(&mut self.lapic, Ipi::Startup { destination: lapic_id, vector });
                    self.sleep.sleep_ms(self.config.startup_settle_ms);
                }
                ApState::StartupRetried => {
                    debug!("[SMP] LAPIC {} silent, resending STARTUP", lapic_id);
                    send_ipi(&mut self.lapic, Ipi::Startup { destination: lapic_id, vector });
                    self.sleep.sleep_ms(self.config.startup_retry_ms);
                }
                ApState::WaitingFlag | ApState::WaitingFlagRetry => {
                    alive = self.alive.check_and_clear();
                }
                ApState::Idle | ApState::Started | ApState::Failed => {}
            }
        }

        if state == ApState::Failed {
            warn!("[SMP] CPU {} (LAPIC {}) did not start", index, lapic_id);
            return Err(SmpError::StartupTimeout);
        }

        ctx.commit_started(index);
        info!("[SMP] CPU {} (LAPIC {}) started", index, lapic_id);
        self.sleep.sleep_ms(self.config.post_start_delay_ms);
        Ok(index)
    }

    /// Try every topology entry except the BSP's own LAPIC ID, then close
    /// the registry. Per-candidate failures never stop the pass.
    pub fn run<T, const N: usize>(&mut self, ctx: &mut BringupContext<N>, topology: &T) -> BringupReport
    where
        T: TopologySource + ?Sized,
    {
        assert!(ctx.has_bsp(), "smp: BSP must be registered before APs");
        let bsp_id = ctx.descriptor(0).map(|d| d.lapic_id);

        let mut report = BringupReport::default();
        for i in 0..topology.len() {
            let lapic_id = topology.controller_id(i);
            if Some(lapic_id) == bsp_id {
                debug!("[SMP] LAPIC {} is the BSP, skipping", lapic_id);
                continue;
            }
            report.attempted += 1;
            match self.start_ap(ctx, lapic_id) {
                Ok(_) => report.started += 1,
                Err(_) => report.failed.push(lapic_id),
            }
        }

        ctx.finish();
        info!("[SMP] Total CPUs: {}", ctx.running_count());
        report
    }

    pub fn into_parts(self) -> (C, S, P) {
        (self.lapic, self.sleep, self.platform)
    }
}

/// First kernel code run by a started AP, before it idles
pub fn ap_handoff<C: InterruptController + ?Sized>(
    descriptor: &ProcessorDescriptor,
    alive: &AliveFlag,
    lapic: &mut C,
) {
    alive.signal();
    lapic.enable();
    info!(
        "[SMP] CPU {} (LAPIC {}) online",
        descriptor.cpu_number, descriptor.lapic_id
    );
}

/// AP entry point (called from the trampoline in long mode on the AP's own
/// stack)
///
/// # Safety
/// `descriptor` must point at this AP's registered descriptor and the local
/// APIC base must have been published by `smp::init_smp`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ap_kernel_entry(descriptor: *const ProcessorDescriptor) -> ! {
    // SAFETY: the BSP wrote the descriptor before sending STARTUP and never
    // touches it again.
    let Some(descriptor) = (unsafe { descriptor.as_ref() }) else {
        crate::panic_handler::halt()
    };
    // SAFETY: guaranteed by the caller.
    let mut lapic = unsafe { super::local_apic() };

    ap_handoff(descriptor, &super::AP_ALIVE, &mut lapic);

    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
