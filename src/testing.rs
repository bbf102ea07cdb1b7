//! Host-side fakes for the hardware capability traits

use core::cell::Cell;

use x86_64::structures::paging::PhysFrame;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::AcpiError;
use crate::io::acpi::tables::{RSDP_SIGNATURE, checksum};
use crate::io::apic::{InterruptController, LapicRegister};
use crate::io::memory::PhysicalMemory;
use crate::smp::AliveFlag;
use crate::smp::bootstrap::{BootstrapBlock, Platform};
use crate::smp::percpu::ProcessorDescriptor;
use crate::time::Sleep;

/// Zero-filled physical memory window `[base, base + size)`
pub struct FirmwareImage {
    base: u64,
    bytes: Vec<u8>,
    reads: Cell<usize>,
}

impl FirmwareImage {
    pub fn new(base: u64, size: usize) -> Self {
        FirmwareImage {
            base,
            bytes: vec![0; size],
            reads: Cell::new(0),
        }
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let start = (addr - self.base) as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    /// Raw contents, for mapping the image at a virtual offset
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of `read` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    /// Write an SDT with a correct checksum
    pub fn place_table(&mut self, addr: u64, signature: &[u8; 4], body: &[u8]) {
        let length = 36 + body.len();
        let mut table = vec![0u8; length];
        table[..4].copy_from_slice(signature);
        table[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        table[8] = 1;
        table[10..16].copy_from_slice(b"RANYOS");
        table[16..24].copy_from_slice(b"EXORUST ");
        table[36..].copy_from_slice(body);
        table[9] = 0u8.wrapping_sub(checksum(&table));
        self.write(addr, &table);
    }

    /// Write a revision 0 RSDP
    pub fn place_rsdp_v1(&mut self, addr: u64, rsdt: u32) {
        let mut rsdp = [0u8; 20];
        rsdp[..8].copy_from_slice(RSDP_SIGNATURE);
        rsdp[9..15].copy_from_slice(b"RANYOS");
        rsdp[16..20].copy_from_slice(&rsdt.to_le_bytes());
        rsdp[8] = 0u8.wrapping_sub(checksum(&rsdp));
        self.write(addr, &rsdp);
    }

    /// Write a revision 2 RSDP with both checksums set
    pub fn place_rsdp_v2(&mut self, addr: u64, rsdt: u32, xsdt: u64) {
        let mut rsdp = [0u8; 36];
        rsdp[..8].copy_from_slice(RSDP_SIGNATURE);
        rsdp[9..15].copy_from_slice(b"RANYOS");
        rsdp[15] = 2;
        rsdp[16..20].copy_from_slice(&rsdt.to_le_bytes());
        rsdp[20..24].copy_from_slice(&36u32.to_le_bytes());
        rsdp[24..32].copy_from_slice(&xsdt.to_le_bytes());
        rsdp[8] = 0u8.wrapping_sub(checksum(&rsdp[..20]));
        rsdp[32] = 0u8.wrapping_sub(checksum(&rsdp));
        self.write(addr, &rsdp);
    }
}

impl PhysicalMemory for FirmwareImage {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), AcpiError> {
        self.reads.set(self.reads.get() + 1);
        let start = addr
            .as_u64()
            .checked_sub(self.base)
            .ok_or(AcpiError::UnmappedMemory)? as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(AcpiError::UnmappedMemory);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// When a simulated AP sets the alive flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Never,
    FirstStartup,
    SecondStartup,
}

/// Interrupt controller that records writes and simulates AP startup
pub struct RecordingApic<'a> {
    pub writes: Vec<(LapicRegister, u32)>,
    pub enabled: usize,
    alive: Option<&'a AliveFlag>,
    default_ack: Ack,
    overrides: Vec<(u32, Ack)>,
    startups: Vec<(u32, usize)>,
    destination: u32,
}

impl RecordingApic<'static> {
    pub fn new() -> Self {
        RecordingApic {
            writes: Vec::new(),
            enabled: 0,
            alive: None,
            default_ack: Ack::Never,
            overrides: Vec::new(),
            startups: Vec::new(),
            destination: 0,
        }
    }
}

impl<'a> RecordingApic<'a> {
    /// Every destination answers according to `default_ack`
    pub fn with_alive(alive: &'a AliveFlag, default_ack: Ack) -> Self {
        RecordingApic {
            alive: Some(alive),
            default_ack,
            ..RecordingApic::new()
        }
    }

    pub fn acknowledge(mut self, destination: u32, ack: Ack) -> Self {
        self.overrides.push((destination, ack));
        self
    }

    /// `(destination, icr_low)` for every command issued
    pub fn sent(&self) -> Vec<(u32, u32)> {
        let mut destination = 0;
        let mut sent = Vec::new();
        for &(register, value) in &self.writes {
            match register {
                LapicRegister::IcrHigh => destination = value >> 24,
                LapicRegister::IcrLow => sent.push((destination, value)),
                _ => {}
            }
        }
        sent
    }

    fn policy(&self, destination: u32) -> Ack {
        self.overrides
            .iter()
            .find(|(id, _)| *id == destination)
            .map_or(self.default_ack, |&(_, ack)| ack)
    }

    fn on_startup(&mut self, destination: u32) {
        let count = match self.startups.iter_mut().find(|(id, _)| *id == destination) {
            Some((_, count)) => {
                *count += 1;
                *count
            }
            None => {
                self.startups.push((destination, 1));
                1
            }
        };

        let answers = match self.policy(destination) {
            Ack::Never => false,
            Ack::FirstStartup => count == 1,
            Ack::SecondStartup => count == 2,
        };
        if let (true, Some(alive)) = (answers, self.alive) {
            alive.signal();
        }
    }
}

impl InterruptController for RecordingApic<'_> {
    fn write(&mut self, register: LapicRegister, value: u32) {
        self.writes.push((register, value));
        match register {
            LapicRegister::IcrHigh => self.destination = value >> 24,
            LapicRegister::IcrLow if value & 0x700 == 0x600 => self.on_startup(self.destination),
            _ => {}
        }
    }

    fn enable(&mut self) {
        self.enabled += 1;
    }
}

/// Sleeper that records requested durations instead of waiting
#[derive(Debug, Default)]
pub struct RecordingSleep {
    pub calls: Vec<u64>,
}

impl RecordingSleep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sleep for RecordingSleep {
    fn sleep_ms(&mut self, ms: u64) {
        self.calls.push(ms);
    }
}

/// Memory-manager fake with a fixed page-table root and trampoline page
pub struct FakePlatform {
    pub root: PhysFrame,
    pub trampoline: PhysAddr,
    pub blocks: Vec<BootstrapBlock>,
    /// `(cpu_number, kernel_stack)` of every `load_cpu_local` call
    pub loaded: Vec<(u32, VirtAddr)>,
}

impl FakePlatform {
    pub fn new() -> Self {
        FakePlatform {
            root: PhysFrame::containing_address(PhysAddr::new(0x1000)),
            trampoline: PhysAddr::new(0x8000),
            blocks: Vec::new(),
            loaded: Vec::new(),
        }
    }

    pub fn with_trampoline(mut self, trampoline: PhysAddr) -> Self {
        self.trampoline = trampoline;
        self
    }
}

impl Platform for FakePlatform {
    fn page_table_root(&self) -> PhysFrame {
        self.root
    }

    fn prepare_trampoline(&mut self, block: &BootstrapBlock) -> PhysAddr {
        self.blocks.push(*block);
        self.trampoline
    }

    fn load_cpu_local(&mut self, descriptor: &ProcessorDescriptor, _tss: &TaskStateSegment) {
        self.loaded.push((descriptor.cpu_number, descriptor.kernel_stack));
    }
}
