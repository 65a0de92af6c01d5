// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A mock kernel for exercising the engine on the host.
//!
//! Every test runs on its own thread, so the mock keeps its state in a
//! thread local: guest entries are scripted as closures run in place of the
//! trampoline, and every call that matters is recorded in `call_log`.

use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    cell::RefCell,
    collections::{HashMap, VecDeque},
    string::{String, ToString},
    sync::{
        Arc, Condvar, Mutex, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
    vec::Vec,
};

use axerrno::{AxError, AxResult};

use crate::{
    El2Registry, Guest,
    addr::{GuestPhysAddr, HostPhysAddr, HostVirtAddr, PAGE_SIZE_4K},
    decode::{ec, make_esr, sys_reg},
    dispatch::psci,
    exit::GuestPacket,
    hal::{
        CpuMask, El2Hal, GuestAddrSpace, GuestEntry, HostEvent, MemRegion, MemRegionKind,
        ThreadId, ThreadObserver,
    },
    percpu::{cpu_bit, cpus_in},
    regs::El2State,
    trap::PacketPort,
    vgic::GichRegs,
};


/// One scripted guest entry: runs in place of the trampoline.
pub(crate) type ScriptedEntry = Box<dyn FnMut(&mut El2State, &mut GichRegs) -> GuestEntry>;

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(1);

pub(crate) const CODE_BASE: usize = 0x4000_0000;
pub(crate) const CODE_SIZE: usize = 0x20_0000;
pub(crate) const RAM_BASE: usize = CODE_BASE + CODE_SIZE;
pub(crate) const RAM_SIZE: usize = 0x8000_0000 - RAM_BASE;
pub(crate) const MMIO_BASE: usize = 0x9000_0000;
pub(crate) const MMIO_SIZE: usize = 0x3000;

pub(crate) const DEFAULT_ASPACE_SIZE: usize = 1 << 30;

pub(crate) struct MockState {
    pub el2_supported: bool,
    pub max_cpus: usize,
    pub online: CpuMask,
    pub current_cpu: usize,
    pub thread: ThreadId,
    pub killed: bool,
    /// CPUs on which `el2_on` fails.
    pub el2_on_fail: CpuMask,
    pub call_log: Vec<String>,
    pub ipis: Vec<CpuMask>,
    pub observers: Vec<(ThreadId, Weak<dyn ThreadObserver>)>,
    /// Outstanding page allocations, base address to page count.
    pub pages: HashMap<usize, usize>,
    pub regions: Vec<MemRegion>,
    pub entries_script: VecDeque<ScriptedEntry>,
    /// `(vttbr, hcr)` of every guest entry.
    pub entries: Vec<(u64, u64)>,
    /// The virtual interface registers as the controller holds them.
    pub gich_hw: GichRegs,
    pub num_lrs: usize,
    pub priority_bits: u8,
    pub gicv: Option<HostPhysAddr>,
    pub irq_disabled: bool,
    pub ticks: u64,
    /// Deadline of every blocking wait on a host event.
    pub waits: Vec<Option<u64>>,
    pub aspace_size: usize,
    pub fail_new_addr_space: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            el2_supported: true,
            max_cpus: 4,
            online: 0b1111,
            current_cpu: 0,
            thread: NEXT_THREAD.fetch_add(1, Ordering::Relaxed),
            killed: false,
            el2_on_fail: 0,
            call_log: Vec::new(),
            ipis: Vec::new(),
            observers: Vec::new(),
            pages: HashMap::new(),
            regions: vec![
                MemRegion {
                    base: HostPhysAddr::from_usize(CODE_BASE),
                    size: CODE_SIZE,
                    kind: MemRegionKind::Code,
                },
                MemRegion {
                    base: HostPhysAddr::from_usize(RAM_BASE),
                    size: RAM_SIZE,
                    kind: MemRegionKind::Data,
                },
                MemRegion {
                    base: HostPhysAddr::from_usize(MMIO_BASE),
                    size: MMIO_SIZE,
                    kind: MemRegionKind::Data,
                },
            ],
            entries_script: VecDeque::new(),
            entries: Vec::new(),
            gich_hw: GichRegs::default(),
            num_lrs: 4,
            priority_bits: 5,
            gicv: None,
            irq_disabled: false,
            ticks: 0,
            waits: Vec::new(),
            aspace_size: DEFAULT_ASPACE_SIZE,
            fail_new_addr_space: false,
        }
    }
}

thread_local! {
    static MOCK: RefCell<MockState> = RefCell::new(MockState::default());
}

/// Runs `f` on this thread's mock state.
pub(crate) fn with_mock<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    MOCK.with(|mock| f(&mut mock.borrow_mut()))
}

pub(crate) fn call_log() -> Vec<String> {
    with_mock(|m| m.call_log.clone())
}

/// Number of outstanding allocations of exactly `num_pages` pages.
pub(crate) fn allocations_of(num_pages: usize) -> usize {
    with_mock(|m| m.pages.values().filter(|&&n| n == num_pages).count())
}

pub(crate) fn outstanding_pages() -> usize {
    with_mock(|m| m.pages.len())
}

/// Moves the current thread to `cpu`, notifying observers.
pub(crate) fn migrate_current_thread(cpu: usize) {
    let (thread, observers) = with_mock(|m| {
        m.current_cpu = cpu;
        (m.thread, m.observers.clone())
    });
    for (_, observer) in observers.iter().filter(|(t, _)| *t == thread) {
        if let Some(observer) = observer.upgrade() {
            observer.migrated(cpu);
        }
    }
}

/// Tells observers the current thread is exiting.
pub(crate) fn exit_current_thread() {
    let (thread, observers) = with_mock(|m| (m.thread, m.observers.clone()));
    for (_, observer) in observers.iter().filter(|(t, _)| *t == thread) {
        if let Some(observer) = observer.upgrade() {
            observer.exited();
        }
    }
}

/// Queues a guest entry.
pub(crate) fn script(entry: impl FnMut(&mut El2State, &mut GichRegs) -> GuestEntry + 'static) {
    with_mock(|m| m.entries_script.push_back(Box::new(entry)));
}

/// Queues a guest entry that traps with the given syndrome.
pub(crate) fn script_trap(esr: u64, far: u64, hpfar: u64) {
    script(move |state, _| {
        state.guest_state.esr_el2 = esr;
        state.guest_state.far_el2 = far;
        state.guest_state.hpfar_el2 = hpfar;
        GuestEntry::Trapped
    });
}

/// Queues a guest entry that makes a PSCI call.
pub(crate) fn script_psci(function: u32, x1: u64, x2: u64) {
    script(move |state, _| {
        state.guest_state.x[0] = function as u64;
        state.guest_state.x[1] = x1;
        state.guest_state.x[2] = x2;
        state.guest_state.esr_el2 = make_esr(ec::SMC64, 0);
        GuestEntry::Trapped
    });
}

/// Makes the guest call PSCI CPU_OFF.
pub(crate) fn power_off(state: &mut El2State) -> GuestEntry {
    state.guest_state.x[0] = psci::CPU_OFF as u64;
    state.guest_state.esr_el2 = smc_esr(0);
    GuestEntry::Trapped
}

pub(crate) fn script_cpu_off() {
    script(|state, _| power_off(state));
}

pub(crate) fn wfx_esr(is_wfe: bool) -> u64 {
    make_esr(ec::WFX, is_wfe as u64)
}

pub(crate) fn smc_esr(imm: u16) -> u64 {
    make_esr(ec::SMC64, imm as u64)
}

/// ESR of an MSR/MRS of the register `encoding` through `rt`.
pub(crate) fn sys_esr(encoding: u32, rt: u8, read: bool) -> u64 {
    let op0 = (encoding >> 14) as u64 & 0b11;
    let op1 = (encoding >> 11) as u64 & 0b111;
    let crn = (encoding >> 7) as u64 & 0b1111;
    let crm = (encoding >> 3) as u64 & 0b1111;
    let op2 = encoding as u64 & 0b111;
    let iss = op0 << 20
        | op2 << 17
        | op1 << 14
        | crn << 10
        | (rt as u64) << 5
        | crm << 1
        | read as u64;
    make_esr(ec::SYSTEM, iss)
}

/// ESR of a stage-2 data abort. `size_log2` is the SAS field.
pub(crate) fn dabt_esr(valid: bool, size_log2: u64, sign_extend: bool, rt: u8, write: bool) -> u64 {
    let iss = (valid as u64) << 24
        | size_log2 << 22
        | (sign_extend as u64) << 21
        | (rt as u64) << 16
        | (write as u64) << 6;
    make_esr(ec::DABT_LOWER, iss)
}

pub(crate) fn iabt_esr() -> u64 {
    make_esr(ec::IABT_LOWER, 0)
}

/// HPFAR_EL2 value reporting the page of `ipa`.
pub(crate) fn hpfar_of(ipa: usize) -> u64 {
    ((ipa & !(PAGE_SIZE_4K - 1)) >> 8) as u64
}

pub(crate) const SCTLR_EL1: u32 = sys_reg(3, 0, 1, 0, 0);

pub(crate) struct MockHal;

impl El2Hal for MockHal {
    type AddrSpace = MockAddrSpace;
    type Event = MockEvent;

    fn el2_supported() -> bool {
        with_mock(|m| m.el2_supported)
    }

    fn max_cpus() -> usize {
        with_mock(|m| m.max_cpus)
    }

    fn online_cpus() -> CpuMask {
        with_mock(|m| m.online)
    }

    fn current_cpu() -> usize {
        with_mock(|m| m.current_cpu)
    }

    fn sync_exec(mask: CpuMask, task: &(dyn Fn(usize) -> AxResult + Sync)) -> CpuMask {
        let saved = with_mock(|m| {
            m.call_log.push(format!("sync_exec({:#x})", mask));
            m.current_cpu
        });
        let mut done = 0;
        for cpu in cpus_in(mask) {
            with_mock(|m| m.current_cpu = cpu);
            if task(cpu).is_ok() {
                done |= cpu_bit(cpu);
            }
        }
        with_mock(|m| m.current_cpu = saved);
        done
    }

    fn send_ipi(mask: CpuMask) {
        with_mock(|m| m.ipis.push(mask));
    }

    fn current_thread() -> ThreadId {
        with_mock(|m| m.thread)
    }

    fn thread_killed() -> bool {
        with_mock(|m| m.killed)
    }

    fn watch_thread(thread: ThreadId, observer: Weak<dyn ThreadObserver>) {
        with_mock(|m| m.observers.push((thread, observer)));
    }

    fn irq_save() -> usize {
        with_mock(|m| core::mem::replace(&mut m.irq_disabled, true) as usize)
    }

    fn irq_restore(state: usize) {
        with_mock(|m| m.irq_disabled = state != 0);
    }

    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr> {
        let layout = Layout::from_size_align(num_pages * PAGE_SIZE_4K, PAGE_SIZE_4K).ok()?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        with_mock(|m| m.pages.insert(ptr as usize, num_pages));
        Some(HostPhysAddr::from_usize(ptr as usize))
    }

    fn dealloc_pages(paddr: HostPhysAddr, num_pages: usize) {
        with_mock(|m| m.pages.remove(&paddr.as_usize()));
        let layout = Layout::from_size_align(num_pages * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap();
        // SAFETY: `paddr` came from `alloc_pages` with the same page count.
        unsafe { dealloc(paddr.as_usize() as *mut u8, layout) };
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from_usize(paddr.as_usize())
    }

    fn memory_regions() -> Vec<MemRegion> {
        with_mock(|m| m.regions.clone())
    }

    fn el2_on(ttbr0: HostPhysAddr, stack_top: HostPhysAddr) -> AxResult {
        with_mock(|m| {
            let cpu = m.current_cpu;
            assert_ne!(ttbr0.as_usize(), 0);
            assert_ne!(stack_top.as_usize(), 0);
            m.call_log.push(format!("el2_on({})", cpu));
            if m.el2_on_fail & cpu_bit(cpu) != 0 {
                Err(AxError::BadState)
            } else {
                Ok(())
            }
        })
    }

    fn el2_off() -> AxResult {
        with_mock(|m| {
            let cpu = m.current_cpu;
            m.call_log.push(format!("el2_off({})", cpu));
        });
        Ok(())
    }

    fn resume_guest(vttbr: u64, state: &mut El2State, hcr: u64) -> GuestEntry {
        let (mut entry, mut hw) = with_mock(|m| {
            assert!(m.irq_disabled, "guest entered with interrupts enabled");
            m.entries.push((vttbr, hcr));
            let entry = m
                .entries_script
                .pop_front()
                .expect("guest entered with nothing scripted");
            (entry, m.gich_hw.clone())
        });
        let result = entry(state, &mut hw);
        with_mock(|m| m.gich_hw = hw);
        result
    }

    fn gich_num_lrs() -> usize {
        with_mock(|m| m.num_lrs)
    }

    fn gich_priority_bits() -> u8 {
        with_mock(|m| m.priority_bits)
    }

    fn gich_read(regs: &mut GichRegs) {
        with_mock(|m| *regs = m.gich_hw.clone());
    }

    fn gich_write(regs: &GichRegs) {
        with_mock(|m| m.gich_hw = regs.clone());
    }

    fn gicv_paddr() -> Option<HostPhysAddr> {
        with_mock(|m| m.gicv)
    }

    fn current_ticks() -> u64 {
        with_mock(|m| m.ticks)
    }

    fn new_addr_space(vmid: u8) -> AxResult<MockAddrSpace> {
        let (fail, size) = with_mock(|m| (m.fail_new_addr_space, m.aspace_size));
        if fail {
            return Err(AxError::NoMemory);
        }
        Ok(MockAddrSpace::new(vmid, size))
    }
}

/// Guest address space that records every operation.
pub(crate) struct MockAddrSpace {
    vmid: u8,
    size: usize,
    ops: Mutex<Vec<String>>,
    pub fail_resolve: AtomicBool,
}

impl MockAddrSpace {
    pub fn new(vmid: u8, size: usize) -> Self {
        Self {
            vmid,
            size,
            ops: Mutex::new(Vec::new()),
            fail_resolve: AtomicBool::new(false),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// How many recorded operations start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl GuestAddrSpace for MockAddrSpace {
    fn size(&self) -> usize {
        self.size
    }

    fn root_paddr(&self) -> HostPhysAddr {
        HostPhysAddr::from_usize(0x4_0000_0000 + ((self.vmid as usize) << 12))
    }

    fn resolve_fault(&self, addr: GuestPhysAddr) -> AxResult {
        self.record(format!("resolve_fault({:#x})", addr.as_usize()));
        if self.fail_resolve.load(Ordering::Relaxed) {
            return Err(AxError::NoMemory);
        }
        Ok(())
    }

    fn unmap_range(&self, addr: GuestPhysAddr, len: usize) -> AxResult {
        self.record(format!("unmap_range({:#x}, {:#x})", addr.as_usize(), len));
        Ok(())
    }

    fn map_host_range(&self, addr: GuestPhysAddr, host: HostPhysAddr, len: usize) -> AxResult {
        self.record(format!(
            "map_host_range({:#x}, {:#x}, {:#x})",
            addr.as_usize(),
            host.as_usize(),
            len
        ));
        Ok(())
    }

    fn clean_invalidate_cache(&self) {
        self.record("clean_invalidate_cache".to_string());
    }
}

/// Auto-reset event. A deadline wait completes immediately by advancing
/// the mock clock to the deadline, as if the timer fired.
pub(crate) struct MockEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl HostEvent for MockEvent {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Option<u64>) -> bool {
        with_mock(|m| m.waits.push(deadline));
        let mut signaled = self.signaled.lock().unwrap();
        if let Some(deadline) = deadline {
            if core::mem::take(&mut *signaled) {
                return true;
            }
            with_mock(|m| m.ticks = m.ticks.max(deadline));
            return false;
        }
        while !*signaled {
            let (guard, timeout) = self
                .cond
                .wait_timeout(signaled, Duration::from_secs(5))
                .unwrap();
            signaled = guard;
            assert!(!timeout.timed_out() || *signaled, "event never signaled");
        }
        *signaled = false;
        true
    }
}

/// A packet port that keeps everything queued on it.
#[derive(Default)]
pub(crate) struct RecordingPort {
    packets: Mutex<Vec<GuestPacket>>,
}

impl RecordingPort {
    pub fn packets(&self) -> Vec<GuestPacket> {
        self.packets.lock().unwrap().clone()
    }
}

impl PacketPort for RecordingPort {
    fn queue(&self, packet: GuestPacket) -> AxResult {
        self.packets.lock().unwrap().push(packet);
        Ok(())
    }
}

pub(crate) fn new_registry() -> Arc<El2Registry<MockHal>> {
    Arc::new(El2Registry::new())
}

pub(crate) fn new_guest() -> (Arc<El2Registry<MockHal>>, Arc<Guest<MockHal>>) {
    let registry = new_registry();
    let guest = Guest::create(&registry).unwrap();
    (registry, guest)
}
