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

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use axerrno::{AxResult, ax_err, ax_err_type};

use crate::{
    addr::GuestPhysAddr,
    decode::ExceptionSyndrome,
    dispatch::{self, ExitAction, ExitContext, psci},
    exit::{GuestPacket, StartupAck, VcpuExit},
    guest::Guest,
    hal::{El2Hal, GuestAddrSpace, GuestEntry, HostEvent, IrqGuard, NO_THREAD, ThreadId, ThreadObserver},
    percpu::cpu_bit,
    regs::{El2State, HcrFlags, SPSR_EL1H_DAIF, VcpuRegs},
    vgic::{GichState, InterruptQueue, InterruptType, TIMER_VECTOR},
};

/// VMPIDR_EL2 bit 31 is RES1.
const VMPIDR_RES1: u64 = 1 << 31;

/// The lifecycle state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// Created on its thread, never entered.
    Unbound,
    /// Inside the resume loop.
    Running,
    /// Returned from the resume loop and may be resumed again.
    Exited,
    /// The guest powered the vCPU off; it can only be dropped.
    Stopped,
    /// A terminal status ended the vCPU's useful life; it can only be dropped.
    Failed,
}

/// The part of a vCPU other threads may touch: its interrupt queue and the
/// weak relation to the host thread running it.
struct VcpuShared<H: El2Hal> {
    vpid: u8,
    /// The bound host thread, or [`NO_THREAD`] once it has exited.
    thread: AtomicUsize,
    /// The CPU the bound thread last ran on, used to steer IPIs.
    last_cpu: AtomicUsize,
    /// Whether the vCPU is inside the guest right now.
    entered: AtomicBool,
    queue: InterruptQueue,
    /// Wakes the vCPU thread out of WFI emulation.
    event: H::Event,
}

impl<H: El2Hal> VcpuShared<H> {
    fn interrupt(&self, vector: u32, kind: InterruptType) -> AxResult {
        self.queue.push(vector, kind)?;
        self.event.signal();
        if self.entered.load(Ordering::Acquire) && self.thread.load(Ordering::Acquire) != NO_THREAD
        {
            let cpu = self.last_cpu.load(Ordering::Acquire);
            if cpu != H::current_cpu() {
                H::send_ipi(cpu_bit(cpu));
            }
        }
        Ok(())
    }
}

impl<H: El2Hal> ThreadObserver for VcpuShared<H> {
    fn migrated(&self, cpu: usize) {
        trace!("vcpu {}: thread migrated to CPU {}", self.vpid, cpu);
        self.last_cpu.store(cpu, Ordering::Release);
    }

    fn exited(&self) {
        trace!("vcpu {}: thread exited", self.vpid);
        self.thread.store(NO_THREAD, Ordering::Release);
    }
}

/// A handle for raising interrupts on a vCPU from any thread.
pub struct VcpuInterrupter<H: El2Hal> {
    shared: Arc<VcpuShared<H>>,
}

impl<H: El2Hal> VcpuInterrupter<H> {
    /// Raises `vector` on the vCPU.
    ///
    /// If the vCPU is currently inside the guest on another CPU, that CPU is
    /// kicked so the new interrupt is seen without waiting for the next exit.
    pub fn interrupt(&self, vector: u32, kind: InterruptType) -> AxResult {
        self.shared.interrupt(vector, kind)
    }

    pub fn vpid(&self) -> u8 {
        self.shared.vpid
    }
}

impl<H: El2Hal> Clone for VcpuInterrupter<H> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A virtual CPU of a [`Guest`], bound to the host thread that created it.
///
/// `Vcpu` is neither `Send` nor `Sync`: it is created, resumed and dropped on
/// one thread. Other threads raise interrupts through a
/// [`VcpuInterrupter`].
pub struct Vcpu<H: El2Hal> {
    guest: Weak<Guest<H>>,
    vpid: u8,
    /// The thread that created, and alone may run, this vCPU.
    thread: ThreadId,
    state: VcpuState,
    /// A CPU_ON request was surfaced and awaits the host's answer.
    awaiting_startup_ack: bool,
    hcr: HcrFlags,
    /// The register block shared with the trampoline.
    el2_state: Box<El2State>,
    gich: GichState,
    shared: Arc<VcpuShared<H>>,
    _not_send: PhantomData<*const ()>,
}

impl<H: El2Hal> Vcpu<H> {
    /// Creates a vCPU of `guest` bound to the calling thread, starting at
    /// `entry`.
    pub fn create(guest: &Arc<Guest<H>>, entry: GuestPhysAddr) -> AxResult<Self> {
        if entry.as_usize() >= guest.aspace().size() {
            return ax_err!(InvalidInput, "entry point outside the guest address space");
        }
        let gich = GichState::new(H::gich_num_lrs(), H::gich_priority_bits())?;
        let thread = H::current_thread();
        let vpid = guest.alloc_vpid()?;

        let mut el2_state = Box::<El2State>::default();
        let system_state = &mut el2_state.guest_state.system_state;
        system_state.elr_el2 = entry.as_usize() as u64;
        system_state.spsr_el2 = SPSR_EL1H_DAIF;
        system_state.vmpidr_el2 = VMPIDR_RES1 | (vpid - 1) as u64;

        let shared = Arc::new(VcpuShared::<H> {
            vpid,
            thread: AtomicUsize::new(thread),
            last_cpu: AtomicUsize::new(H::current_cpu()),
            entered: AtomicBool::new(false),
            queue: InterruptQueue::new(),
            event: H::Event::new(),
        });
        let weak = Arc::downgrade(&shared);
        let observer: Weak<dyn ThreadObserver> = weak;
        H::watch_thread(thread, observer);

        debug!("vcpu {}: created for VMID {} at {:?}", vpid, guest.vmid(), entry);
        Ok(Self {
            guest: Arc::downgrade(guest),
            vpid,
            thread,
            state: VcpuState::Unbound,
            awaiting_startup_ack: false,
            hcr: HcrFlags::GUEST_DEFAULT | HcrFlags::DC,
            el2_state,
            gich,
            shared,
            _not_send: PhantomData,
        })
    }

    pub fn vpid(&self) -> u8 {
        self.vpid
    }

    /// Get the lifecycle state of the vcpu.
    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Current HCR_EL2 value used for guest entry.
    pub fn hcr(&self) -> HcrFlags {
        self.hcr
    }

    pub fn gich(&self) -> &GichState {
        &self.gich
    }

    /// The CPU the bound thread last ran on.
    pub fn last_cpu(&self) -> usize {
        self.shared.last_cpu.load(Ordering::Acquire)
    }

    /// Whether the host thread is still bound.
    pub fn is_bound(&self) -> bool {
        self.shared.thread.load(Ordering::Acquire) != NO_THREAD
    }

    pub fn interrupter(&self) -> VcpuInterrupter<H> {
        VcpuInterrupter {
            shared: self.shared.clone(),
        }
    }

    /// Raises `vector` on this vCPU.
    pub fn interrupt(&self, vector: u32, kind: InterruptType) -> AxResult {
        self.shared.interrupt(vector, kind)
    }

    fn check_thread(&self) -> AxResult {
        if H::current_thread() != self.thread {
            return ax_err!(BadState, "vCPU used from a thread other than its own");
        }
        Ok(())
    }

    /// Runs the guest until an exit needs the caller.
    ///
    /// Blocks while the guest runs and while it waits for interrupts.
    /// Returns a [`VcpuExit`] when a packet needs handling, the guest stopped
    /// the vCPU, or the thread is being killed. An error is terminal: the
    /// vCPU moves to [`VcpuState::Failed`] and should be dropped. A stopped
    /// vCPU cannot be resumed either.
    pub fn resume(&mut self) -> AxResult<VcpuExit> {
        self.check_thread()?;
        if self.awaiting_startup_ack {
            return ax_err!(BadState, "CPU_ON request has not been acknowledged");
        }
        let guest = self
            .guest
            .upgrade()
            .ok_or_else(|| ax_err_type!(BadState, "guest was destroyed"))?;

        self.with_state_transition(&[VcpuState::Unbound, VcpuState::Exited], |vcpu| {
            vcpu.run(&guest)
        })
    }

    /// Execute a block with the state of the vcpu moved to `Running`. If the
    /// current state is not one of `from`, return an error.
    ///
    /// The state ends as [`VcpuState::Failed`] if the block fails or reports
    /// cancellation, as [`VcpuState::Stopped`] if the guest powered off, and
    /// as [`VcpuState::Exited`] otherwise.
    fn with_state_transition<F>(&mut self, from: &[VcpuState], f: F) -> AxResult<VcpuExit>
    where
        F: FnOnce(&mut Self) -> AxResult<VcpuExit>,
    {
        if !from.contains(&self.state) {
            return ax_err!(
                BadState,
                format!("vCPU state is not one of {:?}, but {:?}", from, self.state)
            );
        }
        self.state = VcpuState::Running;
        let result = f(self);
        self.state = match &result {
            Ok(VcpuExit::Packet(_)) => VcpuState::Exited,
            Ok(VcpuExit::Stopped) => VcpuState::Stopped,
            Ok(VcpuExit::Canceled) | Err(_) => VcpuState::Failed,
        };
        result
    }

    fn run(&mut self, guest: &Guest<H>) -> AxResult<VcpuExit> {
        let vttbr = guest.aspace().root_paddr().as_usize() as u64 | (guest.vmid() as u64) << 48;
        loop {
            if self.el2_state.guest_state.timer_expired(H::current_ticks()) {
                self.shared.queue.push(TIMER_VECTOR, InterruptType::Virtual)?;
            }
            self.gich.refill(&self.shared.queue);

            let entry = self.enter_guest(vttbr);
            self.gich.track_all_list_registers();

            if entry == GuestEntry::Trapped {
                let syndrome = ExceptionSyndrome::decode(self.el2_state.guest_state.esr_el2);
                let mut ctx = ExitContext::<H> {
                    hcr: &mut self.hcr,
                    guest_state: &mut self.el2_state.guest_state,
                    gich: &self.gich,
                    queue: &self.shared.queue,
                    event: &self.shared.event,
                    aspace: guest.aspace(),
                    traps: guest.traps(),
                    vpid: self.vpid,
                };
                match dispatch::handle_exit(syndrome, &mut ctx)? {
                    ExitAction::Continue => {}
                    ExitAction::Next(packet) => {
                        if matches!(packet, GuestPacket::VcpuStartup { .. }) {
                            self.awaiting_startup_ack = true;
                        }
                        return Ok(VcpuExit::Packet(packet));
                    }
                    ExitAction::Stop => {
                        debug!("vcpu {}: stopped by the guest", self.vpid);
                        return Ok(VcpuExit::Stopped);
                    }
                }
            }

            if H::thread_killed() {
                debug!("vcpu {}: thread killed, leaving the guest", self.vpid);
                return Ok(VcpuExit::Canceled);
            }
        }
    }

    /// Enters the guest once. The virtual interface state is only exchanged
    /// with the controller while interrupts are off and the vCPU is not
    /// marked as entered.
    fn enter_guest(&mut self, vttbr: u64) -> GuestEntry {
        let _irq = IrqGuard::<H>::new();
        H::gich_write(self.gich.regs());
        self.shared.last_cpu.store(H::current_cpu(), Ordering::Release);
        self.shared.entered.store(true, Ordering::Release);
        let entry = H::resume_guest(vttbr, &mut self.el2_state, self.hcr.bits());
        self.shared.entered.store(false, Ordering::Release);
        H::gich_read(self.gich.regs_mut());
        entry
    }

    /// Answers a [`GuestPacket::VcpuStartup`] request, completing the guest's
    /// CPU_ON call with the matching PSCI status.
    pub fn acknowledge_startup(&mut self, ack: StartupAck) -> AxResult {
        self.check_thread()?;
        if !self.awaiting_startup_ack {
            return ax_err!(BadState, "no CPU_ON request is outstanding");
        }
        let status = match ack {
            StartupAck::Started => psci::SUCCESS,
            StartupAck::AlreadyOn => psci::ALREADY_ON,
            StartupAck::InvalidTarget => psci::INVALID_PARAMETERS,
        };
        self.el2_state.guest_state.set_reg(0, status as u64);
        self.awaiting_startup_ack = false;
        Ok(())
    }

    /// Reads the general purpose registers, stack pointer and condition flags.
    pub fn read_state(&self) -> AxResult<VcpuRegs> {
        self.check_thread()?;
        Ok(VcpuRegs::read_from(&self.el2_state.guest_state))
    }

    /// Writes the general purpose registers, stack pointer and condition
    /// flags. Only the NZCV bits of `regs.cpsr` are applied.
    pub fn write_state(&mut self, regs: &VcpuRegs) -> AxResult {
        self.check_thread()?;
        regs.write_to(&mut self.el2_state.guest_state);
        Ok(())
    }

    /// Get the register block shared with the trampoline.
    pub fn el2_state(&self) -> &El2State {
        &self.el2_state
    }
}

impl<H: El2Hal> Drop for Vcpu<H> {
    fn drop(&mut self) {
        if H::current_thread() != self.thread {
            error!("vcpu {}: destroyed off its own thread", self.vpid);
        }
        self.shared.thread.store(NO_THREAD, Ordering::Release);
        if let Some(guest) = self.guest.upgrade() {
            if let Err(err) = guest.free_vpid(self.vpid) {
                error!("vcpu {}: failed to free VPID: {:?}", self.vpid, err);
            }
        }
        debug!("vcpu {}: destroyed", self.vpid);
    }
}
