// SPDX-License-Identifier: MPL-2.0

//! The interrupt vector table: exception/service/hardware classification,
//! per-vector `HwInterrupt` chains, and dispatch.
//!
//! Each vector resolves to one of three kinds — a CPU exception, a
//! software service call, or a hardware line — and hardware lines
//! support a chain of callbacks sharing one vector, torn down one entry
//! at a time.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use spin::Once;
use trapframe::TrapFrame;

use crate::arch::x86_64::{interrupts, pic};
use crate::prelude::*;
use crate::sync::SpinLock;
use crate::trap::ipl::{self, Ipl};

/// First vector the hardware interrupt controller dispatches at; vectors
/// below this are reserved for CPU exceptions.
pub const HARDWARE_BASE: u8 = pic::VECTOR_BASE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InterruptMode {
    Edge,
    Level,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

bitflags::bitflags! {
    /// Per-`HwInterrupt` flags.
    pub struct HwFlags: u32 {
        /// Exclusive to its installer; rejects any further chain member.
        const INTERNAL   = 1 << 0;
        const MASKABLE   = 1 << 1;
        /// Installer demands its own IPL rather than joining a chain at
        /// the existing one.
        const FORCE_IPL  = 1 << 2;
        /// Temporarily skipped by dispatch without being uninstalled.
        const MASKED     = 1 << 3;
    }
}

type HwHandler = dyn Fn(&TrapFrame) -> bool + Send + Sync;
type ExceptionHandler = fn(&mut TrapFrame) -> bool;
type ServiceHandler = fn(&mut TrapFrame);

/// One source sharing a hardware vector's chain.
pub struct HwInterrupt {
    gsi: u8,
    mode: InterruptMode,
    polarity: Polarity,
    ipl: AtomicU8,
    vector: u8,
    flags: HwFlags,
    handler: Box<HwHandler>,
}

impl HwInterrupt {
    pub fn gsi(&self) -> u8 {
        self.gsi
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn ipl(&self) -> Ipl {
        self.ipl.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum InterruptKind {
    Unset,
    Exception,
    Service,
    Hardware,
}

/// The per-vector slot in the global table.
struct InterruptObject {
    kind: SpinLock<InterruptKind>,
    call_count: AtomicUsize,
    exception_handler: SpinLock<Option<ExceptionHandler>>,
    service_handler: SpinLock<Option<ServiceHandler>>,
    chain: SpinLock<Vec<HwInterrupt>>,
}

impl InterruptObject {
    fn new() -> Self {
        Self {
            kind: SpinLock::new(InterruptKind::Unset),
            call_count: AtomicUsize::new(0),
            exception_handler: SpinLock::new(None),
            service_handler: SpinLock::new(None),
            chain: SpinLock::new(Vec::new()),
        }
    }
}

static VECTOR_TABLE: Once<[InterruptObject; 256]> = Once::new();
static SPURIOUS_COUNT: AtomicUsize = AtomicUsize::new(0);
static INTERRUPT_COUNT: AtomicUsize = AtomicUsize::new(0);
static IN_INTERRUPT_CONTEXT: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

/// Builds the 256-entry vector table and brings up the controller.
/// Must run once, before interrupts are enabled.
pub fn init() {
    VECTOR_TABLE.call_once(|| core::array::from_fn(|_| InterruptObject::new()));
    pic::init();
}

fn table() -> &'static [InterruptObject; 256] {
    VECTOR_TABLE.get().expect("trap::irq not initialized")
}

/// Registers `handler` for CPU exception `vector`. The handler returns
/// `true` if it resolved the fault; `false` escalates to the default
/// exception dispatcher.
pub fn install_exception(vector: u8, handler: ExceptionHandler) {
    let obj = &table()[vector as usize];
    *obj.kind.lock() = InterruptKind::Exception;
    *obj.exception_handler.lock() = Some(handler);
}

/// Registers `handler` for a software service vector. Service handlers
/// never fail.
pub fn install_service(vector: u8, handler: ServiceHandler) {
    let obj = &table()[vector as usize];
    *obj.kind.lock() = InterruptKind::Service;
    *obj.service_handler.lock() = Some(handler);
}

/// Installs a hardware interrupt source on global system interrupt
/// `gsi`. The first install on a line initializes its chain, programs
/// the controller, and enables the source; later installs share the
/// chain if compatible by mode/polarity and the existing chain is not
/// `INTERNAL`, otherwise the install is rejected.
pub fn install_hardware_interrupt(
    gsi: u8,
    mode: InterruptMode,
    polarity: Polarity,
    ipl: Ipl,
    flags: HwFlags,
    handler: Box<HwHandler>,
) -> Result<u8> {
    assert!(gsi < 16, "only the legacy PIC's 16 lines are wired up");
    let vector = HARDWARE_BASE + gsi;
    let obj = &table()[vector as usize];
    let mut chain = obj.chain.lock();

    if let Some(first) = chain.first() {
        if first.flags.contains(HwFlags::INTERNAL) {
            return Err(Error::AccessDenied);
        }
        if first.mode != mode || first.polarity != polarity {
            return Err(Error::InvalidArgs);
        }
        if flags.contains(HwFlags::FORCE_IPL) && first.ipl() != ipl {
            return Err(Error::InvalidArgs);
        }
    } else {
        *obj.kind.lock() = InterruptKind::Hardware;
        pic::set_line_ipl(gsi, ipl);
    }

    chain.push(HwInterrupt {
        gsi,
        mode,
        polarity,
        ipl: AtomicU8::new(ipl),
        vector,
        flags,
        handler,
    });
    Ok(vector)
}

/// Moves a line's IPL without changing its vector (the legacy PIC cannot
/// retarget a GSI to a different vector, so `remap_interrupt` here only
/// ever adjusts priority). Rejected if more than one source shares the
/// chain, since they would need to move together.
pub fn remap_interrupt(gsi: u8, new_ipl: Ipl) -> Result<()> {
    let vector = HARDWARE_BASE + gsi;
    let chain = table()[vector as usize].chain.lock();
    match chain.as_slice() {
        [only] => {
            only.ipl.store(new_ipl, Ordering::Relaxed);
            pic::remap_ipl(gsi, new_ipl);
            Ok(())
        }
        _ => Err(Error::AccessDenied),
    }
}

/// Returns whether the calling CPU is currently running a hardware
/// interrupt handler.
pub fn in_interrupt_context() -> bool {
    IN_INTERRUPT_CONTEXT.load(Ordering::Acquire)
}

pub fn spurious_count() -> usize {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

pub fn interrupt_count() -> usize {
    INTERRUPT_COUNT.load(Ordering::Relaxed)
}

/// Entered from [`super::handler::trap_handler`] with a uniform trap
/// context record.
pub(crate) fn dispatch(vector: u8, frame: &mut TrapFrame) {
    INTERRUPT_COUNT.fetch_add(1, Ordering::Relaxed);
    let obj = &table()[vector as usize];
    obj.call_count.fetch_add(1, Ordering::Relaxed);

    let kind = *obj.kind.lock();
    match kind {
        InterruptKind::Exception => {
            let resolved = obj
                .exception_handler
                .lock()
                .map_or(false, |handler| handler(frame));
            if !resolved {
                default_exception_dispatcher(vector, frame);
            }
        }
        InterruptKind::Service => match *obj.service_handler.lock() {
            Some(handler) => handler(frame),
            None => bad_trap(vector, frame),
        },
        InterruptKind::Hardware => dispatch_hardware(vector, obj, frame),
        InterruptKind::Unset => bad_trap(vector, frame),
    }
}

fn dispatch_hardware(vector: u8, obj: &InterruptObject, frame: &mut TrapFrame) {
    if !pic::begin_interrupt(vector) {
        SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let head_ipl = obj
        .chain
        .lock()
        .first()
        .map(HwInterrupt::ipl)
        .unwrap_or(ipl::IPL_HIGH);
    let old = ipl::raise_ipl(head_ipl);
    interrupts::enable_local();
    IN_INTERRUPT_CONTEXT.store(true, Ordering::Release);

    {
        let chain = obj.chain.lock();
        for hw in chain.iter() {
            if hw.flags.contains(HwFlags::MASKED) {
                continue;
            }
            if (hw.handler)(frame) {
                break;
            }
        }
    }

    IN_INTERRUPT_CONTEXT.store(false, Ordering::Release);
    interrupts::disable_local();
    ipl::lower_ipl(old);
    pic::end_interrupt(vector);
}

/// Prints diagnostic info and crashes.
fn default_exception_dispatcher(vector: u8, frame: &TrapFrame) -> ! {
    panic!("unresolved CPU exception {vector:#x}: {frame:#x?}");
}

fn bad_trap(vector: u8, frame: &TrapFrame) -> ! {
    panic!("bad trap: unhandled vector {vector:#x}: {frame:#x?}");
}
