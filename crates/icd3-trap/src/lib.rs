//! Installs the `SIGSEGV`/`SIGBUS` handler that turns a driver's MMIO access
//! into a transaction against the model process (§4.E).
//!
//! Everything between the fault and `sigreturn` runs in async-signal context:
//! no allocation, no non-signal-safe locking, no `tracing` calls. The handler
//! reads the faulting instruction directly out of the process's own code
//! pages, classifies it with [`icd3_decoder`], looks the address up in the
//! [`icd3_registry::Registry`], and round-trips a request through the
//! device's [`icd3_transport::Transport`] — whose `send` is itself
//! signal-safe because it touches only a `Mutex`/`Condvar` pair already held
//! exclusively by this thread's own reentry, never anything shared with a
//! non-signal context that this thread could deadlock against. On success it
//! rewrites the destination/source register and advances `RIP` past the
//! instruction; on any unrecoverable outcome it writes a short diagnostic
//! directly to `STDERR_FILENO` and aborts.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use icd3_decoder::{Direction, RegSlot, Register, WriteWidth};
use icd3_protocol::{Message, ResultCode};
use icd3_registry::Registry;
use icd3_transport::Transport;

/// The handle `icd3-registry` resolves a fault to: the transport connected
/// to the device's model process.
pub type DeviceHandle = Arc<Transport>;
pub type DeviceRegistry = Registry<DeviceHandle>;

#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    #[error("trap handler is already installed")]
    AlreadyInstalled,
    #[error("trap handler is not installed")]
    NotInstalled,
    #[error("sigaction/sigaltstack call failed: {0}")]
    Io(#[from] std::io::Error),
}

struct TrapContext {
    registry: Arc<DeviceRegistry>,
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static CONTEXT_PTR: AtomicPtr<TrapContext> = AtomicPtr::new(ptr::null_mut());
static ALT_STACK_PTR: AtomicPtr<libc::c_void> = AtomicPtr::new(ptr::null_mut());

static PREV_SEGV_HANDLER: AtomicUsize = AtomicUsize::new(0);
static PREV_SEGV_FLAGS: AtomicI32 = AtomicI32::new(0);
static PREV_BUS_HANDLER: AtomicUsize = AtomicUsize::new(0);
static PREV_BUS_FLAGS: AtomicI32 = AtomicI32::new(0);

const ALT_STACK_SIZE: usize = 64 * 1024;

/// Installs the signal handler and wires it to `registry`. Only one
/// installation may be active per process, matching the one process-wide
/// `SIGSEGV` handler the OS itself forces.
pub fn install(registry: Arc<DeviceRegistry>) -> Result<(), TrapError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(TrapError::AlreadyInstalled);
    }

    let ctx = Box::into_raw(Box::new(TrapContext { registry }));
    CONTEXT_PTR.store(ctx, Ordering::Release);

    if let Err(err) = install_alt_stack() {
        cleanup_failed_install(ctx);
        return Err(err);
    }

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_fault as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }

    for (signum, prev_handler, prev_flags) in [
        (libc::SIGSEGV, &PREV_SEGV_HANDLER, &PREV_SEGV_FLAGS),
        (libc::SIGBUS, &PREV_BUS_HANDLER, &PREV_BUS_FLAGS),
    ] {
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sigaction(signum, &action, &mut old) };
        if rc != 0 {
            cleanup_failed_install(ctx);
            return Err(TrapError::Io(std::io::Error::last_os_error()));
        }
        if old.sa_sigaction != libc::SIG_DFL && old.sa_sigaction != libc::SIG_IGN {
            prev_handler.store(old.sa_sigaction, Ordering::SeqCst);
            prev_flags.store(old.sa_flags, Ordering::SeqCst);
        }
    }

    Ok(())
}

fn cleanup_failed_install(ctx: *mut TrapContext) {
    INSTALLED.store(false, Ordering::SeqCst);
    CONTEXT_PTR.store(ptr::null_mut(), Ordering::Release);
    unsafe {
        drop(Box::from_raw(ctx));
    }
}

fn install_alt_stack() -> Result<(), TrapError> {
    let size = ALT_STACK_SIZE.max(unsafe { libc::SIGSTKSZ });
    // SAFETY: `size` is nonzero and we own the returned allocation until
    // `uninstall` frees it.
    let mem = unsafe { libc::malloc(size) };
    if mem.is_null() {
        return Err(TrapError::Io(std::io::Error::last_os_error()));
    }
    let stack = libc::stack_t {
        ss_sp: mem,
        ss_flags: 0,
        ss_size: size,
    };
    let rc = unsafe { libc::sigaltstack(&stack, ptr::null_mut()) };
    if rc != 0 {
        unsafe { libc::free(mem) };
        return Err(TrapError::Io(std::io::Error::last_os_error()));
    }
    ALT_STACK_PTR.store(mem, Ordering::SeqCst);
    Ok(())
}

/// Restores whatever `SIGSEGV`/`SIGBUS` handlers were installed before
/// [`install`] ran (or their default dispositions) and frees the alternate
/// stack and trap context.
pub fn uninstall() -> Result<(), TrapError> {
    if !INSTALLED.swap(false, Ordering::SeqCst) {
        return Err(TrapError::NotInstalled);
    }

    for (signum, prev_handler, prev_flags) in [
        (libc::SIGSEGV, &PREV_SEGV_HANDLER, &PREV_SEGV_FLAGS),
        (libc::SIGBUS, &PREV_BUS_HANDLER, &PREV_BUS_FLAGS),
    ] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        let prev = prev_handler.swap(0, Ordering::SeqCst);
        action.sa_sigaction = if prev != 0 { prev } else { libc::SIG_DFL };
        action.sa_flags = prev_flags.swap(0, Ordering::SeqCst);
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, ptr::null_mut());
        }
    }

    let ctx = CONTEXT_PTR.swap(ptr::null_mut(), Ordering::AcqRel);
    if !ctx.is_null() {
        unsafe {
            drop(Box::from_raw(ctx));
        }
    }

    let stack_mem = ALT_STACK_PTR.swap(ptr::null_mut(), Ordering::SeqCst);
    if !stack_mem.is_null() {
        unsafe {
            libc::free(stack_mem);
        }
    }

    Ok(())
}

extern "C" fn handle_fault(signum: i32, info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let ctx_ptr = CONTEXT_PTR.load(Ordering::Acquire);
    if ctx_ptr.is_null() {
        chain(signum, info, ucontext);
        return;
    }
    // SAFETY: non-null only while `install` has not been undone by
    // `uninstall`, which always runs on a thread not currently inside this
    // handler (the caller is responsible for quiescing faulting threads
    // before calling `uninstall`).
    let ctx = unsafe { &*ctx_ptr };

    let fault_addr = unsafe { (*info).si_addr() as u64 };

    let hit = match ctx.registry.lookup(fault_addr) {
        Ok(hit) => hit,
        Err(_) => {
            chain(signum, info, ucontext);
            return;
        }
    };

    let uc = unsafe { &mut *(ucontext as *mut libc::ucontext_t) };
    let rip = uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64;

    // SAFETY: `rip` points into the faulting thread's own code, which is
    // mapped readable and executable; reading up to MAX_INSTRUCTION_LEN
    // bytes from it never touches unmapped memory because the instruction
    // that faulted starts there and the ISA bounds its own length.
    let code = unsafe {
        std::slice::from_raw_parts(rip as *const u8, icd3_decoder::MAX_INSTRUCTION_LEN)
    };

    let decoded = match icd3_decoder::decode(rip, code) {
        Ok(d) => d,
        Err(_) => {
            // Unsupported instruction forms chain to whatever handler (or
            // default disposition) was previously installed, the same as an
            // unmapped address above — there is no architectural way to
            // synthesize a result for an instruction we can't decode, but
            // that's a normal-crash outcome, not grounds to abort() under a
            // signal this process never raised itself (spec §4.E step 3).
            chain(signum, info, ucontext);
            return;
        }
    };

    let request = match decoded.direction {
        Direction::Load => {
            Message::request_read(hit.device_id, hit.offset as u32, decoded.width as u32)
        }
        Direction::Store => {
            let value = read_gpr(uc, decoded.reg_slot.reg);
            let bytes = value.to_le_bytes();
            Message::request_write(
                hit.device_id,
                hit.offset as u32,
                decoded.width as u32,
                &bytes[..decoded.width as usize],
            )
        }
    };

    match hit.handle.send(&request) {
        Ok(resp) if resp.result == ResultCode::Success => {
            if let Direction::Load = decoded.direction {
                write_gpr(uc, decoded.reg_slot, resp.data());
            }
            uc.uc_mcontext.gregs[libc::REG_RIP as usize] = decoded.post_pc as i64;
        }
        Ok(_) => fatal(b"icd3: model rejected the MMIO transaction\n"),
        Err(_) => fatal(b"icd3: transport to the model process was lost\n"),
    }
}

fn chain(signum: i32, info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let (prev_handler, prev_flags) = if signum == libc::SIGSEGV {
        (&PREV_SEGV_HANDLER, &PREV_SEGV_FLAGS)
    } else {
        (&PREV_BUS_HANDLER, &PREV_BUS_FLAGS)
    };
    let prev = prev_handler.load(Ordering::SeqCst);
    if prev == 0 {
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
        return;
    }
    let flags = prev_flags.load(Ordering::SeqCst);
    if flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(prev) };
        f(signum, info, ucontext);
    } else {
        let f: extern "C" fn(i32) = unsafe { std::mem::transmute(prev) };
        f(signum);
    }
}

/// Writes directly to `STDERR_FILENO` and aborts. No allocation, no
/// `tracing`: this runs on the signal stack after a transaction the engine
/// cannot safely continue from.
fn fatal(msg: &'static [u8]) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

fn gregs_index(reg: Register) -> Option<usize> {
    use Register::*;
    let idx = match reg {
        RAX | EAX | AX | AL => libc::REG_RAX,
        RCX | ECX | CX | CL => libc::REG_RCX,
        RDX | EDX | DX | DL => libc::REG_RDX,
        RBX | EBX | BX | BL => libc::REG_RBX,
        RSP | ESP | SP | SPL => libc::REG_RSP,
        RBP | EBP | BP | BPL => libc::REG_RBP,
        RSI | ESI | SI | SIL => libc::REG_RSI,
        RDI | EDI | DI | DIL => libc::REG_RDI,
        R8 | R8D | R8W | R8L => libc::REG_R8,
        R9 | R9D | R9W | R9L => libc::REG_R9,
        R10 | R10D | R10W | R10L => libc::REG_R10,
        R11 | R11D | R11W | R11L => libc::REG_R11,
        R12 | R12D | R12W | R12L => libc::REG_R12,
        R13 | R13D | R13W | R13L => libc::REG_R13,
        R14 | R14D | R14W | R14L => libc::REG_R14,
        R15 | R15D | R15W | R15L => libc::REG_R15,
        _ => return None,
    };
    Some(idx as usize)
}

fn read_gpr(uc: &libc::ucontext_t, reg: Register) -> u64 {
    let idx = gregs_index(reg).expect("decoder only emits register slots this table covers");
    uc.uc_mcontext.gregs[idx] as u64
}

fn write_gpr(uc: &mut libc::ucontext_t, slot: RegSlot, data: &[u8]) {
    let idx = gregs_index(slot.reg).expect("decoder only emits register slots this table covers");
    let current = uc.uc_mcontext.gregs[idx] as u64;
    let mut value_bytes = [0u8; 8];
    value_bytes[..data.len()].copy_from_slice(data);
    let incoming = u64::from_le_bytes(value_bytes);
    let new_value = match slot.write_width {
        WriteWidth::Byte => (current & !0xFFu64) | (incoming & 0xFF),
        WriteWidth::Word => (current & !0xFFFFu64) | (incoming & 0xFFFF),
        WriteWidth::DWordZeroExtend => incoming & 0xFFFF_FFFF,
        WriteWidth::QWord => incoming,
    };
    uc.uc_mcontext.gregs[idx] = new_value as i64;
}
