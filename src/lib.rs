//! Public façade over the interception engine (§4.G): `init` / `deinit` /
//! `register_device` / `unregister_device` / `read_register` /
//! `write_register` / `register_interrupt_handler`.
//!
//! Every other crate in this workspace is a plain library with no process
//! state of its own. This crate owns the one piece of state that genuinely
//! has to be process-wide — the installed `SIGSEGV`/`SIGBUS` handler is a
//! property of the OS process, not of any Rust value — behind a single
//! [`OnceLock`]. `Engine` itself is an ordinary, explicitly-constructed value
//! (see DESIGN.md / spec §9, "Replacing global mutable state"); re-init after
//! `deinit` is `drop; construct`, not a reset of hidden statics.

mod config;

pub use config::{EngineConfig, LogLevel};
pub use icd3_protocol::ResultCode;
pub use icd3_registry::RegistryError;
pub use icd3_shadow::ShadowError;
pub use icd3_trap::TrapError;
pub use icd3_transport::TransportError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use icd3_protocol::Message;
use icd3_shadow::ShadowWindow;
use icd3_trap::DeviceRegistry;
use icd3_transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum IcdError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Trap(#[from] TrapError),
    #[error("icd3::init() has not been called (or icd3::deinit() was called since)")]
    NotInitialized,
    #[error("icd3::init() was already called; call icd3::deinit() first")]
    AlreadyInitialized,
    #[error("model returned {0:?} for the request")]
    ModelError(ResultCode),
    #[error("width must be one of 1, 2, 4, or 8 bytes, got {0}")]
    InvalidWidth(u8),
}

struct Engine {
    registry: Arc<DeviceRegistry>,
    router: Arc<icd3_interrupts::Router>,
    shadows: RwLock<HashMap<u32, ShadowWindow>>,
    config: EngineConfig,
    // Eagerly connected at init() per spec §6; not used for device traffic
    // (each device dials its own endpoint lazily at register_device), kept
    // alive only to surface an unreachable-endpoint error as early as possible.
    _default_transport: Transport,
}

static ENGINE: OnceLock<Mutex<Option<Engine>>> = OnceLock::new();
static LOG_INIT: OnceLock<()> = OnceLock::new();

fn engine_slot() -> &'static Mutex<Option<Engine>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

fn install_logging(cfg: &EngineConfig) {
    // `tracing` has no supported way to uninstall a global subscriber, so a
    // second init() after deinit() reuses whatever was installed the first
    // time rather than re-reading ICD3_LOG_LEVEL; this is a deliberate
    // deviation from per-init reconfiguration, recorded in DESIGN.md.
    LOG_INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_new(cfg.log_level.as_filter_str())
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

fn with_engine<T>(f: impl FnOnce(&Engine) -> Result<T, IcdError>) -> Result<T, IcdError> {
    let slot = engine_slot().lock().unwrap();
    let engine = slot.as_ref().ok_or(IcdError::NotInitialized)?;
    f(engine)
}

/// Installs the trap handler, connects the default model endpoint, and
/// starts the interrupt dispatch worker, using [`EngineConfig::from_env`].
/// Idempotent across a `deinit()`/`init()` pair; calling it twice without an
/// intervening `deinit()` fails with [`IcdError::AlreadyInitialized`].
pub fn init() -> Result<(), IcdError> {
    init_with_config(EngineConfig::from_env())
}

/// Like [`init`], but with an explicitly supplied configuration rather than
/// one read from the environment (ambient: for tests and embedders that
/// don't want to set env vars to point at a test model).
pub fn init_with_config(cfg: EngineConfig) -> Result<(), IcdError> {
    install_logging(&cfg);

    let mut slot = engine_slot().lock().unwrap();
    if slot.is_some() {
        return Err(IcdError::AlreadyInitialized);
    }

    let registry: Arc<DeviceRegistry> = Arc::new(icd3_registry::Registry::new());
    let router = Arc::new(icd3_interrupts::Router::new());
    let default_transport =
        Transport::connect(&cfg.model_endpoint, cfg.send_timeout, router.sink())?;

    icd3_trap::install(Arc::clone(&registry))?;

    *slot = Some(Engine {
        registry,
        router,
        shadows: RwLock::new(HashMap::new()),
        config: cfg,
        _default_transport: default_transport,
    });
    Ok(())
}

/// Uninstalls the trap handler and tears down every process-wide resource:
/// the registry, the interrupt dispatch worker, and any shadow windows still
/// reserved by devices the caller never explicitly unregistered. A second
/// `deinit()` in a row fails with [`IcdError::NotInitialized`]; a subsequent
/// `init()` is a fresh construction, per spec §3.
pub fn deinit() -> Result<(), IcdError> {
    let mut slot = engine_slot().lock().unwrap();
    let engine = slot.take().ok_or(IcdError::NotInitialized)?;

    icd3_trap::uninstall()?;

    let Engine { shadows, .. } = engine;
    for (device_id, shadow) in shadows.into_inner().unwrap() {
        if let Err(err) = icd3_shadow::release(shadow) {
            tracing::warn!(device_id, %err, "failed to release shadow window during deinit");
        }
    }
    Ok(())
}

/// Registers a device covering `[base, base+size)`. Checks the registry for
/// an id conflict or overlapping range first — before reserving the shadow
/// window, so a range that is both overlapping and misaligned reports
/// `OVERLAP` (spec §8 S4), not `ALIGN` from the shadow reservation that would
/// otherwise run first — then reserves the shadow, dials a fresh
/// [`Transport`] to the configured model endpoint, and inserts the device
/// into the registry, in that order, so a failure at any step leaves no
/// partial state behind.
pub fn register_device(id: u32, base: u64, size: u64) -> Result<(), IcdError> {
    with_engine(|engine| {
        engine.registry.check_available(id, base, size)?;

        let shadow = icd3_shadow::reserve(base, size)?;

        let transport = match Transport::connect(
            &engine.config.model_endpoint,
            engine.config.send_timeout,
            engine.router.sink(),
        ) {
            Ok(t) => t,
            Err(err) => {
                let _ = icd3_shadow::release(shadow);
                return Err(err.into());
            }
        };

        if let Err(err) = engine.registry.insert(id, base, size, Arc::new(transport)) {
            let _ = icd3_shadow::release(shadow);
            return Err(err.into());
        }

        engine.shadows.write().unwrap().insert(id, shadow);
        Ok(())
    })
}

/// Removes a device: unregisters any interrupt callback, drops its
/// transport (closing the connection to the model), and releases its shadow
/// window. Fails with [`RegistryError::Unknown`] if `id` was never
/// registered, or was already removed.
pub fn unregister_device(id: u32) -> Result<(), IcdError> {
    with_engine(|engine| {
        engine.router.unregister_callback(id);
        engine.registry.remove(id)?;
        if let Some(shadow) = engine.shadows.write().unwrap().remove(&id) {
            icd3_shadow::release(shadow)?;
        }
        Ok(())
    })
}

/// Direct synchronous read, bypassing the fault path: looks the address up
/// in the registry and sends `READ` straight to the owning device's
/// transport. Byte-identical to whatever a faulting load at the same
/// address/width would have produced (spec §4.G, Invariant 2).
pub fn read_register(addr: u64, width: u8) -> Result<u64, IcdError> {
    if !icd3_protocol::is_valid_width(width as u32) {
        return Err(IcdError::InvalidWidth(width));
    }
    with_engine(|engine| {
        let hit = engine.registry.lookup(addr)?;
        let request = Message::request_read(hit.device_id, hit.offset as u32, width as u32);
        let response = hit.handle.send(&request)?;
        if response.result != ResultCode::Success {
            return Err(IcdError::ModelError(response.result));
        }
        let mut buf = [0u8; 8];
        let data = response.data();
        buf[..data.len()].copy_from_slice(data);
        Ok(u64::from_le_bytes(buf))
    })
}

/// Direct synchronous write, bypassing the fault path (spec §4.G).
pub fn write_register(addr: u64, value: u64, width: u8) -> Result<(), IcdError> {
    if !icd3_protocol::is_valid_width(width as u32) {
        return Err(IcdError::InvalidWidth(width));
    }
    with_engine(|engine| {
        let hit = engine.registry.lookup(addr)?;
        let bytes = value.to_le_bytes();
        let request = Message::request_write(
            hit.device_id,
            hit.offset as u32,
            width as u32,
            &bytes[..width as usize],
        );
        let response = hit.handle.send(&request)?;
        if response.result != ResultCode::Success {
            return Err(IcdError::ModelError(response.result));
        }
        Ok(())
    })
}

/// Registers (or replaces) the interrupt callback for `device_id`. The
/// callback runs on the dispatch worker thread, never on the transport's
/// reader thread or inside the trap handler (spec §4.F, §5). Succeeds even
/// if `device_id` is not currently registered, but only affects irqs pushed
/// from this point on — an irq pushed while no callback is registered is
/// dropped immediately with a counter increment, not queued, so registering
/// here never triggers delivery of a backlog (spec §4.F).
pub fn register_interrupt_handler(
    device_id: u32,
    cb: impl Fn(u32, u32) + Send + Sync + 'static,
) -> Result<(), IcdError> {
    with_engine(|engine| {
        engine.router.register_callback(device_id, cb);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_init_report_not_initialized() {
        // Runs in this crate's unit-test binary, a separate process from the
        // integration tests in tests/facade.rs, so it never observes an
        // ENGINE another test initialized.
        assert!(matches!(read_register(0x1000, 4), Err(IcdError::NotInitialized)));
        assert!(matches!(
            register_device(1, 0x1000, 0x1000),
            Err(IcdError::NotInitialized)
        ));
    }
}
