//! Process-level shutdown handling
//!
//! # Design Principles (KISS)
//! - Writers register themselves once they are running
//! - A single call (`shutdown_all`) drains every live writer
//! - Binaries wire Ctrl+C to that call via `setup_shutdown`

use std::sync::Weak;

use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Something that can be drained and closed when the process stops
pub trait ShutdownHandle: Send + Sync {
    /// Unique id of the registered instance
    fn handle_id(&self) -> u64;

    /// Drain and close; must be idempotent
    fn shutdown_now(&self);
}

static REGISTRY: Mutex<Vec<Weak<dyn ShutdownHandle>>> = parking_lot::const_mutex(Vec::new());

/// Register a handle for process shutdown
///
/// Only a weak reference is kept; dropping the writer unregisters it.
pub fn register(handle: Weak<dyn ShutdownHandle>) {
    let mut registry = REGISTRY.lock();
    registry.retain(|h| h.strong_count() > 0);
    registry.push(handle);
}

/// Check whether the handle with `id` is registered and alive
pub fn is_registered(id: u64) -> bool {
    REGISTRY
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .any(|h| h.handle_id() == id)
}

/// Shut down every live registered handle, returning how many were drained
///
/// Handles are collected first so the registry lock is not held while
/// writers drain.
pub fn shutdown_all() -> usize {
    let handles: Vec<_> = {
        let mut registry = REGISTRY.lock();
        let live: Vec<_> = registry.iter().filter_map(Weak::upgrade).collect();
        registry.clear();
        live
    };

    for handle in &handles {
        handle.shutdown_now();
    }
    if !handles.is_empty() {
        info!(writers = handles.len(), "Registered writers shut down");
    }
    handles.len()
}

/// Setup shutdown handling with Ctrl+C signal
///
/// Creates a broadcast channel and spawns a task that sends on Ctrl+C.
/// Returns (sender, receiver) - caller uses receiver for their component,
/// and can clone sender if needed for additional shutdown triggers.
///
/// # Example
/// ```ignore
/// let (_shutdown_tx, mut shutdown_rx) = setup_shutdown();
/// shutdown_rx.recv().await.ok();
/// shutdown_all();
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, initiating shutdown");
            let _ = tx_clone.send(());
        }
    });

    (tx, rx)
}
