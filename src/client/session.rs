//! Capture session state shared across the application shell.

use crate::config::CaptureConfig;
use crate::provider::Provider;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Small key → timestamp store that outlives a page load (the browser's
/// session storage, or anything with the same lifetime).
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<DateTime<Utc>>;
    fn set(&self, key: &str, at: DateTime<Utc>);
    fn remove(&self, key: &str);
}

/// Process-local [`SessionStorage`].
#[derive(Default)]
pub struct MemorySessionStorage {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().ok()?.get(key).copied()
    }

    fn set(&self, key: &str, at: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), at);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Where the capture state machine currently is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CapturePhase {
    Idle,
    Capturing,
    Stored { provider: Provider },
    Failed { provider: Option<Provider> },
}

/// Capture bookkeeping owned by the application shell.
///
/// Holds the in-flight guard (lost on reload) and the dedup markers (kept in
/// [`SessionStorage`], which survives reload).
pub struct CaptureSession {
    storage: std::sync::Arc<dyn SessionStorage>,
    in_flight: AtomicBool,
    claim_lock: Mutex<()>,
    phase: watch::Sender<CapturePhase>,
    code_ttl: Duration,
    sign_in_window: Duration,
}

/// Exclusive right to run one capture. Dropping it releases the session.
pub struct CaptureGuard<'a> {
    session: &'a CaptureSession,
}

impl CaptureGuard<'_> {
    /// Publishes [`CapturePhase::Capturing`]. Called once the signal is known
    /// to be new, so duplicates never disturb the published phase.
    pub fn start(&self) {
        self.session.phase.send_replace(CapturePhase::Capturing);
    }

    pub fn finish(self, phase: CapturePhase) {
        self.session.phase.send_replace(phase);
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        // Abandoned mid-capture (cancelled future, early return)
        self.session.phase.send_if_modified(|phase| {
            if *phase == CapturePhase::Capturing {
                *phase = CapturePhase::Idle;
                true
            } else {
                false
            }
        });
        self.session.in_flight.store(false, Ordering::SeqCst);
    }
}

fn code_key(code: &str) -> String {
    format!("capture:code:{}", code)
}

fn sign_in_key(provider: Provider) -> String {
    format!("capture:sign_in:{}", provider)
}

impl CaptureSession {
    pub fn new(storage: std::sync::Arc<dyn SessionStorage>, config: &CaptureConfig) -> Self {
        Self {
            storage,
            in_flight: AtomicBool::new(false),
            claim_lock: Mutex::new(()),
            phase: watch::channel(CapturePhase::Idle).0,
            code_ttl: Duration::seconds(config.code_marker_ttl_seconds),
            sign_in_window: Duration::seconds(config.sign_in_window_seconds),
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CapturePhase> {
        self.phase.subscribe()
    }

    /// Takes the in-flight guard unless a capture is already running. The
    /// published phase is untouched until [`CaptureGuard::start`].
    pub fn try_begin(&self) -> Option<CaptureGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(CaptureGuard { session: self })
    }

    /// Marks `code` processed. Returns false if it already was (and the
    /// marker has not expired).
    pub fn claim_code(&self, code: &str) -> bool {
        let _claim = self.claim_lock.lock();
        let key = code_key(code);
        let now = Utc::now();
        if let Some(at) = self.storage.get(&key) {
            if now - at < self.code_ttl {
                return false;
            }
        }
        self.storage.set(&key, now);
        true
    }

    /// Forgets a code so a retry can process it.
    pub fn release_code(&self, code: &str) {
        self.storage.remove(&code_key(code));
    }

    /// True if a capture for `provider` completed inside the sign-in window.
    pub fn recently_captured(&self, provider: Provider) -> bool {
        self.storage
            .get(&sign_in_key(provider))
            .map(|at| Utc::now() - at < self.sign_in_window)
            .unwrap_or(false)
    }

    pub fn mark_captured(&self, provider: Provider) {
        self.storage.set(&sign_in_key(provider), Utc::now());
    }

    /// Drops markers that have outlived their window. Call on page load.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        for provider in Provider::ALL {
            let key = sign_in_key(provider);
            if matches!(self.storage.get(&key), Some(at) if now - at >= self.sign_in_window) {
                debug!(provider = %provider, "Expired sign-in marker removed");
                self.storage.remove(&key);
            }
        }
    }
}
