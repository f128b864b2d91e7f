//! Thread-pinned capability elevation

use crate::{Result, SecurityError};
use caps::{CapSet, Capability, CapsHashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named executor that runs closures on a dedicated thread with a fixed
/// capability set raised for the duration of each closure.
pub struct SecurityContext {
    name: String,
    caps: Vec<Capability>,
    tx: mpsc::Sender<Job>,
}

/// Raises the context's capabilities on construction and drops them when
/// it goes out of scope, so elevation never outlives a job even when the
/// job panics.
struct RaisedCaps<'a> {
    name: &'a str,
    caps: &'a [Capability],
}

impl<'a> RaisedCaps<'a> {
    fn raise(name: &'a str, caps: &'a [Capability]) -> std::result::Result<Self, caps::errors::CapsError> {
        for cap in caps {
            caps::raise(None, CapSet::Effective, *cap)?;
        }
        Ok(Self { name, caps })
    }
}

impl Drop for RaisedCaps<'_> {
    fn drop(&mut self) {
        for cap in self.caps {
            if let Err(e) = caps::drop(None, CapSet::Effective, *cap) {
                // Failing to shed a capability must be loud: the process
                // would keep running elevated.
                warn!(context = self.name, capability = %cap, error = %e, "Failed to drop capability");
            }
        }
    }
}

impl SecurityContext {
    /// Create a context that raises `capabilities` around each submitted job.
    ///
    /// Fails when any requested capability is absent from the process
    /// permitted set; callers decide whether that disables a collector or
    /// aborts startup.
    pub fn new(name: impl Into<String>, capabilities: Vec<Capability>) -> Result<Self> {
        let name = name.into();

        let permitted: CapsHashSet = caps::read(None, CapSet::Permitted).map_err(|e| SecurityError::Caps {
            name: name.clone(),
            source: e,
        })?;

        let missing: Vec<Capability> = capabilities
            .iter()
            .filter(|c| !permitted.contains(c))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(SecurityError::NotPermitted(name, missing));
        }

        let (tx, rx) = mpsc::channel::<Job>();

        let thread_name = format!("ceems-sec-{}", name);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .map_err(|e| SecurityError::Spawn(e.to_string()))?;

        debug!(context = %name, caps = ?capabilities, "Created security context");

        Ok(Self { name, caps: capabilities, tx })
    }

    /// Run `f` on the context thread with capabilities raised, blocking
    /// until it completes.
    ///
    /// From async code, call this inside `tokio::task::spawn_blocking`.
    pub fn exec<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel::<Result<T>>();
        let name = self.name.clone();
        let caps = self.caps.clone();

        let job: Job = Box::new(move || {
            let outcome = match RaisedCaps::raise(&name, &caps) {
                Ok(_guard) => catch_unwind(AssertUnwindSafe(f))
                    .map_err(|_| SecurityError::JobPanicked(name.clone())),
                Err(e) => Err(SecurityError::Caps { name: name.clone(), source: e }),
            };
            // Receiver may have hung up if the caller was cancelled
            let _ = result_tx.send(outcome);
        });

        self.tx
            .send(job)
            .map_err(|_| SecurityError::Terminated(self.name.clone()))?;

        result_rx
            .recv()
            .map_err(|_| SecurityError::Terminated(self.name.clone()))?
    }

    /// Name of this context
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities raised around each job
    pub fn capabilities(&self) -> &[Capability] {
        &self.caps
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .finish()
    }
}
