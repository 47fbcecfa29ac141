//! Process-wide state shared by all handles.
//!
//! The runtime is initialised once, on first use, from the open path of every transport. It
//! counts the handles that are currently open; a handle registers itself when it opens and the
//! returned [`HandleToken`] deregisters it when the handle closes or is dropped.

use std::sync::{
    OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Get the process-wide runtime, initialising it on the first call.
///
/// Repeated calls are cheap and always return the same instance.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        debug!("Initializing instrumentlink runtime.");
        Runtime {
            open_handles: AtomicUsize::new(0),
        }
    })
}

/// Process-wide bookkeeping for open handles.
#[derive(Debug)]
pub struct Runtime {
    open_handles: AtomicUsize,
}

impl Runtime {
    /// Number of handles that are currently open in this process.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Register an open handle of the given kind.
    ///
    /// The handle stays registered as long as the returned token lives.
    pub fn register(&'static self, kind: &'static str) -> HandleToken {
        let count = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Registered {kind} handle, {count} open.");
        HandleToken {
            runtime: self,
            kind,
        }
    }
}

/// Proof that a handle is registered with the [`Runtime`].
#[derive(Debug)]
pub struct HandleToken {
    runtime: &'static Runtime,
    kind: &'static str,
}

impl Drop for HandleToken {
    fn drop(&mut self) {
        let count = self.runtime.open_handles.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!("Released {} handle, {count} open.", self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_is_initialized_once() {
        assert!(std::ptr::eq(runtime(), runtime()));
    }

    #[test]
    fn test_token_registers_handle() {
        let token = runtime().register("test");
        assert!(runtime().open_handles() >= 1);
        drop(token);
    }
}
