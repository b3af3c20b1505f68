// Process table: maps in-flight requests to their child process groups

use crate::types::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    cancel: CancellationToken,
    pgid: Option<u32>,
}

/// Registry of running executions keyed by request id.
///
/// Explicit cancel messages find the execution here; the execution itself
/// kills its process group when its token fires.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: Mutex<HashMap<RequestId, Entry>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution. The entry is removed when the guard drops.
    pub fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        cancel: CancellationToken,
    ) -> ProcessGuard {
        self.entries.lock().insert(request_id, Entry { cancel, pgid: None });
        ProcessGuard {
            table: Arc::clone(self),
            request_id,
        }
    }

    /// Fire the cancellation token of a running execution
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        match self.entries.lock().get(request_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything, used on shutdown
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        entries.len()
    }

    pub fn process_group(&self, request_id: &RequestId) -> Option<u32> {
        self.entries.lock().get(request_id).and_then(|e| e.pgid)
    }

    /// Number of executions currently registered
    pub fn active(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Keeps a request registered in the [`ProcessTable`] while alive
#[derive(Debug)]
pub struct ProcessGuard {
    table: Arc<ProcessTable>,
    request_id: RequestId,
}

impl ProcessGuard {
    pub(crate) fn set_process_group(&self, pgid: Option<u32>) {
        if let Some(entry) = self.table.entries.lock().get_mut(&self.request_id) {
            entry.pgid = pgid;
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.table.entries.lock().remove(&self.request_id);
    }
}

/// Send SIGKILL to every process in the group led by `pgid`
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        // Group already gone
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let table = Arc::new(ProcessTable::new());
        let id = RequestId::new();
        let token = CancellationToken::new();

        let guard = table.register(id, token.clone());
        assert_eq!(table.active(), 1);
        guard.set_process_group(Some(4242));
        assert_eq!(table.process_group(&id), Some(4242));

        assert!(table.cancel(&id));
        assert!(token.is_cancelled());

        drop(guard);
        assert_eq!(table.active(), 0);
        assert!(!table.cancel(&id));
    }

    #[test]
    fn test_cancel_all() {
        let table = Arc::new(ProcessTable::new());
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _ga = table.register(RequestId::new(), a.clone());
        let _gb = table.register(RequestId::new(), b.clone());

        assert_eq!(table.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
