//! The transaction coordinator.
//!
//! Wraps the file engine's whole-file transaction with a nesting counter so
//! that operations composed of other operations (rename, reindex-inside-
//! modify) share one physical transaction. Only the outermost commit or
//! cancel reaches the file engine; inner scopes just net the counter.
//! Prepare flushes the index maintainer's buffered work first, then
//! pre-commits the file engine — a failure of either cancels the whole
//! transaction, leaving the store exactly as it was before `start`.

use tracing::{trace, warn};

use crate::db::index::IndexMaintainer;
use crate::error::{Error, Result};
use crate::storage::KvBackend;

/// Depth-counted coordinator over one physical file transaction.
#[derive(Debug, Default)]
pub struct TxnCoordinator {
    depth: u32,
    prepared: bool,
}

impl TxnCoordinator {
    /// An idle coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transaction is open at any depth.
    pub fn active(&self) -> bool {
        self.depth > 0
    }

    /// Opens the physical transaction at depth 0, otherwise just nests.
    pub fn start(
        &mut self,
        kv: &mut dyn KvBackend,
        index: &mut IndexMaintainer,
    ) -> Result<()> {
        if self.depth == 0 {
            kv.txn_start().map_err(Error::from)?;
            index.txn_start();
            self.prepared = false;
        }
        self.depth += 1;
        trace!(depth = self.depth, "transaction start");
        Ok(())
    }

    fn prepare(&mut self, kv: &mut dyn KvBackend, index: &mut IndexMaintainer) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        let staged = index
            .txn_commit(kv)
            .and_then(|()| kv.txn_prepare().map_err(Error::from));
        if let Err(e) = staged {
            index.txn_cancel();
            if let Err(cancel_err) = kv.txn_cancel() {
                warn!("rollback after failed prepare also failed: {cancel_err}");
            }
            self.depth = 0;
            self.prepared = false;
            return Err(e);
        }
        self.prepared = true;
        Ok(())
    }

    /// Nets the counter; at depth 0 prepares (if not already) and finalizes
    /// the file-engine commit.
    pub fn commit(
        &mut self,
        kv: &mut dyn KvBackend,
        index: &mut IndexMaintainer,
    ) -> Result<()> {
        match self.depth {
            0 => Err(Error::Operations(
                "transaction commit with no open transaction".into(),
            )),
            1 => {
                self.prepare(kv, index)?;
                if let Err(e) = kv.txn_commit().map_err(Error::from) {
                    index.txn_cancel();
                    if let Err(cancel_err) = kv.txn_cancel() {
                        warn!("rollback after failed commit also failed: {cancel_err}");
                    }
                    self.depth = 0;
                    self.prepared = false;
                    return Err(e);
                }
                trace!("transaction committed");
                self.depth = 0;
                self.prepared = false;
                Ok(())
            }
            _ => {
                self.depth -= 1;
                Ok(())
            }
        }
    }

    /// Nets the counter; at depth 0 discards buffered index work and rolls
    /// the file engine back.
    pub fn cancel(&mut self, kv: &mut dyn KvBackend, index: &mut IndexMaintainer) {
        match self.depth {
            0 => warn!("transaction cancel with no open transaction"),
            1 => {
                index.txn_cancel();
                if let Err(e) = kv.txn_cancel() {
                    warn!("transaction rollback failed: {e}");
                }
                trace!("transaction cancelled");
                self.depth = 0;
                self.prepared = false;
            }
            _ => self.depth -= 1,
        }
    }
}
