//! Startup recovery: bring the mirror set back from the membership store.

use crate::error::{Error, ErrorKind, Result};
use crate::mirror::Mirroring;
use dmirror_replicate::Key;
use dmirror_rpc::ResourceKind;
use exn::ResultExt;
use futures::StreamExt;
use std::pin::pin;
use tracing::instrument;

/// A row that could not be restored.
#[derive(Debug)]
pub struct Failure {
    /// The stored key, or `None` if the row itself was unreadable.
    pub key: Option<Key>,
    pub error: Error,
}

/// What recovery restored and what it skipped.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Base keys back in the mirror set, in store order.
    pub restored: Vec<Key>,
    /// Drives re-entered into the drive index.
    pub drives: Vec<Key>,
    pub failed: Vec<Failure>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record_failure(&mut self, key: Option<Key>, error: Error, strict: bool) -> Result<()> {
        if strict {
            return Err(error).or_raise(|| ErrorKind::Recovery);
        }
        match &key {
            Some(key) => tracing::warn!(%key, error = ?error, "Could not restore mirroring"),
            None => tracing::warn!(error = ?error, "Skipping unreadable store row"),
        }
        self.failed.push(Failure { key, error });
        Ok(())
    }
}

impl Mirroring {
    /// Replay the membership store, then rebuild the drive index from the
    /// type store.
    ///
    /// Each row is restored on its own: a row that fails is logged and
    /// reported, and the next row is tried. With `strict`, the first failure
    /// aborts recovery with [`ErrorKind::Recovery`] instead. Membership rows
    /// are never rewritten.
    #[instrument("recovering mirroring state", skip(self))]
    pub async fn recover(&self, strict: bool) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        // Scoped so the scan is finished and dropped before the next one.
        {
            let mut keys = pin!(self.membership());
            while let Some(row) = keys.next().await {
                let result = match row {
                    Ok(key) => self.mirror_base(key, None, true, false).await.map(|()| key).map_err(|e| (Some(key), e)),
                    Err(e) => Err((None, e)),
                };
                match result {
                    Ok(key) => report.restored.push(key),
                    Err((key, error)) => report.record_failure(key, error, strict)?,
                }
            }
        }

        let mut types = pin!(self.stores().types.entries());
        while let Some(row) = types.next().await {
            let result = match row {
                Ok((key, ResourceKind::Drive)) => {
                    self.restore_drive(key).await.map(|()| Some(key)).map_err(|e| (Some(key), e))
                },
                Ok((_, ResourceKind::Base)) => Ok(None),
                Err(e) => Err((None, e)),
            };
            match result {
                Ok(Some(key)) => report.drives.push(key),
                Ok(None) => (),
                Err((key, error)) => report.record_failure(key, error, strict)?,
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            drives = report.drives.len(),
            failed = report.failed.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Put a drive back into the drive index. Its constituents came back with
    /// the membership rows, so nothing is replicated or downloaded here.
    async fn restore_drive(&self, key: Key) -> Result<()> {
        let (constituents, _, _) = self.open_drive(key, false).await?;
        if !(self.is_mirrored(&constituents.metadata) && self.is_mirrored(&constituents.content)) {
            tracing::warn!(%key, "Drive constituents are not all mirrored");
        }
        self.index_drive(key, constituents);
        Ok(())
    }
}
