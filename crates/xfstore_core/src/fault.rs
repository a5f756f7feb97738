//! Crash injection points for recovery testing.

use crate::error::{CoreError, CoreResult};

/// A point in the commit path where a simulated crash can be injected.
///
/// When [`Config::fault_point`](crate::Config) names one of these points the
/// commit stops there with [`CoreError::InjectedFault`], leaving the durable
/// state exactly as a process crash at that moment would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// After prepare has been logged, before the commit starts.
    AfterPrepare,
    /// After the commit record is durable, while journals are being merged.
    MidCommit,
    /// After every item committed, before logs and journals are removed.
    AfterCommitBeforeCleanup,
}

pub(crate) fn check(configured: Option<FaultPoint>, point: FaultPoint) -> CoreResult<()> {
    if configured == Some(point) {
        tracing::warn!(?point, "injected fault");
        Err(CoreError::InjectedFault { point })
    } else {
        Ok(())
    }
}
