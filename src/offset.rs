//! Dual monotonic cursor tracking for the receive pump.

use crate::model::ReceiveConfig;

/// `(globalOffset, localOffset)` plus the connect-time snapshot so callers
/// can restart consumption from the channel's beginning without
/// reconnecting. Offsets are monotonically non-decreasing within a session.
#[derive(Debug, Clone)]
pub struct OffsetTracker {
    global_offset: i64,
    local_offset: i64,
    original_global_offset: i64,
}

impl OffsetTracker {
    /// `original_global_offset` seeds [`OffsetTracker::initial_receive_config`]
    /// (always read from local offset zero); `global_offset`/`local_offset`
    /// seed [`OffsetTracker::current_receive_config`].
    pub fn new(original_global_offset: i64, global_offset: i64, local_offset: i64) -> Self {
        Self {
            global_offset,
            local_offset,
            original_global_offset,
        }
    }

    pub fn global_offset(&self) -> i64 {
        self.global_offset
    }

    pub fn local_offset(&self) -> i64 {
        self.local_offset
    }

    /// Promotes the tracker from a pull response. Absent fields retain the
    /// previous value (the server may omit an offset that didn't advance).
    pub fn promote(&mut self, next_global_offset: Option<i64>, next_local_offset: Option<i64>) {
        if let Some(g) = next_global_offset {
            self.global_offset = g;
        }
        if let Some(l) = next_local_offset {
            self.local_offset = l;
        }
    }

    /// Snapshot used as the input to the next pull.
    pub fn current_receive_config(&self) -> ReceiveConfig {
        ReceiveConfig::new(self.global_offset, self.local_offset)
    }

    /// Fixed for the life of the connection: restarts a fresh pump from the
    /// channel's beginning rather than "only new messages."
    pub fn initial_receive_config(&self) -> ReceiveConfig {
        ReceiveConfig::new(self.original_global_offset, 0)
    }
}
