//! Kernel session state
//!
//! Busy/idle tracking, the kernel's execution counter, and heartbeat
//! reachability. Mutated only from messages observed on iopub/shell and from
//! the heartbeat monitor; reads are lock-free snapshots and never block.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Kernel execution state as broadcast on iopub `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

impl ExecutionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutionState::Starting,
            1 => ExecutionState::Busy,
            _ => ExecutionState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ExecutionState::Starting => 0,
            ExecutionState::Busy => 1,
            ExecutionState::Idle => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "starting" => Some(ExecutionState::Starting),
            "busy" => Some(ExecutionState::Busy),
            "idle" => Some(ExecutionState::Idle),
            _ => None,
        }
    }
}

/// Read-only view of the session at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub execution_state: ExecutionState,
    pub execution_count: u64,
    pub reachable: bool,
}

/// Shared session state.
#[derive(Debug)]
pub struct SessionState {
    state: AtomicU8,
    execution_count: AtomicU64,
    reachable: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ExecutionState::Starting.as_u8()),
            execution_count: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// Apply a broadcast `status` execution_state value.
    pub fn observe_execution_state(&self, state: ExecutionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Apply the execution counter from the kernel's own `execute_reply`.
    /// The bridge never increments this itself.
    pub fn observe_execution_count(&self, count: u64) {
        self.execution_count.store(count, Ordering::Release);
    }

    /// Flip heartbeat reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Reset local counters after a kernel restart.
    pub fn reset(&self) {
        self.state
            .store(ExecutionState::Starting.as_u8(), Ordering::Release);
        self.execution_count.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            execution_state: ExecutionState::from_u8(self.state.load(Ordering::Acquire)),
            execution_count: self.execution_count.load(Ordering::Acquire),
            reachable: self.reachable.load(Ordering::Acquire),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
