//! Cooperative task/channel scheduling (spec §5).
//!
//! This core's concurrency model is single-threaded and cooperative: two
//! logical tasks never execute a single instruction concurrently, only
//! interleaved at explicit suspension points. [`Channel`] is a plain
//! in-process bounded queue rather than a wrapper over an OS-thread-aware
//! async runtime; bridging a `Task`/`Channel` handle to real async I/O
//! (sockets, timers, an actual `tokio` reactor) is a collaborator module's
//! job, not this core's (spec §1 — networking/timers are named Non-goals).
//!
//! `Spawn` in this implementation runs the spawned function **eagerly, to
//! completion**, rather than deferring it to a later interleaving point —
//! a deliberate, documented scope cut (see `DESIGN.md`): a faithful
//! resumable-coroutine scheduler would park a task's [`crate::vm::frame::CallFrame`]
//! stack mid-execution and resume it later, which this core does not yet
//! do. `Await` on a task is therefore always immediate, and `Channel` is a
//! plain bounded queue rather than a true blocking rendezvous.

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::value::Value;
use std::collections::VecDeque;

/// Outcome of a spawned task (spec §5 "Task").
#[derive(Debug, Clone)]
pub enum TaskState {
    Resolved(Value),
    Failed(RuntimeErrorKind),
    Cancelled,
}

impl TaskState {
    /// Convert a resolved/failed/cancelled task into the `Await` result.
    pub fn into_result(self, line: u32) -> Result<Value, RuntimeError> {
        match self {
            TaskState::Resolved(v) => Ok(v),
            TaskState::Failed(kind) => Err(RuntimeError { kind, line, trace: Vec::new() }),
            TaskState::Cancelled => Err(RuntimeError {
                kind: RuntimeErrorKind::Cancelled,
                line,
                trace: Vec::new(),
            }),
        }
    }
}

/// A bounded multi-producer/multi-consumer queue (spec §5 "Channel").
/// Since every task in this implementation runs to completion before the
/// next one is considered, there is never a concurrent writer to race a
/// concurrent reader; `send`/`receive` are synchronous and fail fast on a
/// full/empty channel rather than suspending.
#[derive(Debug)]
pub struct Channel {
    capacity: usize,
    queue: VecDeque<Value>,
    closed: bool,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            closed: false,
        }
    }

    pub fn send(&mut self, value: Value) -> Result<(), RuntimeErrorKind> {
        if self.closed {
            return Err(RuntimeErrorKind::CallError("send on closed channel".into()));
        }
        if self.queue.len() >= self.capacity {
            return Err(RuntimeErrorKind::CallError("channel is full".into()));
        }
        self.queue.push_back(value);
        Ok(())
    }

    pub fn receive(&mut self) -> Result<Value, RuntimeErrorKind> {
        self.queue
            .pop_front()
            .ok_or_else(|| RuntimeErrorKind::CallError("channel is empty".into()))
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_respects_capacity() {
        let mut ch = Channel::new(1);
        ch.send(Value::I32(1)).unwrap();
        assert!(ch.send(Value::I32(2)).is_err());
        assert_eq!(ch.receive().unwrap(), Value::I32(1));
        assert!(ch.receive().is_err());
    }

    #[test]
    fn task_state_converts_to_result() {
        let ok = TaskState::Resolved(Value::I32(9)).into_result(1);
        assert_eq!(ok.unwrap(), Value::I32(9));
        let err = TaskState::Failed(RuntimeErrorKind::DivisionByZero).into_result(2);
        assert!(err.is_err());
    }
}
