//! Generator objects: a suspended frame plus a lifecycle state machine.
//!
//! Calling a unit compiled with the generator flag never runs its body;
//! it produces a [`Generator`] holding a fresh frame. Resuming moves the
//! frame into a new activation driven by the interpreter and parks it back
//! here at the next yield. The state field is a reentrancy guard: resuming a
//! generator whose frame is currently checked out fails immediately instead
//! of deadlocking or aliasing the frame.

use std::sync::Arc;

use strum::Display;

use crate::error::GeneratorStateError;
use crate::frame::Frame;
use crate::value::Value;

/// Lifecycle of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum GenState {
    /// Built but never resumed; only a `None` send may start it.
    Created,
    /// Frame checked out by an active resume.
    Running,
    /// Parked at a yield.
    Suspended,
    /// Body returned or raised; `return_value` holds the result.
    Completed,
    /// Close signal honored (or delivered before the first resume).
    Closed,
}

/// A generator: its parked frame and where it is in its lifecycle.
#[derive(Debug)]
pub struct Generator {
    /// Name of the underlying unit, for repr and errors.
    pub name: Arc<str>,
    state: GenState,
    /// The parked frame; `Some` in `Created` and `Suspended`, `None` while
    /// `Running` (checked out) and after completion.
    frame: Option<Frame>,
    /// Value returned by the body, consumed into `StopIteration` payloads.
    return_value: Option<Value>,
}

impl Generator {
    /// Wraps a freshly built frame; the body has not started.
    #[must_use]
    pub fn new(name: Arc<str>, frame: Frame) -> Self {
        Self {
            name,
            state: GenState::Created,
            frame: Some(frame),
            return_value: None,
        }
    }

    /// Rebuilds a generator from captured parts (continuation restore).
    #[must_use]
    pub(crate) fn restore(name: Arc<str>, state: GenState, frame: Option<Frame>, return_value: Option<Value>) -> Self {
        Self {
            name,
            state,
            frame,
            return_value,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GenState {
        self.state
    }

    /// The body's return value, if it has completed.
    #[must_use]
    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    /// Read access to the parked frame (serialization).
    #[must_use]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Checks out the frame for a resume carrying `sent`.
    ///
    /// On success the state is `Running` and the caller owns the frame; it
    /// must be returned through [`park`](Self::park), [`finish`](Self::finish)
    /// or [`mark_closed`](Self::mark_closed). The first resume only accepts a
    /// `None` send, since no yield is waiting to receive the value.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when the frame is checked out, `Exhausted` after
    /// completion or close, `SendToFresh` for a non-`None` first send.
    pub fn check_out(&mut self, sent: &Value) -> Result<Frame, GeneratorStateError> {
        match self.state {
            GenState::Created => {
                if !matches!(sent, Value::None) {
                    return Err(GeneratorStateError::SendToFresh);
                }
            }
            GenState::Suspended => {}
            GenState::Running => return Err(GeneratorStateError::AlreadyRunning),
            GenState::Completed | GenState::Closed => return Err(GeneratorStateError::Exhausted),
        }
        self.state = GenState::Running;
        self.frame.take().ok_or(GeneratorStateError::AlreadyRunning)
    }

    /// Parks the frame back at a yield.
    pub fn park(&mut self, frame: Frame) {
        self.frame = Some(frame);
        self.state = GenState::Suspended;
    }

    /// Records completion with the body's return value. The frame is dropped.
    pub fn finish(&mut self, return_value: Value) {
        self.frame = None;
        self.state = GenState::Completed;
        self.return_value = Some(return_value);
    }

    /// Records that the close signal was honored (or that the generator was
    /// closed before ever starting). The frame is dropped.
    pub fn mark_closed(&mut self) {
        self.frame = None;
        self.state = GenState::Closed;
        if self.return_value.is_none() {
            self.return_value = Some(Value::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeBuilder, CodeRegistry};
    use crate::namespace::{builtins_namespace, Namespace};
    use crate::op::Opcode;

    fn gen_fixture() -> Generator {
        let mut registry = CodeRegistry::new();
        let mut b = CodeBuilder::new("g");
        b.generator();
        b.op(Opcode::LoadNone).op(Opcode::YieldValue).op(Opcode::Pop);
        b.op(Opcode::LoadNone).op(Opcode::ReturnValue);
        let code = b.finish(&mut registry).unwrap();
        let frame = Frame::new(code, Namespace::new().into_ref(), builtins_namespace(), None);
        Generator::new("g".into(), frame)
    }

    #[test]
    fn send_into_fresh_rejected() {
        let mut gen = gen_fixture();
        let err = gen.check_out(&Value::Int(1)).unwrap_err();
        assert_eq!(err, GeneratorStateError::SendToFresh);
        // A None send starts it.
        assert!(gen.check_out(&Value::None).is_ok());
        assert_eq!(gen.state(), GenState::Running);
    }

    #[test]
    fn checked_out_frame_blocks_reentry() {
        let mut gen = gen_fixture();
        let frame = gen.check_out(&Value::None).unwrap();
        assert_eq!(gen.check_out(&Value::None).unwrap_err(), GeneratorStateError::AlreadyRunning);
        gen.park(frame);
        assert_eq!(gen.state(), GenState::Suspended);
    }

    #[test]
    fn finished_generator_is_exhausted() {
        let mut gen = gen_fixture();
        let _frame = gen.check_out(&Value::None).unwrap();
        gen.finish(Value::Int(42));
        assert_eq!(gen.check_out(&Value::None).unwrap_err(), GeneratorStateError::Exhausted);
        assert_eq!(gen.return_value(), Some(&Value::Int(42)));
    }
}
