//! The host facade: owns the registry and root namespaces, runs code.
//!
//! A [`Machine`] is the embedding API. It owns the compiled-unit registry,
//! the module globals and the builtins, and constructs a fresh interpreter
//! activation for each entry point. Continuation capture and restore resolve
//! compiled units against this machine's registry.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::code::{Code, CodeRegistry};
use crate::error::{GeneratorStateError, VmError};
use crate::exc::{ExcKind, ExceptionState};
use crate::frame::Frame;
use crate::generator::Generator;
use crate::interp::{Interp, Outcome, ResumeOutcome};
use crate::namespace::{builtins_namespace, Namespace, NsRef};
use crate::portable;
use crate::resolver::resolve_exec_namespaces;
use crate::trace::{NullTrace, TraceSink};
use crate::value::Value;

const DEFAULT_RECURSION_LIMIT: usize = 1000;

/// An execution host: registry, root namespaces, trace sink.
pub struct Machine<T: TraceSink = NullTrace> {
    registry: CodeRegistry,
    globals: NsRef,
    builtins: NsRef,
    recursion_limit: usize,
    trace: T,
}

impl Machine<NullTrace> {
    /// Creates a machine with empty globals, the default builtins and no
    /// tracing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace(NullTrace)
    }
}

impl Default for Machine<NullTrace> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TraceSink> Machine<T> {
    /// Creates a machine reporting execution anchors to `trace`.
    pub fn with_trace(trace: T) -> Self {
        Self {
            registry: CodeRegistry::new(),
            globals: Namespace::new().into_ref(),
            builtins: builtins_namespace(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            trace,
        }
    }

    /// The compiled-unit registry. Builders register against this.
    #[must_use]
    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    /// Mutable registry access for registering units.
    pub fn registry_mut(&mut self) -> &mut CodeRegistry {
        &mut self.registry
    }

    /// The module globals namespace.
    #[must_use]
    pub fn globals(&self) -> &NsRef {
        &self.globals
    }

    /// The builtins namespace.
    #[must_use]
    pub fn builtins(&self) -> &NsRef {
        &self.builtins
    }

    /// The trace sink, for reading back recorded anchors.
    #[must_use]
    pub fn trace(&self) -> &T {
        &self.trace
    }

    /// Caps the combined interpreted call depth (frames plus nested
    /// generator activations).
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit;
    }

    /// Runs a module body to completion under this machine's globals.
    ///
    /// # Errors
    ///
    /// Uncaught interpreted exceptions surface as [`VmError::Uncaught`];
    /// a yield at module level is an illegal instruction.
    pub fn run_module(&mut self, code: &Arc<Code>) -> Result<Value, VmError> {
        debug!(unit = code.name(), "run module");
        let frame = Frame::new(
            Arc::clone(code),
            Rc::clone(&self.globals),
            Rc::clone(&self.builtins),
            Some(Rc::clone(&self.globals)),
        );
        self.run_frames(vec![frame])
    }

    /// Calls an interpreted function with `args`. Calling a generator-flagged
    /// function returns the generator without running the body.
    ///
    /// # Errors
    ///
    /// A non-function callee or an arity mismatch surfaces as an uncaught
    /// `TypeError`.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        let Value::Function(func) = callee else {
            return Err(VmError::Uncaught(ExceptionState::msg(
                ExcKind::TypeError,
                format!("'{}' object is not callable", callee.type_name()),
            )));
        };
        if args.len() != func.code.arg_count() as usize {
            return Err(VmError::Uncaught(ExceptionState::msg(
                ExcKind::TypeError,
                format!(
                    "{}() takes {} arguments ({} given)",
                    func.name,
                    func.code.arg_count(),
                    args.len()
                ),
            )));
        }
        debug!(unit = func.code.name(), "call function");
        let frame = Frame::activate(func, args);
        if func.code.flags().generator {
            let gen = Generator::new(Arc::clone(&func.name), frame);
            return Ok(Value::Generator(Rc::new(RefCell::new(gen))));
        }
        self.run_frames(vec![frame])
    }

    /// Executes a dynamically compiled snippet under namespaces chosen by the
    /// namespace-argument rules. With no arguments the snippet shares this
    /// machine's globals.
    ///
    /// # Errors
    ///
    /// A non-mapping namespace argument fails with
    /// [`VmError::NamespaceType`] before any instruction runs.
    pub fn exec_dynamic(
        &mut self,
        code: &Arc<Code>,
        globals_arg: Option<Value>,
        locals_arg: Option<Value>,
    ) -> Result<Value, VmError> {
        let resolved = resolve_exec_namespaces(
            &self.globals,
            &self.globals,
            &self.builtins,
            globals_arg,
            locals_arg,
        )?;
        debug!(unit = code.name(), "exec dynamic snippet");
        let frame = Frame::new(
            Arc::clone(code),
            resolved.globals,
            Rc::clone(&self.builtins),
            Some(resolved.names),
        );
        self.run_frames(vec![frame])
    }

    /// Resumes a generator, sending `value` to its waiting yield. Returns the
    /// next yielded value.
    ///
    /// # Errors
    ///
    /// When the body returns instead of yielding, the generator moves to its
    /// terminal state and the resume fails with
    /// [`GeneratorStateError::Exhausted`](crate::GeneratorStateError::Exhausted);
    /// the return value stays readable through [`Generator::return_value`].
    pub fn resume(&mut self, gen: &Rc<RefCell<Generator>>, value: Value) -> Result<Value, VmError> {
        let mut interp = Interp::new(&self.registry, &mut self.trace, self.recursion_limit);
        match interp.resume(gen, value)? {
            ResumeOutcome::Yielded(v) => Ok(v),
            ResumeOutcome::Completed(_) => Err(GeneratorStateError::Exhausted.into()),
        }
    }

    /// Throws an exception into a generator: at its yield point when
    /// suspended, at the top of the body when it has never been resumed.
    /// Exhaustion surfaces exactly as for [`resume`](Self::resume).
    pub fn throw_into(&mut self, gen: &Rc<RefCell<Generator>>, exc: ExceptionState) -> Result<Value, VmError> {
        let mut interp = Interp::new(&self.registry, &mut self.trace, self.recursion_limit);
        match interp.throw_into(gen, exc)? {
            ResumeOutcome::Yielded(v) => Ok(v),
            ResumeOutcome::Completed(_) => Err(GeneratorStateError::Exhausted.into()),
        }
    }

    /// Closes a generator, delivering the close signal at its yield point.
    pub fn close_generator(&mut self, gen: &Rc<RefCell<Generator>>) -> Result<(), VmError> {
        let mut interp = Interp::new(&self.registry, &mut self.trace, self.recursion_limit);
        interp.close(gen)
    }

    /// Captures a suspended generator as a portable continuation stream.
    pub fn capture_generator(&self, gen: &Rc<RefCell<Generator>>) -> Result<Vec<u8>, VmError> {
        Ok(portable::serialize_generator(gen)?)
    }

    /// Restores a generator captured by [`capture_generator`](Self::capture_generator),
    /// resolving compiled units against this machine's registry.
    pub fn restore_generator(&self, bytes: &[u8]) -> Result<Rc<RefCell<Generator>>, VmError> {
        Ok(portable::deserialize_generator(bytes, &self.registry)?)
    }

    /// Captures a standalone frame (its back chain included, if attached).
    pub fn capture_frame(&self, frame: &Frame) -> Result<Vec<u8>, VmError> {
        Ok(portable::serialize_frame(frame)?)
    }

    /// Restores a frame captured by [`capture_frame`](Self::capture_frame).
    pub fn restore_frame(&self, bytes: &[u8]) -> Result<Frame, VmError> {
        Ok(portable::deserialize_frame(bytes, &self.registry)?)
    }

    fn run_frames(&mut self, mut frames: Vec<Frame>) -> Result<Value, VmError> {
        let mut interp = Interp::new(&self.registry, &mut self.trace, self.recursion_limit);
        match interp.run(&mut frames)? {
            Outcome::Returned(value) => Ok(value),
            Outcome::Yielded(_) => Err(VmError::IllegalInstruction("yield outside a generator activation")),
        }
    }
}
