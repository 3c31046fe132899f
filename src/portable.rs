//! Portable continuations: serializing frames, generators and tracebacks.
//!
//! The wire form is a postcard stream: a fixed header (magic bytes and a
//! format version, checked before anything else is interpreted) followed by a
//! body of identity side tables and a root record. Shared objects (cells,
//! namespaces, lists, functions, generators, exception values) are written
//! once into their table, keyed by object identity at capture time, and
//! referenced by index everywhere else; restoring rebuilds one object per
//! table entry, so aliasing inside a single capture survives the round trip.
//! Two separate captures never share objects.
//!
//! Compiled units are never embedded. A frame names its unit by [`CodeId`]
//! and restore resolves it against the caller's registry; both sides must
//! register the same units in the same order.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::code::{CodeId, CodeRegistry};
use crate::error::SerializationError;
use crate::exc::{ExcKind, ExceptionState, TraceNode, Traceback};
use crate::frame::{Block, Frame, PendingAction};
use crate::generator::{GenState, Generator};
use crate::namespace::{ns_addr, Namespace, NsRef};
use crate::value::{Builtin, Cell, FunctionObj, ListIter, ListRef, Value};

const MAGIC: [u8; 4] = *b"GRCN";
/// Bumped on any change to the record layout below.
pub const FORMAT_VERSION: u16 = 1;

// ============================================================================
// Wire records
// ============================================================================

#[derive(Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    version: u16,
}

#[derive(Serialize, Deserialize)]
struct Body {
    cells: Vec<ValRec>,
    namespaces: Vec<Vec<(String, ValRec)>>,
    lists: Vec<Vec<ValRec>>,
    funcs: Vec<FuncRec>,
    gens: Vec<GenRec>,
    excs: Vec<ExcRec>,
    root: RootRec,
}

#[derive(Serialize, Deserialize)]
enum RootRec {
    Frame(FrameRec),
    Generator(u32),
    Traceback(Vec<TraceNode>),
}

#[derive(Serialize, Deserialize)]
enum ValRec {
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(u32),
    Iter { list: u32, index: u64 },
    Cell(u32),
    Function(u32),
    Generator(u32),
    Namespace(u32),
    Exc(u32),
    Builtin(Builtin),
    Pending(Box<ActionRec>),
}

#[derive(Serialize, Deserialize)]
enum ActionRec {
    Return(ValRec),
    Break,
    Continue(u32),
    Raise(ExcRec),
}

#[derive(Serialize, Deserialize)]
struct ExcRec {
    kind: ExcKind,
    payload: ValRec,
    traceback: Vec<TraceNode>,
    context: Option<Box<ExcRec>>,
}

#[derive(Serialize, Deserialize)]
struct FuncRec {
    name: String,
    code: u32,
    globals: u32,
    builtins: u32,
    closure: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
enum GenStateRec {
    Created,
    Suspended,
    /// Exhaustion marker: the body finished (or was closed); no frame
    /// follows, only the return value.
    Completed,
    Closed,
}

#[derive(Serialize, Deserialize)]
struct GenRec {
    name: String,
    state: GenStateRec,
    frame: Option<FrameRec>,
    return_value: Option<ValRec>,
}

#[derive(Serialize, Deserialize)]
struct FrameRec {
    code: u32,
    ip: u32,
    stack: Vec<ValRec>,
    blocks: Vec<Block>,
    locals: Vec<ValRec>,
    cells: Vec<u32>,
    globals: u32,
    builtins: u32,
    names: Option<u32>,
    last_exception: Option<ExcRec>,
    /// The calling-frame chain, present only when the host left it attached.
    back: Option<Box<FrameRec>>,
}

// ============================================================================
// Public entry points
// ============================================================================

/// Serializes a frame (and its attached back chain, if any).
///
/// # Errors
///
/// [`SerializationError::Unsupported`] when something reachable from the
/// frame cannot be captured (a running generator); codec failures pass
/// through.
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, SerializationError> {
    let mut enc = Encoder::default();
    let root = RootRec::Frame(enc.encode_frame(frame)?);
    to_stream(enc, root)
}

/// Restores a frame serialized by [`serialize_frame`].
///
/// # Errors
///
/// Header mismatches fail before any record is read; dangling references and
/// shapes that do not fit the registered unit fail with
/// [`SerializationError::Corrupt`].
pub fn deserialize_frame(bytes: &[u8], registry: &CodeRegistry) -> Result<Frame, SerializationError> {
    let body = from_stream(bytes)?;
    let dec = Decoder::build(registry, &body)?;
    match &body.root {
        RootRec::Frame(rec) => dec.decode_frame(rec),
        _ => Err(SerializationError::Corrupt("stream root is not a frame")),
    }
}

/// Serializes a suspended (or created, or exhausted) generator.
///
/// # Errors
///
/// A generator whose frame is checked out by an active resume cannot be
/// captured and fails with [`SerializationError::Unsupported`].
pub fn serialize_generator(gen: &Rc<RefCell<Generator>>) -> Result<Vec<u8>, SerializationError> {
    let mut enc = Encoder::default();
    let id = enc.gen_id(gen)?;
    to_stream(enc, RootRec::Generator(id))
}

/// Restores a generator serialized by [`serialize_generator`].
pub fn deserialize_generator(
    bytes: &[u8],
    registry: &CodeRegistry,
) -> Result<Rc<RefCell<Generator>>, SerializationError> {
    let body = from_stream(bytes)?;
    let dec = Decoder::build(registry, &body)?;
    match &body.root {
        RootRec::Generator(id) => dec
            .gens
            .get(*id as usize)
            .cloned()
            .ok_or(SerializationError::Corrupt("dangling generator reference")),
        _ => Err(SerializationError::Corrupt("stream root is not a generator")),
    }
}

/// Serializes a traceback on its own (for error reporting across hosts).
pub fn serialize_traceback(traceback: &Traceback) -> Result<Vec<u8>, SerializationError> {
    to_stream(Encoder::default(), RootRec::Traceback(traceback.nodes().to_vec()))
}

/// Restores a traceback serialized by [`serialize_traceback`].
pub fn deserialize_traceback(bytes: &[u8]) -> Result<Traceback, SerializationError> {
    let body = from_stream(bytes)?;
    match body.root {
        RootRec::Traceback(nodes) => Ok(Traceback::from_nodes(nodes)),
        _ => Err(SerializationError::Corrupt("stream root is not a traceback")),
    }
}

fn to_stream(enc: Encoder, root: RootRec) -> Result<Vec<u8>, SerializationError> {
    let body = enc.into_body(root);
    let mut out = postcard::to_stdvec(&Header {
        magic: MAGIC,
        version: FORMAT_VERSION,
    })?;
    out.extend(postcard::to_stdvec(&body)?);
    Ok(out)
}

fn from_stream(bytes: &[u8]) -> Result<Body, SerializationError> {
    let (header, rest) = postcard::take_from_bytes::<Header>(bytes)?;
    if header.magic != MAGIC {
        return Err(SerializationError::BadMagic);
    }
    if header.version != FORMAT_VERSION {
        return Err(SerializationError::VersionMismatch {
            found: header.version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(postcard::from_bytes::<Body>(rest)?)
}

// ============================================================================
// Encoding
// ============================================================================

/// Reserve-then-fill tables: an object's index is assigned before its
/// contents are encoded, so reference cycles terminate.
#[derive(Default)]
struct Encoder {
    cells: Vec<Option<ValRec>>,
    cell_ids: AHashMap<usize, u32>,
    namespaces: Vec<Option<Vec<(String, ValRec)>>>,
    ns_ids: AHashMap<usize, u32>,
    lists: Vec<Option<Vec<ValRec>>>,
    list_ids: AHashMap<usize, u32>,
    funcs: Vec<Option<FuncRec>>,
    func_ids: AHashMap<usize, u32>,
    gens: Vec<Option<GenRec>>,
    gen_ids: AHashMap<usize, u32>,
    excs: Vec<Option<ExcRec>>,
    exc_ids: AHashMap<usize, u32>,
}

fn filled<T>(table: Vec<Option<T>>) -> Vec<T> {
    table
        .into_iter()
        .map(|slot| slot.expect("record reserved but never filled"))
        .collect()
}

impl Encoder {
    fn into_body(self, root: RootRec) -> Body {
        Body {
            cells: filled(self.cells),
            namespaces: filled(self.namespaces),
            lists: filled(self.lists),
            funcs: filled(self.funcs),
            gens: filled(self.gens),
            excs: filled(self.excs),
            root,
        }
    }

    fn encode_value(&mut self, value: &Value) -> Result<ValRec, SerializationError> {
        Ok(match value {
            Value::Undefined => ValRec::Undefined,
            Value::None => ValRec::None,
            Value::Bool(b) => ValRec::Bool(*b),
            Value::Int(n) => ValRec::Int(*n),
            Value::Float(f) => ValRec::Float(*f),
            Value::Str(s) => ValRec::Str(s.to_string()),
            Value::List(list) => ValRec::List(self.list_id(list)?),
            Value::Iter(iter) => {
                let iter = iter.borrow();
                ValRec::Iter {
                    list: self.list_id(&iter.list)?,
                    index: iter.index as u64,
                }
            }
            Value::Cell(cell) => ValRec::Cell(self.cell_id(cell)?),
            Value::Function(func) => ValRec::Function(self.func_id(func)?),
            Value::Generator(gen) => ValRec::Generator(self.gen_id(gen)?),
            Value::Namespace(ns) => ValRec::Namespace(self.ns_id(ns)?),
            Value::Exc(exc) => ValRec::Exc(self.exc_id(exc)?),
            Value::Builtin(b) => ValRec::Builtin(*b),
            Value::Pending(action) => ValRec::Pending(Box::new(self.encode_action(action)?)),
        })
    }

    fn encode_action(&mut self, action: &PendingAction) -> Result<ActionRec, SerializationError> {
        Ok(match action {
            PendingAction::Return(v) => ActionRec::Return(self.encode_value(v)?),
            PendingAction::Break => ActionRec::Break,
            PendingAction::Continue(target) => ActionRec::Continue(*target),
            PendingAction::Raise(exc) => ActionRec::Raise(self.encode_exc(exc)?),
        })
    }

    fn encode_exc(&mut self, exc: &ExceptionState) -> Result<ExcRec, SerializationError> {
        let context = match &exc.context {
            Some(inner) => Some(Box::new(self.encode_exc(inner)?)),
            None => None,
        };
        Ok(ExcRec {
            kind: exc.kind,
            payload: self.encode_value(&exc.payload)?,
            traceback: exc.traceback.nodes().to_vec(),
            context,
        })
    }

    fn encode_frame(&mut self, frame: &Frame) -> Result<FrameRec, SerializationError> {
        let stack = frame
            .stack
            .iter()
            .map(|v| self.encode_value(v))
            .collect::<Result<_, _>>()?;
        let locals = frame
            .locals
            .iter()
            .map(|v| self.encode_value(v))
            .collect::<Result<_, _>>()?;
        let cells = frame
            .cells
            .iter()
            .map(|c| self.cell_id(c))
            .collect::<Result<_, _>>()?;
        let last_exception = match &frame.last_exception {
            Some(exc) => Some(self.encode_exc(exc)?),
            None => None,
        };
        let names = match &frame.names {
            Some(ns) => Some(self.ns_id(ns)?),
            None => None,
        };
        let back = match &frame.back {
            Some(caller) => Some(Box::new(self.encode_frame(caller)?)),
            None => None,
        };
        Ok(FrameRec {
            code: frame.code.id().0,
            ip: frame.ip,
            stack,
            blocks: frame.blocks.clone(),
            locals,
            cells,
            globals: self.ns_id(&frame.globals)?,
            builtins: self.ns_id(&frame.builtins)?,
            names,
            last_exception,
            back,
        })
    }

    fn cell_id(&mut self, cell: &Cell) -> Result<u32, SerializationError> {
        if let Some(&id) = self.cell_ids.get(&cell.addr()) {
            return Ok(id);
        }
        let id = self.cells.len() as u32;
        self.cells.push(None);
        self.cell_ids.insert(cell.addr(), id);
        let rec = self.encode_value(&cell.get())?;
        self.cells[id as usize] = Some(rec);
        Ok(id)
    }

    fn ns_id(&mut self, ns: &NsRef) -> Result<u32, SerializationError> {
        if let Some(&id) = self.ns_ids.get(&ns_addr(ns)) {
            return Ok(id);
        }
        let id = self.namespaces.len() as u32;
        self.namespaces.push(None);
        self.ns_ids.insert(ns_addr(ns), id);
        let entries = ns.borrow().iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<Vec<_>>();
        let mut rec = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            rec.push((name, self.encode_value(&value)?));
        }
        self.namespaces[id as usize] = Some(rec);
        Ok(id)
    }

    fn list_id(&mut self, list: &ListRef) -> Result<u32, SerializationError> {
        let addr = Rc::as_ptr(list) as usize;
        if let Some(&id) = self.list_ids.get(&addr) {
            return Ok(id);
        }
        let id = self.lists.len() as u32;
        self.lists.push(None);
        self.list_ids.insert(addr, id);
        let items = list.borrow().clone();
        let mut rec = Vec::with_capacity(items.len());
        for item in &items {
            rec.push(self.encode_value(item)?);
        }
        self.lists[id as usize] = Some(rec);
        Ok(id)
    }

    fn func_id(&mut self, func: &Rc<FunctionObj>) -> Result<u32, SerializationError> {
        let addr = Rc::as_ptr(func) as usize;
        if let Some(&id) = self.func_ids.get(&addr) {
            return Ok(id);
        }
        let id = self.funcs.len() as u32;
        self.funcs.push(None);
        self.func_ids.insert(addr, id);
        let closure = func
            .closure
            .iter()
            .map(|c| self.cell_id(c))
            .collect::<Result<_, _>>()?;
        let rec = FuncRec {
            name: func.name.to_string(),
            code: func.code.id().0,
            globals: self.ns_id(&func.globals)?,
            builtins: self.ns_id(&func.builtins)?,
            closure,
        };
        self.funcs[id as usize] = Some(rec);
        Ok(id)
    }

    fn exc_id(&mut self, exc: &Rc<ExceptionState>) -> Result<u32, SerializationError> {
        let addr = Rc::as_ptr(exc) as usize;
        if let Some(&id) = self.exc_ids.get(&addr) {
            return Ok(id);
        }
        let id = self.excs.len() as u32;
        self.excs.push(None);
        self.exc_ids.insert(addr, id);
        let rec = self.encode_exc(exc)?;
        self.excs[id as usize] = Some(rec);
        Ok(id)
    }

    fn gen_id(&mut self, gen: &Rc<RefCell<Generator>>) -> Result<u32, SerializationError> {
        let addr = Rc::as_ptr(gen) as usize;
        if let Some(&id) = self.gen_ids.get(&addr) {
            return Ok(id);
        }
        let id = self.gens.len() as u32;
        self.gens.push(None);
        self.gen_ids.insert(addr, id);

        // Holding the shared borrow across the recursion is fine: a
        // self-reference re-enters through the memo check above, which only
        // needs another shared borrow.
        let guard = gen.borrow();
        let state = match guard.state() {
            GenState::Created => GenStateRec::Created,
            GenState::Suspended => GenStateRec::Suspended,
            GenState::Completed => GenStateRec::Completed,
            GenState::Closed => GenStateRec::Closed,
            GenState::Running => return Err(SerializationError::Unsupported("running generator")),
        };
        let frame = match guard.frame() {
            Some(frame) => Some(self.encode_frame(frame)?),
            None => None,
        };
        let return_value = match guard.return_value() {
            Some(v) => Some(self.encode_value(v)?),
            None => None,
        };
        self.gens[id as usize] = Some(GenRec {
            name: guard.name.to_string(),
            state,
            frame,
            return_value,
        });
        Ok(id)
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Two-phase restore: handles for every table entry exist before any entry's
/// contents are decoded, so cycles resolve to the already-created handles.
/// Exception values are immutable, so their table is resolved on demand
/// instead; a reference cycle among them cannot have been captured and is
/// reported as corruption.
struct Decoder<'r> {
    registry: &'r CodeRegistry,
    cells: Vec<Cell>,
    namespaces: Vec<NsRef>,
    lists: Vec<ListRef>,
    funcs: Vec<Rc<FunctionObj>>,
    gens: Vec<Rc<RefCell<Generator>>>,
    exc_recs: &'r [ExcRec],
    excs: RefCell<Vec<ExcSlot>>,
}

#[derive(Clone)]
enum ExcSlot {
    Pending,
    Decoding,
    Ready(Rc<ExceptionState>),
}

impl<'r> Decoder<'r> {
    fn build(registry: &'r CodeRegistry, body: &'r Body) -> Result<Self, SerializationError> {
        // Phase one: allocate every handle empty.
        let cells: Vec<Cell> = (0..body.cells.len()).map(|_| Cell::unbound()).collect();
        let namespaces: Vec<NsRef> = (0..body.namespaces.len())
            .map(|_| Namespace::new().into_ref())
            .collect();
        let lists: Vec<ListRef> = (0..body.lists.len())
            .map(|_| Rc::new(RefCell::new(Vec::new())))
            .collect();
        let gens: Vec<Rc<RefCell<Generator>>> = body
            .gens
            .iter()
            .map(|rec| {
                let state = gen_state(&rec.state);
                Rc::new(RefCell::new(Generator::restore(rec.name.as_str().into(), state, None, None)))
            })
            .collect();

        // Functions only reference handles and the registry, so they can be
        // built eagerly.
        let mut funcs = Vec::with_capacity(body.funcs.len());
        let partial = Self {
            registry,
            cells,
            namespaces,
            lists,
            funcs: Vec::new(),
            gens,
            exc_recs: &body.excs,
            excs: RefCell::new(vec![ExcSlot::Pending; body.excs.len()]),
        };
        for rec in &body.funcs {
            let code = registry
                .get(CodeId(rec.code))
                .ok_or(SerializationError::UnknownCode(CodeId(rec.code)))?;
            let closure = rec
                .closure
                .iter()
                .map(|&id| partial.cell(id))
                .collect::<Result<_, _>>()?;
            funcs.push(Rc::new(FunctionObj {
                name: rec.name.as_str().into(),
                code: Arc::clone(code),
                globals: partial.namespace(rec.globals)?,
                builtins: partial.namespace(rec.builtins)?,
                closure,
            }));
        }
        let dec = Self { funcs, ..partial };

        // Phase two: fill every handle.
        for (cell, rec) in dec.cells.iter().zip(&body.cells) {
            cell.set(dec.decode_value(rec)?);
        }
        for (ns, recs) in dec.namespaces.iter().zip(&body.namespaces) {
            let mut ns = ns.borrow_mut();
            for (name, rec) in recs {
                ns.set(name.as_str(), dec.decode_value(rec)?);
            }
        }
        for (list, recs) in dec.lists.iter().zip(&body.lists) {
            let mut items = Vec::with_capacity(recs.len());
            for rec in recs {
                items.push(dec.decode_value(rec)?);
            }
            *list.borrow_mut() = items;
        }
        for (gen, rec) in dec.gens.iter().zip(&body.gens) {
            let frame = match &rec.frame {
                Some(frame_rec) => Some(dec.decode_frame(frame_rec)?),
                None => None,
            };
            let return_value = match &rec.return_value {
                Some(v) => Some(dec.decode_value(v)?),
                None => None,
            };
            *gen.borrow_mut() = Generator::restore(rec.name.as_str().into(), gen_state(&rec.state), frame, return_value);
        }
        Ok(dec)
    }

    fn decode_value(&self, rec: &ValRec) -> Result<Value, SerializationError> {
        Ok(match rec {
            ValRec::Undefined => Value::Undefined,
            ValRec::None => Value::None,
            ValRec::Bool(b) => Value::Bool(*b),
            ValRec::Int(n) => Value::Int(*n),
            ValRec::Float(f) => Value::Float(*f),
            ValRec::Str(s) => Value::str(s.as_str()),
            ValRec::List(id) => Value::List(self.list(*id)?),
            ValRec::Iter { list, index } => Value::Iter(Rc::new(RefCell::new(ListIter {
                list: self.list(*list)?,
                index: *index as usize,
            }))),
            ValRec::Cell(id) => Value::Cell(self.cell(*id)?),
            ValRec::Function(id) => Value::Function(
                self.funcs
                    .get(*id as usize)
                    .cloned()
                    .ok_or(SerializationError::Corrupt("dangling function reference"))?,
            ),
            ValRec::Generator(id) => Value::Generator(
                self.gens
                    .get(*id as usize)
                    .cloned()
                    .ok_or(SerializationError::Corrupt("dangling generator reference"))?,
            ),
            ValRec::Namespace(id) => Value::Namespace(self.namespace(*id)?),
            ValRec::Exc(id) => Value::Exc(self.exc(*id)?),
            ValRec::Builtin(b) => Value::Builtin(*b),
            ValRec::Pending(action) => Value::Pending(Box::new(self.decode_action(action)?)),
        })
    }

    fn decode_action(&self, rec: &ActionRec) -> Result<PendingAction, SerializationError> {
        Ok(match rec {
            ActionRec::Return(v) => PendingAction::Return(self.decode_value(v)?),
            ActionRec::Break => PendingAction::Break,
            ActionRec::Continue(target) => PendingAction::Continue(*target),
            ActionRec::Raise(exc) => PendingAction::Raise(self.decode_exc(exc)?),
        })
    }

    fn decode_exc(&self, rec: &ExcRec) -> Result<ExceptionState, SerializationError> {
        let context = match &rec.context {
            Some(inner) => Some(Box::new(self.decode_exc(inner)?)),
            None => None,
        };
        Ok(ExceptionState {
            kind: rec.kind,
            payload: self.decode_value(&rec.payload)?,
            traceback: Traceback::from_nodes(rec.traceback.clone()),
            context,
        })
    }

    fn decode_frame(&self, rec: &FrameRec) -> Result<Frame, SerializationError> {
        let code = self
            .registry
            .get(CodeId(rec.code))
            .ok_or(SerializationError::UnknownCode(CodeId(rec.code)))?;
        if code.declared_depth_at(rec.ip).is_none() {
            return Err(SerializationError::Corrupt("resume point is not an instruction boundary"));
        }
        if rec.stack.len() > code.max_stack() as usize {
            return Err(SerializationError::Corrupt("operand stack exceeds the unit's declared maximum"));
        }
        if rec.locals.len() != code.varnames().len() {
            return Err(SerializationError::Corrupt("locals shape does not match the compiled unit"));
        }
        if rec.cells.len() != code.cellvars().len() + code.freevars().len() {
            return Err(SerializationError::Corrupt("cell count does not match the compiled unit"));
        }
        let stack = rec
            .stack
            .iter()
            .map(|v| self.decode_value(v))
            .collect::<Result<_, _>>()?;
        let locals = rec
            .locals
            .iter()
            .map(|v| self.decode_value(v))
            .collect::<Result<_, _>>()?;
        let cells = rec.cells.iter().map(|&id| self.cell(id)).collect::<Result<_, _>>()?;
        let last_exception = match &rec.last_exception {
            Some(exc) => Some(self.decode_exc(exc)?),
            None => None,
        };
        let names = match rec.names {
            Some(id) => Some(self.namespace(id)?),
            None => None,
        };
        let back = match &rec.back {
            Some(caller) => Some(Box::new(self.decode_frame(caller)?)),
            None => None,
        };
        Ok(Frame {
            code: Arc::clone(code),
            ip: rec.ip,
            stack,
            blocks: rec.blocks.clone(),
            locals,
            cells,
            globals: self.namespace(rec.globals)?,
            builtins: self.namespace(rec.builtins)?,
            names,
            last_exception,
            back,
        })
    }

    fn cell(&self, id: u32) -> Result<Cell, SerializationError> {
        self.cells
            .get(id as usize)
            .cloned()
            .ok_or(SerializationError::Corrupt("dangling cell reference"))
    }

    fn namespace(&self, id: u32) -> Result<NsRef, SerializationError> {
        self.namespaces
            .get(id as usize)
            .cloned()
            .ok_or(SerializationError::Corrupt("dangling namespace reference"))
    }

    fn list(&self, id: u32) -> Result<ListRef, SerializationError> {
        self.lists
            .get(id as usize)
            .cloned()
            .ok_or(SerializationError::Corrupt("dangling list reference"))
    }

    fn exc(&self, id: u32) -> Result<Rc<ExceptionState>, SerializationError> {
        let slot = self
            .excs
            .borrow()
            .get(id as usize)
            .cloned()
            .ok_or(SerializationError::Corrupt("dangling exception reference"))?;
        match slot {
            ExcSlot::Ready(exc) => Ok(exc),
            ExcSlot::Decoding => Err(SerializationError::Corrupt("cyclic exception reference")),
            ExcSlot::Pending => {
                self.excs.borrow_mut()[id as usize] = ExcSlot::Decoding;
                let exc = Rc::new(self.decode_exc(&self.exc_recs[id as usize])?);
                self.excs.borrow_mut()[id as usize] = ExcSlot::Ready(Rc::clone(&exc));
                Ok(exc)
            }
        }
    }
}

fn gen_state(rec: &GenStateRec) -> GenState {
    match rec {
        GenStateRec::Created => GenState::Created,
        GenStateRec::Suspended => GenState::Suspended,
        GenStateRec::Completed => GenState::Completed,
        GenStateRec::Closed => GenState::Closed,
    }
}
