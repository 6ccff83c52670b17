use crate::chunk::Chunk;
use crate::error::RuntimeError;
use crate::table::Table;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct Function {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct Class {
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

pub struct Instance {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Natives are threaded the heap explicitly (no global `vm` singleton to
/// reach for, unlike the source this was distilled from) so any native that
/// needs to allocate — interning a result string, for instance — can.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, RuntimeError>;

pub struct Native {
    pub name: &'static str,
    pub function: NativeFn,
}

/// The tagged payload every heap object carries alongside its mark bit
/// and intrusive next-link.
pub enum ObjData {
    String(String, u32),
    Upvalue(Cell<UpvalueState>),
    Native(Native),
    Function(Function),
    Closure(Closure),
    Class(Class),
    BoundMethod(BoundMethod),
    Instance(Instance),
    Array(RefCell<Vec<Value>>),
}

impl ObjData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjData::String(..) => "string",
            ObjData::Upvalue(..) => "upvalue",
            ObjData::Native(..) => "native function",
            ObjData::Function(..) => "function",
            ObjData::Closure(..) => "function",
            ObjData::Class(..) => "class",
            ObjData::BoundMethod(..) => "function",
            ObjData::Instance(..) => "instance",
            ObjData::Array(..) => "array",
        }
    }
}

impl fmt::Display for ObjData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjData::String(s, _) => write!(f, "{s}"),
            ObjData::Upvalue(_) => write!(f, "<upvalue>"),
            ObjData::Native(_) => write!(f, "<native fn>"),
            ObjData::Function(function) => match &function.name {
                Some(name) => write!(f, "<fn {}>", name.data),
                None => write!(f, "<script>"),
            },
            ObjData::Closure(closure) => write!(f, "{}", closure.function.data),
            ObjData::Class(class) => write!(f, "{}", class.name.data),
            ObjData::BoundMethod(bound) => write!(f, "{}", bound.method.data),
            ObjData::Instance(instance) => write!(f, "{} instance", instance.class.data),
            ObjData::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A heap-allocated object: a mark bit, an intrusive link into the heap's
/// allocation list, and its tagged payload.
pub struct Obj {
    pub marked: Cell<bool>,
    next: Cell<Option<ObjRef>>,
    pub data: ObjData,
}

/// A non-null pointer to a heap object. Copy, so it behaves like a
/// reference-counted handle would, except the heap (not the handle) owns
/// the pointee; the GC is what keeps it valid.
#[derive(Clone, Copy, Debug)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    fn new(ptr: *mut Obj) -> Self {
        Self(NonNull::new(ptr).expect("allocate never produces a null pointer"))
    }
}

impl Obj {
    pub fn ptr_eq(a: ObjRef, b: ObjRef) -> bool {
        std::ptr::eq(a.0.as_ptr(), b.0.as_ptr())
    }
}

impl std::ops::Deref for ObjRef {
    type Target = Obj;

    fn deref(&self) -> &Obj {
        // SAFETY: the heap never frees an object while it is reachable
        // from a root, and this handle is only ever held while reachable
        // (on the value stack, in a table, or inside another live object).
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        Obj::ptr_eq(*self, *other)
    }
}

/// Owns every heap object, the string-intern table, and the GC's
/// bookkeeping. Threaded explicitly through the compiler and VM rather
/// than kept as a global singleton, per the "stable enumeration of roots"
/// framing: nothing here requires it to be global.
pub struct Heap {
    objects: Option<ObjRef>,
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: None,
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn strings(&self) -> &Table {
        &self.strings
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc || cfg!(feature = "gc_stress")
    }

    fn alloc(&mut self, data: ObjData) -> ObjRef {
        let obj = Box::new(Obj {
            marked: Cell::new(false),
            next: Cell::new(self.objects),
            data,
        });
        self.bytes_allocated += std::mem::size_of::<Obj>();
        let ptr = ObjRef::new(Box::into_raw(obj));
        self.objects = Some(ptr);
        ptr
    }

    /// Interns `s`, returning the existing String object if an equal one
    /// is already present. Callers that build strings from potentially
    /// GC-triggering work must keep the new string reachable (e.g. by
    /// pushing it on the value stack) before calling this, per the
    /// "transient objects must be stack-rooted" rule.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        let obj = self.alloc(ObjData::String(s.to_owned(), hash));
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn alloc_native(&mut self, name: &'static str, function: NativeFn) -> ObjRef {
        self.alloc(ObjData::Native(Native { name, function }))
    }

    pub fn alloc_function(&mut self, function: Function) -> ObjRef {
        self.alloc(ObjData::Function(function))
    }

    pub fn alloc_closure(&mut self, closure: Closure) -> ObjRef {
        self.alloc(ObjData::Closure(closure))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(ObjData::Class(Class {
            name,
            methods: RefCell::new(Table::new()),
        }))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(ObjData::Instance(Instance {
            class,
            fields: RefCell::new(Table::new()),
        }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc(ObjData::BoundMethod(BoundMethod { receiver, method }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> ObjRef {
        self.alloc(ObjData::Upvalue(Cell::new(UpvalueState::Open(slot))))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> ObjRef {
        self.alloc(ObjData::Array(RefCell::new(items)))
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.marked.get() {
            return;
        }
        obj.marked.set(true);
        self.gray.push(obj);
    }

    /// Pops gray objects and marks their outgoing references ("blackens"
    /// them), until the worklist is empty.
    fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            match &obj.data {
                ObjData::String(..) | ObjData::Native(..) => {}
                ObjData::Upvalue(state) => {
                    if let UpvalueState::Closed(value) = state.get() {
                        self.mark_value(value);
                    }
                }
                ObjData::Function(function) => {
                    if let Some(name) = function.name {
                        self.mark_object(name);
                    }
                    for constant in function.chunk.constants() {
                        self.mark_value(*constant);
                    }
                }
                ObjData::Closure(closure) => {
                    self.mark_object(closure.function);
                    for upvalue in &closure.upvalues {
                        self.mark_object(*upvalue);
                    }
                }
                ObjData::Class(class) => {
                    self.mark_object(class.name);
                    for (key, value) in class.methods.borrow().iter() {
                        self.mark_object(key);
                        self.mark_value(value);
                    }
                }
                ObjData::BoundMethod(bound) => {
                    self.mark_value(bound.receiver);
                    self.mark_object(bound.method);
                }
                ObjData::Instance(instance) => {
                    self.mark_object(instance.class);
                    for (key, value) in instance.fields.borrow().iter() {
                        self.mark_object(key);
                        self.mark_value(value);
                    }
                }
                ObjData::Array(items) => {
                    for value in items.borrow().iter() {
                        self.mark_value(*value);
                    }
                }
            }
        }
    }

    /// Runs a full tricolor mark-sweep cycle. `mark_roots` is supplied by
    /// the caller (VM and/or compiler) since only they know their own
    /// roots; the heap knows nothing about call frames or locals.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        mark_roots(self);
        self.trace_references();
        self.strings.remove_white();
        self.sweep();
        self.next_gc = self.bytes_allocated * 2;
    }

    fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.objects;
        while let Some(obj) = current {
            let next = obj.next.get();
            if obj.marked.get() {
                obj.marked.set(false);
                previous = Some(obj);
            } else {
                match previous {
                    Some(p) => p.next.set(next),
                    None => self.objects = next,
                }
                self.bytes_allocated -= std::mem::size_of::<Obj>();
                // SAFETY: `obj` was unlinked above and nothing marked it
                // reachable this cycle, so it has no remaining references.
                unsafe {
                    drop(Box::from_raw(obj.0.as_ptr()));
                }
            }
            current = next;
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while let Some(obj) = current {
            let next = obj.next.get();
            unsafe {
                drop(Box::from_raw(obj.0.as_ptr()));
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_equal_strings_returns_the_same_object() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert!(Obj::ptr_eq(a, b));
    }

    #[test]
    fn collecting_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        heap.intern("unreachable");
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.collect_garbage(|_| {});
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn collecting_keeps_marked_roots_alive() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.intern("discarded");
        let before = heap.bytes_allocated();
        heap.collect_garbage(|heap| heap.mark_object(kept));
        // `len()` counts tombstones, so it can't distinguish "freed" from
        // "turned into a tombstone"; `bytes_allocated` can, since sweep
        // actually drops the unmarked object.
        assert!(heap.bytes_allocated() < before);
        assert_eq!(heap.strings().get(kept), Some(Value::Nil));
        assert_eq!(heap.strings().find_string("discarded", fnv1a(b"discarded")), None);
    }

    #[test]
    fn array_elements_are_traced_through() {
        let mut heap = Heap::new();
        let element = heap.intern("inside");
        let array = heap.alloc_array(vec![Value::Obj(element)]);
        heap.collect_garbage(|heap| heap.mark_object(array));
        assert_eq!(heap.strings().get(element), Some(Value::Nil));
    }
}
