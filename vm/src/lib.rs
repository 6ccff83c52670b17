pub mod natives;

use colored::Colorize;
use compiler::chunk::{Chunk, OpCode};
use compiler::compile;
use compiler::error::{Diagnostics, RuntimeError};
use compiler::object::{Closure, Heap, NativeFn, ObjData, ObjRef, UpvalueState};
use compiler::table::Table;
use compiler::value::Value;

const FRAMES_MAX: usize = 64;
const STACK_SLOTS_PER_FRAME: usize = 256;

/// One call's worth of bookkeeping: the closure being run, an instruction
/// pointer into its chunk, and the stack index of its slot 0. Mirrors
/// clox's `CallFrame`, except `slots` is an index into the VM's `Vec`
/// rather than a raw pointer, since the stack can reallocate.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

/// What a failed `interpret()` call reports. No distinction is made
/// between "compile error" and "runtime error" beyond this tag — both
/// have already been printed by the time this is returned, matching
/// clox's `INTERPRET_COMPILE_ERROR`/`INTERPRET_RUNTIME_ERROR` sentinels.
pub enum InterpretError {
    Compile(Diagnostics),
    Runtime,
}

/// The virtual machine: heap, globals, value stack, and call frames,
/// threaded explicitly rather than kept as a global singleton (spec's own
/// redesign note — "an idiomatic rewrite threads a VM handle through the
/// dispatch loop, compiler, and object allocator"). A single `Vm` can run
/// many `interpret()` calls against the same heap, which is what a REPL
/// needs: each line compiles against, and can see globals defined by, the
/// ones before it.
pub struct Vm {
    heap: Heap,
    globals: Table,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Sorted by descending stack slot, matching `captureUpvalue`'s
    /// invariant so `close_upvalues` can stop at the first upvalue above
    /// the closing point.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            globals: Table::new(),
            stack: Vec::with_capacity(FRAMES_MAX * STACK_SLOTS_PER_FRAME),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            init_string,
        };
        vm.install_natives();
        vm
    }

    fn install_natives(&mut self) {
        self.define_native("clock", natives::clock);
        self.define_native("scan", natives::scan);
        self.define_native("sin", natives::sin);
        if cfg!(feature = "debug") {
            self.define_native("bytes_allocated", natives::bytes_allocated);
            self.define_native("next_gc", natives::next_gc);
            for name in natives::DIAGNOSTIC_NATIVE_NAMES {
                self.define_native(name, natives::unreachable_diagnostic);
            }
        }
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let obj = self.heap.alloc_native(name, function);
        let key = self.heap.intern(name);
        self.globals.set(key, Value::Obj(obj));
    }

    /// Compiles and runs `source` against this VM's heap and globals.
    /// Returning `Err` means diagnostics have already been printed; the
    /// caller only needs the variant to pick an exit code.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        self.stack.push(Value::Obj(function));
        let closure = self.heap.alloc_closure(Closure {
            function,
            upvalues: Vec::new(),
        });
        self.stack.pop();
        self.push(Value::Obj(closure));
        if let Err(err) = self.call_value(Value::Obj(closure), 0) {
            return Err(self.report_runtime_error(err));
        }
        self.run().map_err(|err| self.report_runtime_error(err))
    }

    // --- stack -----------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn with_chunk<T>(&self, f: impl FnOnce(&Chunk) -> T) -> T {
        let closure = self.frame().closure;
        let ObjData::Closure(c) = &closure.data else {
            unreachable!("frame closure is always a Closure")
        };
        let function = c.function;
        let ObjData::Function(func) = &function.data else {
            unreachable!("closure always wraps a Function")
        };
        f(&func.chunk)
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.with_chunk(|chunk| chunk.byte(ip));
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frame().ip;
        let value = self.with_chunk(|chunk| chunk.read_u16(ip));
        self.frame_mut().ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.with_chunk(|chunk| chunk.constant(idx))
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant()
            .as_obj()
            .expect("identifier constants are always strings")
    }

    fn closure_upvalue(&self, slot: usize) -> ObjRef {
        let closure = self.frame().closure;
        let ObjData::Closure(c) = &closure.data else {
            unreachable!()
        };
        c.upvalues[slot]
    }

    // --- garbage collection -----------------------------------------

    /// Roots are the value stack, every active frame's closure, the open
    /// upvalue list, the globals table, and `init_string` — exactly
    /// `markRoots`' list, minus the compiler chain (there is none once
    /// `compile()` has returned).
    fn collect_garbage(&mut self) {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        self.heap.collect_garbage(|heap| {
            for value in stack {
                heap.mark_value(*value);
            }
            for frame in frames {
                heap.mark_object(frame.closure);
            }
            for upvalue in open_upvalues {
                heap.mark_object(*upvalue);
            }
            for (key, value) in globals.iter() {
                heap.mark_object(key);
                heap.mark_value(value);
            }
            heap.mark_object(init_string);
        });
    }

    // --- upvalues -----------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        if let Some(existing) = self.open_upvalues.iter().find(|uv| {
            let ObjData::Upvalue(state) = &uv.data else {
                unreachable!()
            };
            matches!(state.get(), UpvalueState::Open(s) if s == slot)
        }) {
            return *existing;
        }
        let upvalue = self.heap.alloc_upvalue(slot);
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|uv| {
                let ObjData::Upvalue(state) = &uv.data else {
                    unreachable!()
                };
                matches!(state.get(), UpvalueState::Open(s) if s < slot)
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let ObjData::Upvalue(state) = &upvalue.data else {
                unreachable!()
            };
            let UpvalueState::Open(slot) = state.get() else {
                break;
            };
            if slot < from {
                break;
            }
            state.set(UpvalueState::Closed(self.stack[slot]));
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        let ObjData::Upvalue(state) = &upvalue.data else {
            unreachable!()
        };
        match state.get() {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        let ObjData::Upvalue(state) = &upvalue.data else {
            unreachable!()
        };
        match state.get() {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => state.set(UpvalueState::Closed(value)),
        }
    }

    // --- calls --------------------------------------------------------

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let ObjData::Closure(c) = &closure.data else {
            unreachable!("call_closure requires a Closure")
        };
        let function = c.function;
        let ObjData::Function(f) = &function.data else {
            unreachable!()
        };
        if argc != f.arity {
            return Err(RuntimeError::WrongArgCount {
                expected: f.arity as usize,
                got: argc as usize,
            });
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(obj) = callee else {
            return Err(RuntimeError::CanOnlyCallFunctionsAndClasses);
        };
        match &obj.data {
            ObjData::Closure(_) => self.call_closure(obj, argc),
            ObjData::Native(native) => {
                let function = native.function;
                let start = self.stack.len() - argc as usize;
                let result = function(&mut self.heap, &self.stack[start..])?;
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            ObjData::Class(class) => {
                let method = class.methods.borrow().get(self.init_string);
                let instance = self.heap.alloc_instance(obj);
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = Value::Obj(instance);
                match method {
                    Some(Value::Obj(init)) => self.call_closure(init, argc),
                    _ if argc != 0 => Err(RuntimeError::WrongArgCount {
                        expected: 0,
                        got: argc as usize,
                    }),
                    _ => Ok(()),
                }
            }
            ObjData::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(RuntimeError::CanOnlyCallFunctionsAndClasses),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let ObjData::Class(c) = &class.data else {
            unreachable!("bind_method requires a Class")
        };
        let method = c.methods.borrow().get(name);
        let Some(Value::Obj(method)) = method else {
            return Err(RuntimeError::UndefinedProperty(self.obj_text(name)));
        };
        let receiver = self.pop();
        let bound = self.heap.alloc_bound_method(receiver, method);
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let ObjData::Class(c) = &class.data else {
            unreachable!("invoke_from_class requires a Class")
        };
        let method = c.methods.borrow().get(name);
        match method {
            Some(Value::Obj(method)) => self.call_closure(method, argc),
            _ => Err(RuntimeError::UndefinedProperty(self.obj_text(name))),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(obj) = receiver else {
            return Err(RuntimeError::OnlyInstancesHaveProperties);
        };
        let ObjData::Instance(instance) = &obj.data else {
            return Err(RuntimeError::OnlyInstancesHaveProperties);
        };
        if let Some(value) = instance.fields.borrow().get(name) {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class = instance.class;
        self.invoke_from_class(class, name, argc)
    }

    // --- properties & indexing ------------------------------------------

    fn is_length(&self, name: ObjRef) -> bool {
        self.obj_text(name) == "length"
    }

    fn obj_text(&self, obj: ObjRef) -> String {
        let ObjData::String(s, _) = &obj.data else {
            unreachable!("identifier constants are always strings")
        };
        s.clone()
    }

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let receiver = self.peek(0);
        let Value::Obj(obj) = receiver else {
            return Err(RuntimeError::OnlyInstancesAndStringsAndArraysHaveProperties);
        };
        match &obj.data {
            ObjData::String(s, _) if self.is_length(name) => {
                let len = s.chars().count();
                self.pop();
                self.push(Value::Number(len as f64));
                Ok(())
            }
            ObjData::String(..) => Err(RuntimeError::UndefinedProperty(self.obj_text(name))),
            ObjData::Array(items) if self.is_length(name) => {
                let len = items.borrow().len();
                self.pop();
                self.push(Value::Number(len as f64));
                Ok(())
            }
            ObjData::Array(..) => Err(RuntimeError::UndefinedProperty(self.obj_text(name))),
            ObjData::Instance(instance) => {
                if let Some(value) = instance.fields.borrow().get(name) {
                    self.pop();
                    self.push(value);
                    return Ok(());
                }
                let class = instance.class;
                self.bind_method(class, name)
            }
            _ => Err(RuntimeError::OnlyInstancesAndStringsAndArraysHaveProperties),
        }
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let receiver = self.peek(1);
        let Value::Obj(obj) = receiver else {
            return Err(RuntimeError::OnlyInstancesHaveFields);
        };
        let ObjData::Instance(instance) = &obj.data else {
            return Err(RuntimeError::OnlyInstancesHaveFields);
        };
        let value = self.peek(0);
        instance.fields.borrow_mut().set(name, value);
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let superclass = self.pop();
        let Value::Obj(class) = superclass else {
            unreachable!("GET_SUPER's operand is always a class")
        };
        self.bind_method(class, name)
    }

    fn check_index(value: Value) -> Result<usize, RuntimeError> {
        match value.as_number() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(RuntimeError::IndexMustBeInteger),
        }
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = Self::check_index(self.peek(0))?;
        let Value::Obj(obj) = self.peek(1) else {
            return Err(RuntimeError::NotIndexable);
        };
        let ObjData::Array(items) = &obj.data else {
            return Err(RuntimeError::NotIndexable);
        };
        let value = {
            let items = items.borrow();
            if index >= items.len() {
                return Err(RuntimeError::IndexOutOfBounds {
                    index: index as i64,
                    len: items.len(),
                });
            }
            items[index]
        };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `index == count` grows the array by one; anything past that is out
    /// of bounds.
    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let index = Self::check_index(self.peek(1))?;
        let value = self.peek(0);
        let Value::Obj(obj) = self.peek(2) else {
            return Err(RuntimeError::NotIndexable);
        };
        let ObjData::Array(items) = &obj.data else {
            return Err(RuntimeError::NotIndexable);
        };
        {
            let mut items = items.borrow_mut();
            if index > items.len() {
                return Err(RuntimeError::IndexOutOfBounds {
                    index: index as i64,
                    len: items.len(),
                });
            }
            if index == items.len() {
                items.push(value);
            } else {
                items[index] = value;
            }
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // --- arithmetic -----------------------------------------------------

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let is_string = |v: Value| v.is_obj_kind(|d| matches!(d, ObjData::String(..)));
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            self.pop();
            self.pop();
            self.push(Value::Number(x + y));
        } else if is_string(a) || is_string(b) {
            let combined = format!("{a}{b}");
            self.pop();
            self.pop();
            let interned = self.heap.intern(&combined);
            self.push(Value::Obj(interned));
        } else {
            return Err(RuntimeError::OperandsMustMatchForAdd);
        }
        Ok(())
    }

    // --- method table maintenance ------------------------------------

    fn define_method(&mut self) {
        let name = self.read_string();
        let method = self.peek(0);
        let Value::Obj(class) = self.peek(1) else {
            unreachable!("a method is always defined directly under its class")
        };
        let ObjData::Class(c) = &class.data else {
            unreachable!()
        };
        c.methods.borrow_mut().set(name, method);
        self.pop();
    }

    fn closure_op(&mut self) {
        let function = self
            .read_constant()
            .as_obj()
            .expect("CLOSURE's operand is always a Function constant");
        let ObjData::Function(f) = &function.data else {
            unreachable!()
        };
        let count = f.upvalue_count;
        let mut upvalues = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let base = self.frame().slot_base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                upvalues.push(self.closure_upvalue(index));
            }
        }
        let closure = self.heap.alloc_closure(Closure { function, upvalues });
        self.push(Value::Obj(closure));
    }

    fn array_op(&mut self) {
        let n = self.read_byte() as usize;
        let start = self.stack.len() - n;
        let items: Vec<Value> = self.stack.drain(start..).collect();
        let array = self.heap.alloc_array(items);
        self.push(Value::Obj(array));
    }

    // --- diagnostics --------------------------------------------------

    fn print_table(&self, table: &Table, show_values: bool) {
        for (key, value) in table.iter() {
            if show_values {
                println!("{} = {value}", self.obj_text(key));
            } else {
                println!("{}", self.obj_text(key));
            }
        }
    }

    /// `gc`/`print_stack`/`print_globals`/`print_strings` need the whole
    /// VM's state, which a plain `NativeFn` can't see; these four are
    /// dispatched here by name instead of through the `Native`'s stored
    /// function pointer. Returns `None` for any other native, meaning
    /// "call it normally".
    fn call_diagnostic_native(&mut self, name: &str, argc: u8) -> Option<()> {
        if !cfg!(feature = "debug") || !natives::DIAGNOSTIC_NATIVE_NAMES.contains(&name) {
            return None;
        }
        let start = self.stack.len() - argc as usize;
        match name {
            "gc" => self.collect_garbage(),
            "print_stack" => {
                for value in &self.stack {
                    print!("[ {value} ]");
                }
                println!();
            }
            "print_globals" => self.print_table(&self.globals, true),
            "print_strings" => self.print_table(self.heap.strings(), false),
            _ => unreachable!(),
        }
        self.stack.truncate(start - 1);
        self.push(Value::Nil);
        Some(())
    }

    // --- error reporting --------------------------------------------

    fn frame_line(&self, frame: &CallFrame) -> u32 {
        let ObjData::Closure(c) = &frame.closure.data else {
            unreachable!()
        };
        let ObjData::Function(f) = &c.function.data else {
            unreachable!()
        };
        f.chunk.line(frame.ip.saturating_sub(1))
    }

    fn frame_name(&self, frame: &CallFrame) -> String {
        let ObjData::Closure(c) = &frame.closure.data else {
            unreachable!()
        };
        let ObjData::Function(f) = &c.function.data else {
            unreachable!()
        };
        match f.name {
            Some(name) => format!("{}()", self.obj_text(name)),
            None => "script".into(),
        }
    }

    /// Prints the message and a top-down frame backtrace, matching
    /// `runtimeError`, then resets the stack so the VM is ready for the
    /// next `interpret()` call (a REPL keeps running after a runtime
    /// error, same as after a compile error).
    fn report_runtime_error(&mut self, err: RuntimeError) -> InterpretError {
        eprintln!("{}", err.to_string().red());
        for frame in self.frames.iter().rev() {
            eprintln!("[line {}] in {}", self.frame_line(frame), self.frame_name(frame));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretError::Runtime
    }

    // --- dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let op = OpCode::from(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => {
                            return Err(RuntimeError::UndefinedVariable(self.obj_text(name)))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(RuntimeError::UndefinedVariable(self.obj_text(name)));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.closure_upvalue(slot);
                    self.push(self.read_upvalue(upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.closure_upvalue(slot);
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetIndex => self.get_index()?,
                OpCode::SetIndex => self.set_index()?,
                OpCode::GetSuper => self.get_super()?,
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Less => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Bool(a < b));
                }
                OpCode::Add => self.add()?,
                OpCode::Subtract => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.truthy()));
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(RuntimeError::OperandMustBeNumber),
                },
                OpCode::Print => {
                    let v = self.pop();
                    println!("{v}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).truthy() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    if let Value::Obj(obj) = callee {
                        if let ObjData::Native(native) = &obj.data {
                            if self.call_diagnostic_native(native.name, argc).is_some() {
                                continue;
                            }
                        }
                    }
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop();
                    let Value::Obj(class) = superclass else {
                        unreachable!("SUPER_INVOKE's operand is always a class")
                    };
                    self.invoke_from_class(class, name, argc)?;
                }
                OpCode::Closure => self.closure_op(),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame().slot_base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Value::Obj(super_obj) = self.peek(1) else {
                        return Err(RuntimeError::SuperclassMustBeClass);
                    };
                    let ObjData::Class(super_class) = &super_obj.data else {
                        return Err(RuntimeError::SuperclassMustBeClass);
                    };
                    let Value::Obj(sub_obj) = self.peek(0) else {
                        unreachable!("INHERIT's subclass operand is always a class")
                    };
                    let ObjData::Class(sub_class) = &sub_obj.data else {
                        unreachable!()
                    };
                    super_class.methods.borrow().add_all(&mut sub_class.methods.borrow_mut());
                    self.pop();
                }
                OpCode::Method => self.define_method(),
                OpCode::Array => self.array_op(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Ok(()) => {}
            Err(InterpretError::Compile(d)) => {
                d.print();
                panic!("unexpected compile error")
            }
            Err(InterpretError::Runtime) => panic!("unexpected runtime error"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_concatenation() {
        run_ok(r#"var a = "hi"; var b = a + ", world"; print b;"#);
    }

    #[test]
    fn closures_share_captured_state() {
        run_ok(
            "fun make(){var x=1; fun g(){x=x+1; return x;} return g;} \
             var g=make(); print g(); print g(); print g();",
        );
    }

    #[test]
    fn super_call_chains_through_inheritance() {
        run_ok(
            "class A{greet(){print \"a\";}} \
             class B < A{greet(){super.greet(); print \"b\";}} B().greet();",
        );
    }

    #[test]
    fn initializer_sets_instance_fields() {
        run_ok("class P{init(x){this.x=x;}} var p = P(41); p.x = p.x + 1; print p.x;");
    }

    #[test]
    fn array_index_assignment_and_length() {
        run_ok("var a = {10,20,30}; a[1] = 99; print a[1]; print a.length;");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("print nope;") {
            Err(InterpretError::Runtime) => {}
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn division_by_zero_produces_infinity() {
        run_ok("print 1 / 0;");
    }

    #[test]
    fn stack_is_usable_again_after_a_runtime_error() {
        let mut vm = Vm::new();
        assert!(matches!(vm.interpret("print 1 + nil;"), Err(InterpretError::Runtime)));
        assert!(vm.interpret("print 1 + 1;").is_ok());
    }
}
