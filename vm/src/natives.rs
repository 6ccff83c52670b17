use compiler::error::RuntimeError;
use compiler::object::Heap;
use compiler::value::Value;
use std::io::{self, BufRead};
use std::time::Instant;

/// `clock`, `scan`, and `sin` are the surface natives; clox's `clock()`
/// measures process-relative time, which `Instant` gives us without a
/// wall-clock dependency.
fn process_start() -> Instant {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

pub fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(process_start().elapsed().as_secs_f64()))
}

/// Reads one line from standard input, stripping the trailing newline.
/// Grounded in `natives.c`'s `scanNative`, which grows a buffer a
/// character at a time until it sees `\n`; `BufRead::read_line` is the
/// idiomatic equivalent.
pub fn scan(heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Value::Obj(heap.intern(&line)))
}

pub fn sin(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let x = args
        .first()
        .and_then(Value::as_number)
        .ok_or(RuntimeError::OperandMustBeNumber)?;
    Ok(Value::Number(x.sin()))
}

pub fn bytes_allocated(heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(heap.bytes_allocated() as f64))
}

pub fn next_gc(heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(heap.next_gc() as f64))
}

/// `gc`, `print_stack`, `print_globals`, and `print_strings` need the
/// running VM's stack/frames/globals, which a plain `NativeFn` can't see —
/// the dispatch loop recognizes these four by name and handles them
/// directly instead of calling through the stored function pointer. These
/// stubs exist only so the names resolve to a callable `Native` object in
/// the globals table; they are never actually invoked.
pub fn unreachable_diagnostic(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    unreachable!("diagnostic natives are dispatched by name, not through their function pointer")
}

pub const DIAGNOSTIC_NATIVE_NAMES: [&str; 4] =
    ["gc", "print_stack", "print_globals", "print_strings"];
