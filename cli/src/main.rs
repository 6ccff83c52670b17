mod args;

use args::EvalMode;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::{fs, path::PathBuf, process::exit};
use vm::{InterpretError, Vm};

fn main() {
    match args::eval_mode() {
        Ok(EvalMode::Repl) => run_repl(),
        Ok(EvalMode::File(path)) => run_file(path),
        Err(err) => {
            eprintln!("{err}");
            exit(exitcode::USAGE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                // Errors are already reported by interpret(); the REPL
                // keeps going either way, same as clox's.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}

fn run_file(path: PathBuf) {
    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("can't read '{}': {err}", path.display());
            exit(exitcode::IOERR);
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile(diagnostics)) => {
            diagnostics.print();
            exit(exitcode::DATAERR);
        }
        Err(InterpretError::Runtime) => exit(exitcode::SOFTWARE),
    }
}
