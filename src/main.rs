#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;

mod compiler;
mod debug;
mod memory;
mod vm;

use memory::Heap;
use vm::{VMError, VM};

fn main() {
    let args: Vec<String> = env::args().collect();
    let code = match args.len() {
        1 => repl(),
        2 => run_file(Path::new(&args[1])),
        _ => {
            eprintln!("Usage: rlox [path]");
            64
        }
    };
    process::exit(code);
}

/// Line-oriented read-eval-print loop. Errors are reported but never end
/// the session; globals and interned strings carry over between lines.
fn repl() -> i32 {
    let mut heap = Heap::new();
    let stdin = io::stdin();

    print_prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let line = line.trim();
        if line == "exit" {
            break;
        }
        if !line.is_empty() {
            let _ = VM::new(&mut heap).interpret(line);
        }
        print_prompt();
    }
    0
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn run_file(path: &Path) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path.display(), err);
            return 74;
        }
    };

    let mut heap = Heap::new();
    match VM::new(&mut heap).interpret(&source) {
        Ok(()) => 0,
        Err(VMError::CompileError(_)) => 65,
        Err(_) => 70,
    }
}
