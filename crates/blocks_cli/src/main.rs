use std::env;
use std::fs;
use std::process;

use blocks_vm::{compile_source, disassemble, format_instruction, format_value, Vm, VmError};
use serde_json::json;

fn print_usage() {
    eprintln!("blocks - The Blocks toy language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  blocks <file.blocks>            Run a file");
    eprintln!("  blocks run [--json] <file>      Run a file");
    eprintln!("  blocks eval [--json] <source>   Run inline source");
    eprintln!("  blocks dis <file>               Disassemble a file");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }
    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
        }
        "--version" | "-V" => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        "run" => {
            let (json_mode, path) = split_flag(&args[2..]);
            let Some(path) = path else {
                print_usage();
                process::exit(1);
            };
            process::exit(run_file(path, json_mode));
        }
        "eval" => {
            let (json_mode, source) = split_flag(&args[2..]);
            let Some(source) = source else {
                print_usage();
                process::exit(1);
            };
            process::exit(run_source(source, json_mode));
        }
        "dis" => {
            let Some(path) = args.get(2) else {
                print_usage();
                process::exit(1);
            };
            process::exit(dis_file(path));
        }
        path => {
            process::exit(run_file(path, false));
        }
    }
}

fn split_flag(args: &[String]) -> (bool, Option<&str>) {
    let mut json_mode = false;
    let mut operand = None;
    for arg in args {
        if arg == "--json" {
            json_mode = true;
        } else if operand.is_none() {
            operand = Some(arg.as_str());
        }
    }
    (json_mode, operand)
}

fn run_file(path: &str, json_mode: bool) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {path}: {err}");
            return 1;
        }
    };
    run_source(&source, json_mode)
}

fn run_source(source: &str, json_mode: bool) -> i32 {
    if json_mode {
        let result = evaluate(source, None);
        let ok = result["status"] == "ok";
        println!("{result}");
        return if ok { 0 } else { 1 };
    }
    let program = match compile_source(source) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    let mut vm = Vm::new();
    match vm.run(&program) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

/// Run source with output capture and produce the structured result object
/// shared with the WASM surface.
fn evaluate(source: &str, max_instructions: Option<usize>) -> serde_json::Value {
    let program = match compile_source(source) {
        Ok(program) => program,
        Err(err) => {
            return json!({
                "status": "parse_error",
                "error": err.to_string(),
                "output": [],
            })
        }
    };
    let mut vm = match max_instructions {
        Some(max) => Vm::with_execution_limit_and_output(max),
        None => Vm::with_output_capture(),
    };
    let result = vm.run(&program);
    let output = vm.get_output().unwrap_or_default();
    match result {
        Ok(value) => json!({
            "status": "ok",
            "value": value.map(|v| format_value(&v)),
            "output": output,
        }),
        Err(err @ VmError::ExecutionLimit { .. }) => json!({
            "status": "execution_limit",
            "error": err.to_string(),
            "output": output,
        }),
        Err(err) => json!({
            "status": "runtime_error",
            "error": err.to_string(),
            "output": output,
        }),
    }
}

fn dis_file(path: &str) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {path}: {err}");
            return 1;
        }
    };
    let program = match compile_source(&source) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    match disassemble(&program) {
        Ok(decoded) => {
            for inst in &decoded {
                println!("{}", format_instruction(&program, inst));
            }
            0
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}
