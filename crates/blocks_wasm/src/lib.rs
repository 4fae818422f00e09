use blocks_vm::{compile_source, format_value, Vm, VmError};
use console_error_panic_hook::set_once;
use wasm_bindgen::prelude::*;

/// Initialize the WASM module.
/// Call this once at startup for better error messages.
#[wasm_bindgen(start)]
pub fn init() {
    set_once();
}

/// Compile and run Blocks source, returning a structured JSON result.
///
/// The returned JSON has the following structure:
/// ```json
/// {
///   "status": "ok" | "parse_error" | "runtime_error" | "execution_limit",
///   "value": "...",        // Only present when status is "ok"
///   "output": ["..."],     // Captured print output (array of strings)
///   "error": "..."         // Only present on error
/// }
/// ```
#[wasm_bindgen]
pub fn run(source: &str, max_instructions: Option<usize>) -> String {
    run_inner(source, max_instructions)
}

fn run_inner(source: &str, max_instructions: Option<usize>) -> String {
    let program = match compile_source(source) {
        Ok(program) => program,
        Err(err) => {
            return serde_json::json!({
                "status": "parse_error",
                "error": err.to_string(),
                "output": []
            })
            .to_string();
        }
    };

    let mut vm = match max_instructions {
        Some(max) => Vm::with_execution_limit_and_output(max),
        None => Vm::with_output_capture(),
    };

    match vm.run(&program) {
        Ok(value) => {
            let output = vm.get_output().unwrap_or_default();
            serde_json::json!({
                "status": "ok",
                "value": value.map(|v| format_value(&v)),
                "output": output
            })
            .to_string()
        }
        Err(err @ VmError::ExecutionLimit { .. }) => {
            let output = vm.get_output().unwrap_or_default();
            serde_json::json!({
                "status": "execution_limit",
                "error": err.to_string(),
                "output": output
            })
            .to_string()
        }
        Err(err) => {
            let output = vm.get_output().unwrap_or_default();
            serde_json::json!({
                "status": "runtime_error",
                "error": err.to_string(),
                "output": output
            })
            .to_string()
        }
    }
}

#[wasm_bindgen(typescript_custom_section)]
const TS_TYPES: &str = r#"
export interface BlocksResult {
  status: 'ok' | 'parse_error' | 'runtime_error' | 'execution_limit';
  value?: string | null;
  output: string[];
  error?: string;
}

export function run(source: string, maxInstructions?: number): string;
"#;
