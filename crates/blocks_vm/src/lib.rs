use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use blocks_parser::ParseError;
use blocks_syntax::{Expr, Module};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Operand stack capacity. Overflow and underflow are fatal.
pub const STACK_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(Rc<String>),
    Closure(Rc<ClosureValue>),
    Native(Rc<NativeValue>),
    Nil,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Nil, Value::Nil) => true,
            _ => false,
        }
    }
}

/// A user-defined callable: entry address into the code array, the number
/// of environment slots to allocate on call, the parameter names (kept for
/// display; resolution is by index), and the environment captured at the
/// `MAKE_BLOCK` that created it.
#[derive(Debug)]
pub struct ClosureValue {
    pub entry: usize,
    pub locals: usize,
    pub params: Rc<Vec<String>>,
    pub env: Rc<RefCell<Env>>,
}

/// A host-provided callable. Natives receive the evaluated arguments in
/// order plus the VM's printer so `print` works against any sink.
pub struct NativeValue {
    pub name: &'static str,
    pub func: fn(&[Value], &mut Printer) -> Value,
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

/// A runtime environment: a fixed vector of value slots plus a link to the
/// enclosing environment. Shared between the frame executing in it and any
/// closure that captured it.
#[derive(Debug, Default)]
pub struct Env {
    pub values: Vec<Value>,
    pub parent: Option<Rc<RefCell<Env>>>,
}

impl Env {
    fn with_slots(count: usize, parent: Option<Rc<RefCell<Env>>>) -> Self {
        Self {
            values: vec![Value::Int(0); count],
            parent,
        }
    }
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Str(s) => s.as_ref().clone(),
        Value::Closure(c) => format!("<closure params=[{}]>", c.params.join(", ")),
        Value::Native(_) => "<native>".to_string(),
        Value::Nil => "null".to_string(),
    }
}

fn type_name_of_value(value: &Value) -> &'static str {
    match value {
        Value::Int(_) => "int",
        Value::Str(_) => "string",
        Value::Closure(_) => "closure",
        Value::Native(_) => "native",
        Value::Nil => "null",
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Nil => false,
        Value::Int(v) => *v != 0,
        Value::Str(s) => !s.is_empty(),
        Value::Closure(_) | Value::Native(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    Parse(ParseError),
    Runtime { message: String, line: u32 },
    ExecutionLimit { message: String },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Parse(err) => err.fmt(f),
            VmError::Runtime { message, line } => {
                write!(f, "runtime error at line {line}: {message}")
            }
            VmError::ExecutionLimit { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<ParseError> for VmError {
    fn from(err: ParseError) -> Self {
        VmError::Parse(err)
    }
}

/// The instruction set. Opcodes and their operands are stored inline in a
/// dense `i32` array; the operand count per opcode is table-driven and
/// shared by the VM and the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Op {
    PushConst = 0,
    LoadLocal = 1,
    StoreLocal = 2,
    LoadGlobal = 3,
    StoreGlobal = 4,
    LoadUpvalue = 5,
    StoreUpvalue = 6,
    BinaryOp = 7,
    Jump = 8,
    JumpIfFalse = 9,
    MakeBlock = 10,
    Call = 11,
    TailCall = 12,
    Return = 13,
    Halt = 14,
    Pop = 15,
    CallIfClosure = 16,
    TailCallIfClosure = 17,
}

impl Op {
    pub fn from_i32(raw: i32) -> Option<Op> {
        Some(match raw {
            0 => Op::PushConst,
            1 => Op::LoadLocal,
            2 => Op::StoreLocal,
            3 => Op::LoadGlobal,
            4 => Op::StoreGlobal,
            5 => Op::LoadUpvalue,
            6 => Op::StoreUpvalue,
            7 => Op::BinaryOp,
            8 => Op::Jump,
            9 => Op::JumpIfFalse,
            10 => Op::MakeBlock,
            11 => Op::Call,
            12 => Op::TailCall,
            13 => Op::Return,
            14 => Op::Halt,
            15 => Op::Pop,
            16 => Op::CallIfClosure,
            17 => Op::TailCallIfClosure,
            _ => return None,
        })
    }

    pub fn operand_count(self) -> usize {
        match self {
            Op::Return | Op::Halt | Op::Pop | Op::CallIfClosure | Op::TailCallIfClosure => 0,
            Op::LoadUpvalue | Op::StoreUpvalue => 2,
            Op::MakeBlock => 3,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::PushConst => "PUSH_CONST",
            Op::LoadLocal => "LOAD_LOCAL",
            Op::StoreLocal => "STORE_LOCAL",
            Op::LoadGlobal => "LOAD_GLOBAL",
            Op::StoreGlobal => "STORE_GLOBAL",
            Op::LoadUpvalue => "LOAD_UPVALUE",
            Op::StoreUpvalue => "STORE_UPVALUE",
            Op::BinaryOp => "BINARY_OP",
            Op::Jump => "JUMP",
            Op::JumpIfFalse => "JUMP_IF_F",
            Op::MakeBlock => "MAKE_BLOCK",
            Op::Call => "CALL",
            Op::TailCall => "TAIL_CALL",
            Op::Return => "RETURN",
            Op::Halt => "HALT",
            Op::Pop => "POP",
            Op::CallIfClosure => "CALL_IF_CLOSURE",
            Op::TailCallIfClosure => "TAIL_CALL_IF_CLOSURE",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A constant pool entry. Integers and strings dedupe on equality at
/// compile time; parameter-name lists never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Str(String),
    Params(Vec<String>),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{v}"),
            Const::Str(s) => write!(f, "\"{s}\""),
            Const::Params(params) => write!(f, "[{}]", params.join(", ")),
        }
    }
}

/// A compiled program: dense instruction stream, constant pool, and a
/// parallel map from every code slot to the 1-based source line that
/// produced it. Immutable after compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<i32>,
    pub pool: Vec<Const>,
    pub source_map: Vec<u32>,
}

impl Program {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// One decoded instruction: address, opcode, raw operand values, and the
/// source line of the opcode slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub ip: usize,
    pub op: Op,
    pub args: Vec<i32>,
    pub line: u32,
}

/// Decode a whole program into instruction records. Never executes;
/// covers every code slot exactly once.
pub fn disassemble(program: &Program) -> Result<Vec<Decoded>, VmError> {
    let mut out = Vec::new();
    let mut ip = 0;
    while ip < program.code.len() {
        let at = ip;
        let line = program.source_map.get(ip).copied().unwrap_or(0);
        let raw = program.code[ip];
        let op = Op::from_i32(raw).ok_or_else(|| VmError::Runtime {
            message: format!("unknown opcode {raw}"),
            line,
        })?;
        ip += 1;
        let mut args = Vec::new();
        for _ in 0..op.operand_count() {
            match program.code.get(ip) {
                Some(&arg) => {
                    args.push(arg);
                    ip += 1;
                }
                None => {
                    return Err(VmError::Runtime {
                        message: format!("truncated operands for {op}"),
                        line,
                    })
                }
            }
        }
        out.push(Decoded { ip: at, op, args, line });
    }
    Ok(out)
}

/// Render one decoded instruction for display, resolving pool-index
/// operands to their pool values.
pub fn format_instruction(program: &Program, inst: &Decoded) -> String {
    let args = inst
        .args
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let detail = match inst.op {
        Op::PushConst | Op::LoadGlobal | Op::StoreGlobal | Op::BinaryOp | Op::MakeBlock => inst
            .args
            .first()
            .and_then(|&idx| program.pool.get(idx as usize))
            .map(|c| c.to_string()),
        _ => None,
    };
    let mut text = format!("{:04} {:<20} {:<10}", inst.ip, inst.op.name(), args);
    if let Some(detail) = detail {
        text.push_str(&format!("; {detail} "));
    }
    text.push_str(&format!("(line {})", inst.line));
    text
}

#[derive(Debug, Default)]
struct Scope {
    locals: Vec<String>,
}

enum Resolved {
    Local(usize),
    Upvalue(usize, usize),
    Global,
}

enum StoreTarget {
    Local(usize),
    Upvalue(usize, usize),
    Global(i32),
}

/// Single-pass bytecode compiler. Walks the AST once, maintaining a stack
/// of lexical block scopes, and emits code, pool, and source map together.
#[derive(Debug, Default)]
pub struct Compiler {
    code: Vec<i32>,
    pool: Vec<Const>,
    lines: Vec<u32>,
    scopes: Vec<Scope>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a parsed module. Accepts any well-formed AST; the compiler
    /// itself has no failure modes.
    pub fn compile_module(&mut self, module: &Module) -> Program {
        for (i, expr) in module.exprs.iter().enumerate() {
            self.compile_expr(expr, false);
            if i + 1 < module.exprs.len() {
                self.emit(Op::Pop, expr.line());
            }
        }
        let last_line = module.exprs.last().map(|e| e.line()).unwrap_or(1);
        self.emit(Op::Halt, last_line);
        Program {
            code: std::mem::take(&mut self.code),
            pool: std::mem::take(&mut self.pool),
            source_map: std::mem::take(&mut self.lines),
        }
    }

    fn emit(&mut self, op: Op, line: u32) {
        self.code.push(op as i32);
        self.lines.push(line);
    }

    fn emit_arg(&mut self, value: i32, line: u32) {
        self.code.push(value);
        self.lines.push(line);
    }

    fn patch(&mut self, slot: usize, target: usize) {
        self.code[slot] = target as i32;
    }

    fn const_int(&mut self, value: i64) -> i32 {
        if let Some(idx) = self
            .pool
            .iter()
            .position(|c| matches!(c, Const::Int(v) if *v == value))
        {
            return idx as i32;
        }
        self.pool.push(Const::Int(value));
        (self.pool.len() - 1) as i32
    }

    fn const_str(&mut self, value: &str) -> i32 {
        if let Some(idx) = self
            .pool
            .iter()
            .position(|c| matches!(c, Const::Str(v) if v == value))
        {
            return idx as i32;
        }
        self.pool.push(Const::Str(value.to_string()));
        (self.pool.len() - 1) as i32
    }

    fn const_params(&mut self, params: &[String]) -> i32 {
        self.pool.push(Const::Params(params.to_vec()));
        (self.pool.len() - 1) as i32
    }

    /// Resolve a name read: innermost scope (newest binding first), then
    /// enclosing scopes counting parent hops, then global.
    fn resolve(&self, name: &str) -> Resolved {
        if let Some((last, outer)) = self.scopes.split_last() {
            if let Some(idx) = last.locals.iter().rposition(|local| local == name) {
                return Resolved::Local(idx);
            }
            for (hops, scope) in outer.iter().rev().enumerate() {
                if let Some(idx) = scope.locals.iter().rposition(|local| local == name) {
                    return Resolved::Upvalue(idx, hops + 1);
                }
            }
        }
        Resolved::Global
    }

    /// Resolve a name write. An unresolved write inside a block implicitly
    /// declares a fresh local in the innermost scope; at the top level it
    /// targets a global. Writes inside a block never reach globals.
    fn resolve_store(&mut self, name: &str) -> StoreTarget {
        match self.resolve(name) {
            Resolved::Local(idx) => StoreTarget::Local(idx),
            Resolved::Upvalue(idx, hops) => StoreTarget::Upvalue(idx, hops),
            Resolved::Global => match self.scopes.last_mut() {
                Some(scope) => {
                    scope.locals.push(name.to_string());
                    StoreTarget::Local(scope.locals.len() - 1)
                }
                None => StoreTarget::Global(self.const_str(name)),
            },
        }
    }

    fn emit_store(&mut self, target: &StoreTarget, line: u32) {
        match target {
            StoreTarget::Local(idx) => {
                self.emit(Op::StoreLocal, line);
                self.emit_arg(*idx as i32, line);
            }
            StoreTarget::Upvalue(idx, hops) => {
                self.emit(Op::StoreUpvalue, line);
                self.emit_arg(*idx as i32, line);
                self.emit_arg(*hops as i32, line);
            }
            StoreTarget::Global(pool_idx) => {
                self.emit(Op::StoreGlobal, line);
                self.emit_arg(*pool_idx, line);
            }
        }
    }

    fn push_int(&mut self, value: i64, line: u32) {
        let idx = self.const_int(value);
        self.emit(Op::PushConst, line);
        self.emit_arg(idx, line);
    }

    fn compile_expr(&mut self, expr: &Expr, tail: bool) {
        match expr {
            Expr::Int { value, line } => self.push_int(*value, *line),
            Expr::Str { value, line } => {
                let idx = self.const_str(value);
                self.emit(Op::PushConst, *line);
                self.emit_arg(idx, *line);
            }
            Expr::Var { name, line } => match self.resolve(name) {
                Resolved::Local(idx) => {
                    self.emit(Op::LoadLocal, *line);
                    self.emit_arg(idx as i32, *line);
                }
                Resolved::Upvalue(idx, hops) => {
                    self.emit(Op::LoadUpvalue, *line);
                    self.emit_arg(idx as i32, *line);
                    self.emit_arg(hops as i32, *line);
                }
                Resolved::Global => {
                    let idx = self.const_str(name);
                    self.emit(Op::LoadGlobal, *line);
                    self.emit_arg(idx, *line);
                }
            },
            Expr::Assign { name, value, line } => {
                // For `name = [block]` the name is bound before the body is
                // compiled so the block can call itself. Any other RHS sees
                // the previous binding of the name.
                if matches!(value.as_ref(), Expr::Block { .. }) {
                    let target = self.resolve_store(name);
                    self.compile_expr(value, false);
                    self.emit_store(&target, *line);
                } else {
                    self.compile_expr(value, false);
                    let target = self.resolve_store(name);
                    self.emit_store(&target, *line);
                }
            }
            Expr::Binary { op, lhs, rhs, line } => {
                self.compile_expr(lhs, false);
                self.compile_expr(rhs, false);
                let idx = self.const_str(op.symbol());
                self.emit(Op::BinaryOp, *line);
                self.emit_arg(idx, *line);
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
                line,
            } => {
                self.compile_expr(cond, false);
                self.emit(Op::JumpIfFalse, *line);
                let else_patch = self.code.len();
                self.emit_arg(0, *line);
                self.compile_expr(then_branch, tail);
                self.emit_branch_call(tail, then_branch.line());
                self.emit(Op::Jump, *line);
                let end_patch = self.code.len();
                self.emit_arg(0, *line);
                self.patch(else_patch, self.code.len());
                match else_branch {
                    Some(branch) => {
                        self.compile_expr(branch, tail);
                        self.emit_branch_call(tail, branch.line());
                    }
                    None => {
                        self.push_int(0, *line);
                        self.emit_branch_call(tail, *line);
                    }
                }
                self.patch(end_patch, self.code.len());
            }
            Expr::Block { params, body, line } => {
                self.emit(Op::Jump, *line);
                let skip_patch = self.code.len();
                self.emit_arg(0, *line);
                let entry = self.code.len();
                self.scopes.push(Scope {
                    locals: params.clone(),
                });
                if body.is_empty() {
                    self.push_int(0, *line);
                } else {
                    for (i, expr) in body.iter().enumerate() {
                        let last = i + 1 == body.len();
                        self.compile_expr(expr, last);
                        if !last {
                            self.emit(Op::Pop, expr.line());
                        }
                    }
                }
                self.emit(Op::Return, *line);
                let scope = self.scopes.pop().expect("scope stack balanced");
                self.patch(skip_patch, self.code.len());
                let params_idx = self.const_params(params);
                self.emit(Op::MakeBlock, *line);
                self.emit_arg(params_idx, *line);
                self.emit_arg(entry as i32, *line);
                self.emit_arg(scope.locals.len() as i32, *line);
            }
            Expr::Call { callee, args, line } => {
                self.compile_expr(callee, false);
                for arg in args {
                    self.compile_expr(arg, false);
                }
                self.emit(if tail { Op::TailCall } else { Op::Call }, *line);
                self.emit_arg(args.len() as i32, *line);
            }
        }
    }

    /// Branch values are block literals, so each branch of an `if` is
    /// invoked with zero arguments right after it is pushed; non-callable
    /// branch values pass through unchanged.
    fn emit_branch_call(&mut self, tail: bool, line: u32) {
        self.emit(
            if tail {
                Op::TailCallIfClosure
            } else {
                Op::CallIfClosure
            },
            line,
        );
    }
}

/// Parse and compile in one step.
pub fn compile_source(source: &str) -> Result<Program, VmError> {
    let module = blocks_parser::parse_module(source)?;
    Ok(Compiler::new().compile_module(&module))
}

/// Where `print` output goes: captured into a buffer, or stdout.
pub struct Printer {
    buffer: Option<Rc<RefCell<Vec<String>>>>,
}

impl Printer {
    pub fn write(&mut self, line: String) {
        match &self.buffer {
            Some(buffer) => buffer.borrow_mut().push(line),
            None => println!("{line}"),
        }
    }
}

/// The global environment: an insertion-ordered name/value map,
/// pre-populated with the host natives.
#[derive(Debug, Default)]
pub struct Globals {
    values: IndexMap<String, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_natives() -> Self {
        let mut globals = Self::new();
        globals.set("print", native("print", native_print));
        globals.set("to_s", native("to_s", native_to_s));
        globals.set("to_n", native("to_n", native_to_n));
        globals
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Update in place when the name exists, insert otherwise.
    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn native(name: &'static str, func: fn(&[Value], &mut Printer) -> Value) -> Value {
    Value::Native(Rc::new(NativeValue { name, func }))
}

fn native_print(args: &[Value], printer: &mut Printer) -> Value {
    let line = args
        .iter()
        .map(format_value)
        .collect::<Vec<_>>()
        .join(" ");
    printer.write(line);
    args.last().cloned().unwrap_or(Value::Nil)
}

fn native_to_s(args: &[Value], _printer: &mut Printer) -> Value {
    let text = args.first().map(format_value).unwrap_or_else(|| "null".to_string());
    Value::Str(Rc::new(text))
}

fn native_to_n(args: &[Value], _printer: &mut Printer) -> Value {
    let text = args.first().map(format_value).unwrap_or_default();
    Value::Int(parse_leading_int(&text))
}

/// Leading optionally-signed integer prefix of the text; 0 when absent.
fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return 0;
    }
    let value = digits.parse::<i64>().unwrap_or(0);
    if negative {
        -value
    } else {
        value
    }
}

fn apply_binary(op: &str, a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            match op {
                "+" => Ok(Value::Int(x.wrapping_add(y))),
                "-" => Ok(Value::Int(x.wrapping_sub(y))),
                "*" => Ok(Value::Int(x.wrapping_mul(y))),
                "/" => {
                    if y == 0 {
                        Err("division by zero".to_string())
                    } else {
                        Ok(Value::Int(floor_div(x, y)))
                    }
                }
                "%" => {
                    if y == 0 {
                        Err("modulo by zero".to_string())
                    } else {
                        Ok(Value::Int(x.wrapping_rem(y)))
                    }
                }
                "==" => Ok(Value::Int((x == y) as i64)),
                "<" => Ok(Value::Int((x < y) as i64)),
                ">" => Ok(Value::Int((x > y) as i64)),
                _ => Err(format!("unknown operator `{op}`")),
            }
        }
        (Value::Str(x), Value::Str(y)) if op == "+" => {
            let mut text = x.as_ref().clone();
            text.push_str(y);
            Ok(Value::Str(Rc::new(text)))
        }
        // `s - n`: drop the last n characters; non-positive n is a no-op.
        (Value::Str(s), Value::Int(n)) if op == "-" => {
            if *n <= 0 {
                Ok(Value::Str(s.clone()))
            } else {
                let count = s.chars().count();
                let keep = count.saturating_sub(*n as usize);
                Ok(Value::Str(Rc::new(s.chars().take(keep).collect())))
            }
        }
        // `n - s`: slice from offset n; a negative n counts from the end.
        (Value::Int(n), Value::Str(s)) if op == "-" => {
            let count = s.chars().count() as i64;
            let start = if *n < 0 {
                (count + n).max(0)
            } else {
                (*n).min(count)
            };
            Ok(Value::Str(Rc::new(s.chars().skip(start as usize).collect())))
        }
        _ if op == "==" => Ok(Value::Int((a == b) as i64)),
        _ => Err(format!(
            "invalid operands for `{op}`: {} and {}",
            type_name_of_value(a),
            type_name_of_value(b)
        )),
    }
}

/// Integer division floored toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// A call record: where to resume in the caller, and the environment to
/// restore. The operand stack is shared across frames by the calling
/// convention, so frames carry no stack slice.
#[derive(Debug)]
struct Frame {
    return_addr: usize,
    env: Rc<RefCell<Env>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Running,
    Halted,
}

/// The Blocks virtual machine: flat operand stack, frame stack, and a
/// chain of environments for lexical captures.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    ip: usize,
    env: Rc<RefCell<Env>>,
    globals: Globals,
    printer: Printer,
    instruction_count: usize,
    max_instructions: Option<usize>,
    halted: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::build(None, false)
    }

    /// Route `print` output into a buffer readable via [`Vm::get_output`].
    pub fn with_output_capture() -> Self {
        Self::build(None, true)
    }

    /// Abort any run after `max` executed instructions.
    pub fn with_execution_limit(max: usize) -> Self {
        Self::build(Some(max), false)
    }

    pub fn with_execution_limit_and_output(max: usize) -> Self {
        Self::build(Some(max), true)
    }

    fn build(max_instructions: Option<usize>, capture: bool) -> Self {
        Self {
            stack: Vec::with_capacity(STACK_CAPACITY),
            frames: Vec::new(),
            ip: 0,
            env: Rc::new(RefCell::new(Env::default())),
            globals: Globals::with_natives(),
            printer: Printer {
                buffer: if capture {
                    Some(Rc::new(RefCell::new(Vec::new())))
                } else {
                    None
                },
            },
            instruction_count: 0,
            max_instructions,
            halted: false,
        }
    }

    pub fn get_output(&self) -> Option<Vec<String>> {
        self.printer.buffer.as_ref().map(|buffer| buffer.borrow().clone())
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn env(&self) -> Rc<RefCell<Env>> {
        self.env.clone()
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Globals {
        &mut self.globals
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.ip = 0;
        self.env = Rc::new(RefCell::new(Env::default()));
        self.instruction_count = 0;
        self.halted = false;
    }

    /// Run a program to completion and return the value of its last
    /// top-level expression, if any.
    pub fn run(&mut self, program: &Program) -> Result<Option<Value>, VmError> {
        self.reset();
        loop {
            if let Some(max) = self.max_instructions {
                if self.instruction_count >= max {
                    return Err(VmError::ExecutionLimit {
                        message: format!("execution limit exceeded: {max} instructions"),
                    });
                }
            }
            match self.exec_next(program)? {
                StepOutcome::Running => {}
                StepOutcome::Halted => return Ok(self.stack.pop()),
            }
        }
    }

    /// Execute exactly one instruction. Does not reset the machine; a
    /// halted machine stays halted. Drives external stepping debuggers.
    pub fn step(&mut self, program: &Program) -> Result<StepOutcome, VmError> {
        self.exec_next(program)
    }

    fn exec_next(&mut self, program: &Program) -> Result<StepOutcome, VmError> {
        if self.halted {
            return Ok(StepOutcome::Halted);
        }
        self.instruction_count += 1;
        let raw = self.fetch(program)?;
        let op = match Op::from_i32(raw) {
            Some(op) => op,
            None => return Err(self.error(format!("unknown opcode {raw}"), program)),
        };
        match op {
            Op::PushConst => {
                let idx = self.fetch(program)? as usize;
                let value = self.const_value(program, idx)?;
                self.push(value, program)?;
            }
            Op::LoadLocal => {
                let idx = self.fetch(program)? as usize;
                let value = match self.env.borrow().values.get(idx) {
                    Some(value) => value.clone(),
                    None => return Err(self.error(format!("invalid local slot {idx}"), program)),
                };
                self.push(value, program)?;
            }
            Op::StoreLocal => {
                let idx = self.fetch(program)? as usize;
                let value = self.peek(program)?;
                let env = self.env.clone();
                let mut env = env.borrow_mut();
                if idx >= env.values.len() {
                    return Err(self.error(format!("invalid local slot {idx}"), program));
                }
                env.values[idx] = value;
            }
            Op::LoadUpvalue => {
                let idx = self.fetch(program)? as usize;
                let hops = self.fetch(program)? as usize;
                let env = self.env_at(hops, program)?;
                let value = match env.borrow().values.get(idx) {
                    Some(value) => value.clone(),
                    None => return Err(self.error(format!("invalid upvalue slot {idx}"), program)),
                };
                self.push(value, program)?;
            }
            Op::StoreUpvalue => {
                let idx = self.fetch(program)? as usize;
                let hops = self.fetch(program)? as usize;
                let value = self.peek(program)?;
                let env = self.env_at(hops, program)?;
                let mut env = env.borrow_mut();
                if idx >= env.values.len() {
                    return Err(self.error(format!("invalid upvalue slot {idx}"), program));
                }
                env.values[idx] = value;
            }
            Op::LoadGlobal => {
                let idx = self.fetch(program)? as usize;
                let name = self.pool_str(program, idx)?;
                let value = match self.globals.get(&name) {
                    Some(value) => value.clone(),
                    None => {
                        return Err(self.error(format!("undefined global `{name}`"), program))
                    }
                };
                self.push(value, program)?;
            }
            Op::StoreGlobal => {
                let idx = self.fetch(program)? as usize;
                let name = self.pool_str(program, idx)?;
                let value = self.peek(program)?;
                self.globals.set(&name, value);
            }
            Op::BinaryOp => {
                let idx = self.fetch(program)? as usize;
                let op_symbol = self.pool_str(program, idx)?;
                let b = self.pop(program)?;
                let a = self.pop(program)?;
                let result = apply_binary(&op_symbol, &a, &b)
                    .map_err(|message| self.error(message, program))?;
                self.push(result, program)?;
            }
            Op::Jump => {
                let target = self.fetch(program)?;
                self.jump(target, program)?;
            }
            Op::JumpIfFalse => {
                let target = self.fetch(program)?;
                let value = self.pop(program)?;
                if !is_truthy(&value) {
                    self.jump(target, program)?;
                }
            }
            Op::MakeBlock => {
                let params_idx = self.fetch(program)? as usize;
                let entry = self.fetch(program)? as usize;
                let locals = self.fetch(program)? as usize;
                let params = match program.pool.get(params_idx) {
                    Some(Const::Params(params)) => Rc::new(params.clone()),
                    _ => {
                        return Err(
                            self.error(format!("invalid params pool index {params_idx}"), program)
                        )
                    }
                };
                let closure = Value::Closure(Rc::new(ClosureValue {
                    entry,
                    locals,
                    params,
                    env: self.env.clone(),
                }));
                self.push(closure, program)?;
            }
            Op::Call => {
                let argc = self.fetch(program)? as usize;
                self.call_top(program, argc, false)?;
            }
            Op::TailCall => {
                let argc = self.fetch(program)? as usize;
                self.call_top(program, argc, true)?;
            }
            Op::CallIfClosure => self.call_if_closure(program, false)?,
            Op::TailCallIfClosure => self.call_if_closure(program, true)?,
            Op::Return => {
                let frame = match self.frames.pop() {
                    Some(frame) => frame,
                    None => return Err(self.error("return with no active frame".to_string(), program)),
                };
                self.ip = frame.return_addr;
                self.env = frame.env;
            }
            Op::Halt => {
                self.halted = true;
                return Ok(StepOutcome::Halted);
            }
            Op::Pop => {
                self.pop(program)?;
            }
        }
        Ok(StepOutcome::Running)
    }

    fn fetch(&mut self, program: &Program) -> Result<i32, VmError> {
        match program.code.get(self.ip) {
            Some(&word) => {
                self.ip += 1;
                Ok(word)
            }
            None => Err(self.error("instruction pointer out of bounds".to_string(), program)),
        }
    }

    fn jump(&mut self, target: i32, program: &Program) -> Result<(), VmError> {
        if target < 0 || target as usize >= program.code.len() {
            return Err(self.error(format!("jump target {target} out of range"), program));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn push(&mut self, value: Value, program: &Program) -> Result<(), VmError> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(self.error("stack overflow".to_string(), program));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, program: &Program) -> Result<Value, VmError> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.error("stack underflow".to_string(), program)),
        }
    }

    fn peek(&self, program: &Program) -> Result<Value, VmError> {
        match self.stack.last() {
            Some(value) => Ok(value.clone()),
            None => Err(self.error("stack underflow".to_string(), program)),
        }
    }

    fn const_value(&self, program: &Program, idx: usize) -> Result<Value, VmError> {
        match program.pool.get(idx) {
            Some(Const::Int(v)) => Ok(Value::Int(*v)),
            Some(Const::Str(s)) => Ok(Value::Str(Rc::new(s.clone()))),
            Some(Const::Params(_)) => {
                Err(self.error(format!("pool index {idx} is a parameter list"), program))
            }
            None => Err(self.error(format!("invalid pool index {idx}"), program)),
        }
    }

    fn pool_str(&self, program: &Program, idx: usize) -> Result<String, VmError> {
        match program.pool.get(idx) {
            Some(Const::Str(s)) => Ok(s.clone()),
            _ => Err(self.error(format!("invalid pool index {idx}"), program)),
        }
    }

    fn env_at(&self, hops: usize, program: &Program) -> Result<Rc<RefCell<Env>>, VmError> {
        let mut env = self.env.clone();
        for _ in 0..hops {
            let parent = env.borrow().parent.clone();
            env = match parent {
                Some(parent) => parent,
                None => {
                    return Err(
                        self.error("upvalue lookup reached a missing parent".to_string(), program)
                    )
                }
            };
        }
        Ok(env)
    }

    fn call_top(&mut self, program: &Program, argc: usize, tail: bool) -> Result<(), VmError> {
        if self.stack.len() < argc + 1 {
            return Err(self.error("stack underflow".to_string(), program));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let callee = self.pop(program)?;
        self.invoke(program, callee, args, tail)
    }

    /// Branch-call: invoke the value just pushed by a branch when it is
    /// callable (closure or native, matching the source), pass it through
    /// otherwise.
    fn call_if_closure(&mut self, program: &Program, tail: bool) -> Result<(), VmError> {
        let value = self.stack.pop().unwrap_or(Value::Nil);
        match value {
            Value::Closure(_) | Value::Native(_) => self.invoke(program, value, Vec::new(), tail),
            other => self.push(other, program),
        }
    }

    fn invoke(
        &mut self,
        program: &Program,
        callee: Value,
        args: Vec<Value>,
        tail: bool,
    ) -> Result<(), VmError> {
        match callee {
            Value::Native(native) => {
                let result = (native.func)(&args, &mut self.printer);
                self.push(result, program)
            }
            Value::Closure(closure) => {
                if !tail {
                    self.frames.push(Frame {
                        return_addr: self.ip,
                        env: self.env.clone(),
                    });
                }
                let mut env = Env::with_slots(closure.locals, Some(closure.env.clone()));
                for (slot, arg) in env.values.iter_mut().zip(args) {
                    *slot = arg;
                }
                self.env = Rc::new(RefCell::new(env));
                self.ip = closure.entry;
                Ok(())
            }
            other => Err(self.error(
                format!("call target is not callable: {}", type_name_of_value(&other)),
                program,
            )),
        }
    }

    /// Attach the line of the instruction that faulted, mapped through the
    /// source map from the slot just consumed.
    fn error(&self, message: String, program: &Program) -> VmError {
        let slot = self.ip.saturating_sub(1);
        let line = program.source_map.get(slot).copied().unwrap_or(0);
        VmError::Runtime { message, line }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        compile_source, disassemble, format_value, Op, Program, StepOutcome, Value, Vm, VmError,
    };

    fn compile(source: &str) -> Program {
        compile_source(source).expect("compile")
    }

    fn run_capture(source: &str) -> (Option<Value>, Vec<String>) {
        let program = compile(source);
        let mut vm = Vm::with_output_capture();
        let value = vm.run(&program).expect("run program");
        let output = vm.get_output().expect("captured output");
        (value, output)
    }

    fn run_err(source: &str) -> VmError {
        let program = compile(source);
        let mut vm = Vm::with_output_capture();
        vm.run(&program).expect_err("expected runtime error")
    }

    #[test]
    fn arithmetic_and_print() {
        let (_, output) = run_capture("x = 10\ny = 20\nprint(\"Sum:\", x + y)");
        assert_eq!(output, vec!["Sum: 30"]);
    }

    #[test]
    fn recursive_factorial() {
        let source = "fact = [ $n, if (n < 2) then [1] else [ n * fact(n-1) ] ]\nprint(fact(5))";
        let (_, output) = run_capture(source);
        assert_eq!(output, vec!["120"]);
    }

    #[test]
    fn closure_capture_currying() {
        let source = "add_n = [ $n, [ $x, x + n ] ]\nadd5 = add_n(5)\nprint(add5(10))";
        let (_, output) = run_capture(source);
        assert_eq!(output, vec!["15"]);
    }

    #[test]
    fn tail_recursion_runs_in_constant_frames() {
        let source =
            "loop = [ $n, if (n == 0) then [0] else [ loop(n - 1) ] ]\nprint(loop(100000))";
        let program = compile(source);
        let mut vm = Vm::with_output_capture();
        let mut max_depth = 0;
        loop {
            match vm.step(&program).expect("step") {
                StepOutcome::Running => max_depth = max_depth.max(vm.call_depth()),
                StepOutcome::Halted => break,
            }
        }
        assert_eq!(vm.get_output().unwrap(), vec!["0"]);
        assert!(max_depth <= 2, "call depth grew to {max_depth}");
    }

    #[test]
    fn string_subtraction_both_ways() {
        let (_, output) = run_capture("print(3 - \"Hello\")\nprint(\"Hello\" - 2)");
        assert_eq!(output, vec!["lo", "Hel"]);
    }

    #[test]
    fn implicit_local_shadows_global() {
        let source = "x = 1\nf = [ x = 2  x ]\nprint(f(), x)";
        let (_, output) = run_capture(source);
        assert_eq!(output, vec!["2 1"]);
    }

    #[test]
    fn read_of_outer_name_before_implicit_declaration() {
        let source = "x = 10\nf = [ x = x + 1  x ]\nprint(f(), x)";
        let (_, output) = run_capture(source);
        assert_eq!(output, vec!["11 10"]);
    }

    #[test]
    fn assignment_leaves_value_on_stack() {
        let (value, _) = run_capture("x = 5 + 2");
        assert_eq!(value, Some(Value::Int(7)));
    }

    #[test]
    fn flat_precedence_is_left_associative() {
        let (value, _) = run_capture("1 + 2 * 3");
        assert_eq!(value, Some(Value::Int(9)));
    }

    #[test]
    fn division_floors_and_modulo_truncates() {
        let (_, output) = run_capture("x = 0 - 7\nprint(x / 2, x % 2)");
        assert_eq!(output, vec!["-4 -1"]);
    }

    #[test]
    fn equality_across_types_is_not_fatal() {
        let (_, output) = run_capture("print((\"a\" == 1), (1 == 1), (\"a\" == \"a\"))");
        assert_eq!(output, vec!["0 1 1"]);
    }

    #[test]
    fn string_conversion_natives() {
        let (_, output) = run_capture("print(to_s(42) + \"!\")\nprint(to_n(\"12ab\") + to_n(\"x\"))");
        assert_eq!(output, vec!["42!", "12"]);
    }

    #[test]
    fn print_returns_last_argument() {
        let (_, output) = run_capture("x = print(\"a\", 5)\nprint(x + 1)");
        assert_eq!(output, vec!["a 5", "6"]);
    }

    #[test]
    fn print_renders_special_values() {
        let (_, output) = run_capture("print([ $x, x ])\nprint(print)\nprint(print())");
        assert_eq!(
            output,
            vec!["<closure params=[x]>", "<native>", "", "null"]
        );
    }

    #[test]
    fn missing_else_yields_zero() {
        let (value, _) = run_capture("if 0 then [1]");
        assert_eq!(value, Some(Value::Int(0)));
    }

    #[test]
    fn branch_value_passes_through_when_not_callable() {
        let (value, _) = run_capture("if 1 then 42 else 7");
        assert_eq!(value, Some(Value::Int(42)));
    }

    #[test]
    fn branch_value_invokes_natives() {
        let (_, output) = run_capture("x = if 1 then print\nprint(x)");
        assert_eq!(output, vec!["", "null"]);
    }

    #[test]
    fn empty_block_returns_zero() {
        let (value, _) = run_capture("f = []\nf()");
        assert_eq!(value, Some(Value::Int(0)));
    }

    #[test]
    fn missing_arguments_default_to_zero_and_extras_are_ignored() {
        let (_, output) = run_capture("f = [ $a, $b, a + b ]\nprint(f(1), f(1, 2, 3))");
        assert_eq!(output, vec!["1 3"]);
    }

    #[test]
    fn division_by_zero_is_fatal_with_line() {
        let err = run_err("x = 1\nprint(x / 0)");
        match err {
            VmError::Runtime { message, line } => {
                assert!(message.contains("division by zero"), "{message}");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn undefined_global_is_fatal_with_line() {
        let err = run_err("x = 1\nprint(missing)");
        match err {
            VmError::Runtime { message, line } => {
                assert!(message.contains("undefined global `missing`"), "{message}");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn calling_a_non_callable_is_fatal() {
        let err = run_err("5(1)");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("not callable"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_operand_combination_is_fatal() {
        let err = run_err("print(\"a\" < \"b\")");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("invalid operands for `<`"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deep_non_tail_recursion_overflows_the_stack() {
        let source =
            "f = [ $n, if (n == 0) then [0] else [ 1 + f(n - 1) ] ]\nprint(f(100000))";
        let err = run_err(source);
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("stack overflow"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn execution_limit_stops_runaway_programs() {
        let source = "spin = [ spin() ]\nspin()";
        let program = compile(source);
        let mut vm = Vm::with_execution_limit_and_output(10_000);
        let err = vm.run(&program).expect_err("expected limit error");
        assert!(matches!(err, VmError::ExecutionLimit { .. }), "{err:?}");
    }

    #[test]
    fn host_injected_globals_are_visible() {
        let program = compile("print(answer)");
        let mut vm = Vm::with_output_capture();
        vm.globals_mut().set("answer", Value::Int(42));
        vm.run(&program).expect("run program");
        assert_eq!(vm.get_output().unwrap(), vec!["42"]);
    }

    #[test]
    fn runs_are_deterministic() {
        let source = "f = [ $n, n * n ]\nprint(f(4), f(5))\nf(6)";
        let (first_value, first_output) = run_capture(source);
        let (second_value, second_output) = run_capture(source);
        assert_eq!(first_value, second_value);
        assert_eq!(first_output, second_output);
        assert_eq!(first_value, Some(Value::Int(36)));
        assert_eq!(first_output, vec!["16 25"]);
    }

    #[test]
    fn disassembly_covers_every_slot_exactly_once() {
        let source = "fact = [ $n, if (n < 2) then [1] else [ n * fact(n-1) ] ]\nprint(fact(5))";
        let program = compile(source);
        let decoded = disassemble(&program).expect("disassemble");
        let mut expected_ip = 0;
        let mut total = 0;
        for inst in &decoded {
            assert_eq!(inst.ip, expected_ip);
            expected_ip += 1 + inst.op.operand_count();
            total += 1 + inst.args.len();
        }
        assert_eq!(total, program.code.len());
    }

    #[test]
    fn jump_targets_land_on_opcode_slots() {
        let source = "f = [ $n, if (n < 2) then [1] else [ f(n - 1) ] ]\nf(3)";
        let program = compile(source);
        let decoded = disassemble(&program).expect("disassemble");
        let opcode_slots: std::collections::HashSet<usize> =
            decoded.iter().map(|inst| inst.ip).collect();
        for inst in &decoded {
            match inst.op {
                Op::Jump | Op::JumpIfFalse => {
                    let target = inst.args[0] as usize;
                    assert!(
                        opcode_slots.contains(&target) || target == program.code.len(),
                        "jump to non-opcode slot {target}"
                    );
                }
                Op::MakeBlock => {
                    let entry = inst.args[1] as usize;
                    assert!(opcode_slots.contains(&entry), "entry at non-opcode slot {entry}");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn source_map_is_total_and_in_range() {
        let source = "x = 10\ny = 20\nprint(\"Sum:\", x + y)";
        let program = compile(source);
        assert_eq!(program.source_map.len(), program.code.len());
        let line_count = source.lines().count() as u32;
        for &line in &program.source_map {
            assert!(line >= 1 && line <= line_count, "line {line} out of range");
        }
    }

    #[test]
    fn upvalue_references_carry_slot_and_hops() {
        let source = "add_n = [ $n, [ $x, x + n ] ]\nadd_n(5)(10)";
        let program = compile(source);
        let decoded = disassemble(&program).expect("disassemble");
        let upvalue = decoded
            .iter()
            .find(|inst| inst.op == Op::LoadUpvalue)
            .expect("expected an upvalue load");
        assert_eq!(upvalue.args, vec![0, 1]);
    }

    #[test]
    fn pool_interning_dedupes_scalars_but_not_params() {
        let source = "x = 1\ny = 1\nf = [ $a, a ]\ng = [ $a, a ]";
        let program = compile(source);
        let ints = program
            .pool
            .iter()
            .filter(|c| matches!(c, super::Const::Int(1)))
            .count();
        let params = program
            .pool
            .iter()
            .filter(|c| matches!(c, super::Const::Params(_)))
            .count();
        assert_eq!(ints, 1);
        assert_eq!(params, 2);
    }

    #[test]
    fn program_round_trips_through_bytes() {
        let program = compile("f = [ $n, n + 1 ]\nprint(f(1))");
        let bytes = program.to_bytes().expect("serialize");
        let restored = Program::from_bytes(&bytes).expect("deserialize");
        assert_eq!(program, restored);
    }

    #[test]
    fn step_exposes_machine_state() {
        let program = compile("x = 1\nx + 2");
        let mut vm = Vm::new();
        assert_eq!(vm.ip(), 0);
        vm.step(&program).expect("step");
        assert_eq!(vm.ip(), 2);
        assert_eq!(vm.stack(), &[Value::Int(1)]);
        while vm.step(&program).expect("step") == StepOutcome::Running {}
        assert_eq!(vm.stack(), &[Value::Int(3)]);
        // A halted machine stays halted.
        assert_eq!(vm.step(&program).expect("step"), StepOutcome::Halted);
    }

    #[test]
    fn block_bodies_are_skipped_until_called() {
        let program = compile("f = [ print(\"side effect\") ]\n0");
        let mut vm = Vm::with_output_capture();
        vm.run(&program).expect("run program");
        assert_eq!(vm.get_output().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn shared_environment_is_mutated_through_upvalues() {
        let source = "counter = [ n = 0, [ n = n + 1  n ] ]\nc = counter()\nc()\nc()\nprint(c())";
        let (_, output) = run_capture(source);
        assert_eq!(output, vec!["3"]);
    }

    #[test]
    fn format_value_matches_print_rendering() {
        assert_eq!(format_value(&Value::Int(-3)), "-3");
        assert_eq!(
            format_value(&Value::Str(std::rc::Rc::new("hi".to_string()))),
            "hi"
        );
        assert_eq!(format_value(&Value::Nil), "null");
    }
}
