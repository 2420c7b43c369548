use std::borrow::Cow;
use std::io::{self, Write};

use colored::*;

use super::instruction::OpCode;
use super::value::Value;
use super::{CallFrame, Result, VMError};
use crate::debug::{self, TRACE_EXECUTION_INSTR, TRACE_EXECUTION_STACK};
use crate::memory::{
    BoundMethod, Class, Closure, Gc, Heap, Instance, NativeFn, NativeFunction, Object, Upvalue,
};

const FRAMES_MAX: usize = 64;

fn runtime_error(message: impl Into<Cow<'static, str>>) -> VMError {
    VMError::RuntimeError(message.into())
}

/// The bytecode interpreter. All shared state lives in the heap; the VM
/// itself only adds the output writer, which is a parameter so tests can
/// capture what `print` produces.
pub struct VM<'gc, W: Write = io::Stdout> {
    gc: &'gc mut Heap,
    stdout: W,
}

impl<'gc> VM<'gc, io::Stdout> {
    pub fn new(gc: &'gc mut Heap) -> Self {
        VM::with_output(gc, io::stdout())
    }
}

impl<'gc, W: Write> VM<'gc, W> {
    pub fn with_output(gc: &'gc mut Heap, stdout: W) -> Self {
        let mut vm = Self { gc, stdout };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Compiles and runs `source` against this VM's heap.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = crate::compiler::Compiler::new(source, &mut *self.gc).compile()?;
        self.interpret_function(function)
    }

    /// Runs a compiled top-level function. On a runtime error the stack
    /// trace is printed and the stack is reset, leaving the heap usable for
    /// the next call.
    pub fn interpret_function(&mut self, function: Gc<Object>) -> Result<()> {
        // Keep the function reachable while the closure is allocated.
        self.gc.stack.push(function.into());
        let closure = self.gc.track(Object::Closure(Closure::new(function)));
        self.gc.stack.pop();
        self.gc.stack.push(closure.into());

        self.call(closure, 0)?;

        if let Err(err) = self.run() {
            eprintln!("{}", err);
            self.print_stack_trace();
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    fn print_stack_trace(&self) {
        for frame in self.gc.call_frames.iter().rev() {
            let function = frame.function();
            let line = frame.current_line();
            match &function.name {
                Some(name) => {
                    eprintln!("[line {}] in {}()", line, name.as_ref().as_string().as_str())
                }
                None => eprintln!("[line {}] in script", line),
            }
        }
    }

    fn reset(&mut self) {
        self.gc.stack.clear();
        self.gc.call_frames.clear();
        self.gc.open_upvalues.clear();
    }

    fn define_native(&mut self, name: &str, native_fun: NativeFunction) {
        let name = self.gc.intern(name.to_owned());
        self.gc.stack.push(name.into());

        let native = self
            .gc
            .track(Object::Native(NativeFn::new(name, native_fun)));
        self.gc.stack.push(native.into());

        self.gc.globals.set(name, native.into());

        self.gc.stack.pop();
        self.gc.stack.pop();
    }

    fn frame(&self) -> Result<&CallFrame> {
        self.gc.call_frames.last().ok_or(VMError::NoCallFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.gc.call_frames.last_mut().ok_or(VMError::NoCallFrame)
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.frame_mut()?.next_instruction()
    }

    fn read_constant(&mut self) -> Result<Value> {
        self.frame_mut()?.next_instruction_as_constant()
    }

    /// Reads a constant that the compiler guarantees to be a string, such
    /// as a variable or property name.
    fn read_string(&mut self) -> Result<Gc<Object>> {
        match self.read_constant()? {
            Value::Object(object) if matches!(object.as_ref(), Object::String(_)) => Ok(object),
            _ => Err(runtime_error("Expected a string constant.")),
        }
    }

    fn push(&mut self, value: Value) {
        self.gc.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.gc.stack.pop().ok_or(VMError::EmptyStack)
    }

    fn peek(&self, distance: usize) -> Result<Value> {
        self.gc
            .stack
            .len()
            .checked_sub(1 + distance)
            .and_then(|index| self.gc.stack.get(index))
            .copied()
            .ok_or(VMError::EmptyStack)
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if TRACE_EXECUTION_STACK {
                let stack: String = self
                    .gc
                    .stack
                    .iter()
                    .map(|value| format!("[ {} ]", value))
                    .collect();
                println!("{}\t{}", "[STACK]".yellow(), stack);
            }
            if TRACE_EXECUTION_INSTR {
                let frame = self.frame()?;
                let (text, _) =
                    debug::disassemble_instruction(&frame.function().chunk, frame.ip);
                println!("{}\t{:04}\t{}", "[Instruction]".green(), frame.ip, text);
            }

            let byte = self.read_byte()?;
            let instruction =
                OpCode::from_byte(byte).ok_or(VMError::InvalidInstruction(byte))?;

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self
                        .gc
                        .stack
                        .get(base + slot)
                        .copied()
                        .ok_or(VMError::EmptyStack)?;
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self.peek(0)?;
                    self.gc.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string()?;
                    match self.gc.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(runtime_error(format!(
                                "Undefined variable '{}'.",
                                name.as_ref().as_string().as_str()
                            )))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?;
                    self.gc.globals.set(name, value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?;
                    if self.gc.globals.set(name, value) {
                        // Assignment never creates a global; undo and report.
                        self.gc.globals.delete(name);
                        return Err(runtime_error(format!(
                            "Undefined variable '{}'.",
                            name.as_ref().as_string().as_str()
                        )));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let closure = self.frame()?.closure;
                    let upvalue = closure.as_ref().as_closure().upvalues[slot];
                    let value = upvalue.as_ref().as_upvalue().get(&self.gc.stack);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek(0)?;
                    let closure = self.frame()?.closure;
                    let mut upvalue = closure.as_ref().as_closure().upvalues[slot];
                    match upvalue.as_mut().as_upvalue_mut() {
                        Upvalue::Open(index) => self.gc.stack[*index] = value,
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string()?;
                    let receiver = self.peek(0)?;
                    let instance = match receiver.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
                        _ => return Err(runtime_error("Only instances have properties.")),
                    };

                    if let Some(value) = instance.as_ref().as_instance().fields.get(name) {
                        self.pop()?;
                        self.push(value);
                    } else {
                        // Fields shadow methods; only fall back to the class.
                        let class = instance.as_ref().as_instance().class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string()?;
                    let target = self.peek(1)?;
                    let mut instance = match target.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
                        _ => return Err(runtime_error("Only instances have fields.")),
                    };

                    let value = self.peek(0)?;
                    instance.as_mut().as_instance_mut().fields.set(name, value);

                    // Leave the assigned value as the expression result.
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string()?;
                    let superclass = match self.pop()?.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(runtime_error("Superclass must be a class.")),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.push(Value::Bool(lhs == rhs));
                }
                OpCode::Greater => {
                    let (lhs, rhs) = self.pop_numbers()?;
                    self.push(Value::Bool(lhs > rhs));
                }
                OpCode::Less => {
                    let (lhs, rhs) = self.pop_numbers()?;
                    self.push(Value::Bool(lhs < rhs));
                }
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => {
                    let (lhs, rhs) = self.pop_numbers()?;
                    self.push(Value::Number(lhs - rhs));
                }
                OpCode::Multiply => {
                    let (lhs, rhs) = self.pop_numbers()?;
                    self.push(Value::Number(lhs * rhs));
                }
                OpCode::Divide => {
                    let (lhs, rhs) = self.pop_numbers()?;
                    self.push(Value::Number(lhs / rhs));
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(v) => self.push(Value::Number(-v)),
                        _ => return Err(runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.stdout, "{}", value)?;
                }
                OpCode::Jump => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    self.frame_mut()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    self.frame_mut()?.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    let superclass = match self.pop()?.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(runtime_error("Superclass must be a class.")),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant()? {
                        Value::Object(object) => object,
                        _ => return Err(runtime_error("Expected a function constant.")),
                    };

                    // The closure goes on the stack before its upvalues are
                    // captured; capturing can allocate and trigger the
                    // collector.
                    let mut closure = self.gc.track(Object::Closure(Closure::new(function)));
                    self.push(closure.into());

                    let num_upvalues = function.as_ref().as_function().num_upvalues;
                    for _ in 0..num_upvalues {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let base = self.frame()?.stack_base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frame()?.closure;
                            enclosing.as_ref().as_closure().upvalues[index]
                        };
                        closure.as_mut().as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.gc.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    self.close_upvalues(frame.stack_base);

                    self.gc.stack.truncate(frame.stack_base);
                    if self.gc.call_frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string()?;
                    let class = self.gc.track(Object::Class(Class::new(name)));
                    self.push(class.into());
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1)?.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(runtime_error("Superclass must be a class.")),
                    };
                    let mut subclass = match self.peek(0)?.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(runtime_error("Expected a class to inherit into.")),
                    };

                    // Copy-down inheritance: the subclass starts with every
                    // superclass method and overrides as its own methods are
                    // bound afterwards.
                    let methods = &superclass.as_ref().as_class().methods;
                    subclass.as_mut().as_class_mut().methods.add_all(methods);
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.read_string()?;
                    let method = self.peek(0)?;
                    let mut class = match self.peek(1)?.as_object() {
                        Some(object) if matches!(object.as_ref(), Object::Class(_)) => object,
                        _ => return Err(runtime_error("Expected a class to bind a method on.")),
                    };
                    class.as_mut().as_class_mut().methods.set(name, method);
                    self.pop()?;
                }
            }
        }
    }

    fn pop_numbers(&mut self) -> Result<(f64, f64)> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => Ok((lhs, rhs)),
            _ => Err(runtime_error("Operands must be numbers.")),
        }
    }

    fn op_add(&mut self) -> Result<()> {
        let rhs = self.peek(0)?;
        let lhs = self.peek(1)?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.pop()?;
                self.pop()?;
                self.push(Value::Number(lhs + rhs));
                Ok(())
            }
            (Value::Object(lhs), Value::Object(rhs)) => {
                match (lhs.as_ref(), rhs.as_ref()) {
                    (Object::String(lhs), Object::String(rhs)) => {
                        let mut data = String::with_capacity(lhs.data.len() + rhs.data.len());
                        data.push_str(&lhs.data);
                        data.push_str(&rhs.data);
                        // Intern while both operands are still stack roots.
                        let result = self.gc.intern(data);
                        self.pop()?;
                        self.pop()?;
                        self.push(result.into());
                        Ok(())
                    }
                    _ => Err(runtime_error("Operands must be two numbers or two strings.")),
                }
            }
            _ => Err(runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        let object = match callee.as_object() {
            Some(object) => object,
            None => return Err(runtime_error("Can only call functions and classes.")),
        };

        match object.as_ref() {
            Object::Closure(_) => self.call(object, arg_count),
            Object::Native(native) => {
                let fun = native.fun;
                let args_start = self.gc.stack.len() - arg_count;
                let result = fun(arg_count, &self.gc.stack[args_start..]);
                // Replace the callee and its arguments with the result.
                self.gc.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Object::Class(_) => {
                let instance = self.gc.track(Object::Instance(Instance::new(object)));
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = instance.into();

                let init = object.as_ref().as_class().methods.get(self.gc.init_string);
                if let Some(Value::Object(init)) = init {
                    self.call(init, arg_count)
                } else if arg_count != 0 {
                    Err(runtime_error(format!(
                        "Expected 0 arguments but got {}.",
                        arg_count
                    )))
                } else {
                    Ok(())
                }
            }
            Object::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = receiver;
                self.call(method, arg_count)
            }
            _ => Err(runtime_error("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure: Gc<Object>, arg_count: usize) -> Result<()> {
        let arity = closure
            .as_ref()
            .as_closure()
            .function
            .as_ref()
            .as_function()
            .arity;
        if arg_count != arity {
            return Err(runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }

        if self.gc.call_frames.len() == FRAMES_MAX {
            return Err(VMError::StackOverflow);
        }

        let stack_base = self.gc.stack.len() - arg_count - 1;
        self.gc.call_frames.push(CallFrame::new(closure, stack_base));
        Ok(())
    }

    fn invoke(&mut self, name: Gc<Object>, arg_count: usize) -> Result<()> {
        let receiver = self.peek(arg_count)?;
        let instance = match receiver.as_object() {
            Some(object) if matches!(object.as_ref(), Object::Instance(_)) => object,
            _ => return Err(runtime_error("Only instances have methods.")),
        };

        // A field shadows a method of the same name, even when invoked.
        if let Some(field) = instance.as_ref().as_instance().fields.get(name) {
            let slot = self.gc.stack.len() - arg_count - 1;
            self.gc.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = instance.as_ref().as_instance().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<Object>,
        name: Gc<Object>,
        arg_count: usize,
    ) -> Result<()> {
        match class.as_ref().as_class().methods.get(name) {
            Some(Value::Object(method)) => self.call(method, arg_count),
            _ => Err(runtime_error(format!(
                "Undefined property '{}'.",
                name.as_ref().as_string().as_str()
            ))),
        }
    }

    /// Produces a bound method for `name` on `class`, replacing the receiver
    /// on top of the stack.
    fn bind_method(&mut self, class: Gc<Object>, name: Gc<Object>) -> Result<()> {
        let method = match class.as_ref().as_class().methods.get(name) {
            Some(Value::Object(method)) => method,
            _ => {
                return Err(runtime_error(format!(
                    "Undefined property '{}'.",
                    name.as_ref().as_string().as_str()
                )))
            }
        };

        let receiver = self.peek(0)?;
        let bound = self
            .gc
            .track(Object::BoundMethod(BoundMethod::new(receiver, method)));
        self.pop()?;
        self.push(bound.into());
        Ok(())
    }

    /// Returns the open upvalue for `slot`, creating and splicing in a new
    /// one when none exists. The open list stays sorted ascending by slot.
    fn capture_upvalue(&mut self, slot: usize) -> Gc<Object> {
        let mut insert_at = self.gc.open_upvalues.len();
        for (i, upvalue) in self.gc.open_upvalues.iter().enumerate().rev() {
            let open = upvalue.as_ref().as_upvalue().as_open();
            if open == slot {
                return *upvalue;
            }
            if open < slot {
                break;
            }
            insert_at = i;
        }

        let upvalue = self.gc.track(Object::Upvalue(Upvalue::new(slot)));
        self.gc.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `last`: the stack value moves
    /// into the upvalue and the upvalue leaves the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.gc.open_upvalues.last().copied() {
            let slot = upvalue.as_ref().as_upvalue().as_open();
            if slot < last {
                break;
            }
            let value = self.gc.stack[slot];
            let mut upvalue = upvalue;
            upvalue.as_mut().as_upvalue_mut().close(value);
            self.gc.open_upvalues.pop();
        }
    }
}

fn native_clock(_arg_count: usize, _args: &[Value]) -> Value {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(now.as_millis() as f64 / 1000f64)
}
