use thiserror::Error;

use super::scanner::{Scanner, ScannerError};
use super::token::{Token, TokenKind};
use crate::debug::{self, LOG_COMPILED_CODE};
use crate::memory::{Function, Gc, Heap, Object};
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Compilation failed with {} error(s)", .0.len())]
    Multiple(Vec<CompileError>),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error("Error parsing number: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),

    #[error("Could not find token while parsing (should not happen)")]
    TokenNotFound,

    #[error("[line {line}] Error: {message}")]
    ParseError { message: &'static str, line: u64 },

    #[error("[line {line}] Error: Too many local variables in function.")]
    TooManyLocals { line: u64 },

    #[error("[line {line}] Error: Too many closure variables in function.")]
    TooManyUpvalues { line: u64 },

    #[error("[line {line}] Error: Too many constants in one chunk.")]
    TooManyConstants { line: u64 },

    #[error("[line {line}] Error: Can't have more than 255 parameters.")]
    TooManyParameters { line: u64 },

    #[error("[line {line}] Error: Can't have more than 255 arguments.")]
    TooManyArguments { line: u64 },

    #[error("[line {line}] Error: Too much code to jump over.")]
    JumpTooLarge { line: u64 },

    #[error("[line {line}] Error: Variable '{name}' already declared in this scope.")]
    VariableAlreadyDeclared { name: String, line: u64 },

    #[error("[line {line}] Error: Can't read local variable in its own initializer.")]
    LocalInInitializer { line: u64 },

    #[error("[line {line}] Error: Invalid assignment target.")]
    InvalidAssignmentTarget { line: u64 },

    #[error("[line {line}] Error: Can't return from top-level code.")]
    ReturnFromScript { line: u64 },

    #[error("[line {line}] Error: Can't return a value from an initializer.")]
    ReturnFromInitializer { line: u64 },

    #[error("[line {line}] Error: Can't use 'this' outside of a class.")]
    ThisOutsideClass { line: u64 },

    #[error("[line {line}] Error: Can't use 'super' outside of a class.")]
    SuperOutsideClass { line: u64 },

    #[error("[line {line}] Error: Can't use 'super' in a class with no superclass.")]
    SuperWithoutSuperclass { line: u64 },

    #[error("[line {line}] Error: A class can't inherit from itself.")]
    InheritFromSelf { line: u64 },
}

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug)]
struct Local {
    name: String,

    /// Nesting level, 0 being function scope. -1 marks a declared local
    /// whose initializer has not finished compiling yet.
    depth: i64,

    /// Set when a closure captures this local, so scope exit hoists it
    /// instead of popping it.
    is_captured: bool,
}

#[derive(Debug)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Per-function compilation state. These live on the heap's `functions`
/// stack rather than in the compiler so that a collection triggered during
/// compilation can reach the constants of every chunk in progress.
#[derive(Debug)]
pub struct FunctionState {
    pub function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i64,
    upvalues: Vec<UpvalueRef>,
}

impl FunctionState {
    fn script() -> Self {
        FunctionState::with_function(Function::script(), FunctionKind::Script)
    }

    fn new(name: Gc<Object>, kind: FunctionKind) -> Self {
        FunctionState::with_function(Function::new(name), kind)
    }

    fn with_function(function: Function, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the callee; methods and initializers expose it
        // as `this`, everywhere else it is unnameable.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            function,
            kind,
            locals: vec![Local {
                name: slot_zero.to_owned(),
                depth: 0,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn emit_byte(&mut self, op_code: OpCode, line: u64) {
        self.function.chunk.write(op_code, line);
    }

    fn emit_raw(&mut self, byte: u8, line: u64) {
        self.function.chunk.write_byte(byte, line);
    }

    fn emit_pair(&mut self, op_code: OpCode, byte: u8, line: u64) {
        self.function.chunk.write_index(op_code, byte, line);
    }

    /// The implicit return at the end of a body: initializers return their
    /// receiver, everything else returns nil.
    fn emit_return(&mut self, line: u64) {
        match self.kind {
            FunctionKind::Initializer => self.emit_pair(OpCode::GetLocal, 0, line),
            _ => self.emit_byte(OpCode::Nil, line),
        }
        self.emit_byte(OpCode::Return, line);
    }

    /// Emits a forward jump with a placeholder offset; returns the offset
    /// of the placeholder for `patch_jump`.
    fn emit_jump(&mut self, op_code: OpCode, line: u64) -> usize {
        self.emit_byte(op_code, line);
        self.emit_raw(0xff, line);
        self.emit_raw(0xff, line);
        self.function.chunk.code.len() - 2
    }

    fn emit_loop(&mut self, loop_start: usize, line: u64) -> Result<()> {
        self.emit_byte(OpCode::Loop, line);

        // The operand bytes themselves are part of the distance.
        let offset = self.function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(CompileError::JumpTooLarge { line });
        }
        self.emit_raw((offset >> 8) as u8, line);
        self.emit_raw((offset & 0xff) as u8, line);
        Ok(())
    }

    fn patch_jump(&mut self, offset: usize, line: u64) -> Result<()> {
        let jump = self.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CompileError::JumpTooLarge { line });
        }
        self.function.chunk.code[offset] = (jump >> 8) as u8;
        self.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    fn resolve_local(&self, name: &str, line: u64) -> Result<Option<u8>> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(CompileError::LocalInInitializer { line });
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn add_local(&mut self, name: String, line: u64) -> Result<()> {
        if self.locals.len() > u8::MAX as usize {
            return Err(CompileError::TooManyLocals { line });
        }
        self.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }

    /// Registers an upvalue, deduplicating by (index, is_local).
    fn add_upvalue(&mut self, index: u8, is_local: bool, line: u64) -> Result<u8> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() == u8::MAX as usize {
            return Err(CompileError::TooManyUpvalues { line });
        }
        self.upvalues.push(UpvalueRef { index, is_local });
        self.function.num_upvalues = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Single pass compiler: a Pratt parser that emits bytecode as it goes.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    parser: Parser<'src>,
    classes: Vec<ClassState>,
    gc: &'src mut Heap,
    errors: Vec<CompileError>,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str, gc: &'src mut Heap) -> Self {
        Self {
            scanner: Scanner::new(source),
            parser: Parser::new(),
            classes: Vec::new(),
            gc,
            errors: Vec::new(),
        }
    }

    /// Compiles the whole source into a top-level function, already tracked
    /// by the collector. The caller must root the result (e.g. on the VM
    /// stack) before the next allocation.
    pub fn compile(mut self) -> Result<Gc<Object>> {
        self.advance();
        self.gc.functions.push(FunctionState::script());

        if let Err(err) = self.program() {
            eprintln!("{}", err);
            self.errors.push(err);
        }

        let line = self.parser.line();
        self.state().emit_return(line);

        if !self.errors.is_empty() {
            self.gc.functions.clear();
            return Err(CompileError::Multiple(std::mem::take(&mut self.errors)));
        }

        if LOG_COMPILED_CODE {
            let state = self.gc.functions.last().unwrap();
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        // Track while the state is still a compiler root, then retire it.
        let function = self.gc.functions.last().unwrap().function.clone();
        let function = self.gc.track(Object::Function(function));
        self.gc.functions.clear();
        Ok(function)
    }

    fn program(&mut self) -> Result<()> {
        while !self.match_token(TokenKind::EOF)? {
            self.decl()?;
        }
        Ok(())
    }

    /// Compiles one declaration, reporting and recovering from any error it
    /// raises so the rest of the source still gets checked.
    fn decl(&mut self) -> Result<()> {
        if let Err(err) = self.declaration() {
            eprintln!("{}", err);
            self.errors.push(err);
            self.synchronize()?;
        }
        Ok(())
    }

    /// Skips forward to something that looks like a statement boundary.
    fn synchronize(&mut self) -> Result<()> {
        loop {
            if self.parser.previous()?.kind == TokenKind::Semicolon {
                return Ok(());
            }
            match self.parser.current()?.kind {
                TokenKind::EOF
                | TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return Ok(()),
                _ => {}
            }
            self.advance();
        }
    }

    fn state(&mut self) -> &mut FunctionState {
        self.gc.functions.last_mut().unwrap()
    }

    fn state_ref(&self) -> &FunctionState {
        self.gc.functions.last().unwrap()
    }

    fn emit(&mut self, op_code: OpCode) {
        let line = self.parser.line();
        self.state().emit_byte(op_code, line);
    }

    fn emit_raw(&mut self, byte: u8) {
        let line = self.parser.line();
        self.state().emit_raw(byte, line);
    }

    fn emit_pair(&mut self, op_code: OpCode, byte: u8) {
        let line = self.parser.line();
        self.state().emit_pair(op_code, byte, line);
    }

    fn emit_jump(&mut self, op_code: OpCode) -> usize {
        let line = self.parser.line();
        self.state().emit_jump(op_code, line)
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<()> {
        let line = self.parser.line();
        self.state().emit_loop(loop_start, line)
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        let line = self.parser.line();
        self.state().patch_jump(offset, line)
    }

    fn current_offset(&self) -> usize {
        self.state_ref().function.chunk.code.len()
    }

    /// Pulls the next token, reporting scanner errors and continuing with
    /// the following token.
    fn advance(&mut self) {
        self.parser.previous = self.parser.current.take();
        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    self.parser.current = Some(token);
                    return;
                }
                Err(err) => {
                    eprintln!("{}", err);
                    self.errors.push(err.into());
                }
            }
        }
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.parser.check_current(kind)? {
            self.advance();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected: TokenKind, message: &'static str) -> Result<()> {
        if self.parser.check_current(expected)? {
            self.advance();
            Ok(())
        } else {
            Err(CompileError::ParseError {
                message,
                line: self.parser.line(),
            })
        }
    }

    /// Appends to the constant pool, keeping the value reachable on the VM
    /// stack while it is appended.
    fn make_constant(&mut self, constant: Value) -> Result<u8> {
        self.gc.stack.push(constant);
        let index = self.state().function.chunk.add_constant(constant);
        self.gc.stack.pop();

        if index > u8::MAX as usize {
            return Err(CompileError::TooManyConstants {
                line: self.parser.line(),
            });
        }
        Ok(index as u8)
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8> {
        let name = self.gc.intern(name.to_owned());
        self.make_constant(name.into())
    }

    // Declarations.

    fn declaration(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Class)? {
            self.class_declaration()
        } else if self.match_token(TokenKind::Fun)? {
            self.fun_declaration()
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn class_declaration(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect class name.")?;
        let class_name = *self.parser.previous()?;
        let name_constant = self.identifier_constant(class_name.lexeme)?;
        self.declare_variable()?;

        self.emit_pair(OpCode::Class, name_constant);
        self.define_variable(name_constant)?;

        self.classes.push(ClassState {
            has_superclass: false,
        });
        let result = self.class_body(class_name);
        if self.classes.pop().unwrap().has_superclass {
            // The scope holding the synthetic `super` local.
            self.scope_leave();
        }
        result
    }

    fn class_body(&mut self, class_name: Token<'src>) -> Result<()> {
        if self.match_token(TokenKind::Less)? {
            self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            let superclass_name = *self.parser.previous()?;
            if superclass_name.lexeme == class_name.lexeme {
                return Err(CompileError::InheritFromSelf {
                    line: superclass_name.line,
                });
            }
            self.variable(false)?;

            // `super` is an ordinary local holding the superclass, scoped
            // to the class body so every method can close over it.
            self.scope_enter();
            let line = self.parser.line();
            self.state().add_local("super".to_owned(), line)?;
            self.state().mark_initialized();

            self.named_variable(class_name, false)?;
            self.emit(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        // Reload the class for METHOD to bind against.
        self.named_variable(class_name, false)?;

        self.consume(TokenKind::BraceLeft, "Expect '{' before class body.")?;
        while !self.parser.check_current(TokenKind::BraceRight)?
            && !self.parser.check_current(TokenKind::EOF)?
        {
            self.method()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after class body.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn method(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect method name.")?;
        let token = *self.parser.previous()?;
        let name = self.identifier_constant(token.lexeme)?;

        let kind = if token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind)?;
        self.emit_pair(OpCode::Method, name);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect function name.")?;
        // The function may refer to itself recursively, so its own name is
        // usable before the body finishes compiling.
        self.state().mark_initialized();
        self.function(FunctionKind::Function)?;
        self.define_variable(global)
    }

    fn var_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.")?;
        self.define_variable(global)
    }

    fn function(&mut self, kind: FunctionKind) -> Result<()> {
        let state = {
            let name = self.parser.previous()?.lexeme.to_owned();
            let name = self.gc.intern(name);
            FunctionState::new(name, kind)
        };
        self.gc.functions.push(state);

        // This scope is never closed; RETURN unwinds the whole frame.
        self.scope_enter();

        self.consume(TokenKind::ParenLeft, "Expect '(' after function name.")?;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.state().function.arity += 1;
                if self.state_ref().function.arity > 255 {
                    return Err(CompileError::TooManyParameters {
                        line: self.parser.line(),
                    });
                }
                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant)?;

                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after parameters.")?;
        self.consume(TokenKind::BraceLeft, "Expect '{' before function body.")?;
        self.block()?;

        let line = self.parser.line();
        self.state().emit_return(line);

        if LOG_COMPILED_CODE {
            let state = self.state_ref();
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        // Track the finished function before popping its state: the state
        // is what roots the chunk's constants if tracking collects.
        let function = self.state_ref().function.clone();
        let function = self.gc.track(Object::Function(function));
        let state = self.gc.functions.pop().unwrap();

        let index = self.make_constant(function.into())?;
        self.emit_pair(OpCode::Closure, index);
        for upvalue in state.upvalues.iter() {
            self.emit_raw(if upvalue.is_local { 1 } else { 0 });
            self.emit_raw(upvalue.index);
        }
        Ok(())
    }

    // Variables and scope.

    fn parse_variable(&mut self, message: &'static str) -> Result<u8> {
        self.consume(TokenKind::Identifier, message)?;

        self.declare_variable()?;
        if self.state_ref().scope_depth > 0 {
            return Ok(0);
        }

        let token = *self.parser.previous()?;
        self.identifier_constant(token.lexeme)
    }

    fn declare_variable(&mut self) -> Result<()> {
        // Globals are late bound; only locals are declared.
        if self.state_ref().scope_depth == 0 {
            return Ok(());
        }
        let token = *self.parser.previous()?;

        let state = self.state_ref();
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == token.lexeme {
                return Err(CompileError::VariableAlreadyDeclared {
                    name: token.lexeme.to_owned(),
                    line: token.line,
                });
            }
        }

        self.state().add_local(token.lexeme.to_owned(), token.line)
    }

    fn define_variable(&mut self, index: u8) -> Result<()> {
        if self.state_ref().scope_depth > 0 {
            self.state().mark_initialized();
            return Ok(());
        }
        self.emit_pair(OpCode::DefineGlobal, index);
        Ok(())
    }

    /// Finds an upvalue for `name` in the function at `state_index`,
    /// capturing it from enclosing functions as needed.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str, line: u64) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let enclosing = state_index - 1;

        if let Some(local) = self.gc.functions[enclosing].resolve_local(name, line)? {
            self.gc.functions[enclosing].locals[local as usize].is_captured = true;
            let upvalue = self.gc.functions[state_index].add_upvalue(local, true, line)?;
            return Ok(Some(upvalue));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name, line)? {
            let upvalue = self.gc.functions[state_index].add_upvalue(upvalue, false, line)?;
            return Ok(Some(upvalue));
        }

        Ok(None)
    }

    fn named_variable(&mut self, token: Token<'_>, can_assign: bool) -> Result<()> {
        let (arg, get_op, set_op) =
            if let Some(arg) = self.state_ref().resolve_local(token.lexeme, token.line)? {
                (arg, OpCode::GetLocal, OpCode::SetLocal)
            } else if let Some(arg) =
                self.resolve_upvalue(self.gc.functions.len() - 1, token.lexeme, token.line)?
            {
                (arg, OpCode::GetUpvalue, OpCode::SetUpvalue)
            } else {
                let arg = self.identifier_constant(token.lexeme)?;
                (arg, OpCode::GetGlobal, OpCode::SetGlobal)
            };

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
        Ok(())
    }

    fn scope_enter(&mut self) {
        self.state().scope_depth += 1;
    }

    fn scope_leave(&mut self) {
        let line = self.parser.line();
        let state = self.state();
        state.scope_depth -= 1;

        loop {
            let captured = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => local.is_captured,
                _ => break,
            };
            if captured {
                state.emit_byte(OpCode::CloseUpvalue, line);
            } else {
                state.emit_byte(OpCode::Pop, line);
            }
            state.locals.pop();
        }
    }

    // Statements.

    fn statement(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Print)? {
            self.print_statement()
        } else if self.match_token(TokenKind::If)? {
            self.if_statement()
        } else if self.match_token(TokenKind::Return)? {
            self.return_statement()
        } else if self.match_token(TokenKind::While)? {
            self.while_statement()
        } else if self.match_token(TokenKind::For)? {
            self.for_statement()
        } else if self.match_token(TokenKind::BraceLeft)? {
            self.scope_enter();
            let result = self.block();
            self.scope_leave();
            result
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<()> {
        while !self.parser.check_current(TokenKind::BraceRight)?
            && !self.parser.check_current(TokenKind::EOF)?
        {
            self.decl()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after block.")
    }

    fn print_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        self.emit(OpCode::Print);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        let line = self.parser.line();
        if self.state_ref().kind == FunctionKind::Script {
            return Err(CompileError::ReturnFromScript { line });
        }

        if self.match_token(TokenKind::Semicolon)? {
            let line = self.parser.line();
            self.state().emit_return(line);
            Ok(())
        } else {
            if self.state_ref().kind == FunctionKind::Initializer {
                return Err(CompileError::ReturnFromInitializer { line });
            }
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
            self.emit(OpCode::Return);
            Ok(())
        }
    }

    fn if_statement(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump)?;
        self.emit(OpCode::Pop);

        if self.match_token(TokenKind::Else)? {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<()> {
        let loop_start = self.current_offset();

        self.consume(TokenKind::ParenLeft, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<()> {
        self.scope_enter();
        let result = self.for_clauses_and_body();
        self.scope_leave();
        result
    }

    fn for_clauses_and_body(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'for'.")?;

        // Initializer clause.
        if self.match_token(TokenKind::Semicolon)? {
            // None.
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current_offset();

        // Condition clause.
        let exit_jump = if self.match_token(TokenKind::Semicolon)? {
            None
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit(OpCode::Pop);
            Some(exit_jump)
        };

        // The increment textually precedes the body but runs after it: jump
        // over it into the body, loop back to it afterwards, and from the
        // increment loop back to the condition.
        if !self.match_token(TokenKind::ParenRight)? {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_offset();

            self.expression()?;
            self.emit(OpCode::Pop);
            self.consume(TokenKind::ParenRight, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(OpCode::Pop);
        }
        Ok(())
    }

    // Expressions.

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        self.advance();

        let prefix = rule(self.parser.previous()?.kind)
            .prefix
            .ok_or(CompileError::ParseError {
                message: "Expect expression.",
                line: self.parser.line(),
            })?;

        // Only a target parsed at assignment precedence may consume `=`.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign)?;

        while precedence <= rule(self.parser.current()?.kind).precedence {
            self.advance();
            let infix = rule(self.parser.previous()?.kind)
                .infix
                .ok_or(CompileError::ParseError {
                    message: "Expect expression.",
                    line: self.parser.line(),
                })?;
            infix(self, can_assign)?;
        }

        if can_assign && self.match_token(TokenKind::Equal)? {
            return Err(CompileError::InvalidAssignmentTarget {
                line: self.parser.line(),
            });
        }
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after expression.")
    }

    fn number(&mut self, _can_assign: bool) -> Result<()> {
        let value = self.parser.previous()?.lexeme.parse::<f64>()?;
        let index = self.make_constant(Value::Number(value))?;
        self.emit_pair(OpCode::Constant, index);
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> Result<()> {
        let lexeme = self.parser.previous()?.lexeme;
        // Strip the surrounding quotes; there are no escape sequences.
        let string = lexeme[1..lexeme.len() - 1].to_owned();
        let string = self.gc.intern(string);
        let index = self.make_constant(string.into())?;
        self.emit_pair(OpCode::Constant, index);
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> Result<()> {
        match self.parser.previous()?.kind {
            TokenKind::Nil => self.emit(OpCode::Nil),
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<()> {
        let token = *self.parser.previous()?;
        self.named_variable(token, can_assign)
    }

    fn this_(&mut self, _can_assign: bool) -> Result<()> {
        if self.classes.is_empty() {
            return Err(CompileError::ThisOutsideClass {
                line: self.parser.line(),
            });
        }
        self.variable(false)
    }

    fn super_(&mut self, _can_assign: bool) -> Result<()> {
        let line = self.parser.line();
        match self.classes.last() {
            None => return Err(CompileError::SuperOutsideClass { line }),
            Some(class) if !class.has_superclass => {
                return Err(CompileError::SuperWithoutSuperclass { line })
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenKind::Identifier, "Expect superclass method name.")?;
        let token = *self.parser.previous()?;
        let name = self.identifier_constant(token.lexeme)?;

        self.named_variable(Token::synthetic(TokenKind::This, "this"), false)?;
        if self.match_token(TokenKind::ParenLeft)? {
            let arg_count = self.argument_list()?;
            self.named_variable(Token::synthetic(TokenKind::Super, "super"), false)?;
            self.emit_pair(OpCode::SuperInvoke, name);
            self.emit_raw(arg_count);
        } else {
            self.named_variable(Token::synthetic(TokenKind::Super, "super"), false)?;
            self.emit_pair(OpCode::GetSuper, name);
        }
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;
        self.parse_precedence(Precedence::Unary)?;

        match operator {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;
        self.parse_precedence(rule(operator).precedence.higher())?;

        match operator {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and_(&mut self, _can_assign: bool) -> Result<()> {
        // A falsey left operand short-circuits and stays on the stack.
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_(&mut self, _can_assign: bool) -> Result<()> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);

        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn call(&mut self, _can_assign: bool) -> Result<()> {
        let arg_count = self.argument_list()?;
        self.emit_pair(OpCode::Call, arg_count);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.")?;
        let token = *self.parser.previous()?;
        let name = self.identifier_constant(token.lexeme)?;

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit_pair(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::ParenLeft)? {
            // Fused property access + call.
            let arg_count = self.argument_list()?;
            self.emit_pair(OpCode::Invoke, name);
            self.emit_raw(arg_count);
        } else {
            self.emit_pair(OpCode::GetProperty, name);
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8> {
        let mut arg_count: usize = 0;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.expression()?;
                arg_count += 1;
                if arg_count > 255 {
                    return Err(CompileError::TooManyArguments {
                        line: self.parser.line(),
                    });
                }
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after arguments.")?;
        Ok(arg_count as u8)
    }
}

type PrefixFn<'src> = fn(&mut Compiler<'src>, bool) -> Result<()>;
type InfixFn<'src> = fn(&mut Compiler<'src>, bool) -> Result<()>;

struct ParseRule<'src> {
    prefix: Option<PrefixFn<'src>>,
    infix: Option<InfixFn<'src>>,
    precedence: Precedence,
}

/// The Pratt dispatch table, one row per token kind.
#[rustfmt::skip]
fn rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    let (prefix, infix, precedence): (Option<PrefixFn<'src>>, Option<InfixFn<'src>>, _) =
        match kind {
            TokenKind::ParenLeft    => (Some(Compiler::grouping), Some(Compiler::call)  , Precedence::Call),
            TokenKind::Dot          => (None                    , Some(Compiler::dot)   , Precedence::Call),
            TokenKind::Minus        => (Some(Compiler::unary)   , Some(Compiler::binary), Precedence::Term),
            TokenKind::Plus         => (None                    , Some(Compiler::binary), Precedence::Term),
            TokenKind::Slash        => (None                    , Some(Compiler::binary), Precedence::Factor),
            TokenKind::Star         => (None                    , Some(Compiler::binary), Precedence::Factor),
            TokenKind::Bang         => (Some(Compiler::unary)   , None                  , Precedence::None),
            TokenKind::BangEqual    => (None                    , Some(Compiler::binary), Precedence::Equality),
            TokenKind::EqualEqual   => (None                    , Some(Compiler::binary), Precedence::Equality),
            TokenKind::Greater      => (None                    , Some(Compiler::binary), Precedence::Comparison),
            TokenKind::GreaterEqual => (None                    , Some(Compiler::binary), Precedence::Comparison),
            TokenKind::Less         => (None                    , Some(Compiler::binary), Precedence::Comparison),
            TokenKind::LessEqual    => (None                    , Some(Compiler::binary), Precedence::Comparison),
            TokenKind::Identifier   => (Some(Compiler::variable), None                  , Precedence::None),
            TokenKind::String       => (Some(Compiler::string)  , None                  , Precedence::None),
            TokenKind::Number       => (Some(Compiler::number)  , None                  , Precedence::None),
            TokenKind::And          => (None                    , Some(Compiler::and_)  , Precedence::And),
            TokenKind::Or           => (None                    , Some(Compiler::or_)   , Precedence::Or),
            TokenKind::Nil          => (Some(Compiler::literal) , None                  , Precedence::None),
            TokenKind::True         => (Some(Compiler::literal) , None                  , Precedence::None),
            TokenKind::False        => (Some(Compiler::literal) , None                  , Precedence::None),
            TokenKind::Super        => (Some(Compiler::super_)  , None                  , Precedence::None),
            TokenKind::This         => (Some(Compiler::this_)   , None                  , Precedence::None),
            _                       => (None                    , None                  , Precedence::None),
        };
    ParseRule { prefix, infix, precedence }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // ==, !=
    Comparison, // <, >, <=, >=
    Term,       // +, -
    Factor,     // *, /
    Unary,      // !, -
    Call,       // ., ()
    Primary,
}

impl Precedence {
    fn higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

struct Parser<'src> {
    current: Option<Token<'src>>,
    previous: Option<Token<'src>>,
}

impl<'src> Parser<'src> {
    fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    fn previous(&self) -> Result<&Token<'src>> {
        self.previous.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn current(&self) -> Result<&Token<'src>> {
        self.current.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn check_current(&self, kind: TokenKind) -> Result<bool> {
        Ok(self.current()?.kind == kind)
    }

    fn line(&self) -> u64 {
        self.previous
            .as_ref()
            .or(self.current.as_ref())
            .map(|token| token.line)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) {
        let mut gc = Heap::new();
        let result = Compiler::new(source, &mut gc).compile();
        assert!(result.is_ok(), "expected success: {:?}", result.err());
    }

    fn first_error(source: &str) -> CompileError {
        let mut gc = Heap::new();
        match Compiler::new(source, &mut gc).compile() {
            Err(CompileError::Multiple(mut errors)) => errors.remove(0),
            Err(other) => other,
            Ok(_) => panic!("expected a compile error"),
        }
    }

    #[test]
    fn compile_expressions() {
        compile_ok("(-1 + 2) * 3 - -4;");
        compile_ok("1.5 + 1.3 * 3.5;");
        compile_ok("print 1 == \"one\";");
        compile_ok("print true and false or nil;");
    }

    #[test]
    fn compile_statements() {
        compile_ok("var beverage = \"cafe au lait\"; print beverage;");
        compile_ok("if (1 < 2) { print \"yes\"; } else { print \"no\"; }");
        compile_ok("while (false) {}");
        compile_ok("for (var i = 0; i < 10; i = i + 1) {}");
        compile_ok("{ var a = 1; { var b = a; } }");
    }

    #[test]
    fn compile_functions_and_closures() {
        compile_ok("fun hello() {} fun hello2(a) {}");
        compile_ok(
            r#"
            fun makeClosure() {
                var local = "local";
                fun closure() { print local; }
                return closure;
            }
            "#,
        );
        compile_ok(
            r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            "#,
        );
    }

    #[test]
    fn compile_classes() {
        compile_ok("class Brioche {} print Brioche;");
        compile_ok(
            r#"
            class Pair {
                init(first, second) {
                    this.first = first;
                    this.second = second;
                }
                sum() { return this.first + this.second; }
            }
            print Pair(1, 2).sum();
            "#,
        );
        compile_ok(
            r#"
            class A { method() {} }
            class B < A {
                method() { super.method(); }
            }
            "#,
        );
        compile_ok(
            r#"
            class C {
                init() { return; }
            }
            "#,
        );
    }

    #[test]
    fn invalid_assignment_target() {
        assert!(matches!(
            first_error("a * b = c + d;"),
            CompileError::InvalidAssignmentTarget { .. }
        ));
        assert!(matches!(
            first_error("1 = 2;"),
            CompileError::InvalidAssignmentTarget { .. }
        ));
    }

    #[test]
    fn duplicate_declaration_in_scope() {
        assert!(matches!(
            first_error("{ var a = 1; var a = 2; }"),
            CompileError::VariableAlreadyDeclared { .. }
        ));
        compile_ok("var a = 1; { var a = 2; }");
    }

    #[test]
    fn local_in_own_initializer() {
        assert!(matches!(
            first_error("var a = 1; { var a = a; }"),
            CompileError::LocalInInitializer { .. }
        ));
    }

    #[test]
    fn return_outside_function() {
        assert!(matches!(
            first_error("return 1;"),
            CompileError::ReturnFromScript { .. }
        ));
    }

    #[test]
    fn return_value_from_initializer() {
        assert!(matches!(
            first_error("class C { init() { return 1; } }"),
            CompileError::ReturnFromInitializer { .. }
        ));
    }

    #[test]
    fn this_outside_class() {
        assert!(matches!(
            first_error("print this;"),
            CompileError::ThisOutsideClass { .. }
        ));
        assert!(matches!(
            first_error("fun f() { return this; }"),
            CompileError::ThisOutsideClass { .. }
        ));
    }

    #[test]
    fn super_misuse() {
        assert!(matches!(
            first_error("super.method();"),
            CompileError::SuperOutsideClass { .. }
        ));
        assert!(matches!(
            first_error("class C { m() { super.m(); } }"),
            CompileError::SuperWithoutSuperclass { .. }
        ));
    }

    #[test]
    fn inherit_from_self() {
        assert!(matches!(
            first_error("class A < A {}"),
            CompileError::InheritFromSelf { .. }
        ));
    }

    #[test]
    fn local_limit() {
        let mut ok = String::from("{\n");
        for i in 0..255 {
            ok.push_str(&format!("var l{} = true;\n", i));
        }
        ok.push('}');
        compile_ok(&ok);

        let mut too_many = String::from("{\n");
        for i in 0..256 {
            too_many.push_str(&format!("var l{} = true;\n", i));
        }
        too_many.push('}');
        let mut gc = Heap::new();
        let result = Compiler::new(&too_many, &mut gc).compile();
        match result {
            Err(CompileError::Multiple(errors)) => assert!(errors
                .iter()
                .any(|err| matches!(err, CompileError::TooManyLocals { .. }))),
            other => panic!("expected TooManyLocals, got {:?}", other.err()),
        }
    }

    #[test]
    fn parameter_limit() {
        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        compile_ok(&format!("fun f({}) {{}}", params.join(", ")));

        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let mut gc = Heap::new();
        match Compiler::new(&source, &mut gc).compile() {
            Err(CompileError::Multiple(errors)) => assert!(errors
                .iter()
                .any(|err| matches!(err, CompileError::TooManyParameters { .. }))),
            other => panic!("expected TooManyParameters, got {:?}", other.err()),
        }
    }

    #[test]
    fn argument_limit() {
        let args = vec!["true"; 255].join(", ");
        compile_ok(&format!("fun f() {{}} f({});", args));

        let args = vec!["true"; 256].join(", ");
        let source = format!("fun f() {{}} f({});", args);
        let mut gc = Heap::new();
        match Compiler::new(&source, &mut gc).compile() {
            Err(CompileError::Multiple(errors)) => assert!(errors
                .iter()
                .any(|err| matches!(err, CompileError::TooManyArguments { .. }))),
            other => panic!("expected TooManyArguments, got {:?}", other.err()),
        }
    }

    #[test]
    fn constant_limit() {
        // Every distinct number literal takes a constant slot.
        let ok: String = (0..256).map(|i| format!("print {};\n", i)).collect();
        compile_ok(&ok);

        let too_many: String = (0..257).map(|i| format!("print {};\n", i)).collect();
        let mut gc = Heap::new();
        match Compiler::new(&too_many, &mut gc).compile() {
            Err(CompileError::Multiple(errors)) => assert!(errors
                .iter()
                .any(|err| matches!(err, CompileError::TooManyConstants { .. }))),
            other => panic!("expected TooManyConstants, got {:?}", other.err()),
        }
    }

    #[test]
    fn jump_limit() {
        // `true;` compiles to two bytes and no constants; enough of them
        // inside an if-body push the forward jump past 16 bits.
        let body = "true;".repeat(33_000);
        let source = format!("if (true) {{ {} }}", body);
        let mut gc = Heap::new();
        match Compiler::new(&source, &mut gc).compile() {
            Err(CompileError::Multiple(errors)) => assert!(errors
                .iter()
                .any(|err| matches!(err, CompileError::JumpTooLarge { .. }))),
            other => panic!("expected JumpTooLarge, got {:?}", other.err()),
        }
    }

    #[test]
    fn error_recovery_reports_multiple_errors() {
        let source = r#"
            var = 1;
            print this;
            var ok = 2;
            return 3;
        "#;
        let mut gc = Heap::new();
        match Compiler::new(source, &mut gc).compile() {
            Err(CompileError::Multiple(errors)) => assert!(errors.len() >= 2),
            other => panic!("expected multiple errors, got {:?}", other.err()),
        }
    }

    #[test]
    fn unterminated_string_is_reported() {
        assert!(matches!(
            first_error("var a = \"unterminated"),
            CompileError::Scanner(ScannerError::UnterminatedString { .. })
        ));
    }
}
