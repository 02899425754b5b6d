//! Single-pass compiler: tokens straight to bytecode, no intermediate tree.
//!
//! This is a deliberate departure from how the rest of the retrieval pack
//! structures a front end (most build an AST and lower it in a later pass).
//! The bytecode VM this crate implements wants a Pratt parser that emits
//! opcodes as it recognizes each expression, the way the language it is
//! modeled on has always done it. Precedence climbing lives in
//! [`parse_precedence`](Compiler::parse_precedence); every other parsing
//! method is a `(prefix, infix)` pair wired up through [`Compiler::rule`].
//!
//! One [`Compiler`] exists per source file compiled. Nested function bodies
//! push a [`FunctionFrame`] onto `frames` and pop it back off once the body
//! is parsed, so locals/upvalues never cross a function boundary by
//! accident — the same nesting discipline the reference runtime's compiler
//! uses for its `Local`/`UpvalueContext` stack, just operating directly on
//! tokens instead of an already-built tree.

use crate::chunk::Chunk;
use crate::diagnostic::{CompileError, Diagnostic};
use crate::lexer::Scanner;
use crate::object::{Heap, ObjFunction, ObjRef};
use crate::opcode::Opcode;
use crate::span::Line;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Compiles `source` into a top-level function, ready to be wrapped in a
/// closure and invoked by the VM. Compilation never panics on malformed
/// input: every syntax error is collected into the returned [`CompileError`]
/// via panic-mode recovery, so one bad statement doesn't stop the rest of
/// the file from being checked.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let ended = compiler.end_function();
    if compiler.had_error {
        Err(CompileError(compiler.diagnostics))
    } else {
        Ok(ended.function_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
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
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    /// `None` while the initializer expression is still being compiled, so
    /// `x = x` inside `var x = x;` is caught as a use-before-definition.
    depth: Option<u32>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionFrame<'src> {
    kind: FunctionKind,
    name_ref: Option<ObjRef>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: u32,
    upvalues: Vec<UpvalueDesc>,
}

impl<'src> FunctionFrame<'src> {
    fn new(kind: FunctionKind, name_ref: Option<ObjRef>) -> Self {
        // Slot 0 is reserved for the receiver (methods/initializers) or left
        // unnamed and unreachable (plain functions and the top-level
        // script), matching how the VM always leaves the callee's own
        // closure/receiver sitting in frame slot 0.
        let implicit_name = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            FunctionKind::Function | FunctionKind::Script => "",
        };
        Self {
            kind,
            name_ref,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: Token::new(TokenKind::Identifier, implicit_name, Line::start()),
                depth: Some(0),
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct EndedFunction {
    function_ref: ObjRef,
    upvalues: Vec<UpvalueDesc>,
}

struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    heap: &'heap mut Heap,
    frames: Vec<FunctionFrame<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let sentinel = Token::new(TokenKind::Eof, "", Line::start());
        Self {
            scanner: Scanner::new(source),
            previous: sentinel,
            current: sentinel,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            heap,
            frames: vec![FunctionFrame::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof | TokenKind::Error => None,
            _ => Some(token.lexeme),
        };
        self.diagnostics.push(Diagnostic::new(token.line, at, message));
    }

    /// Panic-mode recovery: discard tokens until a statement boundary so one
    /// malformed statement doesn't cascade into spurious follow-on errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission -------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().expect("at least one frame is always live").chunk
    }

    fn emit_opcode(&mut self, op: Opcode) {
        let line = self.previous.line.0;
        self.current_chunk().write_opcode(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line.0;
        self.current_chunk().write_u8(byte, line);
    }

    fn emit_bytes(&mut self, op: Opcode, operand: u8) {
        self.emit_opcode(op);
        self.emit_u8(operand);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        let line = self.previous.line.0;
        self.current_chunk().emit_jump_placeholder(op, line)
    }

    fn patch_jump(&mut self, placeholder: usize) {
        if self.current_chunk().patch_jump(placeholder).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line.0;
        if self.current_chunk().emit_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn emit_return(&mut self) {
        if self.frames.last().expect("frame").kind == FunctionKind::Initializer {
            self.emit_bytes(Opcode::GetLocal, 0);
        } else {
            self.emit_opcode(Opcode::Nil);
        }
        self.emit_opcode(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(Opcode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.heap.intern(name);
        self.make_constant(Value::Obj(r))
    }

    // ---- scopes, locals, upvalues -------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().expect("frame").scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.previous.line.0;
        self.frames.last_mut().expect("frame").scope_depth -= 1;
        loop {
            let pop_kind = {
                let frame = self.frames.last().expect("frame");
                let depth = frame.scope_depth;
                match frame.locals.last() {
                    Some(local) if local.depth.map_or(false, |d| d > depth) => {
                        Some(local.is_captured)
                    }
                    _ => None,
                }
            };
            match pop_kind {
                Some(captured) => {
                    self.frames.last_mut().expect("frame").locals.pop();
                    let op = if captured { Opcode::CloseUpvalue } else { Opcode::Pop };
                    self.current_chunk().write_opcode(op, line);
                }
                None => break,
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frames.last().expect("frame").locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.frames.last_mut().expect("frame").locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let depth = self.frames.last().expect("frame").scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        {
            let locals = &self.frames.last().expect("frame").locals;
            for local in locals.iter().rev() {
                if let Some(d) = local.depth {
                    if d < depth {
                        break;
                    }
                }
                if local.name.lexeme == name.lexeme {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frames.last().expect("frame").scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().expect("frame");
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frames.last().expect("frame").scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(Opcode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.frames[frame_idx].locals;
        let mut found: Option<(usize, bool)> = None;
        for (idx, local) in locals.iter().enumerate().rev() {
            if local.name.lexeme == name {
                found = Some((idx, local.depth.is_some()));
                break;
            }
        }
        match found {
            Some((idx, true)) => Some(idx as u8),
            Some((_, false)) => {
                self.error("Can't read local variable in its own initializer.");
                None
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.frames[frame_idx]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(pos) = existing {
            return pos as u8;
        }
        if self.frames[frame_idx].upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_idx].upvalues.push(UpvalueDesc { index, is_local });
        (self.frames[frame_idx].upvalues.len() - 1) as u8
    }

    fn synthetic_token(text: &'static str) -> Token<'src> {
        Token::new(TokenKind::Identifier, text, Line::start())
    }

    // ---- declarations & statements -------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_bytes(Opcode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if self.previous.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local(Self::synthetic_token("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_opcode(Opcode::Inherit);
            self.classes.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_opcode(Opcode::Pop);

        let class_state = self.classes.pop().expect("pushed above");
        if class_state.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(Opcode::Method, name_const);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name_ref = if kind != FunctionKind::Script {
            Some(self.heap.intern(self.previous.lexeme))
        } else {
            None
        };
        self.frames.push(FunctionFrame::new(kind, name_ref));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.frames.last().expect("frame").arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.frames.last_mut().expect("frame").arity += 1;
                }
                let param_const = self.parse_variable("Expect parameter name.");
                self.define_variable(param_const);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let ended = self.end_function();
        let const_idx = self.make_constant(Value::Obj(ended.function_ref));
        self.emit_bytes(Opcode::Closure, const_idx);
        for upvalue in &ended.upvalues {
            self.emit_u8(if upvalue.is_local { 1 } else { 0 });
            self.emit_u8(upvalue.index);
        }
    }

    fn end_function(&mut self) -> EndedFunction {
        self.emit_return();
        let frame = self.frames.pop().expect("function() always pushed one");

        if let Err(e) = crate::chunk::validate(&frame.chunk) {
            panic!("compiler produced an invalid chunk: {e}");
        }
        tracing::debug!(
            arity = frame.arity,
            upvalues = frame.upvalues.len(),
            bytes = frame.chunk.code.len(),
            "compiled function chunk"
        );

        let function = ObjFunction {
            arity: frame.arity,
            upvalue_count: frame.upvalues.len(),
            chunk: frame.chunk,
            name: frame.name_ref,
        };
        let function_ref = self.heap.alloc_function(function);
        EndedFunction { function_ref, upvalues: frame.upvalues }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_opcode(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_opcode(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_opcode(Opcode::Pop);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.statement();

        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_opcode(Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().current_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_opcode(Opcode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().current_offset();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_opcode(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.current_chunk().current_offset();
            self.expression();
            self.emit_opcode(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_opcode(Opcode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frames.last().expect("frame").kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frames.last().expect("frame").kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_opcode(Opcode::Return);
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = Self::rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("advance only consumed a token with an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'heap> {
        use TokenKind::*;
        match kind {
            LeftParen => ParseRule {
                prefix: Some(Compiler::grouping),
                infix: Some(Compiler::call),
                precedence: Precedence::Call,
            },
            Dot => ParseRule { prefix: None, infix: Some(Compiler::dot), precedence: Precedence::Call },
            Minus => ParseRule {
                prefix: Some(Compiler::unary),
                infix: Some(Compiler::binary),
                precedence: Precedence::Term,
            },
            Plus => ParseRule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
            Slash | Star => ParseRule {
                prefix: None,
                infix: Some(Compiler::binary),
                precedence: Precedence::Factor,
            },
            Bang => ParseRule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
            BangEqual | EqualEqual => ParseRule {
                prefix: None,
                infix: Some(Compiler::binary),
                precedence: Precedence::Equality,
            },
            Greater | GreaterEqual | Less | LessEqual => ParseRule {
                prefix: None,
                infix: Some(Compiler::binary),
                precedence: Precedence::Comparison,
            },
            Identifier => ParseRule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
            String => ParseRule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None },
            Number => ParseRule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None },
            And => ParseRule { prefix: None, infix: Some(Compiler::and_), precedence: Precedence::And },
            Or => ParseRule { prefix: None, infix: Some(Compiler::or_), precedence: Precedence::Or },
            False | Nil | True => {
                ParseRule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None }
            }
            This => ParseRule { prefix: Some(Compiler::this_), infix: None, precedence: Precedence::None },
            Super => ParseRule { prefix: Some(Compiler::super_), infix: None, precedence: Precedence::None },
            _ => ParseRule { prefix: None, infix: None, precedence: Precedence::None },
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_opcode(Opcode::Not),
            TokenKind::Minus => self.emit_opcode(Opcode::Negate),
            _ => unreachable!("unary() dispatched for a non-unary operator"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_opcode(Opcode::Equal);
                self.emit_opcode(Opcode::Not);
            }
            TokenKind::EqualEqual => self.emit_opcode(Opcode::Equal),
            TokenKind::Greater => self.emit_opcode(Opcode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_opcode(Opcode::Less);
                self.emit_opcode(Opcode::Not);
            }
            TokenKind::Less => self.emit_opcode(Opcode::Less),
            TokenKind::LessEqual => {
                self.emit_opcode(Opcode::Greater);
                self.emit_opcode(Opcode::Not);
            }
            TokenKind::Plus => self.emit_opcode(Opcode::Add),
            TokenKind::Minus => self.emit_opcode(Opcode::Subtract),
            TokenKind::Star => self.emit_opcode(Opcode::Multiply),
            TokenKind::Slash => self.emit_opcode(Opcode::Divide),
            _ => unreachable!("binary() dispatched for a non-binary operator"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_opcode(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_opcode(Opcode::False),
            TokenKind::Nil => self.emit_opcode(Opcode::Nil),
            TokenKind::True => self.emit_opcode(Opcode::True),
            _ => unreachable!("literal() dispatched for a non-literal token"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner only produces well-formed number lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let r = self.heap.intern(content);
        self.emit_constant(Value::Obj(r));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(idx) = self.resolve_local(frame_idx, name.lexeme) {
            (Opcode::GetLocal, Opcode::SetLocal, idx)
        } else if let Some(idx) = self.resolve_upvalue(frame_idx, name.lexeme) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, idx)
        } else {
            let idx = self.identifier_constant(name.lexeme);
            (Opcode::GetGlobal, Opcode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(Self::synthetic_token("this"), false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);

        self.named_variable(Self::synthetic_token("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Self::synthetic_token("super"), false);
            self.emit_opcode(Opcode::SuperInvoke);
            self.emit_u8(name_const);
            self.emit_u8(argc);
        } else {
            self.named_variable(Self::synthetic_token("super"), false);
            self.emit_bytes(Opcode::GetSuper, name_const);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(Opcode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(Opcode::SetProperty, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_opcode(Opcode::Invoke);
            self.emit_u8(name_const);
            self.emit_u8(argc);
        } else {
            self.emit_bytes(Opcode::GetProperty, name_const);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn compiled(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("source must compile");
        (heap, function)
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let (heap, function) = compiled("1 + 2 * 3;");
        let chunk = &heap.as_function(function).chunk;
        assert!(chunk.code.contains(&(Opcode::Multiply as u8)));
        assert!(chunk.code.contains(&(Opcode::Add as u8)));
        assert!(chunk.code.contains(&(Opcode::Pop as u8)));
    }

    #[test]
    fn reports_unterminated_block_as_single_diagnostic() {
        let mut heap = Heap::new();
        let err = compile("{ var x = 1;", &mut heap).unwrap_err();
        assert_eq!(err.diagnostics().len(), 1);
    }

    #[test]
    fn assigning_to_a_call_result_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("foo() = 1;", &mut heap).unwrap_err();
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.message == "Invalid assignment target."));
    }

    #[test]
    fn self_referencing_local_initializer_is_rejected() {
        let mut heap = Heap::new();
        let err = compile("{ var a = a; }", &mut heap).unwrap_err();
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.message == "Can't read local variable in its own initializer."));
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("print this;", &mut heap).unwrap_err();
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.message == "Can't use 'this' outside of a class."));
    }

    #[test]
    fn return_value_from_initializer_is_an_error() {
        let mut heap = Heap::new();
        let source = "class A { init() { return 1; } }";
        let err = compile(source, &mut heap).unwrap_err();
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.message == "Can't return a value from an initializer."));
    }

    #[test]
    fn two_hundred_fifty_five_parameters_compile() {
        let mut heap = Heap::new();
        let params = (0..255).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ");
        let source = format!("fun f({params}) {{ return 0; }}");
        assert!(compile(&source, &mut heap).is_ok());
    }

    #[test]
    fn two_hundred_fifty_six_parameters_is_an_error() {
        let mut heap = Heap::new();
        let params = (0..256).map(|i| format!("p{i}")).collect::<Vec<_>>().join(", ");
        let source = format!("fun f({params}) {{ return 0; }}");
        let err = compile(&source, &mut heap).unwrap_err();
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.message == "Can't have more than 255 parameters."));
    }

    #[test]
    fn nested_closure_captures_enclosing_local_as_upvalue() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let (heap, function) = compiled(source);
        let chunk = &heap.as_function(function).chunk;
        assert!(chunk.code.contains(&(Opcode::Closure as u8)));
    }

    #[test]
    fn class_with_methods_and_inheritance_compiles() {
        let source = r#"
            class A { greet() { return "hi"; } }
            class B < A { greet() { return super.greet(); } }
        "#;
        let (heap, function) = compiled(source);
        let chunk = &heap.as_function(function).chunk;
        assert!(chunk.code.contains(&(Opcode::Inherit as u8)));
        assert!(chunk.code.contains(&(Opcode::Method as u8)));
    }
}
