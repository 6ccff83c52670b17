pub mod chunk;
pub mod error;
pub mod object;
pub mod table;
pub mod value;

use chunk::{Chunk, OpCode};
use error::{CompileError, Diagnostics};
use lexer::token::{Token, TokenKind};
use lexer::Lexer;
use object::{Function, Heap, ObjRef};
use std::rc::Rc;
use value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Clone, Copy, PartialEq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct Local {
    name: Token,
    /// `None` is the UNINITIALIZED sentinel: declared but not yet assigned.
    depth: Option<u32>,
    is_captured: bool,
}

struct FunctionState {
    name: Option<ObjRef>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    function_type: FunctionType,
}

fn synthetic_token(lexeme: &'static str) -> Token {
    let kind = if lexeme == "this" {
        TokenKind::This
    } else if lexeme == "super" {
        TokenKind::Super
    } else {
        TokenKind::Identifier
    };
    Token::new(kind, Rc::from(lexeme), 0, lexeme.len(), 0)
}

impl FunctionState {
    fn new(function_type: FunctionType, name: Option<ObjRef>) -> Self {
        let slot0 = match function_type {
            FunctionType::Method | FunctionType::Initializer => synthetic_token("this"),
            _ => synthetic_token(""),
        };
        Self {
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot0,
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            function_type,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// A single-pass Pratt compiler: no AST, lexical scope is resolved and
/// bytecode emitted in the same walk over the token stream. `heap` is
/// threaded explicitly rather than kept as a singleton so a REPL can
/// reuse one heap across many `compile` calls.
struct Compiler<'h> {
    lexer: Lexer,
    previous: Token,
    current: Token,
    diagnostics: Diagnostics,
    heap: &'h mut Heap,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

impl<'h> Compiler<'h> {
    fn new(source: &str, heap: &'h mut Heap) -> Self {
        let dummy = synthetic_token("");
        Self {
            lexer: Lexer::new(source),
            previous: dummy.clone(),
            current: dummy,
            diagnostics: Diagnostics::default(),
            heap,
            functions: vec![FunctionState::new(FunctionType::Script, None)],
            classes: Vec::new(),
        }
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn current_function(&self) -> &FunctionState {
        self.functions.last().unwrap()
    }

    fn current_function_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().unwrap()
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    /// Collection points are explicit (here, and once per VM dispatch loop
    /// iteration) rather than inside every allocation, so anything freshly
    /// allocated is already attached to a reachable chunk or stack slot by
    /// the time a collection can run.
    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let functions = &self.functions;
            self.heap.collect_garbage(|heap| {
                for f in functions {
                    for c in f.chunk.constants() {
                        heap.mark_value(*c);
                    }
                    if let Some(name) = f.name {
                        heap.mark_object(name);
                    }
                }
            });
        }
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.diagnostics.report(CompileError::LexError(self.current.clone()));
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, what: &'static str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.diagnostics
                .report(CompileError::Expected(what, self.current.clone()));
        }
    }

    fn synchronize(&mut self) {
        self.diagnostics.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(
                self.current.kind,
                Class | Fun | Var | For | If | While | Print | Return
            ) {
                return;
            }
            self.advance();
        }
    }

    // --- bytecode emission --------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk_mut().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_chunk_mut().write_op(op, line);
    }

    fn emit_return(&mut self) {
        if self.current_function().function_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.current_chunk_mut().add_constant(value);
        if idx > u8::MAX as usize {
            self.diagnostics
                .report(CompileError::TooManyConstants(self.previous.clone()));
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(idx);
    }

    fn identifier_constant(&mut self, token: &Token) -> u8 {
        let interned = self.heap.intern(token.lexeme());
        let value = Value::Obj(interned);
        for (i, c) in self.current_chunk().constants().iter().enumerate() {
            if *c == value {
                return i as u8;
            }
        }
        self.make_constant(value)
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.line();
        self.current_chunk_mut().write_u16(0xffff, line);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        let jump = self.current_chunk().len() - at - 2;
        if jump > u16::MAX as usize {
            self.diagnostics
                .report(CompileError::HugeJump(self.previous.clone()));
        } else {
            self.current_chunk_mut().patch_u16(at, jump as u16);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        let line = self.line();
        if offset > u16::MAX as usize {
            self.diagnostics
                .report(CompileError::HugeJump(self.previous.clone()));
            self.current_chunk_mut().write_u16(0, line);
        } else {
            self.current_chunk_mut().write_u16(offset as u16, line);
        }
    }

    // --- scope & variables ----------------------------------------------

    fn begin_scope(&mut self) {
        self.current_function_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_function_mut().scope_depth -= 1;
        let depth = self.current_function().scope_depth;
        while let Some(local) = self.current_function().locals.last() {
            if local.depth.map_or(false, |d| d > depth) {
                let captured = local.is_captured;
                self.current_function_mut().locals.pop();
                if captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
            } else {
                break;
            }
        }
    }

    fn add_local(&mut self, name: Token) {
        if self.current_function().locals.len() >= 256 {
            self.diagnostics.report(CompileError::TooManyLocals(name));
            return;
        }
        self.current_function_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.current_function().scope_depth == 0 {
            return;
        }
        let name = self.previous.clone();
        let depth = self.current_function().scope_depth;
        let mut already_declared = false;
        for local in self.current_function().locals.iter().rev() {
            if let Some(d) = local.depth {
                if d < depth {
                    break;
                }
            }
            if local.name.lexeme() == name.lexeme() {
                already_declared = true;
            }
        }
        if already_declared {
            self.diagnostics
                .report(CompileError::VariableAlreadyDeclared(name.clone()));
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, what: &'static str) -> u8 {
        self.consume(TokenKind::Identifier, what);
        self.declare_variable();
        if self.current_function().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.current_function().scope_depth == 0 {
            return;
        }
        let depth = self.current_function().scope_depth;
        self.current_function_mut().locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_function().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, function_index: usize, name: &Token) -> Option<u8> {
        let mut found_uninitialized = false;
        let mut result = None;
        for (i, local) in self.functions[function_index].locals.iter().enumerate().rev() {
            if local.name.lexeme() == name.lexeme() {
                if local.depth.is_none() {
                    found_uninitialized = true;
                } else {
                    result = Some(i as u8);
                }
                break;
            }
        }
        if found_uninitialized {
            self.diagnostics
                .report(CompileError::ReadInOwnInitializer(name.clone()));
        }
        result
    }

    fn add_upvalue(&mut self, function_index: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.functions[function_index].upvalues;
        for (i, uv) in upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= 256 {
            self.diagnostics
                .report(CompileError::TooManyUpvalues(self.previous.clone()));
            return 0;
        }
        self.functions[function_index]
            .upvalues
            .push(UpvalueDesc { index, is_local });
        (self.functions[function_index].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, function_index: usize, name: &Token) -> Option<u8> {
        if function_index == 0 {
            return None;
        }
        let enclosing = function_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(function_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(function_index, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let function_index = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(function_index, &name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(uv) = self.resolve_upvalue(function_index, &name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, uv)
        } else {
            let idx = self.identifier_constant(&name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // --- Pratt expression parsing ----------------------------------------

    fn precedence_of(&self, kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            LeftParen | Dot | LeftBracket => Precedence::Call,
            Minus | Plus => Precedence::Term,
            Slash | Star => Precedence::Factor,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            And => Precedence::And,
            Or => Precedence::Or,
            _ => Precedence::None,
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let can_assign = prec <= Precedence::Assignment;
        self.prefix_rule(self.previous.kind, can_assign);
        while prec <= self.precedence_of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.diagnostics
                .report(CompileError::InvalidAssignmentTarget(self.previous.clone()));
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Number => self.number(),
            String => self.string_literal(),
            True | False | Nil => self.literal(),
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            LeftBrace => self.array_literal(),
            _ => self
                .diagnostics
                .report(CompileError::Expected("expression", self.previous.clone())),
        }
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and_expr(),
            Or => self.or_expr(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            LeftBracket => self.index(can_assign),
            _ => unreachable!("not an infix operator: {kind:?}"),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme().parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self) {
        let raw = self.previous.lexeme();
        let text = &raw[1..raw.len() - 1];
        let interned = self.heap.intern(text);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "')' after expression");
    }

    fn unary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op = self.previous.kind;
        let prec = self.precedence_of(op);
        self.parse_precedence(prec.next());
        use TokenKind::*;
        match op {
            Plus => self.emit_op(OpCode::Add),
            Minus => self.emit_op(OpCode::Subtract),
            Star => self.emit_op(OpCode::Multiply),
            Slash => self.emit_op(OpCode::Divide),
            EqualEqual => self.emit_op(OpCode::Equal),
            BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            Greater => self.emit_op(OpCode::Greater),
            GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            Less => self.emit_op(OpCode::Less),
            LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.clone();
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.diagnostics
                .report(CompileError::ThisOutsideClass(self.previous.clone()));
            return;
        }
        let name = self.previous.clone();
        self.named_variable(name, false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.diagnostics
                .report(CompileError::SuperOutsideClass(self.previous.clone()));
        } else if !self.classes.last().unwrap().has_superclass {
            self.diagnostics
                .report(CompileError::SuperWithoutSuperclass(self.previous.clone()));
        }
        self.consume(TokenKind::Dot, "'.' after 'super'");
        self.consume(TokenKind::Identifier, "superclass method name");
        let name = self.previous.clone();
        let idx = self.identifier_constant(&name);
        self.named_variable(synthetic_token("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(idx);
            self.emit_byte(argc);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(idx);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.diagnostics
                        .report(CompileError::HugeArray(self.previous.clone()));
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "'}' after array literal");
        self.emit_op(OpCode::Array);
        self.emit_byte(count as u8);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                argc += 1;
                if argc > 255 {
                    self.diagnostics
                        .report(CompileError::TooManyArgs(self.previous.clone()));
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after arguments");
        argc as u8
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "property name after '.'");
        let name = self.previous.clone();
        let idx = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(idx);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(idx);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "']' after index");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    // --- statements -------------------------------------------------

    fn declaration(&mut self) {
        self.maybe_collect();
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.diagnostics.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "class name");
        let name_token = self.previous.clone();
        let name_constant = self.identifier_constant(&name_token);
        self.declare_variable();
        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        let mut has_superclass = false;
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "superclass name");
            let super_name = self.previous.clone();
            if super_name.lexeme() == name_token.lexeme() {
                self.diagnostics
                    .report(CompileError::SelfInheritance(super_name.clone()));
            }
            self.named_variable(super_name, false);
            self.begin_scope();
            self.add_local(synthetic_token("super"));
            self.define_variable(0);
            self.named_variable(name_token.clone(), false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }

        self.classes.push(ClassState { has_superclass });
        self.named_variable(name_token.clone(), false);
        self.consume(TokenKind::LeftBrace, "'{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "'}' after class body");
        self.emit_op(OpCode::Pop);

        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "method name");
        let name_token = self.previous.clone();
        let name_idx = self.identifier_constant(&name_token);
        let ftype = if name_token.lexeme() == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(ftype, Some(&name_token));
        self.emit_op(OpCode::Method);
        self.emit_byte(name_idx);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("function name");
        self.mark_initialized();
        let name_token = self.previous.clone();
        self.function(FunctionType::Function, Some(&name_token));
        self.define_variable(global);
    }

    fn function(&mut self, ftype: FunctionType, name_token: Option<&Token>) {
        let name = name_token.map(|t| self.heap.intern(t.lexeme()));
        self.functions.push(FunctionState::new(ftype, name));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_function_mut().arity += 1;
                if self.current_function().arity > 255 {
                    self.diagnostics
                        .report(CompileError::TooManyParams(self.current.clone()));
                }
                let param = self.parse_variable("parameter name");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters");
        self.consume(TokenKind::LeftBrace, "'{' before function body");
        self.block();

        let upvalues = self.current_function().upvalues.clone();
        let func_obj = self.end_function();
        let idx = self.make_constant(Value::Obj(func_obj));
        self.emit_op(OpCode::Closure);
        self.emit_byte(idx);
        for uv in upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn end_function(&mut self) -> ObjRef {
        self.emit_return();
        let state = self.functions.pop().expect("function stack not empty");
        let function = Function {
            name: state.name,
            arity: state.arity,
            upvalue_count: state.upvalues.len() as u8,
            chunk: state.chunk,
        };
        self.heap.alloc_function(function)
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("variable name");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "';' after variable declaration");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "'}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.functions.len() == 1 {
            self.diagnostics
                .report(CompileError::ReturnOutsideFunction(self.previous.clone()));
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_function().function_type == FunctionType::Initializer {
                self.diagnostics
                    .report(CompileError::ReturnFromInitializer(self.previous.clone()));
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "'(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "'(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }
}

/// Compiles `source` into a top-level script `ObjFunction`, or a set of
/// diagnostics if compilation failed. No bytecode from a failed compile is
/// ever handed to the VM.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Diagnostics> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let function = compiler.end_function();
    if compiler.diagnostics.had_error() {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk::OpCode::*;
    use object::ObjData;

    fn opcodes(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = vec![];
        let mut ip = 0;
        while ip < chunk.len() {
            let op = OpCode::from(chunk.byte(ip));
            ops.push(op);
            ip += 1;
            ip += match op {
                Pop | Nil | True | False | Equal | Greater | Less | Add | Subtract | Multiply
                | Divide | Not | Negate | Print | CloseUpvalue | Return | Inherit | GetIndex
                | SetIndex => 0,
                GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | Constant | GetGlobal
                | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper | Class
                | Method | Array => 1,
                Invoke | SuperInvoke => 2,
                Jump | JumpIfFalse | Loop => 2,
                Closure => {
                    let const_idx = chunk.byte(ip) as usize;
                    let upvalue_count = match chunk.constant(const_idx) {
                        Value::Obj(obj) => match &obj.data {
                            ObjData::Function(f) => f.upvalue_count,
                            _ => 0,
                        },
                        _ => 0,
                    };
                    1 + 1 + (upvalue_count as usize) * 2
                }
            };
        }
        ops
    }

    #[test]
    fn compiles_arithmetic_with_correct_precedence() {
        let mut heap = Heap::new();
        let func = compile("1 + 2 * 3;", &mut heap).unwrap();
        let ObjData::Function(f) = &func.data else {
            unreachable!()
        };
        assert_eq!(
            opcodes(&f.chunk),
            vec![Constant, Constant, Constant, Multiply, Add, Pop, Nil, Return]
        );
    }

    #[test]
    fn resolves_locals_without_global_lookup() {
        let mut heap = Heap::new();
        let func = compile("{ var x = 1; x = x + 1; }", &mut heap).unwrap();
        let ObjData::Function(f) = &func.data else {
            unreachable!()
        };
        assert!(opcodes(&f.chunk).contains(&GetLocal));
        assert!(!opcodes(&f.chunk).contains(&GetGlobal));
    }

    #[test]
    fn reports_read_in_own_initializer() {
        let mut heap = Heap::new();
        let err = compile("{ var a = a; }", &mut heap).unwrap_err();
        assert!(err.had_error());
    }

    #[test]
    fn reports_self_inheriting_class() {
        let mut heap = Heap::new();
        let err = compile("class A < A {}", &mut heap).unwrap_err();
        assert!(err.had_error());
    }

    #[test]
    fn synchronizes_after_error_to_next_statement() {
        let mut heap = Heap::new();
        // `@` is a lexer error; the rest of the program still compiles.
        let err = compile("@ var x = 1;", &mut heap).unwrap_err();
        assert_eq!(err.errors().len(), 1);
    }

    #[test]
    fn function_captures_enclosing_local_as_upvalue() {
        let mut heap = Heap::new();
        let func =
            compile("fun make() { var x = 1; fun g() { return x; } return g; }", &mut heap)
                .unwrap();
        let ObjData::Function(f) = &func.data else {
            unreachable!()
        };
        assert!(opcodes(&f.chunk).contains(&Closure));
    }
}
