use colored::Colorize;
use lexer::token::Token;
use std::fmt;

/// A compile-time diagnostic. Reported with the offending token's line and
/// lexeme, the way `[line N] Error at '<lex>': <msg>` is reported.
#[derive(Debug, Clone)]
pub enum CompileError {
    TooManyConstants(Token),
    TooManyLocals(Token),
    TooManyUpvalues(Token),
    TooManyParams(Token),
    TooManyArgs(Token),
    HugeJump(Token),
    HugeArray(Token),
    VariableAlreadyDeclared(Token),
    ReadInOwnInitializer(Token),
    ReturnOutsideFunction(Token),
    ReturnFromInitializer(Token),
    ThisOutsideClass(Token),
    SuperOutsideClass(Token),
    SuperWithoutSuperclass(Token),
    SelfInheritance(Token),
    InvalidAssignmentTarget(Token),
    Expected(&'static str, Token),
    UnexpectedToken(Token),
    UnterminatedString(Token),
    LexError(Token),
}

impl CompileError {
    pub fn token(&self) -> &Token {
        match self {
            Self::TooManyConstants(t)
            | Self::TooManyLocals(t)
            | Self::TooManyUpvalues(t)
            | Self::TooManyParams(t)
            | Self::TooManyArgs(t)
            | Self::HugeJump(t)
            | Self::HugeArray(t)
            | Self::VariableAlreadyDeclared(t)
            | Self::ReadInOwnInitializer(t)
            | Self::ReturnOutsideFunction(t)
            | Self::ReturnFromInitializer(t)
            | Self::ThisOutsideClass(t)
            | Self::SuperOutsideClass(t)
            | Self::SuperWithoutSuperclass(t)
            | Self::SelfInheritance(t)
            | Self::InvalidAssignmentTarget(t)
            | Self::Expected(_, t)
            | Self::UnexpectedToken(t)
            | Self::UnterminatedString(t)
            | Self::LexError(t) => t,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::TooManyConstants(_) => "Too many constants in one chunk.".into(),
            Self::TooManyLocals(_) => "Too many local variables in function.".into(),
            Self::TooManyUpvalues(_) => "Too many closure variables in function.".into(),
            Self::TooManyParams(_) => "Can't have more than 255 parameters.".into(),
            Self::TooManyArgs(_) => "Can't have more than 255 arguments.".into(),
            Self::HugeJump(_) => "Too much code to jump over.".into(),
            Self::HugeArray(_) => "Can't have more than 255 elements in an array literal.".into(),
            Self::VariableAlreadyDeclared(t) => {
                format!("Already a variable named '{}' in this scope.", t.lexeme())
            }
            Self::ReadInOwnInitializer(_) => {
                "Can't read local variable in its own initializer.".into()
            }
            Self::ReturnOutsideFunction(_) => "Can't return from top-level code.".into(),
            Self::ReturnFromInitializer(_) => "Can't return a value from an initializer.".into(),
            Self::ThisOutsideClass(_) => "Can't use 'this' outside of a class.".into(),
            Self::SuperOutsideClass(_) => "Can't use 'super' outside of a class.".into(),
            Self::SuperWithoutSuperclass(_) => {
                "Can't use 'super' in a class with no superclass.".into()
            }
            Self::SelfInheritance(t) => format!("A class can't inherit from itself ({}).", t.lexeme()),
            Self::InvalidAssignmentTarget(_) => "Invalid assignment target.".into(),
            Self::Expected(what, _) => format!("Expect {what}."),
            Self::UnexpectedToken(t) => format!("Unexpected token '{}'.", t.lexeme()),
            Self::UnterminatedString(_) => "Unterminated string.".into(),
            Self::LexError(t) => t.error_message().to_string(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.token();
        write!(f, "{} ", format!("[line {}] Error", token.line).red())?;
        if token.kind == lexer::token::TokenKind::Eof {
            write!(f, "at end: ")?;
        } else {
            write!(f, "at '{}': ", token.lexeme())?;
        }
        write!(f, "{}", self.message())
    }
}

/// A runtime failure. Each variant knows how to render its own message;
/// the call stack at the point of failure is rendered separately as a
/// `Backtrace`.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    OperandsMustBeNumbers,
    OperandMustBeNumber,
    OperandsMustMatchForAdd,
    UndefinedVariable(String),
    UndefinedProperty(String),
    OnlyInstancesHaveProperties,
    OnlyInstancesAndStringsAndArraysHaveProperties,
    OnlyInstancesHaveFields,
    CanOnlyCallFunctionsAndClasses,
    WrongArgCount { expected: usize, got: usize },
    StackOverflow,
    SuperclassMustBeClass,
    IndexMustBeInteger,
    IndexOutOfBounds { index: i64, len: usize },
    NotIndexable,
}

impl RuntimeError {
    pub fn message(&self) -> String {
        match self {
            Self::OperandsMustBeNumbers => "Operands must be numbers.".into(),
            Self::OperandMustBeNumber => "Operand must be a number.".into(),
            Self::OperandsMustMatchForAdd => {
                "Operands must be two numbers or two strings.".into()
            }
            Self::UndefinedVariable(name) => format!("Undefined variable '{name}'."),
            Self::UndefinedProperty(name) => format!("Undefined property '{name}'."),
            Self::OnlyInstancesHaveProperties => "Only instances have properties.".into(),
            Self::OnlyInstancesAndStringsAndArraysHaveProperties => {
                "Only instances, strings and arrays have properties.".into()
            }
            Self::OnlyInstancesHaveFields => "Only instances have fields.".into(),
            Self::CanOnlyCallFunctionsAndClasses => {
                "Can only call functions and classes.".into()
            }
            Self::WrongArgCount { expected, got } => {
                format!("Expected {expected} arguments but got {got}.")
            }
            Self::StackOverflow => "Stack overflow.".into(),
            Self::SuperclassMustBeClass => "Superclass must be a class.".into(),
            Self::IndexMustBeInteger => "Array index must be a non-negative integer.".into(),
            Self::IndexOutOfBounds { index, len } => {
                format!("Index {index} out of bounds for array of length {len}.")
            }
            Self::NotIndexable => "Only arrays and strings can be indexed.".into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Collects diagnostics for a single `compile()` call. Reporting is
/// suppressed while `panic_mode` is set, until the parser resynchronizes,
/// matching the "first error, then silence until a statement boundary"
/// rule.
#[derive(Default, Debug)]
pub struct Diagnostics {
    errors: Vec<CompileError>,
    pub panic_mode: bool,
}

impl Diagnostics {
    pub fn report(&mut self, error: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(error);
    }

    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn print(&self) {
        for error in &self.errors {
            eprintln!("{error}");
        }
    }
}
