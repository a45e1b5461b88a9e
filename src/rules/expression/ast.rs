//! Syntax tree of match expressions

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
    /// `+`
    Plus,
    /// `~`
    BitNot,
    /// `typeof`
    TypeOf,
    /// `void`
    Void,
    /// `delete`
    Delete,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `===`
    StrictEq,
    /// `!==`
    StrictNotEq,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    LtEq,
    /// `>=`
    GtEq,
    /// Arithmetic, bitwise and the remaining binary operators, by token
    Other(&'static str),
}

impl BinaryOp {
    /// Whether this is an equality or relational comparison
    pub fn is_comparison(&self) -> bool {
        !matches!(self, BinaryOp::Other(_))
    }
}

/// Short-circuiting operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// `&&`
    And,
    /// `||`
    Or,
    /// `??`
    Coalesce,
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `null`
    Null,
    /// `undefined`
    Undefined,
    /// `true` / `false`
    Bool(bool),
    /// Numeric literal
    Number(f64),
    /// String literal
    Str(String),
    /// Regular expression literal
    Regex {
        /// Pattern
        pattern: String,
        /// Flags
        flags: String,
    },
    /// Identifier reference
    Ident(String),
    /// `object.property`
    Member {
        /// Object
        object: Box<Expr>,
        /// Property name
        property: String,
    },
    /// `object[index]`
    Index {
        /// Object
        object: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// Function call
    Call {
        /// Callee
        callee: Box<Expr>,
        /// Arguments
        args: Vec<Expr>,
    },
    /// `new Callee(args)`
    New {
        /// Constructor
        callee: Box<Expr>,
        /// Arguments
        args: Vec<Expr>,
    },
    /// Prefix operator
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operator
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// `&&`, `||`, `??`
    Logical {
        /// Operator
        op: LogicalOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// Assignment, plain or compound
    Assign {
        /// Assigned place
        target: Box<Expr>,
        /// Value
        value: Box<Expr>,
    },
    /// `++` / `--`
    Update(Box<Expr>),
    /// `test ? a : b`
    Conditional {
        /// Condition
        test: Box<Expr>,
        /// Value when true
        then: Box<Expr>,
        /// Value when false
        otherwise: Box<Expr>,
    },
    /// Function expression or arrow function
    Function,
    /// Array literal
    Array(Vec<Expr>),
    /// Object literal
    Object(Vec<(String, Expr)>),
    /// Comma-separated expressions
    Sequence(Vec<Expr>),
    /// `this`
    This,
}

/// Statement node
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Expression statement
    Expr(Expr),
    /// `var`, `let` or `const`
    Declaration,
    /// Named function declaration
    Function,
    /// `class`
    Class,
    /// `if`
    If,
    /// `while`, `do ... while` or `for`
    Loop,
    /// `{ ... }`
    Block,
    /// `return`
    Return,
    /// `throw`
    Throw,
    /// `try`
    Try,
    /// `switch`
    Switch,
    /// `;`
    Empty,
}

impl Stmt {
    /// Short name of the construct, for error messages
    pub fn describe(&self) -> &'static str {
        match self {
            Stmt::Expr(_) => "expression",
            Stmt::Declaration => "variable declaration",
            Stmt::Function => "function declaration",
            Stmt::Class => "class declaration",
            Stmt::If => "if statement",
            Stmt::Loop => "loop",
            Stmt::Block => "block",
            Stmt::Return => "return statement",
            Stmt::Throw => "throw statement",
            Stmt::Try => "try statement",
            Stmt::Switch => "switch statement",
            Stmt::Empty => "empty statement",
        }
    }
}
