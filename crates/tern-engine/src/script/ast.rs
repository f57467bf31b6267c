//! Syntax tree for the script subset

use std::sync::Arc;

/// Source position, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug)]
pub struct Program {
    pub origin: Arc<str>,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub struct FunctionCode {
    pub name: Option<Arc<str>>,
    pub params: Vec<Arc<str>>,
    pub body: Vec<Stmt>,
    pub arrow: bool,
    pub origin: Arc<str>,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug)]
pub enum Stmt {
    Decl {
        kind: DeclKind,
        decls: Vec<(Arc<str>, Option<Expr>)>,
        pos: Pos,
    },
    Function(Arc<FunctionCode>),
    Expr(Expr, Pos),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Return(Option<Expr>, Pos),
    Throw(Expr, Pos),
    Try {
        block: Vec<Stmt>,
        param: Option<Arc<str>>,
        handler: Option<Vec<Stmt>>,
        finalizer: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug)]
pub enum Expr {
    Number(f64),
    Str(Arc<str>),
    Bool(bool),
    Null,
    This,
    Ident(Arc<str>),
    Array(Vec<Expr>),
    Object(Vec<(Arc<str>, Expr)>),
    Function(Arc<FunctionCode>),
    Unary(UnaryOp, Box<Expr>),
    Update {
        increment: bool,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Member(Box<Expr>, Arc<str>),
    Index(Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Pos,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Pos,
    },
}
