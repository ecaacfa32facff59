use std::fmt::Display;

use serde::Deserialize;

use crate::source::Location;

/// Byte range of a node within its script's text.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn location(self, text: &str) -> Location {
        Location::at(text, self.start)
    }
}

impl From<pest::Span<'_>> for Span {
    fn from(span: pest::Span<'_>) -> Self {
        Self {
            start: span.start(),
            end: span.end(),
        }
    }
}

/// The value types a script can manipulate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub enum Ty {
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "string")]
    Str,
    #[serde(rename = "bool")]
    Bool,
}

impl Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Int => write!(f, "int"),
            Ty::Str => write!(f, "string"),
            Ty::Bool => write!(f, "bool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub span: Span,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub span: Span,
    pub value: LiteralValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl LiteralValue {
    pub fn ty(&self) -> Ty {
        match self {
            LiteralValue::Int(_) => Ty::Int,
            LiteralValue::Str(_) => Ty::Str,
            LiteralValue::Bool(_) => Ty::Bool,
        }
    }
}

/// One parsed script file.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Numeric id claimed by a leading `.id` directive, if any.
    pub declared_id: Option<DeclaredId>,
    pub items: Vec<Item>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeclaredId {
    pub span: Span,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Const(ConstDecl),
    Local(LocalDecl),
    Label(LabelDef),
    Stmt(Stmt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub span: Span,
    pub name: Ident,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecl {
    pub span: Span,
    pub name: Ident,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelDef {
    pub span: Span,
    pub name: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(Assign),
    SetField(SetField),
    Call(CallStmt),
    Goto(Goto),
    Branch(Branch),
    Return(Return),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub span: Span,
    pub target: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetField {
    pub span: Span,
    pub component: Ident,
    pub member: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStmt {
    pub span: Span,
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Goto {
    pub span: Span,
    pub label: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub span: Span,
    pub condition: Expr,
    pub label: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub span: Span,
    pub component: Ident,
    pub member: Ident,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(Ident),
    Field(FieldGet),
    Call(Call),
    Unary(Unary),
    Binary(Binary),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal(l) => l.span,
            Expr::Ident(i) => i.span,
            Expr::Field(f) => f.span,
            Expr::Call(c) => c.span,
            Expr::Unary(u) => u.span,
            Expr::Binary(b) => b.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldGet {
    pub span: Span,
    pub component: Ident,
    pub member: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unary {
    pub span: Span,
    pub op: UnaryOp,
    pub operand: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binary {
    pub span: Span,
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    /// Integer negation, `-x`.
    Neg,
    /// Boolean negation, `!x`.
    Not,
}

impl Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    /// True for the four operators that compute over integers.
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }

    /// True for `==` and `!=`, which accept any pair of equal types.
    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne)
    }

    /// True for the ordering comparisons, which compare integers.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}
