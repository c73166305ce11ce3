/// Parsed expression tree for the restricted expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// A bare identifier segment chain, e.g. `this.x.y` -> `["this","x","y"]`.
    Path(Vec<String>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `target[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `target.member`
    Member(Box<Expr>, String),
    /// `callee(args)` where callee is any expression (usually a Member/Path).
    Call(Box<Expr>, Vec<Expr>),
    /// `(params) => body`, only meaningful as an argument to a whitelisted
    /// higher-order method call.
    Lambda(Vec<String>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Nullish,
}
