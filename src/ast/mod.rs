use serde::{Deserialize, Serialize};

// ---- Core AST types ----
//
// The tree is produced outside this crate (usually as JSON) and is read-only
// for both the compiler and the interpreter. Every node carries the source
// line it came from; `0` means unknown.

/// A sequence of expressions evaluated for their effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub instrs: Vec<Expr>,
    #[serde(default)]
    pub line: u32,
}

impl Block {
    pub fn new(instrs: Vec<Expr>) -> Self {
        let line = instrs.first().map(Expr::line).unwrap_or(0);
        Block { instrs, line }
    }

    pub fn empty() -> Self {
        Block { instrs: Vec::new(), line: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i32),
    Str(String),
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Block(Block),

    Literal {
        value: Literal,
        #[serde(default)]
        line: u32,
    },

    /// Variable reference: a local slot, or a global resolved at run time
    LocalVarAccess {
        name: String,
        #[serde(default)]
        line: u32,
    },

    /// `var name = expr` (declaration) or `name = expr`
    LocalVarAssignment {
        name: String,
        expr: Box<Expr>,
        declaration: bool,
        #[serde(default)]
        line: u32,
    },

    /// `function name(params) { body }`, name optional
    Fun {
        name: Option<String>,
        parameters: Vec<String>,
        body: Block,
        #[serde(default)]
        line: u32,
    },

    /// `qualifier(args)`
    FunCall {
        qualifier: Box<Expr>,
        args: Vec<Expr>,
        #[serde(default)]
        line: u32,
    },

    Return {
        expr: Box<Expr>,
        #[serde(default)]
        line: u32,
    },

    If {
        condition: Box<Expr>,
        true_block: Block,
        false_block: Block,
        #[serde(default)]
        line: u32,
    },

    /// Object literal `{ key: expr, ... }`, keys kept in source order
    New {
        init: Vec<(String, Expr)>,
        #[serde(default)]
        line: u32,
    },

    /// `receiver.name`
    FieldAccess {
        receiver: Box<Expr>,
        name: String,
        #[serde(default)]
        line: u32,
    },

    /// `receiver.name = expr`
    FieldAssignment {
        receiver: Box<Expr>,
        name: String,
        expr: Box<Expr>,
        #[serde(default)]
        line: u32,
    },

    /// `receiver.name(args)`
    MethodCall {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        #[serde(default)]
        line: u32,
    },
}

impl Expr {
    pub fn line(&self) -> u32 {
        match self {
            Expr::Block(block) => block.line,
            Expr::Literal { line, .. }
            | Expr::LocalVarAccess { line, .. }
            | Expr::LocalVarAssignment { line, .. }
            | Expr::Fun { line, .. }
            | Expr::FunCall { line, .. }
            | Expr::Return { line, .. }
            | Expr::If { line, .. }
            | Expr::New { line, .. }
            | Expr::FieldAccess { line, .. }
            | Expr::FieldAssignment { line, .. }
            | Expr::MethodCall { line, .. } => *line,
        }
    }

    /// Replaces the line number of this node.
    pub fn at(mut self, new_line: u32) -> Self {
        match &mut self {
            Expr::Block(block) => block.line = new_line,
            Expr::Literal { line, .. }
            | Expr::LocalVarAccess { line, .. }
            | Expr::LocalVarAssignment { line, .. }
            | Expr::Fun { line, .. }
            | Expr::FunCall { line, .. }
            | Expr::Return { line, .. }
            | Expr::If { line, .. }
            | Expr::New { line, .. }
            | Expr::FieldAccess { line, .. }
            | Expr::FieldAssignment { line, .. }
            | Expr::MethodCall { line, .. } => *line = new_line,
        }
        self
    }

    /// Instructions leave nothing on the operand stack; every other node
    /// produces exactly one value.
    pub fn is_instr(&self) -> bool {
        matches!(
            self,
            Expr::Block(_)
                | Expr::LocalVarAssignment { .. }
                | Expr::FieldAssignment { .. }
                | Expr::If { .. }
                | Expr::Return { .. }
        )
    }

    // ---- Builders for hosts that assemble trees directly ----

    pub fn int(value: i32) -> Self {
        Expr::Literal { value: Literal::Int(value), line: 0 }
    }

    pub fn str(value: impl Into<String>) -> Self {
        Expr::Literal { value: Literal::Str(value.into()), line: 0 }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::LocalVarAccess { name: name.into(), line: 0 }
    }

    pub fn declare(name: impl Into<String>, expr: Expr) -> Self {
        Expr::LocalVarAssignment { name: name.into(), expr: Box::new(expr), declaration: true, line: 0 }
    }

    pub fn assign(name: impl Into<String>, expr: Expr) -> Self {
        Expr::LocalVarAssignment { name: name.into(), expr: Box::new(expr), declaration: false, line: 0 }
    }

    pub fn call(qualifier: Expr, args: Vec<Expr>) -> Self {
        Expr::FunCall { qualifier: Box::new(qualifier), args, line: 0 }
    }

    /// Call of a global built-in such as `+` or `print`.
    pub fn op(name: &str, args: Vec<Expr>) -> Self {
        Expr::call(Expr::var(name), args)
    }

    pub fn fun(name: Option<&str>, parameters: &[&str], body: Vec<Expr>) -> Self {
        Expr::Fun {
            name: name.map(str::to_string),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            body: Block::new(body),
            line: 0,
        }
    }

    pub fn ret(expr: Expr) -> Self {
        Expr::Return { expr: Box::new(expr), line: 0 }
    }

    pub fn if_else(condition: Expr, true_block: Vec<Expr>, false_block: Vec<Expr>) -> Self {
        Expr::If {
            condition: Box::new(condition),
            true_block: Block::new(true_block),
            false_block: Block::new(false_block),
            line: 0,
        }
    }

    pub fn new_object(init: Vec<(&str, Expr)>) -> Self {
        Expr::New {
            init: init.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            line: 0,
        }
    }

    pub fn get(receiver: Expr, name: impl Into<String>) -> Self {
        Expr::FieldAccess { receiver: Box::new(receiver), name: name.into(), line: 0 }
    }

    pub fn put(receiver: Expr, name: impl Into<String>, expr: Expr) -> Self {
        Expr::FieldAssignment {
            receiver: Box::new(receiver),
            name: name.into(),
            expr: Box::new(expr),
            line: 0,
        }
    }

    pub fn method(receiver: Expr, name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::MethodCall { receiver: Box::new(receiver), name: name.into(), args, line: 0 }
    }
}

/// A complete program: its top-level block runs as the body of `main`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub body: Block,
}

impl Script {
    pub fn new(body: Vec<Expr>) -> Self {
        Script { body: Block::new(body) }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Script> {
        serde_json::from_str(json)
    }
}
