//! A small JavaScript-like language with two execution engines: a
//! tagged-value stack virtual machine fed by a bytecode compiler, and a
//! tree-walking interpreter used as its reference.
//!
//! Programs arrive as an already-parsed tree ([`ast::Script`], usually read
//! from JSON). [`vm::run`] and [`interpreter::run`] must agree on output
//! and result for every program both accept.

pub mod ast;
pub mod compiler;
pub mod diagnostic;
pub mod interpreter;
pub mod object;
pub mod runtime;
pub mod vm;
