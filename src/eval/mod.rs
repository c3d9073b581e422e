//! Safe Expression Evaluator.
//!
//! A restricted boolean/arithmetic expression language, parsed to a small AST
//! (`ast`) via a recursive-descent parser (`parser`) and interpreted by
//! `evaluator` in one of two name-resolution modes. No arbitrary code
//! execution - the call whitelist and grammar are closed sets.

pub mod ast;
pub mod evaluator;
pub mod parser;

use crate::error::EvalError;
use evaluator::NameMode;
use serde_json::Value;
use std::collections::HashMap;

pub use evaluator::{truthy, CallExtension};
pub use ast::Expr;
pub use parser::parse;

/// Evaluates `src` with no name environment - bare names are always a
/// disallowed-operation failure. Used by the loop-condition evaluator.
pub fn eval_pure(src: &str) -> Result<Value, EvalError> {
    let tree = parser::parse(src)?;
    evaluator::eval(&tree, NameMode::Pure)
}

/// Evaluates `src` against `env` - bare names resolve against the map,
/// failing with `UnknownVariable` when absent. Used by the condition/router
/// block handler.
pub fn eval_with_env(src: &str, env: &HashMap<String, Value>) -> Result<Value, EvalError> {
    let tree = parser::parse(src)?;
    evaluator::eval(&tree, NameMode::WithEnv(env))
}

/// Evaluates `src` against `env`, offering any call outside the base
/// whitelist to `ext` first. Used by the function block handler, whose
/// restricted environment exposes additional constructors (`list`, `dict`,
/// `json_encode`, `json_decode`, `isinstance`, ...).
pub fn eval_with_env_and_extensions(
    src: &str,
    env: &HashMap<String, Value>,
    ext: &CallExtension,
) -> Result<Value, EvalError> {
    let tree = parser::parse(src)?;
    evaluator::eval_with_extensions(&tree, NameMode::WithEnv(env), ext)
}
