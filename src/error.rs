//! Error types for the execution engine.
//!
//! Handler-local failures (an API block's request failing, a function block's
//! code raising) are never represented here - they are captured as output
//! `Value`s per the block-handler contract. These types are for failures that
//! must short-circuit a `Result`: a malformed workflow document, a graph that
//! cannot be built, or a workflow file that cannot be read at boot.

use thiserror::Error;

/// Errors raised while parsing or building a workflow document into a graph.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow document is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("block '{0}' was not found")]
    UnknownBlock(String),

    #[error("failed to read workflow file '{path}': {source}")]
    WorkflowRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow document: {0}")]
    WorkflowParse(#[from] serde_json::Error),

    #[error("invalid workflow document shape: {0}")]
    InvalidShape(String),
}

/// Errors raised by the reference resolver.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("malformed reference path: {0}")]
    MalformedPath(String),
}

/// Errors raised by the safe expression evaluator.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("disallowed operation: {0}")]
    Disallowed(String),

    #[error("type error: {0}")]
    Type(String),
}
