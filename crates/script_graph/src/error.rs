//! Script diagnostics
//!
//! Every compile-time and run-time failure is a [`ScriptError`]: one kind from
//! a closed taxonomy, a message, and the location it is attributed to.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LinkId, NodeId, PinId};

/// The closed set of script error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnreflectedType,
    TypeCannotBeMember,
    TypeCannotBeReferencedFromScripts,
    TypeCannotBeOwnedByScripts,
    NameNotUnique,
    NodeOutOfDate,
    UnderlyingFunctionNoLongerExists,
    CompilerBug,
    LinkNotAllowed,
    NotPossibleToEnterFunction,
    ExecutionTimeOut,
    FunctionCallFailed,
    ValueWasNull,
    StackOverflow,
}

impl ErrorKind {
    /// Whether this kind can only arise while running a function.
    pub fn is_runtime(self) -> bool {
        matches!(
            self,
            ErrorKind::ExecutionTimeOut | ErrorKind::FunctionCallFailed | ErrorKind::ValueWasNull | ErrorKind::StackOverflow
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where an error happened. Unset parts are unknown or not applicable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<PinId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkId>,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(script) = &self.script {
            parts.push(script.clone());
        }
        if let Some(function) = &self.function {
            parts.push(function.clone());
        }
        if let Some(node) = self.node {
            parts.push(node.to_string());
        }
        if let Some(pin) = self.pin {
            parts.push(pin.to_string());
        }
        if let Some(link) = self.link {
            parts.push(link.to_string());
        }
        if parts.is_empty() {
            f.write_str("<unknown>")
        } else {
            f.write_str(&parts.join("::"))
        }
    }
}

/// A script error attributed to a location
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} at {location}: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: ErrorLocation,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: ErrorLocation::default(),
        }
    }

    pub fn in_script(mut self, script: &str) -> Self {
        self.location.script = Some(script.to_string());
        self
    }

    pub fn in_function(mut self, function: &str) -> Self {
        self.location.function = Some(function.to_string());
        self
    }

    pub fn at_node(mut self, node: NodeId) -> Self {
        self.location.node = Some(node);
        self
    }

    pub fn at_pin(mut self, pin: PinId) -> Self {
        self.location.pin = Some(pin);
        self
    }

    pub fn at_link(mut self, link: LinkId) -> Self {
        self.location.link = Some(link);
        self
    }

    /// Fill in script and function where they are not already set.
    pub fn within(mut self, script: Option<&str>, function: &str) -> Self {
        if self.location.script.is_none() {
            self.location.script = script.map(str::to_string);
        }
        if self.location.function.is_none() {
            self.location.function = Some(function.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_location() {
        let err = ScriptError::new(ErrorKind::ValueWasNull, "pin had no value")
            .in_script("Player")
            .in_function("Jump")
            .at_node(NodeId::new(4))
            .at_pin(PinId::new(9));
        assert_eq!(err.to_string(), "ValueWasNull at Player::Jump::node#4::pin#9: pin had no value");
    }

    #[test]
    fn test_within_keeps_existing_location() {
        let err = ScriptError::new(ErrorKind::CompilerBug, "x")
            .in_function("Inner")
            .within(Some("Script"), "Outer");
        assert_eq!(err.location.function.as_deref(), Some("Inner"));
        assert_eq!(err.location.script.as_deref(), Some("Script"));
    }
}
