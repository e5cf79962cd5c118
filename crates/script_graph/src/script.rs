//! Scripts: scripted types and their functions

use serde::{Deserialize, Serialize};

use crate::{GraphFunction, TypeRef};

/// A field declared by a script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    /// Initial value, in the field type's JSON encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ScriptField {
    pub fn new(name: &str, ty: TypeRef) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A scripted type: its fields and functions. Compiling a script registers a
/// type with the script's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<ScriptField>,
    #[serde(default)]
    pub functions: Vec<GraphFunction>,
}

impl Script {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: ScriptField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_function(mut self, function: GraphFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.name.clone())
    }

    pub fn function(&self, name: &str) -> Option<&GraphFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionSignature;

    #[test]
    fn test_script_round_trip() {
        let script = Script::new("Door")
            .with_field(ScriptField::new("open", TypeRef::new("bool")).with_default(serde_json::json!(true)))
            .with_field(ScriptField::new("angle", TypeRef::new("f32")))
            .with_function(GraphFunction::new("Toggle", FunctionSignature::new()));

        let first = script.to_json().unwrap();
        let second = Script::from_json(&first).unwrap().to_json().unwrap();
        assert_eq!(first, second);
        assert!(first.contains("\"default\": true"));
    }
}
