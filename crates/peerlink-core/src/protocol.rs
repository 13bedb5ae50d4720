//! Procedure descriptors and the protocol table exchanged during negotiation.
//!
//! A descriptor is published on the wire in this form:
//!
//! ```text
//! {"procedure": "add_layer",
//!  "required": [{"key": "name", "default": false}],
//!  "optional": [{"key": "opacity", "default": 1.0}]}
//! ```

use crate::error::{PeerlinkError, Result};
use crate::introspect::{ArgMeta, MethodSignature};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// An optional parameter and the default the exposing side declared for it.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalParam {
    pub key: String,
    pub default: Value,
}

/// Declared name and parameter shape of one remotely callable method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DescriptorWire", into = "DescriptorWire")]
pub struct ProcedureDescriptor {
    pub name: String,
    pub required: Vec<String>,
    pub optional: Vec<OptionalParam>,
}

impl ProcedureDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn with_required(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn with_optional(mut self, key: impl Into<String>, default: Value) -> Self {
        self.optional.push(OptionalParam {
            key: key.into(),
            default,
        });
        self
    }

    /// Split introspected arguments into required and optional lists,
    /// keeping declaration order within each.
    pub fn from_arg_meta(name: impl Into<String>, args: &[ArgMeta]) -> Self {
        let mut descriptor = Self::new(name);
        for arg in args {
            match &arg.default {
                Some(default) => descriptor.optional.push(OptionalParam {
                    key: arg.key.clone(),
                    default: default.clone(),
                }),
                None => descriptor.required.push(arg.key.clone()),
            }
        }
        descriptor
    }

    pub fn is_optional(&self, key: &str) -> bool {
        self.optional.iter().any(|p| p.key == key)
    }
}

#[derive(Serialize, Deserialize)]
struct DescriptorWire {
    procedure: String,
    #[serde(default)]
    required: Vec<ArgMeta>,
    #[serde(default)]
    optional: Vec<ArgMeta>,
}

impl From<DescriptorWire> for ProcedureDescriptor {
    fn from(wire: DescriptorWire) -> Self {
        Self {
            name: wire.procedure,
            required: wire.required.into_iter().map(|arg| arg.key).collect(),
            // `false` is how "no default" travels, so it also comes back as `false`.
            optional: wire
                .optional
                .into_iter()
                .map(|arg| OptionalParam {
                    key: arg.key,
                    default: arg.default.unwrap_or(Value::Bool(false)),
                })
                .collect(),
        }
    }
}

impl From<ProcedureDescriptor> for DescriptorWire {
    fn from(descriptor: ProcedureDescriptor) -> Self {
        Self {
            procedure: descriptor.name,
            required: descriptor.required.into_iter().map(ArgMeta::required).collect(),
            optional: descriptor
                .optional
                .into_iter()
                .map(|p| ArgMeta::optional(p.key, p.default))
                .collect(),
        }
    }
}

/// Ordered set of descriptors with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ProcedureDescriptor>", into = "Vec<ProcedureDescriptor>")]
pub struct ProtocolTable {
    procedures: Vec<ProcedureDescriptor>,
}

impl ProtocolTable {
    /// Build a table, rejecting duplicate or empty procedure names.
    pub fn new(procedures: Vec<ProcedureDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for descriptor in &procedures {
            if descriptor.name.is_empty() {
                return Err(PeerlinkError::invalid_request("procedure name must not be empty"));
            }
            if !seen.insert(descriptor.name.as_str()) {
                return Err(PeerlinkError::invalid_request(format!(
                    "duplicate procedure in protocol table: {}",
                    descriptor.name
                )));
            }
        }
        Ok(Self { procedures })
    }

    /// Introspect each whitelisted signature and build the table from them.
    pub fn from_signatures(signatures: &[MethodSignature]) -> Result<Self> {
        Self::new(signatures.iter().map(MethodSignature::descriptor).collect())
    }

    pub fn get(&self, name: &str) -> Option<&ProcedureDescriptor> {
        self.procedures.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcedureDescriptor> {
        self.procedures.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl TryFrom<Vec<ProcedureDescriptor>> for ProtocolTable {
    type Error = PeerlinkError;

    fn try_from(value: Vec<ProcedureDescriptor>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProtocolTable> for Vec<ProcedureDescriptor> {
    fn from(table: ProtocolTable) -> Self {
        table.procedures
    }
}

impl<'a> IntoIterator for &'a ProtocolTable {
    type Item = &'a ProcedureDescriptor;
    type IntoIter = std::slice::Iter<'a, ProcedureDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.procedures.iter()
    }
}
