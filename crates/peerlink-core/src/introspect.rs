//! Argument metadata for exposed methods and reconstruction of call arguments.
//!
//! Methods are declared with a [`MethodSignature`], either from an explicit
//! list of [`ArgMeta`] or from a short parameter declaration such as
//! `"name, vis_url, opacity=1.0, kind='wms'"`. The declaration is parsed the
//! first time the metadata is needed and the result is kept on the signature.
//!
//! Parsing never fails: a declaration that cannot be parsed yields no
//! parameters, and a default that is not a literal is dropped (the parameter
//! becomes required). Both cases are logged.

use crate::codec::Param;
use crate::error::{PeerlinkError, Result};
use crate::protocol::ProcedureDescriptor;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, OnceLock};
use tracing::warn;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier regex must compile")
});

/// One declared parameter: its key and the default, if it has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgMeta {
    pub key: String,
    /// `false` on the wire when there is no default.
    #[serde(
        serialize_with = "serialize_default",
        deserialize_with = "deserialize_default"
    )]
    pub default: Option<Value>,
}

impl ArgMeta {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            default: None,
        }
    }

    pub fn optional(key: impl Into<String>, default: Value) -> Self {
        Self {
            key: key.into(),
            default: Some(default),
        }
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

fn serialize_default<S: Serializer>(
    default: &Option<Value>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match default {
        Some(value) => value.serialize(serializer),
        None => serializer.serialize_bool(false),
    }
}

fn deserialize_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(false) => None,
        other => Some(other),
    })
}

#[derive(Debug, Clone)]
enum Declaration {
    Text(String),
    Explicit(Vec<ArgMeta>),
}

/// Name and parameter declaration of one exposed method.
///
/// The parsed metadata is memoized, so repeated dispatches of the same
/// method never re-parse the declaration.
#[derive(Debug, Clone)]
pub struct MethodSignature {
    name: String,
    declaration: Declaration,
    meta: OnceLock<Arc<[ArgMeta]>>,
}

impl MethodSignature {
    /// Declare a method with an explicit parameter list.
    pub fn new(name: impl Into<String>, args: Vec<ArgMeta>) -> Self {
        Self {
            name: name.into(),
            declaration: Declaration::Explicit(args),
            meta: OnceLock::new(),
        }
    }

    /// Declare a method from a parameter declaration like `"x, y, zoom=4"`.
    ///
    /// Parsing is deferred until the metadata is first requested.
    pub fn declare(name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declaration: Declaration::Text(params.into()),
            meta: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Introspected argument metadata, computed once.
    pub fn arg_meta(&self) -> Arc<[ArgMeta]> {
        self.meta
            .get_or_init(|| match &self.declaration {
                Declaration::Explicit(args) => Arc::from(args.as_slice()),
                Declaration::Text(text) => Arc::from(introspect(&self.name, text)),
            })
            .clone()
    }

    pub fn is_introspected(&self) -> bool {
        self.meta.get().is_some()
    }

    pub fn descriptor(&self) -> ProcedureDescriptor {
        ProcedureDescriptor::from_arg_meta(self.name.clone(), &self.arg_meta())
    }
}

/// Parse a parameter declaration into argument metadata.
///
/// Never fails: an unparsable declaration gives an empty list and a
/// non-literal default is treated as no default. Both are logged.
pub fn introspect(method: &str, declaration: &str) -> Vec<ArgMeta> {
    let params = match parse_declaration(declaration) {
        Ok(params) => params,
        Err(reason) => {
            warn!("Could not parse declaration of {}: {}", method, reason);
            return Vec::new();
        }
    };

    params
        .into_iter()
        .map(|(key, default_text)| {
            let default = default_text.and_then(|text| match parse_literal(&text) {
                Some(value) => Some(value),
                None => {
                    warn!(
                        "Could not evaluate default {:?} for {}.{}, treating it as required",
                        text, method, key
                    );
                    None
                }
            });
            ArgMeta { key, default }
        })
        .collect()
}

/// Split a declaration into `(name, default source)` pairs.
fn parse_declaration(declaration: &str) -> std::result::Result<Vec<(String, Option<String>)>, String> {
    let mut text = declaration.trim();
    if let Some(inner) = text.strip_prefix('(') {
        text = inner
            .strip_suffix(')')
            .ok_or_else(|| "unbalanced parentheses".to_string())?
            .trim();
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let pieces = split_top_level(text, ',')?;
    let last = pieces.len() - 1;
    let mut params = Vec::with_capacity(pieces.len());
    let mut seen = HashSet::new();

    for (i, piece) in pieces.iter().enumerate() {
        let piece = piece.trim();
        if piece.is_empty() {
            // a single trailing comma is fine
            if i == last {
                continue;
            }
            return Err("empty parameter".to_string());
        }

        let (name, default) = match split_top_level(piece, '=')?.as_slice() {
            [name] => (name.trim().to_string(), None),
            [name, rest @ ..] => (name.trim().to_string(), Some(rest.join("=").trim().to_string())),
            [] => return Err("empty parameter".to_string()),
        };

        if !IDENTIFIER.is_match(&name) {
            return Err(format!("invalid parameter name {:?}", name));
        }
        if !seen.insert(name.clone()) {
            return Err(format!("duplicate parameter {:?}", name));
        }
        if matches!(&default, Some(d) if d.is_empty()) {
            return Err(format!("missing default for {:?}", name));
        }
        params.push((name, default));
    }

    Ok(params)
}

/// Split on `sep` outside of brackets and quotes.
fn split_top_level(text: &str, sep: char) -> std::result::Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in text.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth.push(c);
                current.push(c);
            }
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if depth.pop() != Some(open) {
                    return Err(format!("unbalanced {:?}", c));
                }
                current.push(c);
            }
            c if c == sep && depth.is_empty() => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }

    if quote.is_some() {
        return Err("unterminated string".to_string());
    }
    if !depth.is_empty() {
        return Err("unbalanced brackets".to_string());
    }
    parts.push(current);
    Ok(parts)
}

/// Evaluate a default's source text if it is a literal.
fn parse_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    match text {
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        "None" => return Some(Value::Null),
        _ => {}
    }

    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '\'' => return None,
            c => out.push(c),
        }
    }
    Some(Value::String(out))
}

/// Positional arguments reconstructed for one dispatched call.
///
/// A `None` slot means the caller omitted an optional parameter; accessors
/// fall back to the declared default for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    method: String,
    meta: Arc<[ArgMeta]>,
    values: Vec<Option<Value>>,
}

impl CallArgs {
    pub fn new(method: impl Into<String>, meta: Arc<[ArgMeta]>, values: Vec<Option<Value>>) -> Self {
        Self {
            method: method.into(),
            meta,
            values,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw positional list, `None` where the callee's default applies.
    pub fn positional(&self) -> &[Option<Value>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the caller actually sent a value for `key`.
    pub fn is_supplied(&self, key: &str) -> bool {
        self.index_of(key)
            .and_then(|i| self.values.get(i))
            .is_some_and(Option::is_some)
    }

    /// Supplied value or declared default at position `index`.
    pub fn value(&self, index: usize) -> Option<Value> {
        match self.values.get(index)? {
            Some(value) => Some(value.clone()),
            None => self.meta.get(index).and_then(|m| m.default.clone()),
        }
    }

    /// Deserialize the argument named `key`, applying its default if omitted.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_opt(key)?.ok_or_else(|| {
            PeerlinkError::invalid_params(format!("{} has no value for {}", self.method, key))
        })
    }

    /// Like [`CallArgs::get`] but `None` when neither a value nor a default exists.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(index) = self.index_of(key) else {
            return Err(PeerlinkError::invalid_params(format!(
                "{} declares no parameter {}",
                self.method, key
            )));
        };
        self.value(index)
            .map(|value| {
                serde_json::from_value(value).map_err(|e| {
                    PeerlinkError::invalid_params(format!("{}.{}: {}", self.method, key, e))
                })
            })
            .transpose()
    }

    /// All arguments with defaults applied, `Null` where neither exists.
    pub fn into_values(self) -> Vec<Value> {
        (0..self.values.len())
            .map(|i| self.value(i).unwrap_or(Value::Null))
            .collect()
    }

    fn index_of(&self, key: &str) -> Option<usize> {
        self.meta.iter().position(|m| m.key == key)
    }
}

/// Map key-tagged request params onto the declared positional parameters.
///
/// Missing metadata is a `ParseError`; a missing parameter without a default
/// is `InvalidParams`. Params the method does not declare are ignored.
pub fn resolve_args(method: &str, meta: Option<Arc<[ArgMeta]>>, params: &[Param]) -> Result<CallArgs> {
    let meta = meta.ok_or_else(|| PeerlinkError::Parse {
        message: format!("argument metadata not available on {}", method),
    })?;

    // Later duplicates win.
    let by_key: HashMap<&str, &Param> = params.iter().map(|p| (p.key.as_str(), p)).collect();

    let values = meta
        .iter()
        .map(|arg| match by_key.get(arg.key.as_str()) {
            Some(param) => Ok(Some(param.value.clone())),
            None if arg.has_default() => Ok(None),
            None => Err(PeerlinkError::invalid_params(format!(
                "{} did not receive a required param {}",
                method, arg.key
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CallArgs::new(method, meta, values))
}
