//! Dynamic value container used for request environment, params, cookies,
//! response headers, uploaded-file records, and session data.
//!
//! A [`Value`] is a tagged sum over null, bool, number, string, array, and
//! object. Handlers read and write request state through it, and the session
//! store round-trips it as JSON.
//!
//! Objects use a `BTreeMap` so iteration order (and therefore rendered
//! output) is deterministic.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Key-ordered map of values.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Creates an empty object.
    #[must_use]
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Creates an empty array.
    #[must_use]
    pub fn array() -> Self {
        Self::Array(Vec::new())
    }

    /// Returns true for `Value::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for `Value::Object`.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Looks up a key in an object. Returns `None` for non-objects.
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Mutable lookup of a key in an object.
    pub fn find_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Self::Object(map) => map.get_mut(key),
            _ => None,
        }
    }

    /// Inserts a key into the value, converting it to an object first if it
    /// holds anything else.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if !self.is_object() {
            *self = Self::object();
        }
        if let Self::Object(map) = self {
            map.insert(key.into(), value.into());
        }
    }

    /// Appends to the value, converting it to an array first if it holds
    /// anything else.
    pub fn push(&mut self, value: impl Into<Value>) {
        if !matches!(self, Self::Array(_)) {
            *self = Self::array();
        }
        if let Self::Array(items) = self {
            items.push(value.into());
        }
    }

    /// Borrows the string contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// String coercion: strings verbatim, numbers and bools rendered, null
    /// and containers become the empty string.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Self::Null | Self::Array(_) | Self::Object(_) => String::new(),
        }
    }

    /// Numeric coercion with a fallback for non-numeric values. Strings are
    /// parsed; bools map to 0/1.
    #[must_use]
    pub fn to_number(&self, default: f64) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::String(s) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Boolean coercion with a fallback. Numbers are true when non-zero;
    /// strings when non-empty and not "0"/"false".
    #[must_use]
    pub fn to_bool(&self, default: bool) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::String(s) => !s.is_empty() && s != "0" && s != "false",
            _ => default,
        }
    }

    /// Number of entries in an array or object; 0 otherwise.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Array(items) => items.len(),
            Self::Object(map) => map.len(),
            _ => 0,
        }
    }

    /// Returns true when `len() == 0`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resets to `Null`, dropping any contents.
    pub fn clear(&mut self) {
        *self = Self::Null;
    }

    /// Iterates over object entries; empty for non-objects.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        match self {
            Self::Object(map) => map.iter(),
            _ => EMPTY_MAP.iter(),
        }
    }

    /// Iterates over array items; empty for non-arrays.
    pub fn items(&self) -> std::slice::Iter<'_, Value> {
        const EMPTY: &[Value] = &[];
        match self {
            Self::Array(items) => items.iter(),
            _ => EMPTY.iter(),
        }
    }

    /// Serializes to compact JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::Value::from(self).to_string()
    }

    /// Parses JSON text. On failure returns the approximate byte position of
    /// the error.
    pub fn from_json(text: &str) -> Result<Self, usize> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) => Ok(Self::from(v)),
            Err(e) => {
                // serde_json reports 1-based line/column; flatten to a byte
                // offset within the line the way the rest of the gateway
                // reports positions.
                let pos = text
                    .split_inclusive('\n')
                    .take(e.line().saturating_sub(1))
                    .map(str::len)
                    .sum::<usize>()
                    + e.column().saturating_sub(1);
                Err(pos)
            }
        }
    }

    /// Renders the value in the dump format used by the demo handler: one
    /// entry per line, `limit` entries per container (0 = unlimited),
    /// `indent` spaces per depth level.
    pub fn print_limited(&self, out: &mut String, limit: usize, indent: usize) {
        self.print_limited_at(out, limit, indent, 0);
    }

    fn print_limited_at(&self, out: &mut String, limit: usize, indent: usize, depth: usize) {
        let pad = |out: &mut String, d: usize| {
            for _ in 0..d * indent {
                out.push(' ');
            }
        };
        match self {
            Self::Null => out.push_str("null\n"),
            Self::Bool(b) => {
                let _ = writeln!(out, "{b}");
            }
            Self::Number(n) => {
                let _ = writeln!(out, "{}", format_number(*n));
            }
            Self::String(s) => {
                let _ = writeln!(out, "\"{s}\"");
            }
            Self::Array(items) => {
                out.push_str("[\n");
                for (printed, item) in items.iter().enumerate() {
                    if limit != 0 && printed >= limit {
                        pad(out, depth + 1);
                        out.push_str("... (truncated)\n");
                        break;
                    }
                    pad(out, depth + 1);
                    item.print_limited_at(out, 0, indent, depth + 1);
                }
                pad(out, depth);
                out.push_str("]\n");
            }
            Self::Object(map) => {
                out.push_str("{\n");
                for (printed, (key, value)) in map.iter().enumerate() {
                    if limit != 0 && printed >= limit {
                        pad(out, depth + 1);
                        out.push_str("... (truncated)\n");
                        break;
                    }
                    pad(out, depth + 1);
                    let _ = write!(out, "{key}: ");
                    value.print_limited_at(out, 0, indent, depth + 1);
                }
                pad(out, depth);
                out.push_str("}\n");
            }
        }
    }
}

static EMPTY_MAP: BTreeMap<String, Value> = BTreeMap::new();

/// Renders a number the way the dump output expects: integers without a
/// trailing `.0`.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_converts_to_object() {
        let mut v = Value::Null;
        v.insert("a", "1");
        assert!(v.is_object());
        assert_eq!(v.find("a").and_then(Value::as_str), Some("1"));
    }

    #[test]
    fn push_converts_to_array() {
        let mut v = Value::String("old".into());
        v.push(1.0);
        v.push(2.0);
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn find_on_non_object_is_none() {
        assert!(Value::Null.find("x").is_none());
        assert!(Value::String("s".into()).find("x").is_none());
    }

    #[test]
    fn string_coercion() {
        assert_eq!(Value::String("hi".into()).to_display_string(), "hi");
        assert_eq!(Value::Number(3.0).to_display_string(), "3");
        assert_eq!(Value::Number(3.5).to_display_string(), "3.5");
        assert_eq!(Value::Bool(true).to_display_string(), "true");
        assert_eq!(Value::Null.to_display_string(), "");
    }

    #[test]
    fn number_coercion() {
        assert_eq!(Value::String(" 42 ".into()).to_number(0.0), 42.0);
        assert_eq!(Value::String("nope".into()).to_number(7.0), 7.0);
        assert_eq!(Value::Bool(true).to_number(0.0), 1.0);
    }

    #[test]
    fn bool_coercion() {
        assert!(!Value::String("0".into()).to_bool(true));
        assert!(!Value::String("false".into()).to_bool(true));
        assert!(Value::String("yes".into()).to_bool(false));
        assert!(!Value::Number(0.0).to_bool(true));
        assert!(Value::Null.to_bool(true));
    }

    #[test]
    fn json_roundtrip() {
        let mut v = Value::object();
        v.insert("name", "wasgate");
        v.insert("count", 3.0);
        v.insert("on", true);
        let mut arr = Value::array();
        arr.push(1.0);
        arr.push("two");
        v.insert("list", arr);

        let text = v.to_json();
        let back = Value::from_json(&text).expect("valid json");
        assert_eq!(back, v);
    }

    #[test]
    fn from_json_reports_error_position() {
        let err = Value::from_json("{\"a\": }").unwrap_err();
        assert!(err > 0);
    }

    #[test]
    fn print_limited_truncates() {
        let mut v = Value::object();
        for i in 0..5 {
            v.insert(format!("k{i}"), i as f64);
        }
        let mut out = String::new();
        v.print_limited(&mut out, 2, 2);
        assert!(out.contains("... (truncated)"));
        assert!(out.contains("k0: 0"));
        assert!(!out.contains("k4"));
    }

    #[test]
    fn print_limited_zero_is_unlimited() {
        let mut v = Value::array();
        for i in 0..10 {
            v.push(i as f64);
        }
        let mut out = String::new();
        v.print_limited(&mut out, 0, 2);
        assert!(!out.contains("truncated"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                (-1.0e9..1.0e9f64).prop_map(Value::Number),
                "[a-zA-Z0-9 _.:/-]{0,16}".prop_map(Value::String),
            ];
            leaf.prop_recursive(3, 32, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    proptest::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                        .prop_map(Value::Object),
                ]
            })
        }

        proptest! {
            #[test]
            fn json_roundtrip_preserves_value(v in arb_value()) {
                let text = v.to_json();
                let back = Value::from_json(&text).expect("serializer output parses");
                prop_assert_eq!(back, v);
            }
        }
    }
}
