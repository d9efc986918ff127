//! Runtime values for sandboxed programs.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value as Json;

use super::ast::Stmt;

/// A user-defined function local to the program.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Rc<Vec<Stmt>>,
}

/// A value in the scripting environment.
///
/// Lists and dicts have reference semantics: assigning one to a second name
/// aliases the same container, matching the conventions the generated
/// programs assume.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Rc<Function>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: BTreeMap<String, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Function(_) => true,
        }
    }

    /// Render the way `str()` and `FINAL` stringify values.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => fmt_float(*f),
            Value::Str(s) => s.to_string(),
            Value::List(_) | Value::Dict(_) => self.repr(),
            Value::Function(f) => format!("<function {}>", f.name),
        }
    }

    /// Render the way containers print their elements: strings quoted.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s),
            Value::List(l) => {
                let inner: Vec<String> = l.borrow().iter().map(|v| v.repr()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Dict(d) => {
                let inner: Vec<String> = d
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            other => other.display(),
        }
    }

    /// Convert to a JSON value for memory snapshots. Functions are not
    /// JSON-representable and collapse to null.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null | Value::Function(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(l) => Json::Array(l.borrow().iter().map(|v| v.to_json()).collect()),
            Value::Dict(d) => Json::Object(
                d.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::str(s),
            Json::Array(arr) => Value::list(arr.iter().map(Value::from_json).collect()),
            Json::Object(obj) => Value::dict(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn fmt_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Equality the way `==` behaves in the scripting surface: ints and floats
/// compare numerically, containers compare element-wise.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k).map(|other| values_equal(v, other)).unwrap_or(false)
                })
        }
        _ => false,
    }
}

/// Ordering for `<`/`>` comparisons and `sorted`. `None` when the operand
/// types do not admit an ordering.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(!Value::str("").truthy());
        assert!(Value::str("x").truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::list(vec![Value::Null]).truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.display(), "None");
        assert_eq!(Value::Bool(true).display(), "True");
        assert_eq!(Value::Int(42).display(), "42");
        assert_eq!(Value::Float(1.0).display(), "1.0");
        assert_eq!(Value::Float(1.5).display(), "1.5");
        assert_eq!(Value::str("hi").display(), "hi");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::str("a")]).display(),
            "[1, 'a']"
        );
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(!values_equal(&Value::Int(1), &Value::str("1")));
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({
            "s": "text",
            "n": 3,
            "f": 2.5,
            "b": true,
            "arr": [1, 2, 3],
            "nested": {"k": null}
        });
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_list_reference_semantics() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::List(items) = &a {
            items.borrow_mut().push(Value::Int(2));
        }
        if let Value::List(items) = &b {
            assert_eq!(items.borrow().len(), 2);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_compare_values() {
        use std::cmp::Ordering;
        assert_eq!(
            compare_values(&Value::Int(1), &Value::Float(2.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&Value::str("b"), &Value::str("a")),
            Some(Ordering::Greater)
        );
        assert!(compare_values(&Value::Int(1), &Value::str("a")).is_none());
    }
}
