//! Property Definitions
//!
//! A [`PropertyDef`] declares one property of a class: its name, its
//! evaluation policy and, for inputs, a default value and a validator that
//! coerces incoming values.

use std::fmt;
use std::sync::Arc;

use crate::error::{BoxError, ValidationError};
use crate::graph::{NodeKind, UpdateFn};
use crate::reactive::Engine;
use crate::value::Value;

/// Coerces a raw value into the property's domain, or explains why not.
pub type Validator = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Built-in validators.
pub mod validators {
    use std::sync::Arc;

    use super::Validator;
    use crate::value::Value;

    /// Accept anything unchanged.
    pub fn any() -> Validator {
        Arc::new(|v| Ok(v.clone()))
    }

    /// Convert to a bool by truthiness.
    pub fn boolean() -> Validator {
        Arc::new(|v| Ok(Value::Bool(v.truthy())))
    }

    /// Null, or a bool by truthiness.
    pub fn tri_state() -> Validator {
        Arc::new(|v| match v {
            Value::Null => Ok(Value::Null),
            other => Ok(Value::Bool(other.truthy())),
        })
    }

    /// Integers. Floats are truncated, bools and numeric strings converted.
    pub fn int() -> Validator {
        Arc::new(|v| match v {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(x) if x.is_finite() => Ok(Value::Int(x.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("cannot convert {s:?} to int")),
            other => Err(format!("int property cannot accept {}", other.type_name())),
        })
    }

    /// Floats. Integers and numeric strings are converted.
    pub fn float() -> Validator {
        Arc::new(|v| match v {
            Value::Float(x) => Ok(Value::Float(*x)),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("cannot convert {s:?} to float")),
            other => Err(format!("float property cannot accept {}", other.type_name())),
        })
    }

    /// Strings only.
    pub fn string() -> Validator {
        Arc::new(|v| match v {
            Value::Str(_) => Ok(v.clone()),
            other => Err(format!("string property cannot accept {}", other.type_name())),
        })
    }

    /// Lists only.
    pub fn list() -> Validator {
        Arc::new(|v| match v {
            Value::List(_) => Ok(v.clone()),
            other => Err(format!("list property cannot accept {}", other.type_name())),
        })
    }

    /// An entity reference or null.
    pub fn entity() -> Validator {
        Arc::new(|v| match v {
            Value::Null | Value::Entity(_) => Ok(v.clone()),
            other => Err(format!("entity property cannot accept {}", other.type_name())),
        })
    }

    /// One of a fixed set of strings, compared and stored upper-case.
    pub fn enumeration<I, S>(options: I) -> Validator
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let options: Vec<String> = options
            .into_iter()
            .map(|o| o.as_ref().to_uppercase())
            .collect();
        Arc::new(move |v| {
            let s = v.as_str().ok_or("enum value must be a string")?;
            let upper = s.to_uppercase();
            if options.contains(&upper) {
                Ok(Value::Str(upper))
            } else {
                Err(format!("{s:?} is not one of {}", options.join(", ")))
            }
        })
    }

    /// A pair of floats, which may also be given as a single scalar.
    pub fn float_pair() -> Validator {
        Arc::new(|v| {
            let pair = match v {
                Value::List(items) => items.clone(),
                scalar => vec![scalar.clone(), scalar.clone()],
            };
            if pair.len() != 2 {
                return Err(format!(
                    "float pair needs a scalar or two values, not {}",
                    pair.len()
                ));
            }
            let mut out = Vec::with_capacity(2);
            for (i, item) in pair.iter().enumerate() {
                match item {
                    Value::Int(_) | Value::Float(_) => {
                        out.push(Value::Float(item.as_f64().unwrap_or_default()))
                    }
                    other => {
                        return Err(format!(
                            "float pair value {} cannot be {}",
                            i + 1,
                            other.type_name()
                        ))
                    }
                }
            }
            Ok(Value::List(out))
        })
    }
}

/// Declaration of one property.
#[derive(Clone)]
pub struct PropertyDef {
    name: String,
    kind: NodeKind,
    default: Value,
    validator: Validator,
    settable: bool,
    specs: Vec<String>,
    func: Option<UpdateFn>,
}

impl PropertyDef {
    /// An input property with a default value. Accepts any value unless a
    /// validator is set.
    pub fn input(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Input,
            default: default.into(),
            validator: validators::any(),
            settable: false,
            specs: Vec::new(),
            func: None,
        }
    }

    /// A derived property that recomputes as soon as an upstream changes.
    pub fn eager<I, S, F>(name: impl Into<String>, specs: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Engine, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::derived(NodeKind::Eager, name.into(), specs, Arc::new(func))
    }

    /// A derived property that recomputes when read after an upstream changed.
    pub fn lazy<I, S, F>(name: impl Into<String>, specs: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Engine, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::derived(NodeKind::Lazy, name.into(), specs, Arc::new(func))
    }

    fn derived<I, S>(kind: NodeKind, name: String, specs: I, func: UpdateFn) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name,
            kind,
            default: Value::Null,
            validator: validators::any(),
            settable: false,
            specs: specs.into_iter().map(Into::into).collect(),
            func: Some(func),
        }
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Generate a `set_<name>` action for this property.
    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn is_settable(&self) -> bool {
        self.settable
    }

    pub fn specs(&self) -> &[String] {
        &self.specs
    }

    pub(crate) fn func(&self) -> Option<&UpdateFn> {
        self.func.as_ref()
    }

    pub(crate) fn validator_fn(&self) -> &Validator {
        &self.validator
    }

    /// Run the validator on `value`.
    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        (self.validator)(value).map_err(|message| ValidationError::new(&self.name, message))
    }
}

impl fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("settable", &self.settable)
            .field("specs", &self.specs)
            .finish()
    }
}
