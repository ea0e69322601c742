//! Value Containers
//!
//! A container holds the current and previous value of one property together
//! with the logical timestamps of the last two updates. Containers have no
//! public setter: the owning node stores into them after validation (inputs)
//! or after running its update function (derived nodes).

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The value is up to date.
    Ok,
    /// An upstream changed; the value must be recomputed before use.
    Stale,
    /// Connected but never computed.
    Uninitialized,
    /// The connection could not be resolved.
    Unconnected,
}

/// Read access to a value holder.
pub trait Readable {
    fn value(&self) -> &Value;
    fn status(&self) -> Status;

    /// Whether the value can be returned without recomputing.
    fn is_fresh(&self) -> bool {
        self.status() == Status::Ok
    }
}

/// Internal write access to a value holder.
pub trait Mutable {
    /// Store a new value stamped with `stamp`. Returns whether the value
    /// actually changed. Equal values leave value and timestamps untouched.
    fn store(&mut self, value: Value, stamp: u64) -> bool;
}

/// Holds a property's value and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Container {
    value: Value,
    previous_value: Value,
    updated_at: u64,
    previous_updated_at: u64,
    status: Status,
}

impl Container {
    /// A container holding an initial value, considered up to date.
    pub fn new(value: Value) -> Self {
        Self {
            previous_value: value.clone(),
            value,
            updated_at: 0,
            previous_updated_at: 0,
            status: Status::Ok,
        }
    }

    /// A container that has no value yet.
    pub fn uninitialized() -> Self {
        Self {
            status: Status::Uninitialized,
            ..Self::new(Value::Null)
        }
    }

    pub fn previous_value(&self) -> &Value {
        &self.previous_value
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn previous_updated_at(&self) -> u64 {
        self.previous_updated_at
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Mark stale unless the container never had a value.
    pub(crate) fn mark_stale(&mut self) {
        if matches!(self.status, Status::Ok) {
            self.status = Status::Stale;
        }
    }
}

impl Readable for Container {
    fn value(&self) -> &Value {
        &self.value
    }

    fn status(&self) -> Status {
        self.status
    }
}

impl Mutable for Container {
    fn store(&mut self, value: Value, stamp: u64) -> bool {
        self.status = Status::Ok;
        if value == self.value {
            return false;
        }
        self.previous_value = std::mem::replace(&mut self.value, value);
        self.previous_updated_at = self.updated_at;
        self.updated_at = stamp;
        true
    }
}
