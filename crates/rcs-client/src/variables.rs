//! Peer-local variables exposed for remote GET and PUSH.

use rcs_core::Message;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Error text sent back for a variable that is not registered.
pub const ERROR_NOT_REGISTERED: &str = "variable is not registered";

/// Error text sent back for a PUSH to a variable without a setter.
pub const ERROR_READ_ONLY: &str = "variable is read only";

/// Computes a variable's value for the requesting peer.
pub type Getter = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Applies a value pushed by a remote peer.
pub type Setter = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Getter/setter pair for one variable. A variable without a setter is
/// read-only.
#[derive(Clone, Default)]
pub struct Variable {
    getter: Option<Getter>,
    setter: Option<Setter>,
}

impl Variable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A variable that can only be read remotely.
    pub fn read_only(getter: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        Self::new().with_getter(getter)
    }

    pub fn with_getter(mut self, getter: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn with_setter(mut self, setter: impl Fn(&str, Value) + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.setter.is_none()
    }

    pub(crate) fn setter(&self) -> Option<&Setter> {
        self.setter.as_ref()
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .finish()
    }
}

/// Registered variables by name.
#[derive(Debug, Default)]
pub struct Variables {
    entries: HashMap<String, Variable>,
}

impl Variables {
    /// Install `variable` under `name`, returning the one it replaces.
    pub fn register(&mut self, name: impl Into<String>, variable: Variable) -> Option<Variable> {
        self.entries.insert(name.into(), variable)
    }

    /// Returns `true` if the variable was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cloned entry, so callbacks can run without holding the registry lock.
    pub fn lookup(&self, name: &str) -> Option<Variable> {
        self.entries.get(name).cloned()
    }
}

/// Reply to a GET of `var` issued by `from`.
pub(crate) fn reply_to_get(entry: Option<Variable>, from: &str, var: &str) -> Message {
    match entry.and_then(|v| v.getter) {
        Some(getter) => {
            info!("GET from '{}' for '{}'", from, var);
            Message::push(from, var, getter(from))
        }
        None => {
            error!("GET from '{}': variable '{}' is not registered", from, var);
            Message::client_return(from, json!({"error": ERROR_NOT_REGISTERED, "var": var}))
        }
    }
}

/// Apply a PUSH of `var` from `from`. Returns the error reply, if any.
pub(crate) fn apply_push(
    entry: Option<Variable>,
    from: &str,
    var: &str,
    value: Value,
) -> Option<Message> {
    match entry {
        Some(Variable {
            setter: Some(setter),
            ..
        }) => {
            info!("PUSH from '{}' to '{}'", from, var);
            setter(from, value);
            None
        }
        Some(_) => {
            error!("PUSH from '{}': variable '{}' is read only", from, var);
            Some(Message::client_return(
                from,
                json!({"error": ERROR_READ_ONLY, "var": var}),
            ))
        }
        None => {
            error!("PUSH from '{}': variable '{}' is not registered", from, var);
            Some(Message::client_return(
                from,
                json!({"error": ERROR_NOT_REGISTERED, "var": var}),
            ))
        }
    }
}
