//! Named scalar outputs published by the pipeline.
//!
//! The pipeline only writes values here. Observers (a UI, the CLI status
//! line, tests) read them back or subscribe to change notifications.

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Void,
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Void => write!(f, "-"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v:.3}"),
            PropValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

/// A change notification
#[derive(Debug, Clone, PartialEq)]
pub struct PropUpdate {
    pub name: String,
    pub value: PropValue,
}

#[derive(Default)]
pub struct PropertyTree {
    values: RwLock<HashMap<String, PropValue>>,
    subscribers: Mutex<Vec<Sender<PropUpdate>>>,
}

impl PropertyTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value; subscribers are notified only on change
    pub fn set(&self, name: &str, value: impl Into<PropValue>) {
        let value = value.into();
        {
            let mut values = self.values.write();
            if values.get(name) == Some(&value) {
                return;
            }
            values.insert(name.to_string(), value.clone());
        }

        let update = PropUpdate {
            name: name.to_string(),
            value,
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub fn get(&self, name: &str) -> Option<PropValue> {
        self.values.read().get(name).cloned()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            PropValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            PropValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Receive every subsequent change. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<PropUpdate> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl fmt::Debug for PropertyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyTree")
            .field("values", &self.values.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let props = PropertyTree::new();
        props.set("playstatus", "play");
        props.set("currenttime", 1_500_000i64);
        assert_eq!(props.get_str("playstatus").as_deref(), Some("play"));
        assert_eq!(props.get_int("currenttime"), Some(1_500_000));
        assert_eq!(props.get("missing"), None);
    }

    #[test]
    fn test_subscribe_only_on_change() {
        let props = PropertyTree::new();
        let rx = props.subscribe();
        props.set("loading", true);
        props.set("loading", true);
        props.set("loading", false);
        let updates: Vec<_> = rx.try_iter().collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].value, PropValue::Int(0));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let props = PropertyTree::new();
        drop(props.subscribe());
        props.set("x", 1i64);
        assert!(props.subscribers.lock().is_empty());
    }
}
