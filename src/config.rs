//! YAML-backed configuration variables.
//!
//! A [`ConfigVar<T>`] is a typed, named setting with a default value and
//! change listeners. Vars register themselves in a process-wide table on
//! first [`lookup`]; a later [`load_from_str`] / [`load_from_file`] walks a
//! YAML document, updates every registered var it finds and notifies the
//! listeners with the old and new values.
//!
//! Nested YAML maps flatten into dotted names, so
//!
//! ```yaml
//! fiber:
//!   stack_size: 262144
//! ```
//!
//! updates the var registered as `"fiber.stack_size"`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ConfigError;

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

struct VarInner<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    listener_ids: AtomicU64,
}

/// A typed configuration variable handle. Cloning is cheap and all clones
/// observe the same value.
pub struct ConfigVar<T> {
    inner: Arc<VarInner<T>>,
}

impl<T> Clone for ConfigVar<T> {
    fn clone(&self) -> Self {
        ConfigVar {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline(always)]
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Current value (a clone).
    pub fn value(&self) -> T {
        self.inner.value.read().expect("config var poisoned").clone()
    }

    /// Replace the value and fire listeners if it actually changed.
    pub fn set(&self, new: T) {
        let old = {
            let mut value = self.inner.value.write().expect("config var poisoned");
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };
        let listeners = self.inner.listeners.lock().expect("config var poisoned");
        for listener in listeners.values() {
            listener(&old, &new);
        }
    }

    /// Register a change listener; returns an id usable with
    /// [`del_listener`](Self::del_listener).
    pub fn add_listener<F>(&self, f: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.inner.listener_ids.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("config var poisoned")
            .insert(id, Box::new(f));
        id
    }

    pub fn del_listener(&self, id: u64) {
        self.inner
            .listeners
            .lock()
            .expect("config var poisoned")
            .remove(&id);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Global table
////////////////////////////////////////////////////////////////////////////////

trait DynVar: Send + Sync {
    fn load_yaml(&self, value: &serde_yaml::Value) -> Result<(), ConfigError>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> DynVar for VarInner<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn load_yaml(&self, value: &serde_yaml::Value) -> Result<(), ConfigError> {
        let new: T = serde_yaml::from_value(value.clone())?;
        let old = {
            let mut slot = self.value.write().expect("config var poisoned");
            if *slot == new {
                return Ok(());
            }
            std::mem::replace(&mut *slot, new.clone())
        };
        let listeners = self.listeners.lock().expect("config var poisoned");
        for listener in listeners.values() {
            listener(&old, &new);
        }
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static VARS: Lazy<RwLock<HashMap<String, Arc<dyn DynVar>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

/// Fetch the var registered under `name`, creating it with `default` on
/// first use.
///
/// Returns [`ConfigError::TypeMismatch`] if the name is already registered
/// with a different `T`, and [`ConfigError::InvalidName`] for names outside
/// `[a-z0-9._]`.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Result<ConfigVar<T>, ConfigError>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if !valid_name(name) {
        return Err(ConfigError::InvalidName(name.into()));
    }

    {
        let vars = VARS.read().expect("config table poisoned");
        if let Some(var) = vars.get(name) {
            return downcast(name, var.clone());
        }
    }

    let mut vars = VARS.write().expect("config table poisoned");
    // Lost the race to another lookup?
    if let Some(var) = vars.get(name) {
        return downcast(name, var.clone());
    }

    let inner = Arc::new(VarInner {
        name: name.to_owned(),
        description: description.to_owned(),
        value: RwLock::new(default),
        listeners: Mutex::new(HashMap::new()),
        listener_ids: AtomicU64::new(0),
    });
    vars.insert(name.to_owned(), inner.clone());
    log::debug!("config var registered: {}", name);
    Ok(ConfigVar { inner })
}

fn downcast<T>(name: &str, var: Arc<dyn DynVar>) -> Result<ConfigVar<T>, ConfigError>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    var.as_any_arc()
        .downcast::<VarInner<T>>()
        .map(|inner| ConfigVar { inner })
        .map_err(|_| ConfigError::TypeMismatch { name: name.into() })
}

/// Apply a YAML document to every registered var it mentions.
///
/// Unknown keys are ignored (logged at debug level) so a single config file
/// can carry settings for several subsystems.
pub fn load_from_str(yaml: &str) -> Result<(), ConfigError> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let mut flat = Vec::new();
    flatten("", &doc, &mut flat);

    let vars = VARS.read().expect("config table poisoned");
    for (name, value) in flat {
        match vars.get(&name) {
            Some(var) => var.load_yaml(value)?,
            None => log::debug!("config key `{}` has no registered var", name),
        }
    }
    Ok(())
}

/// [`load_from_str`] over a file's contents.
pub fn load_from_file(path: &std::path::Path) -> crate::Result<()> {
    let text = std::fs::read_to_string(path).map_err(crate::error::Error::IO)?;
    load_from_str(&text).map_err(Into::into)
}

fn flatten<'a>(
    prefix: &str,
    value: &'a serde_yaml::Value,
    out: &mut Vec<(String, &'a serde_yaml::Value)>,
) {
    if let serde_yaml::Value::Mapping(map) = value {
        for (key, child) in map {
            if let serde_yaml::Value::String(key) = key {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                match child {
                    serde_yaml::Value::Mapping(_) => flatten(&name, child, out),
                    _ => out.push((name, child)),
                }
            }
        }
    } else if !prefix.is_empty() {
        out.push((prefix.to_owned(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lookup_and_load() {
        let var = lookup::<u32>("test.config.alpha", 7, "test var").unwrap();
        assert_eq!(var.value(), 7);

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        var.add_listener(move |old, new| {
            assert_eq!(*old, 7);
            assert_eq!(*new, 42);
            observed.fetch_add(1, Ordering::SeqCst);
        });

        load_from_str("test:\n  config:\n    alpha: 42\n").unwrap();
        assert_eq!(var.value(), 42);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same value again: listeners stay quiet.
        load_from_str("test:\n  config:\n    alpha: 42\n").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn type_mismatch_is_reported() {
        lookup::<u32>("test.config.beta", 1, "").unwrap();
        assert!(lookup::<String>("test.config.beta", String::new(), "").is_err());
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(lookup::<u32>("Bad Name", 0, "").is_err());
        assert!(lookup::<u32>("", 0, "").is_err());
    }
}
