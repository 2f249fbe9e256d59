//! Process services: long-lived singletons shared by every link of a run.
//!
//! A service is looked up by its declared [`Service::NAME`]. The registry
//! creates services lazily from a factory, keeps exactly one instance per
//! name, snapshots the persistable ones at checkpoints and releases all of
//! them at shutdown.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::config::ConfigObject;

/// Errors raised by service lookup and persistence.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// No instance is registered and no factory was supplied.
    #[error("Service not configured: {0}")]
    NotConfigured(String),

    /// The registered instance under this name has a different type.
    #[error("Service {name} is registered with a type other than {expected}")]
    TypeMismatch {
        /// Service name.
        name: String,
        /// Name of the requested Rust type.
        expected: &'static str,
    },

    /// Restore was requested for a service that does not persist state.
    #[error("Service {0} is not persistable")]
    NotPersistable(String),

    /// Service state could not be encoded or decoded.
    #[error("Failed to (de)serialize service {name}: {reason}")]
    Codec {
        /// Service name.
        name: String,
        /// Codec message.
        reason: String,
    },

    /// Reading or writing persisted services failed.
    #[error("Service I/O error at {path}: {reason}")]
    Io {
        /// Path of the persisted services.
        path: String,
        /// Underlying I/O message.
        reason: String,
    },
}

/// A process-wide singleton resource.
///
/// Implementors model expensive resources (engine sessions, run
/// configuration) that every link shares. Persistable services override
/// [`Service::snapshot`] and [`Service::hydrate`]; the
/// [`persistent_service!`](crate::persistent_service) macro does this for
/// serde types.
pub trait Service: Any + Send + Sync {
    /// Stable name identifying the service in the registry and in checkpoints.
    const NAME: &'static str;

    /// Release hook, invoked once when the service is removed or the
    /// registry shuts down.
    fn release(&mut self) {}

    /// Persistent state of the service, or `None` if it is not persistable.
    fn snapshot(&self) -> Result<Option<Value>, ServiceError> {
        Ok(None)
    }

    /// Rebuild the service from a state produced by [`Service::snapshot`].
    fn hydrate(state: Value) -> Result<Self, ServiceError>
    where
        Self: Sized,
    {
        let _ = state;
        Err(ServiceError::NotPersistable(Self::NAME.to_string()))
    }
}

/// Encode a serde service as its snapshot.
pub fn snapshot_json<T: Service + Serialize>(service: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(service).map_err(|e| ServiceError::Codec {
        name: T::NAME.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a serde service from its snapshot.
pub fn hydrate_json<T: Service + DeserializeOwned>(state: Value) -> Result<T, ServiceError> {
    serde_json::from_value(state).map_err(|e| ServiceError::Codec {
        name: T::NAME.to_string(),
        reason: e.to_string(),
    })
}

/// Object-safe view of a [`Service`].
trait ErasedService: Send + Sync {
    fn name(&self) -> &'static str;
    fn release(&mut self);
    fn snapshot(&self) -> Result<Option<Value>, ServiceError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Service> ErasedService for T {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn release(&mut self) {
        Service::release(self)
    }

    fn snapshot(&self) -> Result<Option<Value>, ServiceError> {
        Service::snapshot(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

type Hydrator = fn(Value) -> Result<Box<dyn ErasedService>, ServiceError>;

fn hydrate_erased<T: Service>(state: Value) -> Result<Box<dyn ErasedService>, ServiceError> {
    Ok(Box::new(T::hydrate(state)?))
}

/// Map from service name to singleton instance.
pub struct ServiceRegistry {
    services: BTreeMap<&'static str, Box<dyn ErasedService>>,
    hydrators: HashMap<&'static str, Hydrator>,
    /// Restored states whose type has not been declared or looked up yet.
    pending: BTreeMap<String, Value>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry that knows how to restore [`ConfigObject`].
    pub fn new() -> Self {
        let mut registry = Self {
            services: BTreeMap::new(),
            hydrators: HashMap::new(),
            pending: BTreeMap::new(),
        };
        registry.hydrators.insert(ConfigObject::NAME, hydrate_erased::<ConfigObject>);
        registry
    }

    /// Declare `T` as restorable from checkpoints.
    ///
    /// If a restored state for `T` is already pending, it is hydrated now.
    pub fn declare_persistable<T: Service>(&mut self) -> Result<(), ServiceError> {
        self.hydrators.insert(T::NAME, hydrate_erased::<T>);
        if let Some(state) = self.pending.get(T::NAME) {
            let service = hydrate_erased::<T>(state.clone())?;
            self.pending.remove(T::NAME);
            self.insert_boxed(T::NAME, service);
        }
        Ok(())
    }

    /// Get the registered instance of `T`.
    ///
    /// Fails with [`ServiceError::NotConfigured`] if there is neither an
    /// instance nor a restored state for it.
    pub fn get<T: Service>(&mut self) -> Result<&mut T, ServiceError> {
        self.hydrate_pending::<T>()?;
        let entry = self
            .services
            .get_mut(T::NAME)
            .ok_or_else(|| ServiceError::NotConfigured(T::NAME.to_string()))?;
        downcast_mut::<T>(entry.as_mut())
    }

    /// Get the instance of `T`, constructing it with `factory` on first use.
    pub fn get_or_create<T, F>(&mut self, factory: F) -> Result<&mut T, ServiceError>
    where
        T: Service,
        F: FnOnce() -> T,
    {
        self.hydrate_pending::<T>()?;
        if !self.services.contains_key(T::NAME) {
            tracing::debug!(service = T::NAME, "service.create");
            self.insert_boxed(T::NAME, Box::new(factory()));
        }
        self.get::<T>()
    }

    /// Get the instance of `T`, creating a default one on first use.
    pub fn get_or_default<T: Service + Default>(&mut self) -> Result<&mut T, ServiceError> {
        self.get_or_create(T::default)
    }

    /// Register `instance`, replacing (and releasing) any earlier instance.
    ///
    /// Returns `true` if an earlier instance was replaced.
    pub fn register<T: Service>(&mut self, instance: T) -> bool {
        self.pending.remove(T::NAME);
        let replaced = self.insert_boxed(T::NAME, Box::new(instance));
        if replaced {
            tracing::warn!(service = T::NAME, "service.replaced");
        } else {
            tracing::debug!(service = T::NAME, "service.registered");
        }
        replaced
    }

    /// Check whether an instance (or restored state) exists for `T`.
    pub fn contains<T: Service>(&self) -> bool {
        self.contains_name(T::NAME)
    }

    /// Check whether an instance (or restored state) exists for `name`.
    pub fn contains_name(&self, name: &str) -> bool {
        self.services.contains_key(name) || self.pending.contains_key(name)
    }

    /// Remove the instance of `T`, running its release hook.
    pub fn remove<T: Service>(&mut self) -> Result<(), ServiceError> {
        let pending = self.pending.remove(T::NAME).is_some();
        match self.services.remove(T::NAME) {
            Some(mut service) => {
                tracing::debug!(service = T::NAME, "service.removed");
                service.release();
                Ok(())
            }
            None if pending => Ok(()),
            None => Err(ServiceError::NotConfigured(T::NAME.to_string())),
        }
    }

    /// Names of the registered instances, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.services.keys().copied().collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Snapshot every persistable service.
    ///
    /// Restored states that were never hydrated are carried over unchanged.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Value>, ServiceError> {
        let mut states = self.pending.clone();
        for (name, service) in &self.services {
            match service.snapshot()? {
                Some(state) => {
                    states.insert((*name).to_string(), state);
                }
                None => tracing::trace!(service = *name, "service.not_persisted"),
            }
        }
        Ok(states)
    }

    /// Re-register services from a snapshot.
    ///
    /// Declared types are hydrated immediately and replace any live instance;
    /// the others wait until their type is declared or looked up. If any
    /// declared state fails to decode, the registry is left unchanged.
    pub fn restore_snapshot(&mut self, states: BTreeMap<String, Value>) -> Result<(), ServiceError> {
        let mut hydrated = Vec::new();
        let mut pending = Vec::new();
        for (name, state) in states {
            let hydrator = self.hydrators.get_key_value(name.as_str()).map(|(k, h)| (*k, *h));
            match hydrator {
                Some((key, hydrate)) => hydrated.push((key, hydrate(state)?)),
                None => pending.push((name, state)),
            }
        }
        for (key, service) in hydrated {
            self.insert_boxed(key, service);
            tracing::debug!(service = key, "service.restored");
        }
        for (name, state) in pending {
            tracing::debug!(service = %name, "service.pending");
            self.pending.insert(name, state);
        }
        Ok(())
    }

    /// Write the persistable services to `path` as JSON.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), ServiceError> {
        let path = path.as_ref();
        let states = self.snapshot()?;
        let bytes = serde_json::to_vec_pretty(&states).map_err(|e| ServiceError::Codec {
            name: "registry".into(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| io_error(path, e))?;
        tracing::debug!(path = %path.display(), services = states.len(), "services.persisted");
        Ok(())
    }

    /// Re-register the services persisted at `path`.
    pub async fn restore(&mut self, path: impl AsRef<Path>) -> Result<(), ServiceError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
        let states: BTreeMap<String, Value> =
            serde_json::from_slice(&bytes).map_err(|e| ServiceError::Codec {
                name: "registry".into(),
                reason: e.to_string(),
            })?;
        self.restore_snapshot(states)
    }

    /// Release every service and empty the registry.
    pub fn shutdown(&mut self) {
        tracing::debug!(services = self.services.len(), "services.shutdown");
        for (_, mut service) in std::mem::take(&mut self.services) {
            service.release();
        }
        self.pending.clear();
    }

    fn hydrate_pending<T: Service>(&mut self) -> Result<(), ServiceError> {
        if self.services.contains_key(T::NAME) {
            return Ok(());
        }
        // The state stays pending until it decodes.
        if let Some(state) = self.pending.get(T::NAME) {
            let service = hydrate_erased::<T>(state.clone())?;
            self.pending.remove(T::NAME);
            self.insert_boxed(T::NAME, service);
            tracing::debug!(service = T::NAME, "service.restored");
        }
        Ok(())
    }

    fn insert_boxed(&mut self, name: &'static str, service: Box<dyn ErasedService>) -> bool {
        match self.services.insert(name, service) {
            Some(mut previous) => {
                previous.release();
                true
            }
            None => false,
        }
    }
}

fn downcast_mut<T: Service>(service: &mut dyn ErasedService) -> Result<&mut T, ServiceError> {
    service
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or_else(|| ServiceError::TypeMismatch {
            name: T::NAME.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

fn io_error(path: &Path, err: std::io::Error) -> ServiceError {
    ServiceError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
