//! Pluggable lookup of capability implementations.
//!
//! A [`ServiceLocationProvider`] discovers suppliers for a capability type.
//! [`ServiceLocator`] caches the discovered suppliers per type until the
//! type is explicitly reloaded. Discovery for one type is serialized: callers
//! asking for a type while its discovery is in flight wait for, and share,
//! that result.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{Error, Result};

/// A type-erased `Arc<ServiceSupplier<T>>`.
pub type AnySupplier = Arc<dyn Any + Send + Sync>;

/// Lazily constructed handle to one implementation of a capability.
pub struct ServiceSupplier<T: ?Sized> {
    name: String,
    factory: Arc<dyn Fn() -> Arc<T> + Send + Sync>,
    instance: OnceLock<Arc<T>>,
}

impl<T: ?Sized> ServiceSupplier<T> {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> Arc<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            instance: OnceLock::new(),
        }
    }

    /// Registered name of the implementation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance, constructing it on first use.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(self.instance.get_or_init(|| (self.factory)()))
    }

    /// Returns true once [`get`](Self::get) has constructed the instance.
    pub fn is_constructed(&self) -> bool {
        self.instance.get().is_some()
    }
}

impl<T: ?Sized> std::fmt::Debug for ServiceSupplier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSupplier")
            .field("name", &self.name)
            .field("constructed", &self.is_constructed())
            .finish()
    }
}

/// Discovers suppliers for a capability type.
///
/// Each returned value must be an `Arc<ServiceSupplier<T>>` for the
/// capability `T` identified by `capability`. Implementations need not be
/// thread-safe; the locator never calls `discover` concurrently.
pub trait ServiceLocationProvider: Send {
    fn discover(&mut self, capability: TypeId, type_name: &'static str) -> Result<Vec<AnySupplier>>;
}

struct RegistryEntry {
    name: String,
    supplier: Box<dyn Fn() -> AnySupplier + Send + Sync>,
}

/// Provider populated by explicit registration at process start.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: HashMap<TypeId, Vec<RegistryEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation of capability `T` under `name`.
    ///
    /// Every discovery pass hands out a fresh supplier, so a reload also
    /// resets constructed instances.
    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory = Arc::new(factory);
        let supplier_name = name.clone();
        self.entries
            .entry(TypeId::of::<T>())
            .or_default()
            .push(RegistryEntry {
                name,
                supplier: Box::new(move || {
                    let factory = Arc::clone(&factory);
                    let supplier: Arc<ServiceSupplier<T>> = Arc::new(ServiceSupplier::new(
                        supplier_name.clone(),
                        move || factory(),
                    ));
                    supplier as AnySupplier
                }),
            });
        self
    }

    /// Names registered for capability `T`.
    pub fn names<T: ?Sized + 'static>(&self) -> Vec<&str> {
        self.entries
            .get(&TypeId::of::<T>())
            .map(|entries| entries.iter().map(|e| e.name.as_str()).collect())
            .unwrap_or_default()
    }
}

impl ServiceLocationProvider for ServiceRegistry {
    fn discover(&mut self, capability: TypeId, type_name: &'static str) -> Result<Vec<AnySupplier>> {
        let suppliers: Vec<AnySupplier> = self
            .entries
            .get(&capability)
            .map(|entries| entries.iter().map(|e| (e.supplier)()).collect())
            .unwrap_or_default();
        tracing::debug!(capability = type_name, suppliers = suppliers.len(), "discovered suppliers");
        Ok(suppliers)
    }
}

type Slot = Arc<Mutex<Option<Vec<AnySupplier>>>>;

/// Per-type cache over a [`ServiceLocationProvider`].
pub struct ServiceLocator {
    provider: Mutex<Box<dyn ServiceLocationProvider>>,
    slots: Mutex<HashMap<TypeId, Slot>>,
}

impl ServiceLocator {
    pub fn new(provider: impl ServiceLocationProvider + 'static) -> Self {
        Self {
            provider: Mutex::new(Box::new(provider)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns every supplier of capability `T`.
    ///
    /// The first call for `T` queries the provider; later calls reuse that
    /// discovery pass until [`reload`](Self::reload) is called.
    pub fn for_type<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Vec<Arc<ServiceSupplier<T>>>> {
        let slot = self.slot(TypeId::of::<T>());
        let erased = {
            let mut cached = lock(&slot);
            if cached.is_none() {
                let discovered =
                    lock(&self.provider).discover(TypeId::of::<T>(), type_name::<T>())?;
                *cached = Some(discovered);
            }
            cached.clone().unwrap_or_default()
        };

        erased
            .into_iter()
            .map(|supplier| {
                Arc::downcast::<ServiceSupplier<T>>(supplier).map_err(|_| Error::ServiceLocation {
                    capability: type_name::<T>(),
                    reason: "provider returned a supplier of an incompatible type".to_string(),
                })
            })
            .collect()
    }

    /// Returns the implementation of `T` registered under `name`.
    ///
    /// Fails if no supplier or more than one supplier carries that name.
    pub fn find<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let mut matching: Vec<_> = self
            .for_type::<T>()?
            .into_iter()
            .filter(|supplier| supplier.name() == name)
            .collect();
        match matching.len() {
            0 => Err(Error::ServiceLocation {
                capability: type_name::<T>(),
                reason: format!("no supplier named '{}'", name),
            }),
            1 => Ok(matching.remove(0).get()),
            n => Err(Error::ServiceLocation {
                capability: type_name::<T>(),
                reason: format!("{} suppliers named '{}'", n, name),
            }),
        }
    }

    /// Returns the only implementation of `T`.
    pub fn single<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let mut suppliers = self.for_type::<T>()?;
        match suppliers.len() {
            0 => Err(Error::ServiceLocation {
                capability: type_name::<T>(),
                reason: "no suppliers registered".to_string(),
            }),
            1 => Ok(suppliers.remove(0).get()),
            _ => Err(Error::ServiceLocation {
                capability: type_name::<T>(),
                reason: format!(
                    "ambiguous: {}",
                    suppliers
                        .iter()
                        .map(|s| s.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
        }
    }

    /// Drops the cached suppliers of `T`; the next lookup queries the provider again.
    pub fn reload<T: ?Sized + 'static>(&self) {
        let slot = self.slot(TypeId::of::<T>());
        let cleared = lock(&slot).take().is_some();
        tracing::debug!(capability = type_name::<T>(), cleared, "reloaded service cache");
    }

    fn slot(&self, capability: TypeId) -> Slot {
        Arc::clone(lock(&self.slots).entry(capability).or_default())
    }
}

impl std::fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("cached_types", &lock(&self.slots).len())
            .finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
