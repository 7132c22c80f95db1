use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::ParamError;
use crate::schema::Param;
use crate::storage::{MemoryStorage, ParamStorage};
use crate::value::{BoundKind, Bounds, ParamValue};

#[derive(Debug, Clone, PartialEq)]
pub struct ParamChange {
    pub param: Param,
    pub value: ParamValue,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamWarning {
    pub kind: BoundKind,
    pub param: Param,
    pub value: f64,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Listener = Arc<dyn Fn(&ParamChange) + Send + Sync>;
pub type WarningListener = Arc<dyn Fn(&ParamWarning) + Send + Sync>;

struct Entry {
    value: ParamValue,
    bounds: Bounds,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Param, Entry>,
    global: Vec<(SubscriptionId, Listener)>,
    per_key: HashMap<Param, Vec<(SubscriptionId, Listener)>>,
    warnings: Vec<WarningListener>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Reactive parameter state shared by every controller.
///
/// Listeners run synchronously inside [`ParamStore::set`] with the internal
/// lock released, so a listener may read and write other parameters. Global
/// listeners run before the per-key ones.
pub struct ParamStore {
    inner: Mutex<Inner>,
    storage: Box<dyn ParamStorage>,
}

impl ParamStore {
    /// Empty store; parameters must be registered with [`ParamStore::define`].
    pub fn new(storage: impl ParamStorage + 'static) -> Self {
        Self { inner: Mutex::new(Inner::default()), storage: Box::new(storage) }
    }

    /// Store with the full vehicle schema defined, persisted values loaded.
    pub fn with_schema(storage: impl ParamStorage + 'static) -> Self {
        let store = Self::new(storage);
        for p in Param::ALL {
            let spec = p.spec();
            // ALL is unique so define cannot fail with AlreadyDefined
            store.define(*p, spec.default, spec.bounds).ok();
        }
        store
    }

    pub fn in_memory() -> Self {
        Self::with_schema(MemoryStorage::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `param` once. A persisted value is used when it parses as the
    /// declared type and fits `bounds`, otherwise `initial`.
    pub fn define(&self, param: Param, initial: impl Into<ParamValue>, bounds: Bounds) -> Result<(), ParamError> {
        let initial = initial.into();
        let value = match self.storage.load(param.key()) {
            Ok(Some(raw)) => match ParamValue::parse(initial.kind(), &raw) {
                Some(v) if matches!(v, ParamValue::Number(n) if bounds.violation(n).is_some()) => {
                    warn!("params: stored {}={} out of bounds, using default", param, raw.trim());
                    initial
                }
                Some(v) => v,
                None => {
                    warn!("params: stored {}={:?} unreadable, using default", param, raw);
                    initial
                }
            },
            Ok(None) => initial,
            Err(e) => {
                warn!("params: load {} failed: {}", param, e);
                initial
            }
        };

        let mut inner = self.lock();
        if inner.entries.contains_key(&param) {
            return Err(ParamError::AlreadyDefined(param));
        }
        inner.entries.insert(param, Entry { value, bounds });
        Ok(())
    }

    pub fn is_defined(&self, param: Param) -> bool {
        self.lock().entries.contains_key(&param)
    }

    /// Current value.
    ///
    /// # Panics
    /// If `param` was never defined.
    pub fn get(&self, param: Param) -> ParamValue {
        match self.lock().entries.get(&param) {
            Some(e) => e.value.clone(),
            None => panic!("read of undefined parameter {}", param),
        }
    }

    pub fn number(&self, param: Param) -> f64 {
        self.get(param).as_f64()
    }

    pub fn flag(&self, param: Param) -> bool {
        self.get(param).as_bool()
    }

    pub fn text(&self, param: Param) -> String {
        self.get(param).to_string()
    }

    pub fn bounds(&self, param: Param) -> Option<Bounds> {
        self.lock().entries.get(&param).map(|e| e.bounds)
    }

    /// Validated write. Equal values are still applied and announced.
    pub fn set(&self, param: Param, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        let value = value.into();
        let (global, per_key, change) = {
            let mut inner = self.lock();
            let entry = inner.entries.get_mut(&param).ok_or(ParamError::Undefined(param))?;

            let expected = entry.value.kind();
            if value.kind() != expected {
                return Err(ParamError::TypeMismatch { param, expected, got: value.kind() });
            }
            if let ParamValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(ParamError::NotFinite(param));
                }
                if let Some(kind) = entry.bounds.violation(n) {
                    let warnings = inner.warnings.clone();
                    drop(inner);
                    let w = ParamWarning { kind, param, value: n, timestamp: OffsetDateTime::now_utc() };
                    for l in &warnings {
                        l(&w);
                    }
                    return Err(ParamError::OutOfBounds { param, kind, value: n });
                }
            }

            entry.value = value.clone();
            let change = ParamChange { param, value, timestamp: OffsetDateTime::now_utc() };
            let global: Vec<Listener> = inner.global.iter().map(|(_, l)| l.clone()).collect();
            let per_key: Vec<Listener> = inner
                .per_key
                .get(&param)
                .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            (global, per_key, change)
        };

        for l in global.iter().chain(per_key.iter()) {
            l(&change);
        }
        Ok(())
    }

    /// Handler fires once per change of any of `params`.
    pub fn subscribe<F>(&self, params: &[Param], handler: F) -> SubscriptionId
    where
        F: Fn(&ParamChange) + Send + Sync + 'static,
    {
        let handler: Listener = Arc::new(handler);
        let mut inner = self.lock();
        let id = inner.next_id();
        for p in params {
            inner.per_key.entry(*p).or_default().push((id, handler.clone()));
        }
        id
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ParamChange) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.global.push((id, Arc::new(handler)));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.global.len() + inner.per_key.values().map(Vec::len).sum::<usize>();
        inner.global.retain(|(i, _)| *i != id);
        for ls in inner.per_key.values_mut() {
            ls.retain(|(i, _)| *i != id);
        }
        let after = inner.global.len() + inner.per_key.values().map(Vec::len).sum::<usize>();
        before != after
    }

    pub fn on_warning<F>(&self, handler: F)
    where
        F: Fn(&ParamWarning) + Send + Sync + 'static,
    {
        self.lock().warnings.push(Arc::new(handler));
    }

    /// Writes the current value to storage. The store never persists on its own.
    pub fn persist(&self, param: Param) -> Result<(), ParamError> {
        let value = {
            let inner = self.lock();
            inner.entries.get(&param).ok_or(ParamError::Undefined(param))?.value.to_string()
        };
        self.storage
            .save(param.key(), &value)
            .map_err(|source| ParamError::Storage { param, source })?;
        debug!("params: persisted {}={}", param, value);
        Ok(())
    }

    /// Defined parameters in wire order.
    pub fn params(&self) -> Vec<Param> {
        let inner = self.lock();
        Param::ALL.iter().copied().filter(|p| inner.entries.contains_key(p)).collect()
    }
}
