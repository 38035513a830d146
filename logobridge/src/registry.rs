use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::codec;
use crate::error::{ListenerError, RegistryError};
use crate::poller::ChangeHandler;
use crate::types::{ChangeEvent, MemoryRange, RangeId, TypedVariable, Value};

/// Callback invoked with the new value of a variable after its bytes changed
///
/// Runs on the poller's task: implementations must return quickly and hand
/// slow work to another task. Errors and panics are logged by the registry
/// and do not affect other listeners.
pub trait ChangeListener: Send + Sync + 'static {
    /// called once per poll cycle in which any byte of `variable` changed
    fn on_change(&self, variable: &TypedVariable, value: Value) -> Result<(), ListenerError>;
}

impl<F> ChangeListener for F
where
    F: Fn(&TypedVariable, Value) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_change(&self, variable: &TypedVariable, value: Value) -> Result<(), ListenerError> {
        self(variable, value)
    }
}

/// Identifies a registered variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariableHandle(u64);

/// Identifies a listener subscribed to a variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    handle: VariableHandle,
    variable: TypedVariable,
    range: RangeId,
    listeners: Vec<(SubscriptionId, Arc<dyn ChangeListener>)>,
}

struct Shadow {
    range: MemoryRange,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    shadows: Vec<Shadow>,
    entries: Vec<Entry>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn entry_mut(&mut self, handle: VariableHandle) -> Result<&mut Entry, RegistryError> {
        self.entries
            .iter_mut()
            .find(|e| e.handle == handle)
            .ok_or(RegistryError::UnknownHandle)
    }

    fn apply(&mut self, event: &ChangeEvent) {
        let Some(shadow) = self.shadows.get_mut(event.range.0) else {
            tracing::warn!("change for unknown range {}", event.range);
            return;
        };

        let begin = event.span.start.wrapping_sub(shadow.range.start()) as usize;
        match shadow.bytes.get_mut(begin..begin + event.bytes.len()) {
            Some(target) => target.copy_from_slice(&event.bytes),
            None => tracing::warn!(
                "change at [{}, {}] is outside of {}",
                event.span.start,
                event.span.end,
                shadow.range
            ),
        }
    }

    fn decode(&self, entry: &Entry) -> Option<Value> {
        let shadow = self.shadows.get(entry.range.0)?;
        let begin = (entry.variable.address() - shadow.range.start()) as usize;
        let bytes = shadow.bytes.get(begin..begin + entry.variable.width())?;
        match codec::decode_binary(&entry.variable, bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("unable to decode {}: {}", entry.variable, err);
                None
            }
        }
    }
}

type Notification = (TypedVariable, Value, Vec<Arc<dyn ChangeListener>>);

/// Maps typed variables onto the shadow copies of the polled memory ranges
///
/// Cloning produces another handle to the same registry.
#[derive(Clone, Default)]
pub struct VariableRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl VariableRegistry {
    /// create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// add a memory range whose changes are fed to [`VariableRegistry::on_change`]
    pub fn add_range(&self, range: MemoryRange) -> RangeId {
        let mut inner = self.lock();
        let id = RangeId(inner.shadows.len());
        inner.shadows.push(Shadow {
            range,
            bytes: vec![0; range.size()],
        });
        id
    }

    /// Register a variable with the first range that fully contains it
    ///
    /// The same variable may be registered more than once; every
    /// registration is notified independently.
    pub fn register(&self, variable: TypedVariable) -> Result<VariableHandle, RegistryError> {
        let mut inner = self.lock();
        let range = inner
            .shadows
            .iter()
            .position(|s| s.range.contains(variable.address(), variable.width()))
            .map(RangeId)
            .ok_or(RegistryError::OutsideOfRanges(variable.address()))?;

        let handle = VariableHandle(inner.next_id());
        inner.entries.push(Entry {
            handle,
            variable,
            range,
            listeners: Vec::new(),
        });
        tracing::debug!("registered {} in range {}", variable, range);
        Ok(handle)
    }

    /// remove a variable together with all of its listeners
    pub fn unregister(&self, handle: VariableHandle) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.retain(|e| e.handle != handle);
        if inner.entries.len() == count {
            return Err(RegistryError::UnknownHandle);
        }
        Ok(())
    }

    /// add a listener that is called after the listeners subscribed before it
    pub fn subscribe(
        &self,
        handle: VariableHandle,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<SubscriptionId, RegistryError> {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id());
        inner.entry_mut(handle)?.listeners.push((id, listener));
        Ok(id)
    }

    /// remove a single listener
    pub fn unsubscribe(
        &self,
        handle: VariableHandle,
        subscription: SubscriptionId,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = inner.entry_mut(handle)?;
        let count = entry.listeners.len();
        entry.listeners.retain(|(id, _)| *id != subscription);
        if entry.listeners.len() == count {
            return Err(RegistryError::UnknownHandle);
        }
        Ok(())
    }

    /// value of the variable as of the last change applied to its range
    pub fn current_value(&self, handle: VariableHandle) -> Result<Value, RegistryError> {
        let inner = self.lock();
        let entry = inner
            .entries
            .iter()
            .find(|e| e.handle == handle)
            .ok_or(RegistryError::UnknownHandle)?;
        inner.decode(entry).ok_or(RegistryError::UnknownHandle)
    }

    /// Apply the changes of one poll cycle and notify the affected listeners
    ///
    /// All spans are applied to the shadow copy before any variable is
    /// decoded, so a variable that straddles several spans sees a consistent
    /// value and is notified only once. Listeners run after the registry lock
    /// has been released, in registration order.
    pub fn on_change(&self, events: &[ChangeEvent]) {
        let notifications: Vec<Notification> = {
            let mut inner = self.lock();
            for event in events {
                inner.apply(event);
            }

            inner
                .entries
                .iter()
                .filter(|entry| {
                    events.iter().any(|event| {
                        event.range == entry.range && event.span.intersects(&entry.variable.span())
                    })
                })
                .filter_map(|entry| {
                    let value = inner.decode(entry)?;
                    let listeners = entry.listeners.iter().map(|(_, l)| l.clone()).collect();
                    Some((entry.variable, value, listeners))
                })
                .collect()
        };

        for (variable, value, listeners) in notifications {
            for listener in listeners {
                match catch_unwind(AssertUnwindSafe(|| listener.on_change(&variable, value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!("listener for {} (value: {}) failed: {}", variable, value, err)
                    }
                    Err(_) => tracing::warn!("listener for {} (value: {}) panicked", variable, value),
                }
            }
        }
    }
}

impl ChangeHandler for VariableRegistry {
    fn on_change(&self, events: &[ChangeEvent]) {
        VariableRegistry::on_change(self, events)
    }
}
