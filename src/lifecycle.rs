//! Lifecycle hooks
//!
//! Closures registered per entity type and [`Phase`]. Registration returns a
//! [`HookHandle`] that can later remove the hook again.

use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::connection::QueryResult;
use crate::entity::Entity;
use crate::error::{MapperError, Result};
use crate::property::PropertyChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    PropertyChanged,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BeforeCreate => "before_create",
            Phase::AfterCreate => "after_create",
            Phase::BeforeUpdate => "before_update",
            Phase::AfterUpdate => "after_update",
            Phase::BeforeDelete => "before_delete",
            Phase::AfterDelete => "after_delete",
            Phase::PropertyChanged => "property_changed",
        };
        f.write_str(name)
    }
}

/// Phase hook. After-phase hooks receive the statement's result.
pub type Hook = Box<dyn FnMut(&mut Entity, Option<&QueryResult>) -> anyhow::Result<()> + Send>;

/// Handler for a change of one named property.
pub type PropertyHandler = Box<dyn FnMut(&mut Entity, &PropertyChange) -> anyhow::Result<()> + Send>;

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

struct PhaseHook {
    handle: HookHandle,
    type_name: String,
    phase: Phase,
    hook: Hook,
}

struct FieldHandler {
    handle: HookHandle,
    type_name: String,
    field: String,
    handler: PropertyHandler,
}

#[derive(Default)]
pub struct LifecycleHooks {
    next_handle: u64,
    hooks: Vec<PhaseHook>,
    handlers: Vec<FieldHandler>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("hooks", &self.hooks.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> HookHandle {
        let handle = HookHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, phase: Phase, hook: F) -> HookHandle
    where
        F: FnMut(&mut Entity, Option<&QueryResult>) -> anyhow::Result<()> + Send + 'static,
    {
        let handle = self.allocate();
        self.hooks.push(PhaseHook {
            handle,
            type_name: type_name.into(),
            phase,
            hook: Box::new(hook),
        });
        handle
    }

    /// Handler for changes of `field`. Fields with a dedicated handler are
    /// not reported to generic [`Phase::PropertyChanged`] hooks.
    pub fn on_property_changed<F>(
        &mut self,
        type_name: impl Into<String>,
        field: impl Into<String>,
        handler: F,
    ) -> HookHandle
    where
        F: FnMut(&mut Entity, &PropertyChange) -> anyhow::Result<()> + Send + 'static,
    {
        let handle = self.allocate();
        self.handlers.push(FieldHandler {
            handle,
            type_name: type_name.into(),
            field: field.into(),
            handler: Box::new(handler),
        });
        handle
    }

    /// Remove a hook or handler. Returns whether it was registered.
    pub fn unregister(&mut self, handle: HookHandle) -> bool {
        let before = self.hooks.len() + self.handlers.len();
        self.hooks.retain(|h| h.handle != handle);
        self.handlers.retain(|h| h.handle != handle);
        before != self.hooks.len() + self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.hooks.len() + self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the hooks of `phase` for the entity's type, in registration order.
    /// The first failure stops the run.
    pub fn run(
        &mut self,
        phase: Phase,
        entity: &mut Entity,
        result: Option<&QueryResult>,
    ) -> Result<()> {
        for entry in self.hooks.iter_mut() {
            if entry.phase != phase || entry.type_name != entity.type_name() {
                continue;
            }

            if let Err(e) = (entry.hook)(entity, result) {
                warn!("⚠️  {} hook failed for {}: {:#}", phase, entity.type_name(), e);
                return Err(MapperError::Hook {
                    phase,
                    message: format!("{:#}", e),
                });
            }
        }

        Ok(())
    }

    /// Report `changes` of an updated entity. Dedicated field handlers run
    /// first; remaining fields trigger the generic hooks once.
    pub fn dispatch_changes(
        &mut self,
        entity: &mut Entity,
        changes: &BTreeMap<String, PropertyChange>,
        result: Option<&QueryResult>,
    ) -> Result<()> {
        let mut unhandled = false;

        for (field, change) in changes {
            let mut handled = false;

            for entry in self.handlers.iter_mut() {
                if entry.field != *field || entry.type_name != entity.type_name() {
                    continue;
                }
                handled = true;

                if let Err(e) = (entry.handler)(entity, change) {
                    warn!("⚠️  Handler for `{}` failed on {}: {:#}", field, entity.type_name(), e);
                    return Err(MapperError::Hook {
                        phase: Phase::PropertyChanged,
                        message: format!("{}: {:#}", field, e),
                    });
                }
            }

            unhandled |= !handled;
        }

        if unhandled {
            self.run(Phase::PropertyChanged, entity, result)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyManager;
    use crate::value::Value;
    use std::sync::{Arc, Mutex};

    fn person() -> Entity {
        let mut manager = PropertyManager::new(true);
        manager.hydrate([("name", Value::from("mark"))], true).unwrap();
        Entity::node("Person", ["Person"], manager)
    }

    #[test]
    fn test_hooks_run_in_order_for_matching_type() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();

        for tag in ["first", "second"] {
            let calls = calls.clone();
            hooks.register("Person", Phase::BeforeCreate, move |_, _| {
                calls.lock().unwrap().push(tag);
                Ok(())
            });
        }
        let other = calls.clone();
        hooks.register("Animal", Phase::BeforeCreate, move |_, _| {
            other.lock().unwrap().push("animal");
            Ok(())
        });

        hooks.run(Phase::BeforeCreate, &mut person(), None).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_hook_becomes_hook_error() {
        let mut hooks = LifecycleHooks::new();
        hooks.register("Person", Phase::BeforeUpdate, |_, _| anyhow::bail!("nope"));

        let err = hooks
            .run(Phase::BeforeUpdate, &mut person(), None)
            .unwrap_err();

        match err {
            MapperError::Hook { phase, message } => {
                assert_eq!(phase, Phase::BeforeUpdate);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unregister_removes_hook() {
        let mut hooks = LifecycleHooks::new();
        let handle = hooks.register("Person", Phase::AfterCreate, |_, _| anyhow::bail!("boom"));

        assert!(hooks.unregister(handle));
        assert!(!hooks.unregister(handle));
        assert!(hooks.run(Phase::AfterCreate, &mut person(), None).is_ok());
    }

    #[test]
    fn test_field_handler_takes_precedence_over_generic_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();

        let field_seen = seen.clone();
        hooks.on_property_changed("Person", "first-name", move |_, change| {
            field_seen.lock().unwrap().push(format!("field:{:?}", change.to));
            Ok(())
        });
        let generic_seen = seen.clone();
        hooks.register("Person", Phase::PropertyChanged, move |_, _| {
            generic_seen.lock().unwrap().push("generic".to_string());
            Ok(())
        });

        let change = PropertyChange {
            from: Value::from("a"),
            to: Value::from("b"),
        };
        let only_field: BTreeMap<String, PropertyChange> =
            [("first-name".to_string(), change.clone())].into_iter().collect();
        hooks
            .dispatch_changes(&mut person(), &only_field, None)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![r#"field:String("b")"#.to_string()]);

        let mixed: BTreeMap<String, PropertyChange> =
            [("first-name".to_string(), change.clone()), ("age".to_string(), change)]
                .into_iter()
                .collect();
        hooks.dispatch_changes(&mut person(), &mixed, None).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(seen.lock().unwrap()[2], "generic");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::AfterDelete.to_string(), "after_delete");
    }
}
