//! Dependency-injected registry of engine subsystems.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::error::SvcError;
use crate::core::{Uid, UidRegistry};

/// A singleton subsystem addressable through the locator.
pub trait NamedService: Any + Send + Sync {
    const SERVICE_UID: Uid;
}

type ServiceObject = Arc<dyn Any + Send + Sync>;
type ServiceFactory = Box<dyn FnMut(&ServiceLocator) -> anyhow::Result<ServiceObject> + Send>;

enum Slot {
    /// Factory registered, instance not yet requested
    Registered(ServiceFactory),
    /// Some thread is running the factory right now
    Creating,
    Created(ServiceObject),
}

struct LocatorInner {
    slots: HashMap<Uid, Slot>,
    creation_order: Vec<Uid>,
}

thread_local! {
    // Stack of service UIDs whose factories are running on this thread,
    // used to detect circular dependencies
    static CREATING_STACK: RefCell<Vec<Uid>> = const { RefCell::new(Vec::new()) };
}

/// UID-addressed registry of services with factory-based lazy creation.
///
/// Factories run without the registry lock held and may recursively
/// request (or even register) other services. A factory requesting a
/// service that is already being created on the same call stack fails
/// with [`SvcError::CircularDependency`]; a different thread finding a
/// service mid-creation blocks until the creating thread finishes.
///
/// Services are torn down in reverse creation order when the locator
/// drops.
pub struct ServiceLocator {
    inner: Mutex<LocatorInner>,
    cv: Condvar,
}

impl Default for ServiceLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LocatorInner {
                slots: HashMap::new(),
                creation_order: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Registers a factory for `S`. Fails if any factory or instance is
    /// already registered under the same UID.
    pub fn register_service_factory<S, F>(&self, mut factory: F) -> Result<(), SvcError>
    where
        S: NamedService,
        F: FnMut(&ServiceLocator) -> anyhow::Result<Arc<S>> + Send + 'static,
    {
        let wrapped: ServiceFactory =
            Box::new(move |locator| factory(locator).map(|arc| arc as ServiceObject));

        let mut inner = self.inner.lock();
        if inner.slots.contains_key(&S::SERVICE_UID) {
            return Err(SvcError::AlreadyRegistered(S::SERVICE_UID));
        }
        inner.slots.insert(S::SERVICE_UID, Slot::Registered(wrapped));
        Ok(())
    }

    /// Returns the instance, creating it (and transitively its
    /// dependencies) on first request.
    pub fn request_service<S: NamedService>(&self) -> anyhow::Result<Arc<S>> {
        let object = self.request_service_uid(S::SERVICE_UID)?;
        object
            .downcast::<S>()
            .map_err(|_| SvcError::InvalidArgument(format!("service {} type mismatch", S::SERVICE_UID)).into())
    }

    pub fn request_service_uid(&self, uid: Uid) -> anyhow::Result<ServiceObject> {
        let on_stack = CREATING_STACK.with(|stack| stack.borrow().contains(&uid));
        if on_stack {
            return Err(SvcError::CircularDependency(uid).into());
        }

        let mut factory = {
            let mut inner = self.inner.lock();
            loop {
                match inner.slots.get_mut(&uid) {
                    None => return Err(SvcError::UnresolvedDependency(uid).into()),
                    Some(Slot::Created(object)) => return Ok(object.clone()),
                    Some(Slot::Creating) => {
                        // Another thread runs the factory, wait it out
                        self.cv.wait(&mut inner);
                    }
                    Some(slot @ Slot::Registered(_)) => {
                        let Slot::Registered(factory) = std::mem::replace(slot, Slot::Creating)
                        else {
                            unreachable!()
                        };
                        break factory;
                    }
                }
            }
        };

        CREATING_STACK.with(|stack| stack.borrow_mut().push(uid));
        let result = factory(self);
        CREATING_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(uid));
        });

        let mut inner = self.inner.lock();
        match result {
            Ok(object) => {
                log::debug!("service {} created", UidRegistry::lookup(uid));
                inner.slots.insert(uid, Slot::Created(object.clone()));
                inner.creation_order.push(uid);
                self.cv.notify_all();
                Ok(object)
            }
            Err(error) => {
                log::error!(
                    "factory of service {} failed: {error:#}",
                    UidRegistry::lookup(uid)
                );
                // Keep the factory so the error stays reproducible
                inner.slots.insert(uid, Slot::Registered(factory));
                self.cv.notify_all();
                Err(error)
            }
        }
    }

    /// Returns the instance if it was already created, without creating
    pub fn find_service<S: NamedService>(&self) -> Option<Arc<S>> {
        self.find_service_uid(S::SERVICE_UID)?.downcast::<S>().ok()
    }

    pub fn find_service_uid(&self, uid: Uid) -> Option<ServiceObject> {
        match self.inner.lock().slots.get(&uid) {
            Some(Slot::Created(object)) => Some(object.clone()),
            _ => None,
        }
    }
}

impl Drop for ServiceLocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        // Reverse creation order: dependants drop before dependencies
        while let Some(uid) = inner.creation_order.pop() {
            log::debug!("service {} destroyed", UidRegistry::lookup(uid));
            inner.slots.remove(&uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    macro_rules! test_service {
        ($name:ident, $uid:literal) => {
            #[derive(Debug)]
            struct $name;
            impl NamedService for $name {
                const SERVICE_UID: Uid = Uid::parse($uid);
            }
        };
    }

    test_service!(ServiceA, "1fc82db5-ea75f28a-c21c223b-10663645");
    test_service!(ServiceB, "c2b6fae1-a1aded58-0f054134-53d47bec");
    test_service!(ServiceC, "dc098141-b47700f8-2d43b146-c5c74611");
    test_service!(ServiceD, "8819c518-0260c91d-db31ab20-f0daee10");
    test_service!(ServiceE, "eb934a1d-ea3777fe-8aeaf67f-13149325");

    fn is_svc_error(error: &anyhow::Error, check: impl Fn(&SvcError) -> bool) -> bool {
        error.downcast_ref::<SvcError>().is_some_and(check)
    }

    #[test]
    fn test_sanity() {
        let svc = ServiceLocator::new();
        assert!(svc.find_service::<ServiceA>().is_none());

        svc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap();
        assert!(svc.find_service::<ServiceA>().is_none());

        svc.register_service_factory::<ServiceB, _>(|loc| {
            loc.request_service::<ServiceA>()?;
            Ok(Arc::new(ServiceB))
        })
        .unwrap();
        svc.register_service_factory::<ServiceC, _>(|loc| {
            loc.request_service::<ServiceA>()?;
            Ok(Arc::new(ServiceC))
        })
        .unwrap();
        svc.register_service_factory::<ServiceD, _>(|loc| {
            loc.request_service::<ServiceB>()?;
            loc.request_service::<ServiceC>()?;
            Ok(Arc::new(ServiceD))
        })
        .unwrap();
        svc.register_service_factory::<ServiceE, _>(|loc| {
            loc.request_service::<ServiceB>()?;
            loc.request_service::<ServiceD>()?;
            Ok(Arc::new(ServiceE))
        })
        .unwrap();

        svc.request_service::<ServiceA>().unwrap();
        assert!(svc.find_service::<ServiceA>().is_some());
        assert!(svc.find_service::<ServiceB>().is_none());

        svc.request_service::<ServiceB>().unwrap();
        assert!(svc.find_service::<ServiceB>().is_some());
        assert!(svc.find_service::<ServiceC>().is_none());
        assert!(svc.find_service::<ServiceD>().is_none());
        assert!(svc.find_service::<ServiceE>().is_none());

        svc.request_service::<ServiceE>().unwrap();
        assert!(svc.find_service::<ServiceC>().is_some());
        assert!(svc.find_service::<ServiceD>().is_some());
        assert!(svc.find_service::<ServiceE>().is_some());
    }

    #[test]
    fn test_factory_failure() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap();
        svc.register_service_factory::<ServiceB, _>(|loc| {
            loc.request_service::<ServiceA>()?;
            Ok(Arc::new(ServiceB))
        })
        .unwrap();
        // Requests its dependencies, then fails
        svc.register_service_factory::<ServiceC, _>(|loc| {
            loc.request_service::<ServiceB>()?;
            Err(anyhow!("oops"))
        })
        .unwrap();
        svc.register_service_factory::<ServiceD, _>(|loc| {
            loc.request_service::<ServiceC>()?;
            Ok(Arc::new(ServiceD))
        })
        .unwrap();

        let error = svc.request_service::<ServiceD>().unwrap_err();
        assert_eq!(error.to_string(), "oops");

        // Dependencies created before the failure stay alive
        assert!(svc.find_service::<ServiceA>().is_some());
        assert!(svc.find_service::<ServiceB>().is_some());
        assert!(svc.find_service::<ServiceC>().is_none());
        assert!(svc.find_service::<ServiceD>().is_none());

        // The failure is reproducible
        let error = svc.request_service::<ServiceC>().unwrap_err();
        assert_eq!(error.to_string(), "oops");
    }

    #[test]
    fn test_double_registration() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap();
        let err = svc
            .register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap_err();
        assert!(matches!(err, SvcError::AlreadyRegistered(_)));

        // Still registered after a request
        svc.request_service::<ServiceA>().unwrap();
        let err = svc
            .register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap_err();
        assert!(matches!(err, SvcError::AlreadyRegistered(_)));
        assert!(svc.find_service::<ServiceA>().is_some());
    }

    #[test]
    fn test_unresolved_dependency() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceB, _>(|loc| {
            loc.request_service::<ServiceA>()?;
            Ok(Arc::new(ServiceB))
        })
        .unwrap();

        let error = svc.request_service::<ServiceB>().unwrap_err();
        assert!(is_svc_error(&error, |e| {
            matches!(e, SvcError::UnresolvedDependency(uid) if *uid == ServiceA::SERVICE_UID)
        }));
        assert!(svc.find_service::<ServiceA>().is_none());
        assert!(svc.find_service::<ServiceB>().is_none());

        // Registering the missing dependency unblocks creation
        svc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap();
        svc.request_service::<ServiceB>().unwrap();
        assert!(svc.find_service::<ServiceA>().is_some());
        assert!(svc.find_service::<ServiceB>().is_some());
    }

    #[test]
    fn test_circular_dependency() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceA, _>(|loc| {
            loc.request_service::<ServiceB>()?;
            Ok(Arc::new(ServiceA))
        })
        .unwrap();
        svc.register_service_factory::<ServiceB, _>(|loc| {
            loc.request_service::<ServiceA>()?;
            Ok(Arc::new(ServiceB))
        })
        .unwrap();

        let error = svc.request_service::<ServiceA>().unwrap_err();
        assert!(is_svc_error(&error, |e| matches!(e, SvcError::CircularDependency(_))));
        assert!(svc.find_service::<ServiceA>().is_none());
        assert!(svc.find_service::<ServiceB>().is_none());

        // Neither instance gets constructed, ever
        let error = svc.request_service::<ServiceB>().unwrap_err();
        assert!(is_svc_error(&error, |e| matches!(e, SvcError::CircularDependency(_))));
        assert!(svc.find_service::<ServiceA>().is_none());
        assert!(svc.find_service::<ServiceB>().is_none());
    }

    #[test]
    fn test_registration_inside_factory() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceE, _>(|loc| {
            loc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))?;
            loc.request_service::<ServiceA>()?;

            loc.register_service_factory::<ServiceD, _>(|loc| {
                loc.register_service_factory::<ServiceB, _>(|_| Ok(Arc::new(ServiceB)))?;
                loc.request_service::<ServiceB>()?;
                Ok(Arc::new(ServiceD))
            })?;
            loc.request_service::<ServiceD>()?;

            Ok(Arc::new(ServiceE))
        })
        .unwrap();

        svc.request_service::<ServiceE>().unwrap();
        assert!(svc.find_service::<ServiceA>().is_some());
        assert!(svc.find_service::<ServiceB>().is_some());
        assert!(svc.find_service::<ServiceD>().is_some());
        assert!(svc.find_service::<ServiceE>().is_some());
    }

    #[test]
    fn test_creation_from_another_thread() {
        let svc = ServiceLocator::new();

        svc.register_service_factory::<ServiceA, _>(|_| Ok(Arc::new(ServiceA)))
            .unwrap();
        svc.register_service_factory::<ServiceB, _>(|_| Ok(Arc::new(ServiceB)))
            .unwrap();
        // Requests its dependencies from a secondary thread
        svc.register_service_factory::<ServiceC, _>(|loc| {
            std::thread::scope(|scope| {
                scope
                    .spawn(|| {
                        loc.request_service::<ServiceA>()?;
                        loc.request_service::<ServiceB>()?;
                        Ok::<(), anyhow::Error>(())
                    })
                    .join()
                    .unwrap()
            })?;
            Ok(Arc::new(ServiceC))
        })
        .unwrap();

        svc.request_service::<ServiceC>().unwrap();
        assert!(svc.find_service::<ServiceA>().is_some());
        assert!(svc.find_service::<ServiceB>().is_some());
        assert!(svc.find_service::<ServiceC>().is_some());
    }

    #[test]
    fn test_concurrent_requests_single_instance() {
        let svc = Arc::new(ServiceLocator::new());

        svc.register_service_factory::<ServiceA, _>(|_| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(Arc::new(ServiceA))
        })
        .unwrap();

        let mut threads = Vec::new();
        for _ in 0..4 {
            let svc = svc.clone();
            threads.push(std::thread::spawn(move || {
                svc.request_service::<ServiceA>().unwrap()
            }));
        }

        let instances: Vec<Arc<ServiceA>> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();
        for pair in instances.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
