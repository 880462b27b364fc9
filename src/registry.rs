use crate::bdf::Bdf;
use crate::controller::Controller;
use crate::dma::Allocator;
use crate::error::Error;
use ahash::RandomState;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Process-wide table of open controllers keyed by PCI address, so two
/// `open()` calls against the same BDF share one `Controller` instead of
/// mapping the device's BAR twice. Entries are `Weak`: the last `Arc` drop
/// closes the controller, and the next `open()` for that address re-attaches
/// rather than handing back a dead handle.
pub(crate) struct Registry<A: Allocator> {
    controllers: Mutex<HashMap<Bdf, Weak<Controller<A>>, RandomState>>,
}

impl<A: Allocator> Registry<A> {
    pub(crate) fn new() -> Self {
        Self {
            controllers: Mutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
        }
    }

    /// Returns the already-open controller for `bdf.address()`, or calls
    /// `attach` to bring one up and registers the result. The lock is held
    /// only for the table lookup/insert, never across `attach` itself, so a
    /// slow bring-up on one BDF never blocks `open()` on another.
    pub(crate) fn get_or_attach(
        &self,
        bdf: Bdf,
        attach: impl FnOnce() -> Result<Controller<A>, Error>,
    ) -> Result<Arc<Controller<A>>, Error> {
        {
            let controllers = self.controllers.lock().unwrap();
            if let Some(existing) = controllers.get(&bdf.address_key()).and_then(Weak::upgrade) {
                return Ok(existing);
            }
        }

        let controller = Arc::new(attach()?);
        let mut controllers = self.controllers.lock().unwrap();
        // Another thread may have attached the same address while `attach`
        // ran without the lock held; prefer whichever won the race so only
        // one `Controller` ever survives per address.
        if let Some(existing) = controllers.get(&bdf.address_key()).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        controllers.insert(bdf.address_key(), Arc::downgrade(&controller));
        Ok(controller)
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self) -> usize {
        self.controllers.lock().unwrap().len()
    }
}

impl Bdf {
    /// A registry key that ignores the namespace suffix: two BDFs naming
    /// the same physical device must resolve to the same `Controller`.
    fn address_key(&self) -> Bdf {
        Bdf {
            nsid: 1,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAllocator;

    fn bdf(nsid: u32) -> Bdf {
        Bdf {
            bus: 1,
            device: 0,
            function: 0,
            nsid,
        }
    }

    #[test]
    fn second_open_of_the_same_address_reuses_the_controller() {
        let registry: Registry<MockAllocator> = Registry::new();
        let mut attaches = 0;
        let first = registry
            .get_or_attach(bdf(1), || {
                attaches += 1;
                Ok(Controller::stub(MockAllocator))
            })
            .unwrap();
        let second = registry
            .get_or_attach(bdf(1), || {
                attaches += 1;
                Ok(Controller::stub(MockAllocator))
            })
            .unwrap();
        assert_eq!(attaches, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn different_namespaces_on_the_same_address_share_one_controller() {
        let registry: Registry<MockAllocator> = Registry::new();
        let mut attaches = 0;
        let first = registry
            .get_or_attach(bdf(1), || {
                attaches += 1;
                Ok(Controller::stub(MockAllocator))
            })
            .unwrap();
        let second = registry
            .get_or_attach(bdf(2), || {
                attaches += 1;
                Ok(Controller::stub(MockAllocator))
            })
            .unwrap();
        assert_eq!(attaches, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn dropping_every_handle_lets_a_later_open_reattach() {
        let registry: Registry<MockAllocator> = Registry::new();
        let mut attaches = 0;
        {
            let _first = registry
                .get_or_attach(bdf(1), || {
                    attaches += 1;
                    Ok(Controller::stub(MockAllocator))
                })
                .unwrap();
        }
        registry
            .get_or_attach(bdf(1), || {
                attaches += 1;
                Ok(Controller::stub(MockAllocator))
            })
            .unwrap();
        assert_eq!(attaches, 2);
    }
}
