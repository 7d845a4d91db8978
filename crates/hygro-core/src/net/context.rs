//! Shared network context
//!
//! Created once at startup and alive for the rest of the program. The
//! bring-up task is the only writer: it installs the stack and publishes each
//! stage. The packet pump and the request path only read.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::warn;

use super::error::NetError;
use super::stack::NetworkStack;
use super::types::{BringUpStage, NetworkInfo};

#[derive(Debug, Default)]
struct Published {
    stage: BringUpStage,
    info: Option<NetworkInfo>,
}

pub struct NetworkContext<S> {
    published: BlockingMutex<CriticalSectionRawMutex, RefCell<Published>>,
    stack: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<S>>>,
}

impl<S> NetworkContext<S> {
    pub const fn new() -> Self {
        Self {
            published: BlockingMutex::new(RefCell::new(Published {
                stage: BringUpStage::Uninitialized,
                info: None,
            })),
            stack: BlockingMutex::new(RefCell::new(None)),
        }
    }

    /// Current bring-up stage. Never blocks.
    pub fn stage(&self) -> BringUpStage {
        self.published.lock(|p| p.borrow().stage)
    }

    pub fn is_ready(&self) -> bool {
        self.stage().is_ready()
    }

    /// The network snapshot, available once the stage is `Ready`
    pub fn network_info(&self) -> Option<NetworkInfo> {
        self.published.lock(|p| p.borrow().info)
    }

    /// Publish a new stage.
    ///
    /// Readers must never see the stage go backwards, so an attempt to publish
    /// an earlier stage is refused and reported as `false`.
    pub(crate) fn publish_stage(&self, stage: BringUpStage) -> bool {
        self.published.lock(|p| {
            let mut p = p.borrow_mut();
            if stage < p.stage {
                warn!("Refusing stage regression from {} to {}", p.stage, stage);
                return false;
            }
            p.stage = stage;
            true
        })
    }

    /// Publish the snapshot and the `Ready` stage together
    pub(crate) fn publish_ready(&self, info: NetworkInfo) {
        self.published.lock(|p| {
            let mut p = p.borrow_mut();
            p.info = Some(info);
            p.stage = BringUpStage::Ready;
        });
    }

    pub(crate) fn install_stack(&self, stack: S) {
        self.stack.lock(|slot| {
            slot.borrow_mut().replace(stack);
        });
    }

    pub fn has_stack(&self) -> bool {
        self.stack.lock(|slot| slot.borrow().is_some())
    }
}

impl<S: NetworkStack> NetworkContext<S> {
    /// Run `f` with exclusive access to the stack.
    ///
    /// Calls must stay short and must not nest.
    pub fn with_stack<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, NetError> {
        self.stack.lock(|slot| {
            let mut slot = slot.borrow_mut();
            slot.as_mut().map(f).ok_or(NetError::NotReady)
        })
    }
}

impl<S> Default for NetworkContext<S> {
    fn default() -> Self {
        Self::new()
    }
}
