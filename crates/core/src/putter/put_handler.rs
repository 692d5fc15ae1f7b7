//! One manifest leaf: either an active insert or a static redirect
//! placeholder.
//!
//! An active handler owns a single-file inserter and receives its
//! callbacks; a static handler is born with prebuilt redirect
//! metadata and nothing to run. Either way, the handler's job is to
//! contribute one metadata byte string to the parent putter and to
//! keep the parent's membership sets current as its inserter makes
//! progress.

use super::ManifestPutter;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use warren_api::*;

#[derive(Debug)]
struct HandlerState {
    inserter: Option<DynSingleFileInserter>,
    started: bool,
    current_state: Option<PutStateId>,
    metadata: Option<Bytes>,
    finished: bool,
    cancelled: bool,
}

#[derive(Debug)]
pub(crate) struct PutHandler {
    id: usize,
    name: String,
    cm: Option<ClientMeta>,
    parent: Weak<ManifestPutter>,
    state: Mutex<HandlerState>,
}

impl PutHandler {
    /// An active leaf. The inserter is attached separately, because
    /// it needs this handler as its callback.
    pub(crate) fn new_active(
        id: usize,
        name: &str,
        cm: Option<ClientMeta>,
        parent: Weak<ManifestPutter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            cm,
            parent,
            state: Mutex::new(HandlerState {
                inserter: None,
                started: false,
                current_state: None,
                metadata: None,
                finished: false,
                cancelled: false,
            }),
        })
    }

    /// A static redirect: prebuilt metadata, no inserter.
    pub(crate) fn new_redirect(
        id: usize,
        name: &str,
        target: Uri,
        cm: Option<ClientMeta>,
        parent: Weak<ManifestPutter>,
    ) -> Result<Arc<Self>, InsertError> {
        let meta = Metadata::simple_redirect(
            target,
            cm.as_ref().map(|m| m.mime.clone()),
        );
        let metadata = meta.to_bytes()?;
        Ok(Arc::new(Self {
            id,
            name: name.to_string(),
            cm: None,
            parent,
            state: Mutex::new(HandlerState {
                inserter: None,
                started: false,
                current_state: None,
                metadata: Some(metadata),
                finished: false,
                cancelled: false,
            }),
        }))
    }

    pub(crate) fn attach_inserter(&self, inserter: DynSingleFileInserter) {
        let mut lock = self.state.lock().unwrap();
        lock.current_state = Some(inserter.state_id());
        lock.inserter = Some(inserter);
    }

    /// Start the inserter, if there is one to start. Idempotent:
    /// `started` flips on the first call for both handler kinds, and
    /// a static redirect has nothing to run.
    pub(crate) fn start(&self) -> Result<(), InsertError> {
        let inserter = {
            let mut lock = self.state.lock().unwrap();
            if lock.started {
                return Ok(());
            }
            lock.started = true;
            if lock.inserter.is_none() && lock.metadata.is_some() {
                return Ok(());
            }
            lock.inserter.clone()
        };
        match inserter {
            Some(inserter) => inserter.start(),
            None => Ok(()),
        }
    }

    pub(crate) fn cancel(&self) {
        let inserter = {
            let mut lock = self.state.lock().unwrap();
            lock.cancelled = true;
            lock.inserter.clone()
        };
        if let Some(inserter) = inserter {
            inserter.cancel();
        }
    }

    /// The contributed metadata bytes, once known.
    pub(crate) fn metadata(&self) -> Option<Bytes> {
        self.state.lock().unwrap().metadata.clone()
    }

    fn parent(&self) -> Option<Arc<ManifestPutter>> {
        let parent = self.parent.upgrade();
        if parent.is_none() {
            tracing::trace!(name = %self.name, "parent is gone");
        }
        parent
    }
}

impl PutCompletionCallback for PutHandler {
    fn on_success(&self, _state: &dyn PutState) {
        tracing::trace!(name = %self.name, "leaf insert completed");
        {
            let mut lock = self.state.lock().unwrap();
            if lock.cancelled || lock.finished {
                return;
            }
            lock.finished = true;
        }
        if let Some(parent) = self.parent() {
            parent.leaf_succeeded(self.id);
        }
    }

    fn on_failure(&self, e: InsertError, _state: &dyn PutState) {
        tracing::trace!(name = %self.name, %e, "leaf insert failed");
        if let Some(parent) = self.parent() {
            parent.fail_from_child(e);
        }
    }

    fn on_encode(&self, key: ClientKey, _state: &dyn PutState) {
        tracing::trace!(name = %self.name, uri = %key.uri(), "encoded");
        let synthesize = {
            let lock = self.state.lock().unwrap();
            if lock.cancelled {
                return;
            }
            lock.metadata.is_none()
        };
        if synthesize {
            // The file was too small to have its own metadata; make
            // the key into metadata instead.
            let meta = Metadata::simple_redirect(
                key.uri(),
                self.cm.as_ref().map(|m| m.mime.clone()),
            );
            self.on_metadata(meta, None);
        }
    }

    fn on_metadata(&self, meta: Metadata, _state: Option<&dyn PutState>) {
        tracing::trace!(name = %self.name, "assigning metadata");
        let bytes = match meta.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(parent) = self.parent() {
                    parent.fail_from_child(e);
                }
                return;
            }
        };
        {
            let mut lock = self.state.lock().unwrap();
            if lock.cancelled {
                return;
            }
            if lock.metadata.is_some() {
                tracing::error!(
                    name = %self.name,
                    "reassigning metadata",
                );
                return;
            }
            lock.metadata = Some(bytes);
        }
        if let Some(parent) = self.parent() {
            parent.leaf_got_metadata(self.id);
        }
    }

    fn on_transition(&self, old: &dyn PutState, new: DynPutState) {
        let mut lock = self.state.lock().unwrap();
        if lock.current_state == Some(old.state_id()) {
            lock.current_state = Some(new.state_id());
        }
    }

    fn on_block_set_finished(&self, _state: &dyn PutState) {
        if let Some(parent) = self.parent() {
            parent.leaf_block_set_finished(self.id);
        }
    }

    fn add_block(&self) {
        if let Some(parent) = self.parent() {
            parent.add_block();
        }
    }

    fn add_blocks(&self, num: u32) {
        if let Some(parent) = self.parent() {
            parent.add_blocks(num);
        }
    }

    fn completed_block(&self, dont_notify: bool) {
        if let Some(parent) = self.parent() {
            parent.completed_block(dont_notify);
        }
    }

    fn failed_block(&self) {
        if let Some(parent) = self.parent() {
            parent.failed_block();
        }
    }

    fn fatally_failed_block(&self) {
        if let Some(parent) = self.parent() {
            parent.fatally_failed_block();
        }
    }

    fn add_must_succeed_blocks(&self, blocks: u32) {
        if let Some(parent) = self.parent() {
            parent.add_must_succeed_blocks(blocks);
        }
    }
}
