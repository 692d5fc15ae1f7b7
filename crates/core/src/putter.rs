//! Hierarchical manifest inserts.
//!
//! A [ManifestPutter] takes a nested name-to-element mapping,
//! materializes a parallel tree of put handlers (one per leaf), runs
//! every leaf insert in parallel, and once each leaf has contributed
//! its metadata bytes, assembles a redirection manifest and inserts
//! that through one final single-file inserter. The caller's
//! [ClientCallback] hears the final URI, then success, exactly once
//! (or failure, exactly once).
//!
//! Handlers are stored in an arena with stable integer ids; the
//! membership sets (`running`, `waiting_for_metadata`,
//! `waiting_for_block_sets`) hold ids and are only touched under the
//! putter lock. Handlers hold weak back-references to the putter and
//! no-op once it is finished. The putter lock is never held across
//! external calls (child start, bucket creation, inserter start).

use crate::putter::put_handler::PutHandler;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use warren_api::*;

pub(crate) mod put_handler;


/// Default documents probed, in order, when the caller supplies no
/// explicit default name.
const DEFAULT_DEFAULT_NAMES: &[&str] =
    &["index.html", "index.htm", "default.html", "default.htm"];

/// A flattened element list that cannot be rebuilt into a tree.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnflattenError {
    /// A path component is used both as a file and as a directory.
    #[error("path component collides with a file: {0}")]
    PathCollision(String),
}

/// A node of a bucket tree: raw data by name, before manifest
/// elements have been made for it.
#[derive(Clone, Debug)]
pub enum BucketTreeNode {
    /// A data bucket.
    Leaf(DynBucket),
    /// A nested subtree.
    Dir(BTreeMap<String, BucketTreeNode>),
}

/// Convert a tree of name -> bucket to a tree of manifest elements.
/// All elements get `mime_override = None`.
pub fn buckets_by_name_to_manifest_entries(
    buckets_by_name: &BTreeMap<String, BucketTreeNode>,
) -> ManifestTree {
    let mut out = ManifestTree::new();
    for (name, node) in buckets_by_name {
        match node {
            BucketTreeNode::Leaf(data) => {
                out.insert(
                    name.clone(),
                    ManifestNode::Leaf(ManifestElement::from_bucket(
                        name.clone(),
                        data.clone(),
                        None,
                    )),
                );
            }
            BucketTreeNode::Dir(sub) => {
                out.insert(
                    name.clone(),
                    ManifestNode::Dir(
                        buckets_by_name_to_manifest_entries(sub),
                    ),
                );
            }
        }
    }
    out
}

/// Convert a manifest tree into a flat list of elements, each with a
/// full `/`-joined path as its name.
pub fn flatten(tree: &ManifestTree) -> Vec<ManifestElement> {
    let mut out = Vec::new();
    flatten_into(tree, &mut out, "");
    out
}

fn flatten_into(
    tree: &ManifestTree,
    out: &mut Vec<ManifestElement>,
    prefix: &str,
) {
    for (name, node) in tree {
        let full = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            ManifestNode::Dir(sub) => flatten_into(sub, out, &full),
            ManifestNode::Leaf(e) => out.push(e.renamed(full)),
        }
    }
}

/// Opposite of [flatten]: split each element's name on `/` and
/// rebuild the tree. A path component that collides with a file name
/// is an error.
pub fn unflatten(
    elements: &[ManifestElement],
) -> Result<ManifestTree, UnflattenError> {
    let mut tree = ManifestTree::new();
    for e in elements {
        let name = e.name.clone();
        add_element(e, &name, &mut tree)?;
    }
    Ok(tree)
}

fn add_element(
    e: &ManifestElement,
    name_part: &str,
    target: &mut ManifestTree,
) -> Result<(), UnflattenError> {
    match name_part.split_once('/') {
        None => {
            target.insert(
                name_part.to_string(),
                ManifestNode::Leaf(e.renamed(name_part)),
            );
            Ok(())
        }
        Some((before, after)) => {
            let node = target
                .entry(before.to_string())
                .or_insert_with(|| ManifestNode::Dir(ManifestTree::new()));
            match node {
                ManifestNode::Dir(sub) => add_element(e, after, sub),
                ManifestNode::Leaf(_) => Err(
                    UnflattenError::PathCollision(before.to_string()),
                ),
            }
        }
    }
}

/// The parallel tree mirroring the input: leaves are arena ids of put
/// handlers.
#[derive(Debug)]
enum PutNode {
    Leaf(usize),
    Dir(BTreeMap<String, PutNode>),
}

#[derive(Debug, Default)]
struct PutterState {
    handlers: Vec<Arc<PutHandler>>,
    tree: BTreeMap<String, PutNode>,
    running: HashSet<usize>,
    waiting_for_metadata: HashSet<usize>,
    waiting_for_block_sets: HashSet<usize>,
    inserted_all_files: bool,
    inserted_manifest: bool,
    metadata_insert_started: bool,
    metadata_block_set_finalized: bool,
    block_set_forwarded: bool,
    finished: bool,
    cancelled: bool,
    final_uri: Option<Uri>,
    current_metadata_inserter: Option<PutStateId>,
    metadata_inserter: Option<DynSingleFileInserter>,
    number_of_files: u32,
    total_size: u64,
}

#[derive(Debug, Default)]
struct BlockProgress {
    total: u32,
    successful: u32,
    failed: u32,
    fatally_failed: u32,
    min_success: u32,
    block_set_finalized: bool,
}

impl BlockProgress {
    fn snapshot(&self) -> SplitfileProgressEvent {
        SplitfileProgressEvent {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            fatally_failed: self.fatally_failed,
            min_success: self.min_success,
            block_set_finalized: self.block_set_finalized,
        }
    }
}

/// Walks the directory tree, runs all leaf puts in parallel,
/// assembles and inserts the manifest.
#[derive(Debug)]
pub struct ManifestPutter {
    ctx: InsertContext,
    cb: DynClientCallback,
    target: Uri,
    default_name: Option<String>,
    get_chk_only: bool,
    state: Mutex<PutterState>,
    progress: Mutex<BlockProgress>,
}

impl ManifestPutter {
    /// Construct a putter over a manifest tree. Leaves with a target
    /// URI become static redirects; leaves with data become active
    /// inserts. A child construction failure cancels whatever was
    /// already built and is returned without touching the client
    /// callback.
    pub fn new(
        cb: DynClientCallback,
        elements: &ManifestTree,
        target: Uri,
        default_name: Option<String>,
        ctx: InsertContext,
        get_chk_only: bool,
    ) -> Result<Arc<Self>, InsertError> {
        let putter = Arc::new(Self {
            ctx,
            cb,
            target,
            default_name,
            get_chk_only,
            state: Mutex::new(PutterState::default()),
            progress: Mutex::new(BlockProgress::default()),
        });
        match Self::make_put_handlers(&putter, elements) {
            Ok(tree) => {
                putter.state.lock().unwrap().tree = tree;
                Ok(putter)
            }
            Err(e) => {
                putter.cancel_and_finish();
                Err(e)
            }
        }
    }

    fn make_put_handlers(
        putter: &Arc<Self>,
        elements: &ManifestTree,
    ) -> Result<BTreeMap<String, PutNode>, InsertError> {
        let mut out = BTreeMap::new();
        for (name, node) in elements {
            match node {
                ManifestNode::Dir(sub) => {
                    out.insert(
                        name.clone(),
                        PutNode::Dir(Self::make_put_handlers(
                            putter, sub,
                        )?),
                    );
                }
                ManifestNode::Leaf(element) => {
                    let id = Self::make_leaf(putter, name, element)?;
                    out.insert(name.clone(), PutNode::Leaf(id));
                }
            }
        }
        Ok(out)
    }

    fn make_leaf(
        putter: &Arc<Self>,
        name: &str,
        element: &ManifestElement,
    ) -> Result<usize, InsertError> {
        let cm = element
            .mime_override
            .as_ref()
            .map(|m| ClientMeta::new(m.clone()));
        let parent = Arc::downgrade(putter);
        let mut lock = putter.state.lock().unwrap();
        let id = lock.handlers.len();
        if let Some(target) = &element.target_uri {
            // Just a placeholder, never actually run.
            let handler = PutHandler::new_redirect(
                id,
                name,
                target.clone(),
                cm,
                parent,
            )?;
            lock.handlers.push(handler);
        } else {
            let data = element.data.clone().ok_or_else(|| {
                InsertError::internal(format!(
                    "element {name} has neither target nor data"
                ))
            })?;
            let handler =
                PutHandler::new_active(id, name, cm.clone(), parent);
            let size = data.size();
            // The inserter factory may call back synchronously, so
            // release the putter lock first.
            drop(lock);
            let block =
                InsertBlock::new(data, cm, Uri::empty_chk());
            let inserter = putter.ctx.inserter_factory.create(
                handler.clone(),
                block,
                false,
                putter.get_chk_only,
                true,
            )?;
            handler.attach_inserter(inserter);
            let mut lock = putter.state.lock().unwrap();
            lock.handlers.push(handler);
            lock.running.insert(id);
            lock.waiting_for_metadata.insert(id);
            lock.waiting_for_block_sets.insert(id);
            lock.number_of_files += 1;
            lock.total_size += size;
        }
        Ok(id)
    }

    /// Start every active leaf. A start failure cancels the rest and
    /// is returned. Trees with no active leaves move straight on to
    /// the manifest insert.
    pub fn start(self: &Arc<Self>) -> Result<(), InsertError> {
        let to_start: Vec<Arc<PutHandler>> = {
            let lock = self.state.lock().unwrap();
            lock.running
                .iter()
                .map(|id| lock.handlers[*id].clone())
                .collect()
        };
        for handler in to_start {
            if let Err(e) = handler.start() {
                self.cancel_and_finish();
                return Err(e);
            }
        }
        let all_inserted = {
            let lock = self.state.lock().unwrap();
            lock.running.is_empty() && !lock.inserted_all_files
        };
        if all_inserted {
            self.inserted_all_files();
        }
        self.maybe_got_all_metadata();
        Ok(())
    }

    /// The final URI of the manifest, once its insert has encoded.
    pub fn uri(&self) -> Option<Uri> {
        self.state.lock().unwrap().final_uri.clone()
    }

    /// Whether the putter has finished (successfully or not) or was
    /// cancelled.
    pub fn is_finished(&self) -> bool {
        let lock = self.state.lock().unwrap();
        lock.finished || lock.cancelled
    }

    /// Number of active files in the manifest.
    pub fn count_files(&self) -> u32 {
        self.state.lock().unwrap().number_of_files
    }

    /// Total size of the active files in the manifest.
    pub fn total_size(&self) -> u64 {
        self.state.lock().unwrap().total_size
    }

    /// Cancel everything still running and mark the putter finished.
    /// Idempotent; no client callback is invoked.
    pub fn cancel_and_finish(&self) {
        self.cancel_and_finish_inner();
    }

    /// Returns whether this call transitioned the putter to finished.
    fn cancel_and_finish_inner(&self) -> bool {
        let (transitioned, running, metadata_inserter) = {
            let mut lock = self.state.lock().unwrap();
            if lock.finished {
                (false, Vec::new(), None)
            } else {
                lock.finished = true;
                lock.cancelled = true;
                let running: Vec<Arc<PutHandler>> = lock
                    .running
                    .iter()
                    .map(|id| lock.handlers[*id].clone())
                    .collect();
                (true, running, lock.metadata_inserter.clone())
            }
        };
        for handler in running {
            handler.cancel();
        }
        if let Some(inserter) = metadata_inserter {
            inserter.cancel();
        }
        transitioned
    }

    fn fail(&self, e: InsertError) {
        tracing::debug!(%e, "manifest insert failed");
        if self.cancel_and_finish_inner() {
            self.cb.on_failure(e);
        }
    }

    fn complete(&self) {
        self.cb.on_success();
    }

    /// One leaf's inserter succeeded.
    pub(crate) fn leaf_succeeded(&self, id: usize) {
        {
            let mut lock = self.state.lock().unwrap();
            lock.running.remove(&id);
            if !lock.running.is_empty() {
                return;
            }
        }
        self.inserted_all_files();
    }

    fn inserted_all_files(&self) {
        tracing::debug!("inserted all files");
        let complete = {
            let mut lock = self.state.lock().unwrap();
            lock.inserted_all_files = true;
            if lock.finished || lock.cancelled {
                tracing::debug!("already finished or cancelled");
                false
            } else if !lock.inserted_manifest {
                tracing::debug!("haven't inserted manifest");
                false
            } else {
                lock.finished = true;
                true
            }
        };
        if complete {
            self.complete();
        }
    }

    /// One leaf has contributed its metadata bytes.
    pub(crate) fn leaf_got_metadata(self: &Arc<Self>, id: usize) {
        let start_manifest = {
            let mut lock = self.state.lock().unwrap();
            lock.waiting_for_metadata.remove(&id);
            Self::should_start_manifest(&mut lock)
        };
        if start_manifest {
            self.got_all_metadata();
        }
    }

    fn maybe_got_all_metadata(self: &Arc<Self>) {
        let start_manifest = {
            let mut lock = self.state.lock().unwrap();
            Self::should_start_manifest(&mut lock)
        };
        if start_manifest {
            self.got_all_metadata();
        }
    }

    fn should_start_manifest(lock: &mut PutterState) -> bool {
        if !lock.waiting_for_metadata.is_empty() {
            return false;
        }
        if lock.metadata_insert_started || lock.finished {
            return false;
        }
        lock.metadata_insert_started = true;
        true
    }

    /// Every leaf has metadata: pick the default document, build the
    /// redirection manifest and insert it.
    fn got_all_metadata(self: &Arc<Self>) {
        tracing::debug!("got all metadata");
        let mut entries = {
            let lock = self.state.lock().unwrap();
            match Self::names_to_meta(&lock.tree, &lock.handlers) {
                Ok(entries) => entries,
                Err(e) => {
                    drop(lock);
                    self.fail(e);
                    return;
                }
            }
        };

        if let Some(default_name) = &self.default_name {
            match entries.get(default_name) {
                Some(MetaNode::Inline(meta)) => {
                    let meta = meta.clone();
                    entries.insert(String::new(), MetaNode::Inline(meta));
                }
                _ => {
                    self.fail(InsertError::invalid_uri(format!(
                        "default name {default_name} does not exist"
                    )));
                    return;
                }
            }
        } else {
            for name in DEFAULT_DEFAULT_NAMES {
                if let Some(MetaNode::Inline(meta)) = entries.get(*name) {
                    let meta = meta.clone();
                    entries.insert(String::new(), MetaNode::Inline(meta));
                    break;
                }
            }
            // No hit is acceptable: no synthetic default.
        }

        let meta = Metadata::redirection_manifest_with_metadata(entries);
        let meta_bytes = match meta.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let bucket = match self
            .ctx
            .bucket_factory
            .make_immutable_bucket(meta_bytes)
        {
            Ok(bucket) => bucket,
            Err(e) => {
                self.fail(InsertError::bucket(e));
                return;
            }
        };
        let block = InsertBlock::new(bucket, None, self.target.clone());
        let cb: DynPutCompletionCallback = self.clone();
        let inserter = match self.ctx.inserter_factory.create(
            cb,
            block,
            true,
            self.get_chk_only,
            false,
        ) {
            Ok(inserter) => inserter,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        {
            let mut lock = self.state.lock().unwrap();
            lock.current_metadata_inserter = Some(inserter.state_id());
            lock.metadata_inserter = Some(inserter.clone());
        }
        if let Err(e) = inserter.start() {
            self.fail(e);
        }
    }

    fn names_to_meta(
        tree: &BTreeMap<String, PutNode>,
        handlers: &[Arc<PutHandler>],
    ) -> Result<BTreeMap<String, MetaNode>, InsertError> {
        let mut out = BTreeMap::new();
        for (name, node) in tree {
            match node {
                PutNode::Leaf(id) => {
                    let meta: Bytes = handlers[*id]
                        .metadata()
                        .ok_or_else(|| {
                            InsertError::internal(format!(
                                "handler {name} has no metadata"
                            ))
                        })?;
                    out.insert(name.clone(), MetaNode::Inline(meta));
                }
                PutNode::Dir(sub) => {
                    out.insert(
                        name.clone(),
                        MetaNode::Dir(Self::names_to_meta(
                            sub, handlers,
                        )?),
                    );
                }
            }
        }
        Ok(out)
    }

    /// One leaf's block set is final.
    pub(crate) fn leaf_block_set_finished(&self, id: usize) {
        {
            let mut lock = self.state.lock().unwrap();
            lock.waiting_for_block_sets.remove(&id);
            if !lock.waiting_for_block_sets.is_empty() {
                return;
            }
        }
        self.block_set_finalized();
    }

    /// Forward "block set finalized" once every leaf block-set AND
    /// the metadata block-set are final.
    fn block_set_finalized(&self) {
        let fire = {
            let mut lock = self.state.lock().unwrap();
            if !lock.metadata_block_set_finalized {
                return;
            }
            if !lock.waiting_for_block_sets.is_empty() {
                return;
            }
            if lock.block_set_forwarded {
                return;
            }
            lock.block_set_forwarded = true;
            true
        };
        if fire {
            self.progress.lock().unwrap().block_set_finalized = true;
            self.notify_clients();
        }
    }

    fn notify_clients(&self) {
        let event = self.progress.lock().unwrap().snapshot();
        self.ctx.event_producer.produce(event);
    }

    pub(crate) fn fail_from_child(&self, e: InsertError) {
        self.fail(e);
    }
}

/// The putter is the completion callback of its own manifest
/// inserter.
impl PutCompletionCallback for ManifestPutter {
    fn on_success(&self, _state: &dyn PutState) {
        tracing::debug!("inserted manifest successfully");
        let complete = {
            let mut lock = self.state.lock().unwrap();
            lock.inserted_manifest = true;
            if lock.finished || lock.cancelled {
                tracing::debug!("already finished");
                false
            } else if !lock.inserted_all_files {
                tracing::debug!("not inserted all files");
                false
            } else {
                lock.finished = true;
                true
            }
        };
        if complete {
            self.complete();
        }
    }

    fn on_failure(&self, e: InsertError, _state: &dyn PutState) {
        self.fail(e);
    }

    fn on_encode(&self, key: ClientKey, _state: &dyn PutState) {
        let uri = key.uri();
        {
            let mut lock = self.state.lock().unwrap();
            if lock.final_uri.is_some() {
                tracing::error!(%uri, "manifest URI already generated");
                return;
            }
            lock.final_uri = Some(uri.clone());
        }
        tracing::debug!(%uri, "got metadata key");
        self.cb.on_generated_uri(&uri);
    }

    fn on_metadata(
        &self,
        _meta: Metadata,
        _state: Option<&dyn PutState>,
    ) {
        // The manifest inserter must produce a URI, never inline
        // metadata.
        tracing::error!("got metadata at the manifest level");
        self.fail(InsertError::internal(
            "metadata inserter returned metadata",
        ));
    }

    fn on_transition(&self, old: &dyn PutState, new: DynPutState) {
        let mut lock = self.state.lock().unwrap();
        if lock.current_metadata_inserter == Some(old.state_id()) {
            lock.current_metadata_inserter = Some(new.state_id());
        } else {
            tracing::error!(
                current = ?lock.current_metadata_inserter,
                old = ?old.state_id(),
                new = ?new.state_id(),
                "transition from an unexpected state",
            );
        }
    }

    fn on_block_set_finished(&self, _state: &dyn PutState) {
        {
            let mut lock = self.state.lock().unwrap();
            lock.metadata_block_set_finalized = true;
            if !lock.waiting_for_block_sets.is_empty() {
                return;
            }
        }
        self.block_set_finalized();
    }

    fn add_block(&self) {
        self.progress.lock().unwrap().total += 1;
    }

    fn add_blocks(&self, num: u32) {
        self.progress.lock().unwrap().total += num;
    }

    fn completed_block(&self, dont_notify: bool) {
        self.progress.lock().unwrap().successful += 1;
        if !dont_notify {
            self.notify_clients();
        }
    }

    fn failed_block(&self) {
        self.progress.lock().unwrap().failed += 1;
        self.notify_clients();
    }

    fn fatally_failed_block(&self) {
        self.progress.lock().unwrap().fatally_failed += 1;
        self.notify_clients();
    }

    fn add_must_succeed_blocks(&self, blocks: u32) {
        self.progress.lock().unwrap().min_success += blocks;
    }
}
