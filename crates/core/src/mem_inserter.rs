//! In-memory single-file inserter.
//!
//! Turns one insert block into a synthetic content-hash key and
//! reports back through the parent callback, synchronously inside
//! `start()`. The key derivation is the identity derivation of
//! [synthetic_routing_key]; real deployments supply a cryptographic
//! inserter instead.
//!
//! Data no larger than the factory's inline threshold takes the
//! inline-metadata path when `report_metadata_only` is set: the
//! parent gets `on_metadata` instead of `on_encode`.

use std::sync::{Arc, Mutex};
use warren_api::*;

/// Factory state controlling failure injection.
#[derive(Debug, Default)]
struct FactoryState {
    fail_create: Option<InsertError>,
    fail_start: Option<InsertError>,
    created: u32,
}

/// A factory for [MemSingleFileInserter]s.
#[derive(Debug)]
pub struct MemInserterFactory {
    inline_threshold: usize,
    state: Mutex<FactoryState>,
}

impl MemInserterFactory {
    /// Construct a new MemInserterFactory with the default inline
    /// threshold of 32 bytes.
    pub fn create() -> Arc<Self> {
        Self::create_with_threshold(32)
    }

    /// Construct a new MemInserterFactory with the given inline
    /// threshold.
    pub fn create_with_threshold(inline_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            inline_threshold,
            state: Mutex::new(FactoryState::default()),
        })
    }

    /// Fail the next `create` call with the given error.
    pub fn fail_next_create(&self, e: InsertError) {
        self.state.lock().unwrap().fail_create = Some(e);
    }

    /// Make the next started inserter report `on_failure` instead of
    /// completing.
    pub fn fail_next_start(&self, e: InsertError) {
        self.state.lock().unwrap().fail_start = Some(e);
    }

    /// How many inserters this factory has created.
    pub fn created(&self) -> u32 {
        self.state.lock().unwrap().created
    }
}

impl SingleFileInserterFactory for MemInserterFactory {
    fn create(
        &self,
        cb: DynPutCompletionCallback,
        block: InsertBlock,
        is_metadata: bool,
        get_chk_only: bool,
        report_metadata_only: bool,
    ) -> Result<DynSingleFileInserter, InsertError> {
        let (fail_start, fail_create) = {
            let mut lock = self.state.lock().unwrap();
            lock.created += 1;
            (lock.fail_start.take(), lock.fail_create.take())
        };
        if let Some(e) = fail_create {
            return Err(e);
        }
        Ok(Arc::new(MemSingleFileInserter {
            state_id: PutStateId::next(),
            cb,
            block,
            is_metadata,
            get_chk_only,
            report_metadata_only,
            inline_threshold: self.inline_threshold,
            fail_start,
            state: Mutex::new(InserterState {
                started: false,
                cancelled: false,
            }),
        }))
    }
}

#[derive(Debug)]
struct InserterState {
    started: bool,
    cancelled: bool,
}

/// One in-memory single-file insert.
#[derive(Debug)]
pub struct MemSingleFileInserter {
    state_id: PutStateId,
    cb: DynPutCompletionCallback,
    block: InsertBlock,
    is_metadata: bool,
    get_chk_only: bool,
    report_metadata_only: bool,
    inline_threshold: usize,
    fail_start: Option<InsertError>,
    state: Mutex<InserterState>,
}

impl MemSingleFileInserter {
    /// Whether this inserter was created for a metadata block.
    pub fn is_metadata(&self) -> bool {
        self.is_metadata
    }

    /// Whether this inserter computes keys without network inserts.
    pub fn get_chk_only(&self) -> bool {
        self.get_chk_only
    }
}

impl PutState for MemSingleFileInserter {
    fn state_id(&self) -> PutStateId {
        self.state_id
    }
}

impl SingleFileInserter for MemSingleFileInserter {
    fn start(self: Arc<Self>) -> Result<(), InsertError> {
        {
            let mut lock = self.state.lock().unwrap();
            if lock.started {
                return Err(InsertError::internal(
                    "inserter started twice",
                ));
            }
            lock.started = true;
            if lock.cancelled {
                return Ok(());
            }
        }
        if let Some(e) = &self.fail_start {
            self.cb.on_failure(e.clone(), &*self);
            return Ok(());
        }
        let data = self
            .block
            .data
            .read()
            .map_err(|e| InsertError::child(format!("read bucket: {e}")))?;
        let key = ClientKey::chk(synthetic_routing_key(&data).0 .0);

        self.cb.add_block();
        self.cb.on_block_set_finished(&*self);

        if self.report_metadata_only
            && data.len() <= self.inline_threshold
        {
            // Small data: deliver metadata directly instead of a URI.
            let meta = Metadata::simple_redirect(
                key.uri(),
                self.block.meta.as_ref().map(|m| m.mime.clone()),
            );
            self.cb.on_metadata(meta, Some(&*self as &dyn PutState));
        } else {
            self.cb.on_encode(key, &*self);
        }

        self.cb.completed_block(false);
        self.cb.on_success(&*self);
        Ok(())
    }

    fn cancel(&self) {
        self.state.lock().unwrap().cancelled = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem_bucket::MemBucket;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, e: impl Into<String>) {
            self.events.lock().unwrap().push(e.into());
        }
    }

    impl PutCompletionCallback for Recorder {
        fn on_success(&self, _state: &dyn PutState) {
            self.push("success");
        }

        fn on_failure(&self, e: InsertError, _state: &dyn PutState) {
            self.push(format!("failure:{e}"));
        }

        fn on_encode(&self, key: ClientKey, _state: &dyn PutState) {
            self.push(format!("encode:{}", key.uri()));
        }

        fn on_metadata(
            &self,
            _meta: Metadata,
            _state: Option<&dyn PutState>,
        ) {
            self.push("metadata");
        }

        fn on_transition(&self, _old: &dyn PutState, _new: DynPutState) {
            self.push("transition");
        }

        fn on_block_set_finished(&self, _state: &dyn PutState) {
            self.push("block_set_finished");
        }

        fn add_block(&self) {}

        fn add_blocks(&self, _num: u32) {}

        fn completed_block(&self, _dont_notify: bool) {}

        fn failed_block(&self) {}

        fn fatally_failed_block(&self) {}

        fn add_must_succeed_blocks(&self, _blocks: u32) {}
    }

    fn make(
        factory: &Arc<MemInserterFactory>,
        data: &'static [u8],
        report_metadata_only: bool,
    ) -> (Arc<Recorder>, DynSingleFileInserter) {
        let rec = Arc::new(Recorder::default());
        let block = InsertBlock::new(
            MemBucket::new(data),
            None,
            Uri::empty_chk(),
        );
        let inserter = factory
            .create(rec.clone(), block, false, false, report_metadata_only)
            .unwrap();
        (rec, inserter)
    }

    #[test]
    fn large_data_reports_uri() {
        let factory = MemInserterFactory::create_with_threshold(4);
        let (rec, inserter) = make(&factory, b"large enough data", true);
        inserter.start().unwrap();
        let events = rec.events();
        assert!(events.iter().any(|e| e.starts_with("encode:CHK@")));
        assert_eq!(Some(&"success".to_string()), events.last());
    }

    #[test]
    fn small_data_reports_inline_metadata() {
        let factory = MemInserterFactory::create_with_threshold(64);
        let (rec, inserter) = make(&factory, b"tiny", true);
        inserter.start().unwrap();
        let events = rec.events();
        assert!(events.contains(&"metadata".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("encode:")));
    }

    #[test]
    fn start_twice_is_an_error() {
        let factory = MemInserterFactory::create();
        let (_rec, inserter) = make(&factory, b"data", false);
        inserter.clone().start().unwrap();
        inserter.start().unwrap_err();
    }

    #[test]
    fn cancelled_inserter_stays_silent() {
        let factory = MemInserterFactory::create();
        let (rec, inserter) = make(&factory, b"data", false);
        inserter.cancel();
        inserter.start().unwrap();
        assert!(rec.events().is_empty());
    }

    #[test]
    fn injected_start_failure() {
        let factory = MemInserterFactory::create();
        factory.fail_next_start(InsertError::internal("boom"));
        let (rec, inserter) = make(&factory, b"data", false);
        inserter.start().unwrap();
        assert!(rec.events()[0].starts_with("failure:"));
    }
}
