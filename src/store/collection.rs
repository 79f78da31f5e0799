use log::{debug, info};
use serde_json::{Map, Value};

use std::{
    collections::BTreeMap,
    ffi, fmt, result,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use crate::{
    index::{self, Catalog, IndexSpec, Key, Tree},
    store::{
        to_record_length, DataFile, Extent, Op, Record, RecordLoc, EXTENT_HEADER_SIZE,
        MAX_DOC_SIZE, PAGE_SIZE,
    },
    util, Config, Error, Result,
};

/// Record layout of a collection. Guarded by the collection's storage lock,
/// writers hold it exclusively, readers share it.
pub struct Storage {
    extents: Vec<Arc<RwLock<Extent>>>,
    // record seqno to its location, in insert order.
    seqnos: BTreeMap<u64, RecordLoc>,
    next_seqno: u64,
    size: u64,
}

impl Storage {
    fn new() -> Storage {
        Storage {
            extents: vec![],
            seqnos: BTreeMap::new(),
            next_seqno: 1,
            size: 0,
        }
    }

    /// Snapshot of the extent list, extents are locked individually.
    pub fn to_extents(&self) -> Vec<Arc<RwLock<Extent>>> {
        self.extents.clone()
    }

    pub fn len_extents(&self) -> usize {
        self.extents.len()
    }

    pub fn len_records(&self) -> usize {
        self.seqnos.len()
    }

    /// Sum of extent lengths.
    pub fn to_storage_size(&self) -> u64 {
        self.size
    }

    /// Seqno of the latest record, ZERO for an empty collection.
    pub fn to_last_seqno(&self) -> u64 {
        self.seqnos.keys().next_back().copied().unwrap_or(0)
    }

    pub fn to_record(&self, loc: RecordLoc) -> Result<Option<Record>> {
        match self.extents.get(loc.extent) {
            Some(extent) => Ok(err_at!(Fatal, extent.read())?.get(loc.ofs).cloned()),
            None => Ok(None),
        }
    }

    /// Return up to `limit` records, in seqno order, whose seqno is larger
    /// than `cursor`.
    pub fn to_records_after(&self, cursor: u64, limit: usize) -> Result<Vec<(RecordLoc, Record)>> {
        let mut records = vec![];
        for (seqno, loc) in self.seqnos.range((cursor + 1)..).take(limit) {
            match self.to_record(*loc)? {
                Some(record) => records.push((*loc, record)),
                None => err_at!(Fatal, msg: "missing record {} at {:?}", seqno, loc)?,
            }
        }
        Ok(records)
    }

    fn alloc(&self, length: usize) -> Result<Option<(RecordLoc, usize)>> {
        for (num, extent) in self.extents.iter().enumerate() {
            if let Some((ofs, n)) = err_at!(Fatal, extent.write())?.alloc(length) {
                return Ok(Some((RecordLoc::new(num, ofs), n)));
            }
        }
        Ok(None)
    }

    fn add_extent(&mut self, length: usize) {
        let num = self.extents.len();
        self.extents.push(Arc::new(RwLock::new(Extent::new(num, length))));
        self.size += length as u64;
    }

    fn to_max_body(&self) -> usize {
        let extents = self.extents.iter().filter_map(|e| e.read().ok());
        extents
            .map(|e| e.to_length() - EXTENT_HEADER_SIZE)
            .max()
            .unwrap_or(0)
    }
}

/// Collection of JSON documents, stored as records in extents and indexed
/// by one or more btree indexes.
pub struct Collection {
    name: String,
    config: Config,
    capped: Option<u64>,

    storage: RwLock<Storage>,
    catalog: Catalog,
    data_file: Mutex<Option<DataFile>>,

    dropped: AtomicBool,
    killed: Arc<AtomicBool>,
    // reason and the operations yet to be persisted.
    blocked: Mutex<Option<(String, Vec<Op>)>>,
    #[cfg(test)]
    fail_appends: AtomicBool,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "collection<{}>", self.name)
    }
}

impl Collection {
    fn new(
        config: &Config,
        name: &str,
        capped: Option<u64>,
        data_file: DataFile,
        killed: Arc<AtomicBool>,
    ) -> Collection {
        let mut storage = Storage::new();
        if let Some(cap) = capped {
            let cap = cap as usize;
            while storage.size < (cap as u64) {
                let n = storage.len_extents();
                let remaining = util::round_up(cap - (storage.size as usize), PAGE_SIZE);
                let length = usize::min(config.to_extent_size(n), remaining);
                storage.add_extent(usize::max(length, PAGE_SIZE));
            }
        }

        Collection {
            name: name.to_string(),
            config: config.clone(),
            capped,

            storage: RwLock::new(storage),
            catalog: Catalog::new(),
            data_file: Mutex::new(Some(data_file)),

            dropped: AtomicBool::new(false),
            killed,
            blocked: Mutex::new(None),
            #[cfg(test)]
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Create a new collection, `capped` is the collection's size limit in
    /// bytes. Its data file is created under `config.dir`.
    pub fn create(
        config: &Config,
        name: &str,
        capped: Option<u64>,
        killed: Arc<AtomicBool>,
    ) -> Result<Collection> {
        if let Some(0) = capped {
            err_at!(InvalidInput, msg: "capped size must be larger than ZERO")?
        }

        let location = Collection::to_location(config, name)?;
        let mut df = DataFile::create(&location, config.fsync)?;
        df.append(Op::Create { capped })?;

        let coll = Collection::new(config, name, capped, df, killed);
        info!(target: "storage", "{}, created capped:{:?}", coll, capped);
        Ok(coll)
    }

    /// Load a collection by replaying its data file. Pages of a freshly
    /// loaded collection are not resident.
    pub fn load(config: &Config, name: &str, killed: Arc<AtomicBool>) -> Result<Collection> {
        let location = Collection::to_location(config, name)?;
        let (df, ops) = DataFile::open(&location, config.fsync)?;

        let mut ops = ops.into_iter();
        let capped = match ops.next() {
            Some(Op::Create { capped }) => capped,
            _ => err_at!(InvalidFile, msg: "{:?} missing create op", location)?,
        };

        let coll = Collection::new(config, name, capped, df, killed);
        {
            let mut storage = coll.write_storage()?;
            for op in ops {
                coll.replay_op(&mut storage, op)?;
            }
        }
        coll.evict_pages()?;

        info!(
            target: "storage",
            "{}, loaded {} records in {} extents",
            coll,
            coll.len()?,
            coll.read_storage()?.len_extents()
        );
        Ok(coll)
    }

    fn replay_op(&self, storage: &mut Storage, op: Op) -> Result<()> {
        match op {
            Op::Create { .. } => err_at!(InvalidFile, msg: "{} duplicate create op", self)?,
            Op::Insert { seqno, doc } => {
                let bson_size = doc.len();
                let doc: Value = err_at!(InvalidFile, serde_json::from_slice(&doc))?;
                storage.next_seqno = u64::max(storage.next_seqno, seqno + 1);
                self.apply_insert(storage, seqno, Arc::new(doc), bson_size)?;
            }
            Op::Remove { seqno } => {
                self.apply_remove(storage, seqno)?;
            }
            Op::CreateIndex { spec } => {
                let spec: Value = err_at!(InvalidFile, serde_json::from_slice(&spec))?;
                let spec = IndexSpec::from_json(&spec)?;
                let tree = self.to_full_index(storage, spec)?;
                self.catalog.add_index(tree)?;
            }
            Op::DropIndex { name } => {
                self.catalog.drop_index(&name)?;
            }
        }
        Ok(())
    }

    fn to_location(config: &Config, name: &str) -> Result<ffi::OsString> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name.chars().all(|c| c.is_alphanumeric() || "._-$".contains(c));
        if !valid {
            err_at!(InvalidInput, msg: "invalid collection name {:?}", name)?
        }

        let mut loc = std::path::PathBuf::from(&config.dir);
        loc.push(format!("{}.data", name));
        Ok(loc.into_os_string())
    }

    /// Read lock on the record layout. Writers are blocked while the guard
    /// is held.
    pub fn read_storage(&self) -> Result<RwLockReadGuard<Storage>> {
        err_at!(Fatal, self.storage.read())
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<Storage>> {
        err_at!(Fatal, self.storage.write())
    }
}

impl Collection {
    /// Insert a document, which must be a JSON object. Documents without
    /// an `_id` field get the record's seqno as their `_id`. Return the
    /// record seqno.
    pub fn insert(&self, doc: Value) -> Result<u64> {
        self.check_alive()?;

        let mut storage = self.write_storage()?;
        let seqno = storage.next_seqno;

        let doc = with_id(doc, seqno)?;
        let data = err_at!(FailConvert, serde_json::to_vec(&doc))?;
        if data.len() > MAX_DOC_SIZE {
            err_at!(InvalidInput, msg: "document too large {} > {}", data.len(), MAX_DOC_SIZE)?
        }
        if self.capped.is_some() && to_record_length(data.len()) > storage.to_max_body() {
            err_at!(InvalidInput, msg: "document too large for capped collection {}", self)?
        }

        // validate keys for all ready indexes before the insert is durable.
        for tree in self.catalog.to_indexes()?.iter() {
            let spec = tree.as_spec();
            let key = spec.to_key(&doc)?;
            if spec.is_unique() && !tree.find(&key)?.is_empty() {
                return Err(index::duplicate_key(spec, &key, &doc["_id"]));
            }
        }

        let bson_size = data.len();
        self.append_op(Op::Insert { seqno, doc: data })?;
        storage.next_seqno = seqno + 1;
        self.apply_insert(&mut storage, seqno, Arc::new(doc), bson_size)?;

        Ok(seqno)
    }

    /// Remove the record identified by `seqno`. Return false if there is no
    /// such record.
    pub fn remove(&self, seqno: u64) -> Result<bool> {
        self.check_alive()?;

        let mut storage = self.write_storage()?;
        if !storage.seqnos.contains_key(&seqno) {
            return Ok(false);
        }
        self.append_op(Op::Remove { seqno })?;
        Ok(self.apply_remove(&mut storage, seqno)?.is_some())
    }

    fn apply_insert(
        &self,
        storage: &mut Storage,
        seqno: u64,
        doc: Arc<Value>,
        bson_size: usize,
    ) -> Result<RecordLoc> {
        let length = to_record_length(bson_size);

        let (loc, length) = loop {
            match storage.alloc(length)? {
                Some(item) => break item,
                None if self.capped.is_some() => {
                    let oldest = storage.seqnos.keys().next().copied();
                    match oldest {
                        Some(oldest) => self.apply_remove(storage, oldest)?,
                        None => err_at!(InvalidInput, msg: "{} record too large {}", self, length)?,
                    };
                }
                None => {
                    let n = storage.len_extents();
                    let size = usize::max(
                        self.config.to_extent_size(n),
                        util::round_up(EXTENT_HEADER_SIZE + length, PAGE_SIZE),
                    );
                    storage.add_extent(size);
                    debug!(target: "storage", "{}, new extent {} size {}", self, n, size);
                }
            }
        };

        let record = Record {
            seqno,
            length,
            bson_size,
            doc: Arc::clone(&doc),
        };
        match storage.extents.get(loc.extent) {
            Some(extent) => err_at!(Fatal, extent.write())?.insert(loc.ofs, record),
            None => err_at!(Fatal, msg: "{} missing extent {}", self, loc.extent)?,
        }
        storage.seqnos.insert(seqno, loc);

        for tree in self.catalog.to_indexes()?.iter() {
            tree.insert(tree.as_spec().to_key(&doc)?, loc)?;
        }
        for build in self.catalog.to_pending()?.iter() {
            if seqno <= build.to_cursor() {
                let res = build.as_spec().to_key(&doc).and_then(|key| {
                    let res = build.as_tree().insert(key.clone(), loc);
                    res.map_err(|err| match err {
                        Error::Conflict(_, _) => index::duplicate_key(build.as_spec(), &key, &doc["_id"]),
                        err => err,
                    })
                });
                if let Err(err) = res {
                    build.set_failure(err);
                }
            }
        }

        Ok(loc)
    }

    fn apply_remove(&self, storage: &mut Storage, seqno: u64) -> Result<Option<Record>> {
        let loc = match storage.seqnos.remove(&seqno) {
            Some(loc) => loc,
            None => return Ok(None),
        };
        let record = match storage.extents.get(loc.extent) {
            Some(extent) => err_at!(Fatal, extent.write())?.remove(loc.ofs),
            None => None,
        };
        let record = match record {
            Some(record) => record,
            None => err_at!(Fatal, msg: "{} missing record {} at {:?}", self, seqno, loc)?,
        };

        for tree in self.catalog.to_indexes()?.iter() {
            if let Ok(key) = tree.as_spec().to_key(&record.doc) {
                tree.remove(&key, loc)?;
            }
        }
        for build in self.catalog.to_pending()?.iter() {
            if seqno <= build.to_cursor() {
                if let Ok(key) = build.as_spec().to_key(&record.doc) {
                    build.as_tree().remove(&key, loc)?;
                }
            }
        }

        Ok(Some(record))
    }

    /// Index all records in `storage` into a new tree for `spec`.
    pub(crate) fn to_full_index(&self, storage: &Storage, spec: IndexSpec) -> Result<Arc<Tree>> {
        let tree = Arc::new(Tree::new(spec));
        for (_, loc) in storage.seqnos.iter() {
            if let Some(record) = storage.to_record(*loc)? {
                let spec = tree.as_spec();
                let key = spec.to_key(&record.doc)?;
                match tree.insert(key.clone(), *loc) {
                    Err(Error::Conflict(_, _)) => {
                        return Err(index::duplicate_key(spec, &key, &record.doc["_id"]))
                    }
                    res => res?,
                }
            }
        }
        Ok(tree)
    }

    /// Build and persist an index whose build committed but did not reach
    /// the data file. Return false if the index is already present. When
    /// the data file cannot be written, the index is left in the catalog
    /// and index operations are blocked.
    pub(crate) fn finalize_index(&self, spec: IndexSpec) -> Result<bool> {
        self.check_alive()?;

        let storage = self.write_storage()?;
        if self.catalog.to_index(spec.as_name())?.is_some() {
            return Ok(false);
        }

        let data = err_at!(FailConvert, serde_json::to_vec(&spec.to_json()))?;
        let tree = self.to_full_index(&storage, spec)?;
        self.catalog.add_index(tree)?;

        let op = Op::CreateIndex { spec: data };
        if let Err(err) = self.append_op(op.clone()) {
            self.set_blocked(err.to_errmsg(), op)?;
            return Err(err);
        }
        Ok(true)
    }

    /// Append an operation to the collection's data file.
    pub(crate) fn append_op(&self, op: Op) -> Result<usize> {
        if self.killed.load(SeqCst) {
            err_at!(Aborted, msg: "{} database is shut down", self)?
        }
        #[cfg(test)]
        {
            if self.fail_appends.load(SeqCst) {
                err_at!(IOError, msg: "{} injected write failure", self)?
            }
        }

        match err_at!(Fatal, self.data_file.lock())?.as_mut() {
            Some(df) => df.append(op),
            None => err_at!(NotFound, msg: "{} is dropped", self),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.killed.load(SeqCst) {
            err_at!(Aborted, msg: "{} database is shut down", self)
        } else if self.dropped.load(SeqCst) {
            err_at!(NotFound, msg: "{} is dropped", self)
        } else {
            Ok(())
        }
    }
}

impl Collection {
    /// All documents in insert order.
    pub fn scan(&self) -> Result<Vec<Value>> {
        self.check_alive()?;

        let storage = self.read_storage()?;
        let mut docs = vec![];
        for (_, record) in storage.to_records_after(0, usize::MAX)? {
            docs.push(record.doc.as_ref().clone());
        }
        Ok(docs)
    }

    /// Documents whose key, in the ready index `index_name`, matches
    /// `values`, one value per field in the index's key pattern.
    pub fn find(&self, index_name: &str, values: &[Value]) -> Result<Vec<Value>> {
        self.check_alive()?;

        let tree = match self.catalog.to_index(index_name)? {
            Some(tree) => tree,
            None => err_at!(NotFound, msg: "index {} does not exist in {}", index_name, self)?,
        };
        let key: Key = tree.as_spec().to_key_from_values(values)?;

        let storage = self.read_storage()?;
        let mut docs = vec![];
        for loc in tree.find(&key)?.into_iter() {
            match storage.to_record(loc)? {
                Some(record) => docs.push(record.doc.as_ref().clone()),
                None => err_at!(Fatal, msg: "{} dangling index entry {:?}", self, loc)?,
            }
        }
        Ok(docs)
    }

    /// Number of records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_storage()?.len_records())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of all extent lengths.
    pub fn storage_size(&self) -> Result<u64> {
        Ok(self.read_storage()?.to_storage_size())
    }

    /// Snapshot of the extent list, extents are locked individually.
    pub fn to_extents(&self) -> Result<Vec<Arc<RwLock<Extent>>>> {
        Ok(self.read_storage()?.to_extents())
    }

    /// Drop all pages of this collection from memory.
    pub fn evict_pages(&self) -> Result<()> {
        for extent in self.to_extents()?.iter() {
            err_at!(Fatal, extent.read())?.evict_pages();
        }
        Ok(())
    }
}

impl Collection {
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    pub fn is_capped(&self) -> bool {
        self.capped.is_some()
    }

    pub fn to_capped(&self) -> Option<u64> {
        self.capped
    }

    pub fn as_catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Namespace of the store backing index `index_name`.
    pub fn to_storage_ns(&self, index_name: &str) -> String {
        format!("{}.${}", self.name, index_name)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(SeqCst)
    }

    /// Block index operations on this collection, after `op` failed to
    /// persist and left the catalog ahead of the data file.
    pub(crate) fn set_blocked(&self, reason: String, op: Op) -> Result<()> {
        let mut blocked = err_at!(Fatal, self.blocked.lock())?;
        match blocked.as_mut() {
            Some((_, ops)) => ops.push(op),
            None => *blocked = Some((reason, vec![op])),
        }
        Ok(())
    }

    /// Return an error if index operations are blocked.
    pub fn check_blocked(&self) -> Result<()> {
        match err_at!(Fatal, self.blocked.lock())?.as_ref() {
            Some((reason, _)) => err_at!(IOError, msg: "{} is blocked: {}", self, reason),
            None => Ok(()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.check_blocked().is_err()
    }

    /// Retry the operations that failed to persist and unblock index
    /// operations.
    pub fn resolve_blocked(&self) -> Result<()> {
        let _storage = self.read_storage()?;
        let mut blocked = err_at!(Fatal, self.blocked.lock())?;

        let n = match blocked.take() {
            Some((reason, ops)) => {
                let n = ops.len();
                for (i, op) in ops.iter().enumerate() {
                    if let Err(err) = self.append_op(op.clone()) {
                        *blocked = Some((reason, ops[i..].to_vec()));
                        return Err(err);
                    }
                }
                n
            }
            None => 0,
        };

        info!(target: "storage", "{}, unblocked after persisting {} ops", self, n);
        Ok(())
    }

    /// Drop an index. Index builds in progress for `name` are cancelled.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.check_alive()?;
        self.check_blocked()?;

        // builds hold the storage lock across a batch and across commit.
        let _storage = self.write_storage()?;
        if let Some(build) = self.catalog.to_pending_index(name)? {
            build.cancel();
            self.catalog.remove_pending(build.to_build_id())?;
            info!(target: "storage", "{}, cancelled index build {}", self, name);
            return Ok(());
        }

        match self.catalog.to_index(name)? {
            Some(_) if name == index::ID_INDEX_NAME => {
                err_at!(InvalidInput, msg: "cannot drop {} index", name)?
            }
            Some(_) => {
                self.append_op(Op::DropIndex {
                    name: name.to_string(),
                })?;
                self.catalog.drop_index(name)?;
                info!(target: "storage", "{}, dropped index {}", self, name);
                Ok(())
            }
            None => err_at!(NotFound, msg: "index {} does not exist in {}", name, self),
        }
    }

    /// Mark this collection as dropped, cancel its index builds and remove
    /// its data file.
    pub(crate) fn purge(&self) -> Result<()> {
        let _storage = self.write_storage()?;
        self.dropped.store(true, SeqCst);
        for build in self.catalog.to_pending()?.iter() {
            build.cancel();
        }
        match err_at!(Fatal, self.data_file.lock())?.take() {
            Some(df) => df.purge(),
            None => Ok(()),
        }
    }
}

// documents are JSON objects, `_id` is the first field.
fn with_id(doc: Value, seqno: u64) -> Result<Value> {
    match doc {
        Value::Object(map) if map.contains_key("_id") => Ok(Value::Object(map)),
        Value::Object(map) => {
            let mut obj = Map::new();
            obj.insert("_id".to_string(), Value::from(seqno));
            obj.extend(map.into_iter());
            Ok(Value::Object(obj))
        }
        doc => err_at!(InvalidInput, msg: "document must be an object, got {}", doc),
    }
}

#[cfg(test)]
#[path = "collection_test.rs"]
mod collection_test;
