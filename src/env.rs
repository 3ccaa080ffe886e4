//! The environment: one data file (or memory region) hosting multiple
//! named databases behind a descriptor table in the header page.

use std::{
    collections::HashMap,
    io::Read,
    path::Path,
    sync::{Arc, RwLock},
};

use log::{debug, info, warn};

use crate::{
    blob::MemBlobStore,
    btree,
    config::{DbParams, EnvConfig, EnvParams, MAX_PAGE_SIZE, MIN_PAGE_SIZE},
    db::{self, Database, DbState, KeyType},
    device::Device,
    error::Error,
    flags::{DbFlags, EnvFlags, TxnFlags},
    io::{get_u16, get_u32, get_u64, set_u16, set_u32, set_u64},
    page::{Page, PageType, PAGE_HEADER_SIZE},
    page_manager::{BlobSpace, FetchMode, PageManager},
    record::Record,
    txn::{Transaction, TxnOpKind},
    types::{DbResult, Pod, Result},
    utils::{is_power_of_two, HandyRwLock},
    wal::Wal,
};

/// File magic at the start of the header page payload.
pub(crate) const MAGIC: [u8; 4] = *b"HAM\0";

/// Semantic on-disk version; unknown versions are rejected, never migrated.
pub(crate) const FILE_VERSION: [u8; 4] = [2, 0, 0, 1];

/// Fixed part of the header page payload before the descriptor table.
pub(crate) const ENV_HEADER_FIXED_SIZE: usize = 20;

pub(crate) const DESCRIPTOR_SIZE: usize = 32;

/// One database descriptor inside the header page. `name == 0` marks a
/// free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub name: u16,
    pub flags: u32,
    pub max_keys: u32,
    pub key_size: u32,
    pub root_address: u64,
    pub key_type: u32,
    /// Stored in the descriptor's opaque word.
    pub record_size: u32,
}

impl Descriptor {
    fn empty() -> Self {
        Self {
            name: 0,
            flags: 0,
            max_keys: 0,
            key_size: 0,
            root_address: 0,
            key_type: 0,
            record_size: 0,
        }
    }
}

/// Parsed view of the header page.
pub(crate) struct HeaderState {
    pub serialno: u32,
    pub max_databases: u16,
    pub descriptors: Vec<Descriptor>,
}

impl HeaderState {
    fn new(max_databases: u16) -> Self {
        Self {
            serialno: 0,
            max_databases,
            descriptors: vec![Descriptor::empty(); max_databases as usize],
        }
    }

    fn parse(payload: &[u8]) -> Result<Self> {
        if payload[0..4] != MAGIC {
            return Err(Error::InvFileHeader);
        }
        if payload[4..8] != FILE_VERSION {
            return Err(Error::InvFileVersion);
        }
        let serialno = get_u32(payload, 8);
        let max_databases = get_u16(payload, 16);
        let table_size = max_databases as usize * DESCRIPTOR_SIZE;
        if max_databases == 0 || ENV_HEADER_FIXED_SIZE + table_size > payload.len() {
            return Err(Error::InvFileHeader);
        }
        let mut descriptors = Vec::with_capacity(max_databases as usize);
        for i in 0..max_databases as usize {
            let at = ENV_HEADER_FIXED_SIZE + i * DESCRIPTOR_SIZE;
            descriptors.push(Descriptor {
                name: get_u16(payload, at),
                flags: get_u32(payload, at + 4),
                max_keys: get_u32(payload, at + 8),
                key_size: get_u32(payload, at + 12),
                root_address: get_u64(payload, at + 16),
                key_type: get_u32(payload, at + 24),
                record_size: get_u32(payload, at + 28),
            });
        }
        Ok(Self {
            serialno,
            max_databases,
            descriptors,
        })
    }

    fn write_to(&self, payload: &mut [u8], page_size: u32) {
        payload[0..4].copy_from_slice(&MAGIC);
        payload[4..8].copy_from_slice(&FILE_VERSION);
        set_u32(payload, 8, self.serialno);
        set_u32(payload, 12, page_size);
        set_u16(payload, 16, self.max_databases);
        set_u16(payload, 18, 0);
        for (i, d) in self.descriptors.iter().enumerate() {
            let at = ENV_HEADER_FIXED_SIZE + i * DESCRIPTOR_SIZE;
            set_u16(payload, at, d.name);
            set_u16(payload, at + 2, 0);
            set_u32(payload, at + 4, d.flags);
            set_u32(payload, at + 8, d.max_keys);
            set_u32(payload, at + 12, d.key_size);
            set_u64(payload, at + 16, d.root_address);
            set_u32(payload, at + 24, d.key_type);
            set_u32(payload, at + 28, d.record_size);
        }
    }

    pub fn descriptor(&self, name: u16) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    fn descriptor_mut(&mut self, name: u16) -> Option<&mut Descriptor> {
        self.descriptors.iter_mut().find(|d| d.name == name)
    }

    fn free_slot_mut(&mut self) -> Option<&mut Descriptor> {
        self.descriptors.iter_mut().find(|d| d.name == 0)
    }
}

/// The whole mutable engine state behind one lock: device, page manager,
/// log, blob map, and the parsed header.
pub(crate) struct EnvState {
    pub config: EnvConfig,
    pub device: Device,
    pub pm: PageManager,
    pub wal: Option<Wal>,
    pub mem_blobs: MemBlobStore,
    pub header: HeaderState,
    pub next_lsn: u64,
    pub next_txn_id: u64,
    /// Keys claimed by open transactions: (db, key) -> txn id.
    claims: HashMap<(u16, Vec<u8>), u64>,
    pub fatal: bool,
    pub closed: bool,
    /// When set, commits stop after the log flush; used by the recovery
    /// tests to emulate a crash before the data-file write.
    pub crash_after_log: bool,
}

impl EnvState {
    pub fn guard(&self) -> DbResult {
        if self.fatal || self.closed {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub fn fetch(
        &mut self,
        address: u64,
        mode: FetchMode,
        raw: bool,
    ) -> Result<Option<Pod<Page>>> {
        self.pm
            .fetch_page(&mut self.device, &self.config, address, mode, raw)
    }

    pub fn alloc_page(&mut self, ptype: PageType, ignore_freelist: bool) -> Result<Pod<Page>> {
        self.pm
            .alloc_page(&mut self.device, &self.config, ptype, ignore_freelist)
    }

    pub fn alloc_blob_space(&mut self, size: u64) -> Result<BlobSpace> {
        self.pm
            .alloc_blob_space(&mut self.device, &self.config, size)
    }

    pub fn track(&mut self, page: &Pod<Page>, address: u64) {
        self.pm.changeset.put(page, address);
    }

    /// Flush the current change set atomically under a fresh lsn.
    pub fn commit(&mut self) -> DbResult {
        if self.pm.freelist.is_dirty() {
            self.pm.store_state(&mut self.device, &self.config)?;
        }
        if self.pm.changeset.is_empty() {
            return Ok(());
        }
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        let fsync = self.config.flags.contains(EnvFlags::ENABLE_FSYNC);
        self.pm.commit_changeset(
            &mut self.device,
            &mut self.wal,
            lsn,
            fsync,
            self.crash_after_log,
        )
    }

    /// Drop the change set and restore the in-memory state from disk.
    pub fn rollback(&mut self) {
        if let Err(e) = self.pm.rollback_changeset(&mut self.device, &self.config) {
            warn!("rollback failed, poisoning the environment: {}", e);
            self.fatal = true;
            return;
        }
        match self.read_header_page() {
            Ok(header) => self.header = header,
            Err(e) => {
                warn!("header re-read failed after rollback: {}", e);
                self.fatal = true;
            }
        }
    }

    fn read_header_page(&mut self) -> Result<HeaderState> {
        let page = self
            .fetch(0, FetchMode::Normal, false)?
            .expect("normal fetch returns a page");
        let pg = page.rl();
        HeaderState::parse(pg.payload())
    }

    /// Serialize the parsed header into page 0 under the change set.
    pub fn write_header_page(&mut self) -> DbResult {
        let page = self
            .fetch(0, FetchMode::Normal, false)?
            .expect("normal fetch returns a page");
        {
            let mut pg = page.wl();
            let page_size = self.config.page_size;
            self.header.write_to(pg.payload_mut(), page_size);
        }
        self.track(&page, 0);
        Ok(())
    }

    pub fn claim(&mut self, db: u16, key: &[u8], txn_id: u64) -> DbResult {
        match self.claims.get(&(db, key.to_vec())) {
            Some(owner) if *owner != txn_id => Err(Error::TxnConflict),
            _ => {
                self.claims.insert((db, key.to_vec()), txn_id);
                Ok(())
            }
        }
    }

    /// A read through a transaction only conflicts with claims held by
    /// other transactions.
    pub fn check_claim_for(&self, db: u16, key: &[u8], txn_id: u64) -> DbResult {
        match self.claims.get(&(db, key.to_vec())) {
            Some(owner) if *owner != txn_id => Err(Error::TxnConflict),
            _ => Ok(()),
        }
    }

    pub fn check_unclaimed(&self, db: u16, key: &[u8]) -> DbResult {
        if self.claims.contains_key(&(db, key.to_vec())) {
            return Err(Error::TxnConflict);
        }
        Ok(())
    }

    pub fn release_claims(&mut self, txn_id: u64) {
        self.claims.retain(|_, owner| *owner != txn_id);
    }
}

pub(crate) struct EnvCore {
    pub state: RwLock<EnvState>,
    pub databases: RwLock<HashMap<u16, Pod<DbState>>>,
}

/// An environment handle. Dropping it closes the environment, flushing
/// whatever is still dirty.
pub struct Environment {
    core: Arc<EnvCore>,
}

impl Environment {
    /// Create a fresh environment file (or memory region).
    pub fn create<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
    ) -> Result<Environment> {
        params.validate(flags)?;
        let in_memory = flags.contains(EnvFlags::IN_MEMORY);
        let config = EnvConfig {
            flags,
            page_size: params.page_size,
            cache_size: params.cache_size,
            max_databases: params.max_databases,
            blob_alignment: params.blob_alignment,
            path: if in_memory {
                None
            } else {
                Some(path.as_ref().to_path_buf())
            },
            log_directory: params.log_directory.clone(),
            mode: params.mode,
        };

        let mut device = if in_memory {
            Device::new_in_memory(config.page_size as usize)
        } else {
            Device::create(&path, flags, params.mode, config.page_size as usize)?
        };
        let mut pm = PageManager::new(&config);

        // page 0: the environment header
        let address = device.alloc_page()?;
        debug_assert_eq!(address, 0);
        let mut page = Page::new(0, config.page_size as usize);
        page.set_page_type(PageType::Header);
        let header = HeaderState::new(config.max_databases);
        header.write_to(page.payload_mut(), config.page_size);
        page.set_dirty(true);
        let pod = Arc::new(RwLock::new(page));
        pm.cache.insert(pod.clone());
        pm.changeset.put(&pod, 0);

        // page 1: the head of the page-manager state chain
        pm.init_state(&mut device, &config)?;

        let wal = if config.recovery_enabled() {
            Some(Wal::create(config.log_path())?)
        } else {
            None
        };

        let mut state = EnvState {
            config,
            device,
            pm,
            wal,
            mem_blobs: MemBlobStore::new(),
            header,
            next_lsn: 1,
            next_txn_id: 1,
            claims: HashMap::new(),
            fatal: false,
            closed: false,
            crash_after_log: false,
        };
        state.commit()?;
        info!("created environment, page size {}", state.config.page_size);

        Ok(Environment {
            core: Arc::new(EnvCore {
                state: RwLock::new(state),
                databases: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Open an existing environment file.
    pub fn open<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
    ) -> Result<Environment> {
        if flags.contains(EnvFlags::IN_MEMORY) {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(EnvFlags::AUTO_RECOVERY) && !flags.contains(EnvFlags::ENABLE_RECOVERY)
        {
            return Err(Error::InvalidParameter);
        }

        // the page size is persisted; probe it before the device exists
        let page_size = probe_header(path.as_ref())?;
        let mut device = Device::open(&path, flags, page_size as usize)?;

        let config = EnvConfig {
            flags,
            page_size,
            cache_size: params.cache_size,
            max_databases: 0, // replaced after the header is parsed
            blob_alignment: params.blob_alignment,
            path: Some(path.as_ref().to_path_buf()),
            log_directory: params.log_directory.clone(),
            mode: params.mode,
        };

        // a leftover log must be replayed (or refused) before anything
        // reads the data file
        let log_path = config.log_path();
        let mut wal = None;
        if log_path.exists() {
            let mut log = Wal::open(&log_path)?;
            if !log.is_empty() {
                if !flags.contains(EnvFlags::AUTO_RECOVERY) {
                    return Err(Error::NeedRecovery);
                }
                info!("replaying log {}", log_path.display());
                log.recover(&mut device)?;
            }
            if config.recovery_enabled() {
                wal = Some(log);
            }
        } else if config.recovery_enabled() {
            wal = Some(Wal::create(&log_path)?);
        }

        let mut pm = PageManager::new(&config);
        let header_page = pm
            .fetch_page(&mut device, &config, 0, FetchMode::Normal, false)?
            .expect("normal fetch returns a page");
        let header = HeaderState::parse(header_page.rl().payload())?;
        let mut config = config;
        config.max_databases = header.max_databases;

        pm.load_state(&mut device, &config)?;

        let next_lsn = wal.as_ref().map(|w| w.last_lsn() + 1).unwrap_or(1);
        let state = EnvState {
            config,
            device,
            pm,
            wal,
            mem_blobs: MemBlobStore::new(),
            header,
            next_lsn,
            next_txn_id: 1,
            claims: HashMap::new(),
            fatal: false,
            closed: false,
            crash_after_log: false,
        };
        info!("opened environment, page size {}", page_size);

        Ok(Environment {
            core: Arc::new(EnvCore {
                state: RwLock::new(state),
                databases: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Create a database under a fresh name.
    pub fn create_db(
        &self,
        name: u16,
        flags: DbFlags,
        params: &DbParams,
    ) -> Result<Database> {
        if name == 0 {
            return Err(Error::InvalidParameter);
        }
        params.validate(flags)?;
        let mut env = self.core.state.wl();
        env.guard()?;
        if env.config.is_read_only() {
            return Err(Error::WriteProtected);
        }
        if env.header.descriptor(name).is_some() {
            return Err(Error::DuplicateKey);
        }

        let key_type = if flags.contains(DbFlags::RECORD_NUMBER) {
            KeyType::RecordNumber
        } else {
            KeyType::Binary
        };
        let mut flags = flags;
        if key_type == KeyType::Binary && params.key_size == crate::config::KEY_SIZE_UNLIMITED
        {
            // variable keys can always spill into extended-key blobs
            flags |= DbFlags::ENABLE_EXTENDED_KEYS;
        }
        let layout = db::layout_for(env.config.page_payload(), params.key_size, key_type)?;

        let result = (|| -> Result<u64> {
            let root = env.alloc_page(PageType::BtreeRoot, false)?;
            let root_address = root.rl().address();
            btree::node::init(&mut root.wl(), true);
            let slot = env.header.free_slot_mut().ok_or(Error::LimitsReached)?;
            *slot = Descriptor {
                name,
                flags: flags.bits(),
                max_keys: layout.max_keys as u32,
                key_size: params.key_size,
                root_address,
                key_type: key_type.to_tag(),
                record_size: params.record_size,
            };
            env.header.serialno += 1;
            env.write_header_page()?;
            env.commit()?;
            Ok(root_address)
        })();

        let root_address = match result {
            Ok(a) => a,
            Err(e) => {
                env.rollback();
                return Err(e);
            }
        };
        debug!("created database {}, root 0x{:x}", name, root_address);

        let state = db::open_state(
            name,
            flags,
            key_type,
            params.key_size,
            params.record_size,
            layout,
            root_address,
        );
        let pod = Arc::new(RwLock::new(state));
        self.core.databases.wl().insert(name, pod.clone());
        Ok(Database {
            core: self.core.clone(),
            state: pod,
        })
    }

    /// Open an existing database by name.
    pub fn open_db(&self, name: u16, _flags: DbFlags) -> Result<Database> {
        if name == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.core.databases.rl().contains_key(&name) {
            return Err(Error::InvalidParameter);
        }
        let mut env = self.core.state.wl();
        env.guard()?;
        let desc = *env.header.descriptor(name).ok_or(Error::KeyNotFound)?;
        let flags = DbFlags::from_bits(desc.flags).ok_or(Error::InvFileHeader)?;
        let key_type = KeyType::from_tag(desc.key_type)?;
        let layout = db::layout_for(env.config.page_payload(), desc.key_size, key_type)?;
        if layout.max_keys != desc.max_keys as usize {
            return Err(Error::IntegrityViolated(format!(
                "database {}: persisted max_keys {} does not match layout {}",
                name, desc.max_keys, layout.max_keys
            )));
        }

        let mut state = db::open_state(
            name,
            flags,
            key_type,
            desc.key_size,
            desc.record_size,
            layout,
            desc.root_address,
        );
        if key_type == KeyType::RecordNumber {
            if let Some((page_address, slot)) = btree::last_slot(&mut env, &mut state)? {
                let page = btree::fetch_node(&mut env, page_address)?;
                let key = btree::materialize_key(&mut env, &mut state, &page, slot)?;
                state.recno_next = btree::recno_of(&key) + 1;
            }
        }
        drop(env);

        let pod = Arc::new(RwLock::new(state));
        self.core.databases.wl().insert(name, pod.clone());
        Ok(Database {
            core: self.core.clone(),
            state: pod,
        })
    }

    /// Rename a closed database.
    pub fn rename_db(&self, old: u16, new: u16) -> DbResult {
        if old == 0 || new == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.core.databases.rl().contains_key(&old) {
            return Err(Error::InvalidParameter);
        }
        let mut env = self.core.state.wl();
        env.guard()?;
        if env.config.is_read_only() {
            return Err(Error::WriteProtected);
        }
        if env.header.descriptor(new).is_some() {
            return Err(Error::DuplicateKey);
        }
        match env.header.descriptor_mut(old) {
            Some(desc) => desc.name = new,
            None => return Err(Error::KeyNotFound),
        }
        let result = env.write_header_page().and_then(|_| env.commit());
        if result.is_err() {
            env.rollback();
        }
        result
    }

    /// Delete a closed database and free every page it owns.
    pub fn erase_db(&self, name: u16) -> DbResult {
        if name == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.core.databases.rl().contains_key(&name) {
            return Err(Error::InvalidParameter);
        }
        let mut env = self.core.state.wl();
        env.guard()?;
        if env.config.is_read_only() {
            return Err(Error::WriteProtected);
        }
        let desc = *env.header.descriptor(name).ok_or(Error::KeyNotFound)?;
        let flags = DbFlags::from_bits(desc.flags).ok_or(Error::InvFileHeader)?;
        let key_type = KeyType::from_tag(desc.key_type)?;
        let layout = db::layout_for(env.config.page_payload(), desc.key_size, key_type)?;
        let mut state = db::open_state(
            name,
            flags,
            key_type,
            desc.key_size,
            desc.record_size,
            layout,
            desc.root_address,
        );

        let result = (|| -> DbResult {
            btree::erase::free_tree(&mut env, &mut state)?;
            if let Some(desc) = env.header.descriptor_mut(name) {
                *desc = Descriptor::empty();
            }
            env.write_header_page()?;
            env.commit()
        })();
        if result.is_err() {
            env.rollback();
        } else {
            debug!("erased database {}", name);
        }
        result
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Vec<u16> {
        let env = self.core.state.rl();
        env.header
            .descriptors
            .iter()
            .filter(|d| d.name != 0)
            .map(|d| d.name)
            .collect()
    }

    /// Begin a transaction. Requires `ENABLE_TRANSACTIONS`.
    pub fn txn_begin(&self, flags: TxnFlags) -> Result<Transaction> {
        let mut env = self.core.state.wl();
        env.guard()?;
        if !env.config.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(Error::InvalidParameter);
        }
        let id = env.next_txn_id;
        env.next_txn_id += 1;
        Ok(Transaction::new(id, flags))
    }

    /// Apply every buffered op of the transaction through the B-tree, as
    /// one atomic change set.
    pub fn txn_commit(&self, txn: Transaction) -> DbResult {
        let ops = txn.state.wl().drain_ordered();
        let handles: HashMap<u16, Pod<DbState>> = self
            .core
            .databases
            .rl()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let mut env = self.core.state.wl();
        env.guard()?;

        let mut result: DbResult = Ok(());
        let mut touched: Vec<Pod<DbState>> = Vec::new();
        for (name, key, op) in ops {
            let pod = match handles.get(&name) {
                Some(p) => p.clone(),
                None => {
                    result = Err(Error::InvalidParameter);
                    break;
                }
            };
            let mut db = pod.wl();
            let empty = Record::default();
            let r = match op.kind {
                TxnOpKind::Insert => btree::insert::insert(
                    &mut env,
                    &mut db,
                    &key,
                    op.record.as_ref().unwrap_or(&empty),
                    op.flags,
                    op.dup_pos,
                ),
                TxnOpKind::Erase => btree::erase::erase(&mut env, &mut db, &key, None),
                TxnOpKind::EraseDup(index) => {
                    btree::erase::erase(&mut env, &mut db, &key, Some(index))
                }
            };
            drop(db);
            touched.push(pod);
            if let Err(e) = r {
                result = Err(e);
                break;
            }
        }

        let result = result.and_then(|_| env.commit());
        env.release_claims(txn.id);
        if let Err(e) = result {
            if e.is_fatal() {
                env.fatal = true;
                return Err(e);
            }
            env.rollback();
            for pod in touched {
                let mut db = pod.wl();
                if let Some(desc) = env.header.descriptor(db.name) {
                    db.root_address = desc.root_address;
                }
                db.extkey_cache.clear();
                db.generation += 1;
            }
            return Err(e);
        }
        debug!("committed transaction {}", txn.id);
        Ok(())
    }

    /// Throw the transaction's buffered ops away.
    pub fn txn_abort(&self, txn: Transaction) -> DbResult {
        let names: Vec<u16> = txn.state.rl().dbs.keys().copied().collect();
        let handles = self.core.databases.rl();
        for name in names {
            if let Some(pod) = handles.get(&name) {
                // cursors on this database may cache txn records
                pod.wl().generation += 1;
            }
        }
        drop(handles);
        self.core.state.wl().release_claims(txn.id);
        debug!("aborted transaction {}", txn.id);
        Ok(())
    }

    /// Flush all dirty state to the device.
    pub fn flush(&self) -> DbResult {
        let mut env = self.core.state.wl();
        env.guard()?;
        env.commit()?;
        let env = &mut *env;
        env.pm.flush_all(&mut env.device)?;
        env.device.flush()
    }

    /// Close the environment. Open databases are closed along the way;
    /// open cursors refuse the close unless `AUTO_CLEANUP` is set.
    pub fn close(self) -> DbResult {
        self.close_inner()
    }

    fn close_inner(&self) -> DbResult {
        let auto = {
            let env = self.core.state.rl();
            if env.closed {
                return Ok(());
            }
            env.config.flags.contains(EnvFlags::AUTO_CLEANUP)
        };
        {
            let dbs = self.core.databases.rl();
            if !auto {
                for pod in dbs.values() {
                    if pod.rl().cursor_count > 0 {
                        return Err(Error::CursorStillOpen);
                    }
                }
            }
        }
        for pod in self.core.databases.wl().drain().map(|(_, v)| v) {
            pod.wl().closed = true;
        }

        let mut env = self.core.state.wl();
        env.closed = true;
        if env.crash_after_log {
            // the crash window: nothing reaches the data file
            return Ok(());
        }
        let env = &mut *env;
        if !env.fatal {
            if env.pm.freelist.is_dirty() {
                env.pm.store_state(&mut env.device, &env.config)?;
            }
            env.pm.flush_all(&mut env.device)?;
            env.device.flush()?;
        }
        let keep_log = env.config.flags.contains(EnvFlags::DONT_CLEAR_LOG);
        if let Some(wal) = env.wal.as_mut() {
            wal.close(!keep_log)?;
        }
        env.device.close()?;
        info!("environment closed");
        Ok(())
    }
}

#[cfg(feature = "testing-api")]
impl Environment {
    /// Make every later commit stop right after the log flush, emulating a
    /// crash between the log write and the data-file write.
    pub fn crash_after_log_flush(&self) {
        self.core.state.wl().crash_after_log = true;
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!("close on drop failed: {}", e);
        }
    }
}

/// Persist a database's new root address in the header page.
pub(crate) fn persist_root_address(state: &mut EnvState, name: u16, root: u64) -> DbResult {
    match state.header.descriptor_mut(name) {
        Some(desc) => desc.root_address = root,
        None => return Err(Error::InvalidParameter),
    }
    state.write_header_page()
}

/// Read the persisted page size out of a file before a device exists for
/// it. Fails without side effects.
fn probe_header(path: &Path) -> Result<u32> {
    let mut file = std::fs::File::open(path).map_err(Error::Io)?;
    let mut buf = [0u8; PAGE_HEADER_SIZE + ENV_HEADER_FIXED_SIZE];
    file.read_exact(&mut buf).map_err(|_| Error::InvFileHeader)?;
    let payload = &buf[PAGE_HEADER_SIZE..];
    if payload[0..4] != MAGIC {
        return Err(Error::InvFileHeader);
    }
    if payload[4..8] != FILE_VERSION {
        return Err(Error::InvFileVersion);
    }
    let page_size = get_u32(payload, 12);
    if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE || !is_power_of_two(page_size as u64)
    {
        return Err(Error::InvPageSize);
    }
    Ok(page_size)
}
