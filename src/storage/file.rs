//! The bundled single-file key/value engine.
//!
//! The whole keyspace lives in one checksummed snapshot file: magic,
//! format version, generation counter, length-prefixed entries, crc32
//! trailer. Transactions keep an undo log in memory; `prepare` stages the
//! next snapshot beside the live file, `commit` rewrites the live file in
//! place (the file handle, and with it the advisory lock, stays valid),
//! and `cancel` replays the undo log. Cross-process exclusion uses `fs2`
//! whole-file advisory locks: shared while idle, exclusive for the
//! duration of a transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crc32fast::Hasher;
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::kv::{KvBackend, KvError, StorePolicy};
use crate::config::OpenOptions;

const FILE_MAGIC: &[u8; 8] = b"SABLEKV1";
const FILE_VERSION: u32 = 1;
const FIXED_HEADER_LEN: usize = 8 + 4 + 8 + 4;
const CRC_LEN: usize = 4;

// One FileKv per path per process; a second open would silently bypass the
// in-memory map.
fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static PATHS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    PATHS.get_or_init(|| Mutex::new(HashSet::new()))
}

struct FileTxn {
    undo: HashMap<Vec<u8>, Option<Vec<u8>>>,
    prepared: bool,
}

/// A [`KvBackend`] storing the whole keyspace in one snapshot file.
pub struct FileKv {
    path: PathBuf,
    file: File,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    generation: u64,
    txn: Option<FileTxn>,
    durable_sync: bool,
}

impl FileKv {
    /// Opens (or creates) the file at `path` and loads its snapshot.
    pub fn open(path: &Path, opts: &OpenOptions) -> Result<Self, KvError> {
        let path_buf = path.to_path_buf();
        if !open_paths().lock().insert(path_buf.clone()) {
            return Err(KvError::Busy);
        }
        let result = Self::open_inner(path_buf.clone(), opts);
        if result.is_err() {
            open_paths().lock().remove(&path_buf);
        }
        result
    }

    fn open_inner(path: PathBuf, opts: &OpenOptions) -> Result<Self, KvError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(opts.create_if_missing)
            .open(&path)?;
        file.lock_shared()?;

        let mut bytes = Vec::new();
        (&file).read_to_end(&mut bytes)?;
        let (map, generation) = if bytes.is_empty() {
            (BTreeMap::new(), 0)
        } else {
            parse_snapshot(&bytes)?
        };
        debug!(
            path = %path.display(),
            entries = map.len(),
            generation,
            "opened key/value file"
        );
        Ok(Self {
            path,
            file,
            map,
            generation,
            txn: None,
            durable_sync: opts.durable_sync,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }

    fn lock_exclusive(&self) -> Result<(), KvError> {
        self.file.try_lock_exclusive().map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                KvError::Busy
            } else {
                KvError::Io(e)
            }
        })
    }

    fn downgrade_to_shared(&self) {
        let _ = self.file.unlock();
        let _ = self.file.lock_shared();
    }

    fn write_file_in_place(&mut self, bytes: &[u8]) -> Result<(), KvError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytes)?;
        if self.durable_sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    // Writes outside a transaction take the exclusive lock for just this
    // change and persist immediately.
    fn persist_autonomous(&mut self) -> Result<(), KvError> {
        self.generation += 1;
        let bytes = serialize_snapshot(&self.map, self.generation);
        let result = self.write_file_in_place(&bytes);
        self.downgrade_to_shared();
        result
    }

    fn no_txn() -> KvError {
        KvError::Corruption("no open transaction".into())
    }
}

impl KvBackend for FileKv {
    fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.get(key).cloned())
    }

    fn store(&mut self, key: &[u8], blob: &[u8], policy: StorePolicy) -> Result<(), KvError> {
        match (self.map.contains_key(key), policy) {
            (true, StorePolicy::MustNotExist) => return Err(KvError::Exists),
            (false, StorePolicy::MustExist) => return Err(KvError::NotFound),
            _ => {}
        }
        let prev = self.map.get(key).cloned();
        if let Some(txn) = self.txn.as_mut() {
            txn.undo.entry(key.to_vec()).or_insert(prev);
            self.map.insert(key.to_vec(), blob.to_vec());
            Ok(())
        } else {
            self.lock_exclusive()?;
            self.map.insert(key.to_vec(), blob.to_vec());
            self.persist_autonomous()
        }
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        if !self.map.contains_key(key) {
            return Err(KvError::NotFound);
        }
        let prev = self.map.get(key).cloned();
        if let Some(txn) = self.txn.as_mut() {
            txn.undo.entry(key.to_vec()).or_insert(prev);
            self.map.remove(key);
            Ok(())
        } else {
            self.lock_exclusive()?;
            self.map.remove(key);
            self.persist_autonomous()
        }
    }

    fn scan(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), KvError>,
    ) -> Result<(), KvError> {
        for (key, blob) in &self.map {
            visit(key, blob)?;
        }
        Ok(())
    }

    fn txn_start(&mut self) -> Result<(), KvError> {
        if self.txn.is_some() {
            return Err(KvError::Corruption("transaction already open".into()));
        }
        self.lock_exclusive()?;
        self.txn = Some(FileTxn {
            undo: HashMap::new(),
            prepared: false,
        });
        Ok(())
    }

    fn txn_prepare(&mut self) -> Result<(), KvError> {
        let prepared = match &self.txn {
            Some(t) => t.prepared,
            None => return Err(Self::no_txn()),
        };
        if prepared {
            return Ok(());
        }
        let bytes = serialize_snapshot(&self.map, self.generation + 1);
        let tmp = self.tmp_path();
        let mut staged = File::create(&tmp)?;
        staged.write_all(&bytes)?;
        if self.durable_sync {
            staged.sync_all()?;
        }
        if let Some(t) = self.txn.as_mut() {
            t.prepared = true;
        }
        Ok(())
    }

    fn txn_commit(&mut self) -> Result<(), KvError> {
        if self.txn.is_none() {
            return Err(Self::no_txn());
        }
        self.txn_prepare()?;
        let bytes = serialize_snapshot(&self.map, self.generation + 1);
        if let Err(e) = self.write_file_in_place(&bytes) {
            warn!(path = %self.path.display(), "commit write failed: {e}");
            return Err(e);
        }
        let _ = fs::remove_file(self.tmp_path());
        self.generation += 1;
        self.txn = None;
        self.downgrade_to_shared();
        Ok(())
    }

    fn txn_cancel(&mut self) -> Result<(), KvError> {
        let txn = self.txn.take().ok_or_else(Self::no_txn)?;
        for (key, old) in txn.undo {
            match old {
                Some(blob) => self.map.insert(key, blob),
                None => self.map.remove(&key),
            };
        }
        let _ = fs::remove_file(self.tmp_path());
        self.downgrade_to_shared();
        Ok(())
    }

    fn sequence_counter(&self) -> u64 {
        self.generation
    }
}

impl Drop for FileKv {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        open_paths().lock().remove(&self.path);
    }
}

fn serialize_snapshot(map: &BTreeMap<Vec<u8>, Vec<u8>>, generation: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + CRC_LEN);
    out.extend_from_slice(FILE_MAGIC);
    out.extend_from_slice(&FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&generation.to_le_bytes());
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (key, blob) in map {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        out.extend_from_slice(blob);
    }
    let mut hasher = Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

#[allow(clippy::type_complexity)]
fn parse_snapshot(bytes: &[u8]) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, u64), KvError> {
    if bytes.len() < FIXED_HEADER_LEN + CRC_LEN {
        return Err(KvError::Corruption("snapshot shorter than header".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(KvError::Corruption("snapshot checksum mismatch".into()));
    }
    if &body[..8] != FILE_MAGIC {
        return Err(KvError::Corruption("bad snapshot magic".into()));
    }
    let version = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
    if version != FILE_VERSION {
        return Err(KvError::Corruption(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let generation = u64::from_le_bytes([
        body[12], body[13], body[14], body[15], body[16], body[17], body[18], body[19],
    ]);
    let count = u32::from_le_bytes([body[20], body[21], body[22], body[23]]) as usize;

    let mut map = BTreeMap::new();
    let mut pos = FIXED_HEADER_LEN;
    for _ in 0..count {
        let key = take_prefixed(body, &mut pos)?;
        let blob = take_prefixed(body, &mut pos)?;
        map.insert(key, blob);
    }
    if pos != body.len() {
        return Err(KvError::Corruption("trailing bytes in snapshot".into()));
    }
    Ok((map, generation))
}

fn take_prefixed(body: &[u8], pos: &mut usize) -> Result<Vec<u8>, KvError> {
    if body.len() - *pos < 4 {
        return Err(KvError::Corruption("truncated snapshot entry".into()));
    }
    let len = u32::from_le_bytes([body[*pos], body[*pos + 1], body[*pos + 2], body[*pos + 3]])
        as usize;
    *pos += 4;
    if body.len() - *pos < len {
        return Err(KvError::Corruption("truncated snapshot entry".into()));
    }
    let out = body[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}
