//! C6: the persistent, memory-mapped per-directory retrieve list.
//!
//! The on-disk layout is a fixed 32-byte header followed by an array of
//! fixed-size entries, decoded with `zerocopy` the same way the
//! ancestor's wire-protocol argument reader casts byte slices into
//! typed structs without copying: `Ref::from_prefix`/`from_prefix_with_elems`
//! over a byte buffer, except here the buffer is a memory map instead of
//! a single kernel message.

pub(crate) mod lock;

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, trace};
use memmap2::MmapMut;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};

pub const NAME_MAX: usize = 256;
const MAGIC: u32 = 0x5246_4C31; // "RFL1"
const FORMAT_VERSION: u32 = 1;

/// Number of entries to grow the map by each time it fills: one OS page
/// worth, so `mmap`/`munmap` churn stays aligned to the granularity the
/// kernel actually manages rather than growing by an arbitrary count.
fn growth_step_entries() -> usize {
    (page_size::get() / ENTRY_SIZE).max(1)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct Header {
    magic: u32,
    version: u32,
    entry_count: u32,
    capacity: u32,
    reserved: [u8; 16],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Entry {
    pub filename: [u8; NAME_MAX],
    pub mtime: i64,
    pub size: u64,
    pub prev_size: u64,
    pub retrieved: u8,
    pub assigned: u8,
    pub in_list: u8,
    pub got_date: u8,
    _padding: [u8; 4],
}

const ENTRY_SIZE: usize = std::mem::size_of::<Entry>();

impl Entry {
    fn empty() -> Entry {
        Entry {
            filename: [0u8; NAME_MAX],
            mtime: 0,
            size: 0,
            prev_size: 0,
            retrieved: 0,
            assigned: 0,
            in_list: 0,
            got_date: 0,
            _padding: [0; 4],
        }
    }

    pub fn name(&self) -> &str {
        let nul = self.filename.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        std::str::from_utf8(&self.filename[..nul]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.filename = [0u8; NAME_MAX];
        let bytes = name.as_bytes();
        let take = bytes.len().min(NAME_MAX - 1);
        self.filename[..take].copy_from_slice(&bytes[..take]);
    }
}

/// Stat information for one remote entry seen during a listing pass.
pub struct RemoteStat {
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit { slot: usize },
    Skipped,
    BudgetExceeded,
}

/// One attached retrieve list; `dir_id`/`worker_id` identify the caller
/// for logging only, the file itself carries no per-worker state.
pub struct Rl {
    file: File,
    map: MmapMut,
    admitted_files: u32,
    admitted_bytes: u64,
}

impl Rl {
    /// Opens (creating if absent) the backing file for `dir_id`, maps it,
    /// and validates the header. A brand-new file gets an empty header
    /// written before mapping.
    pub fn attach(path: &Path) -> Result<Rl> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| Error::LsDataAttach)?;

        if file.metadata().map_err(|_| Error::LsDataAttach)?.len() == 0 {
            Self::initialize(&file)?;
        }

        let map = unsafe { MmapMut::map_mut(&file).map_err(|_| Error::LsDataAttach)? };
        let header = Header::ref_from_bytes(&map[..HEADER_SIZE]).map_err(|_| Error::LsDataAttach)?;
        if header.magic != MAGIC {
            return Err(Error::LsDataAttach);
        }
        if header.version != FORMAT_VERSION {
            return Err(Error::LsDataVersion);
        }

        Ok(Rl { file, map, admitted_files: 0, admitted_bytes: 0 })
    }

    fn initialize(file: &File) -> Result<()> {
        let step = growth_step_entries();
        let header = Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
            entry_count: 0,
            capacity: step as u32,
            reserved: [0; 16],
        };
        let total = HEADER_SIZE + step * ENTRY_SIZE;
        file.set_len(total as u64).map_err(|_| Error::LsDataAttach)?;
        let mut map = unsafe { MmapMut::map_mut(file).map_err(|_| Error::LsDataAttach)? };
        map[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        map.flush().map_err(|_| Error::LsDataAttach)?;
        Ok(())
    }

    fn header(&self) -> Header {
        *Header::ref_from_bytes(&self.map[..HEADER_SIZE]).expect("header region always present")
    }

    fn set_header(&mut self, header: Header) {
        self.map[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    fn entry_offset(slot: usize) -> usize {
        HEADER_SIZE + slot * ENTRY_SIZE
    }

    fn entry(&self, slot: usize) -> Entry {
        let off = Self::entry_offset(slot);
        *Entry::ref_from_bytes(&self.map[off..off + ENTRY_SIZE]).expect("slot within capacity")
    }

    fn set_entry(&mut self, slot: usize, entry: &Entry) {
        let off = Self::entry_offset(slot);
        self.map[off..off + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
    }

    fn entry_count(&self) -> usize {
        self.header().entry_count as usize
    }

    fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    fn grow(&mut self) -> Result<()> {
        let mut header = self.header();
        let new_capacity = header.capacity as usize + growth_step_entries();
        debug!("growing retrieve list to {new_capacity} entries");
        let new_len = HEADER_SIZE + new_capacity * ENTRY_SIZE;
        self.map.flush().map_err(|_| Error::LsDataAttach)?;
        self.file.set_len(new_len as u64).map_err(|_| Error::LsDataAttach)?;
        self.map = unsafe { MmapMut::map_mut(&self.file).map_err(|_| Error::LsDataAttach)? };
        header.capacity = new_capacity as u32;
        self.set_header(header);
        Ok(())
    }

    fn find_by_name(&self, name: &str) -> Option<usize> {
        (0..self.entry_count()).find(|&i| self.entry(i).name() == name)
    }

    /// `reset(dir_id)`: clears `in_list` on every entry ahead of a fresh
    /// listing pass; entries not re-seen during the pass stay `in_list=0`
    /// and become candidates for `compact_absent`.
    pub fn reset(&mut self) {
        for i in 0..self.entry_count() {
            let mut entry = self.entry(i);
            entry.in_list = 0;
            self.set_entry(i, &entry);
        }
        self.admitted_files = 0;
        self.admitted_bytes = 0;
    }

    /// Runs the five-stage matching pipeline for one remote entry and
    /// (on admission) writes the slot back, taking its byte-range lock.
    pub fn try_match(&mut self, name: &str, stat: &RemoteStat, config: &DirectoryConfig, now: i64) -> Result<Admission> {
        // Stage 1: file-mask pattern match, negated masks short-circuit.
        if !mask_admits(name, config) {
            return Ok(Admission::Skipped);
        }

        // Stage 2: size filter.
        if let Some(filter) = &config.size_filter {
            if filter.relation.holds(stat.size as i64, filter.ignore_size) {
                return Ok(Admission::Skipped);
            }
        }

        // Stage 3: time filter.
        if let Some(filter) = &config.time_filter {
            if filter.relation.holds(now - stat.mtime, filter.ignore_file_time) {
                return Ok(Admission::Skipped);
            }
        }

        // Stage 4: list presence / change detection.
        let slot = match self.find_by_name(name) {
            Some(slot) => {
                let mut entry = self.entry(slot);
                if entry.mtime != stat.mtime || entry.size != stat.size {
                    entry.prev_size = entry.size;
                    entry.retrieved = 0;
                    entry.assigned = 0;
                    entry.mtime = stat.mtime;
                    entry.size = stat.size;
                } else if entry.retrieved == 1 {
                    entry.in_list = 1;
                    self.set_entry(slot, &entry);
                    trace!("{name}: unchanged and already retrieved, skipping");
                    return Ok(Admission::Skipped);
                }
                entry.in_list = 1;
                self.set_entry(slot, &entry);
                slot
            }
            None => {
                if self.entry_count() == self.capacity() {
                    self.grow()?;
                }
                let slot = self.entry_count();
                let mut entry = Entry::empty();
                entry.set_name(name);
                entry.mtime = stat.mtime;
                entry.size = stat.size;
                entry.in_list = 1;
                self.set_entry(slot, &entry);
                let mut header = self.header();
                header.entry_count += 1;
                self.set_header(header);
                slot
            }
        };

        // Stage 5: budget.
        let would_be_files = self.admitted_files + 1;
        let would_be_bytes = self.admitted_bytes + stat.size;
        if would_be_files > config.max_copied_files || would_be_bytes > config.max_copied_file_size {
            trace!("{name}: budget exceeded ({would_be_files} files, {would_be_bytes} bytes)");
            return Ok(Admission::BudgetExceeded);
        }
        self.admitted_files = would_be_files;
        self.admitted_bytes = would_be_bytes;

        Ok(Admission::Admit { slot })
    }

    /// Takes the byte-range write lock for `slot`; only the holder may
    /// flip `retrieved` or clear `assigned`. `assigned` persists
    /// `worker_id + 1` so a reader can tell which worker holds the slot.
    pub fn assign(&mut self, slot: usize, worker_id: u32) -> Result<bool> {
        let offset = Self::entry_offset(slot) as i64;
        if !lock::try_lock_range(self.file.as_raw_fd(), offset, ENTRY_SIZE as i64)? {
            return Ok(false);
        }
        let mut entry = self.entry(slot);
        entry.assigned = (worker_id + 1) as u8;
        self.set_entry(slot, &entry);
        Ok(true)
    }

    pub fn mark_retrieved(&mut self, slot: usize) {
        let mut entry = self.entry(slot);
        entry.retrieved = 1;
        self.set_entry(slot, &entry);
    }

    pub fn release(&mut self, slot: usize) -> Result<()> {
        let offset = Self::entry_offset(slot) as i64;
        let mut entry = self.entry(slot);
        entry.assigned = 0;
        self.set_entry(slot, &entry);
        lock::unlock_range(self.file.as_raw_fd(), offset, ENTRY_SIZE as i64)
    }

    /// Removes entries with `in_list=0` by sliding the tail of the array
    /// over the gap. A listing that truncated the array to a negative
    /// count is impossible by construction here, but the count is
    /// clamped to zero defensively to match the source's behavior.
    pub fn compact_absent(&mut self) {
        let mut write = 0usize;
        let total = self.entry_count();
        for read in 0..total {
            let entry = self.entry(read);
            if entry.in_list == 1 {
                if write != read {
                    self.set_entry(write, &entry);
                }
                write += 1;
            }
        }
        if write != total {
            debug!("compacted retrieve list: {} entries removed", total - write);
        }
        let mut header = self.header();
        header.entry_count = write.max(0) as u32;
        self.set_header(header);
    }

    pub fn entries(&self) -> Vec<Entry> {
        (0..self.entry_count()).map(|i| self.entry(i)).collect()
    }

    pub fn detach(self) {
        drop(self);
    }
}

fn mask_admits(name: &str, config: &DirectoryConfig) -> bool {
    for negate in &config.negate_masks {
        if glob_match(negate, name) {
            return false;
        }
    }
    if config.file_masks.is_empty() {
        return true;
    }
    config.file_masks.iter().any(|mask| glob_match(mask, name))
}

/// Minimal shell-glob matcher supporting `*` and `?`, sufficient for the
/// directory-config file masks; no character classes.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn helper(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], n) || (!n.is_empty() && helper(p, &n[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => helper(&p[1..], &n[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;

    fn tmp_list() -> (tempfile::TempDir, Rl) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retrieve.list");
        let rl = Rl::attach(&path).unwrap();
        (dir, rl)
    }

    #[test]
    fn glob_matches_star_and_question() {
        assert!(glob_match("*.txt", "report.txt"));
        assert!(!glob_match("*.txt", "report.csv"));
        assert!(glob_match("file?.dat", "file1.dat"));
    }

    #[test]
    fn fresh_entry_is_admitted_and_persists() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        let admission = rl.try_match("a.txt", &stat, &config, 200).unwrap();
        assert!(matches!(admission, Admission::Admit { .. }));
        assert_eq!(rl.entries().len(), 1);
        assert_eq!(rl.entries()[0].name(), "a.txt");
    }

    #[test]
    fn budget_exceeded_after_max_files() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], max_copied_files: 1, ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        assert!(matches!(rl.try_match("a.txt", &stat, &config, 200).unwrap(), Admission::Admit { .. }));
        assert!(matches!(rl.try_match("b.txt", &stat, &config, 200).unwrap(), Admission::BudgetExceeded));
    }

    #[test]
    fn unchanged_retrieved_entry_is_skipped() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        let Admission::Admit { slot } = rl.try_match("a.txt", &stat, &config, 200).unwrap() else {
            panic!("expected admission")
        };
        rl.mark_retrieved(slot);
        rl.reset();
        let admission = rl.try_match("a.txt", &stat, &config, 300).unwrap();
        assert_eq!(admission, Admission::Skipped);
        assert_eq!(rl.entries()[0].retrieved, 1);
    }

    #[test]
    fn changed_entry_resets_retrieved_and_tracks_prev_size() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        let Admission::Admit { slot } = rl.try_match("a.txt", &stat, &config, 200).unwrap() else {
            panic!("expected admission")
        };
        rl.mark_retrieved(slot);
        rl.reset();
        let grown = RemoteStat { mtime: 150, size: 20 };
        rl.try_match("a.txt", &grown, &config, 300).unwrap();
        let entry = rl.entries()[0];
        assert_eq!(entry.retrieved, 0);
        assert_eq!(entry.prev_size, 10);
        assert_eq!(entry.size, 20);
    }

    #[test]
    fn assign_records_worker_id() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        let Admission::Admit { slot } = rl.try_match("a.txt", &stat, &config, 200).unwrap() else {
            panic!("expected admission")
        };
        assert!(rl.assign(slot, 3).unwrap());
        assert_eq!(rl.entries()[0].assigned, 4);
    }

    #[test]
    fn compact_absent_removes_entries_not_relisted() {
        let (_dir, mut rl) = tmp_list();
        let config = DirectoryConfig { file_masks: vec!["*".to_owned()], ..Default::default() };
        let stat = RemoteStat { mtime: 100, size: 10 };
        rl.try_match("a.txt", &stat, &config, 200).unwrap();
        rl.try_match("b.txt", &stat, &config, 200).unwrap();
        rl.reset();
        rl.try_match("b.txt", &stat, &config, 200).unwrap();
        rl.compact_absent();
        let names: Vec<String> = rl.entries().iter().map(|e| e.name().to_owned()).collect();
        assert_eq!(names, vec!["b.txt".to_owned()]);
    }
}
