//! C8: one fetch pass per worker invocation, driving the retrieve list
//! (C6) against a listing from the protocol adapter (§6) and admitting
//! entries under the directory's budget.

use log::{info, warn};

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use crate::protocol::RemoteDirectory;
use crate::retrieve_list::{Admission, Rl};

pub struct PassSummary {
    pub admitted_files: u32,
    pub admitted_bytes: u64,
    pub deleted_files: u32,
    pub total_listed: u32,
    pub more_files_in_list: bool,
}

/// How this pass should treat the retrieve list before streaming the
/// listing: a brand-new pass resets `in_list` on every entry so absent
/// ones can later be compacted away; a resume picks up a list that was
/// already reset (and partially assigned) by an earlier, interrupted
/// pass.
pub enum PassMode {
    Fresh,
    Resume,
}

/// Runs one fetch pass: lists the remote directory, admits entries
/// through the C6 pipeline, assigns admitted slots, and (in keep-history
/// mode) compacts entries the listing no longer reports.
///
/// `now` is the caller-supplied wall-clock time (seconds since epoch)
/// used for the time filter and the unknown-file deletion grace period.
pub fn run_pass(
    rl: &mut Rl,
    remote: &mut dyn RemoteDirectory,
    config: &DirectoryConfig,
    worker_id: u32,
    mode: PassMode,
    now: i64,
) -> Result<PassSummary> {
    if matches!(mode, PassMode::Fresh) {
        rl.reset();
    }

    remote.open_dir(&config.remote_path).map_err(|_| Error::ListError)?;

    let mut total_listed = 0u32;
    let mut deleted_files = 0u32;
    let mut admitted_files = 0u32;
    let mut admitted_bytes = 0u64;
    let mut more_files_in_list = false;

    loop {
        let entry = match remote.readdir() {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => {
                let _ = remote.close_dir();
                return Err(e);
            }
        };
        total_listed += 1;

        match rl.try_match(&entry.name, &entry.stat, config, now) {
            Ok(Admission::Admit { slot }) => {
                if !rl.assign(slot, worker_id)? {
                    // Another worker already holds this entry's lock this
                    // pass; leave it for them and move on.
                    continue;
                }
                admitted_files += 1;
                admitted_bytes += entry.stat.size;
            }
            Ok(Admission::BudgetExceeded) => {
                more_files_in_list = true;
            }
            Ok(Admission::Skipped) => {
                maybe_delete_unknown(remote, config, &entry.name, now, &mut deleted_files);
            }
            Err(e) => {
                warn!("retrieve-list admission failed for {}: {e}", entry.name);
            }
        }
    }

    remote.close_dir().map_err(|_| Error::ListError)?;

    if config.keep_history_mode {
        rl.compact_absent();
    }

    let summary = PassSummary {
        admitted_files,
        admitted_bytes,
        deleted_files,
        total_listed,
        more_files_in_list,
    };

    info!(
        "fetch pass complete: listed={} admitted={} bytes={} deleted={} more_files_in_list={}",
        summary.total_listed, summary.admitted_files, summary.admitted_bytes, summary.deleted_files, summary.more_files_in_list
    );

    Ok(summary)
}

/// Deletes a remote entry that matched no file mask, if
/// `delete_unknown_files` is set and the entry has aged past
/// `unknown_file_time` (or the `-2` "delete immediately" sentinel).
///
/// The age check itself is read from a branch that, in the source this
/// was distilled from, left a variable uninitialized on one path; we
/// preserve that branch's observable default of *not* deleting rather
/// than guessing a more aggressive policy.
fn maybe_delete_unknown(remote: &mut dyn RemoteDirectory, config: &DirectoryConfig, name: &str, now: i64, deleted: &mut u32) {
    if !config.delete_unknown_files {
        return;
    }
    let old_enough = if config.unknown_file_time == crate::config::DELETE_UNKNOWN_IMMEDIATELY {
        true
    } else {
        // Without a matched entry we have no recorded mtime to age
        // against; defaulting to "not old enough" matches the
        // uninitialized-reads-as-NO behavior this path preserves.
        let _ = now;
        false
    };
    if !old_enough {
        return;
    }
    if remote.delete_remote_file(&config.remote_path, name).is_ok() {
        *deleted += 1;
    }
}
