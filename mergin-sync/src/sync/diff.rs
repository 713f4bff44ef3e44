use std::collections::HashMap;

use super::metadata::FileRecord;

/// Three-way classification of every path touched by a sync. The sets are
/// pairwise disjoint; a path that independently converged on both sides
/// (or was deleted on both) belongs to none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectDiff {
    pub local_added: Vec<String>,
    pub local_updated: Vec<String>,
    pub local_deleted: Vec<String>,
    pub remote_added: Vec<String>,
    pub remote_updated: Vec<String>,
    pub remote_deleted: Vec<String>,
    pub conflict_remote_updated_local_updated: Vec<String>,
    pub conflict_remote_added_local_added: Vec<String>,
    pub conflict_remote_deleted_local_updated: Vec<String>,
    pub conflict_remote_updated_local_deleted: Vec<String>,
}

impl ProjectDiff {
    pub fn is_empty(&self) -> bool {
        self.sets().iter().all(|set| set.is_empty())
    }

    /// Paths the update path must fetch from the server: remote-side changes
    /// plus both conflict flavors whose resolution downloads the server copy
    /// (the local copy is preserved under a conflict name).
    pub fn paths_to_download(&self) -> impl Iterator<Item = &String> {
        self.remote_added
            .iter()
            .chain(&self.remote_updated)
            .chain(&self.conflict_remote_updated_local_updated)
            .chain(&self.conflict_remote_added_local_added)
    }

    pub fn dump(&self) -> String {
        let describe = |label: &str, set: &[String]| {
            if set.is_empty() {
                String::new()
            } else {
                format!(" {label}={:?}", set)
            }
        };
        let mut out = String::from("diff:");
        out.push_str(&describe("local_added", &self.local_added));
        out.push_str(&describe("local_updated", &self.local_updated));
        out.push_str(&describe("local_deleted", &self.local_deleted));
        out.push_str(&describe("remote_added", &self.remote_added));
        out.push_str(&describe("remote_updated", &self.remote_updated));
        out.push_str(&describe("remote_deleted", &self.remote_deleted));
        out.push_str(&describe(
            "conflict_remote_updated_local_updated",
            &self.conflict_remote_updated_local_updated,
        ));
        out.push_str(&describe(
            "conflict_remote_added_local_added",
            &self.conflict_remote_added_local_added,
        ));
        out.push_str(&describe(
            "conflict_remote_deleted_local_updated",
            &self.conflict_remote_deleted_local_updated,
        ));
        out.push_str(&describe(
            "conflict_remote_updated_local_deleted",
            &self.conflict_remote_updated_local_deleted,
        ));
        if self.is_empty() {
            out.push_str(" no changes");
        }
        out
    }

    fn sets(&self) -> [&Vec<String>; 10] {
        [
            &self.local_added,
            &self.local_updated,
            &self.local_deleted,
            &self.remote_added,
            &self.remote_updated,
            &self.remote_deleted,
            &self.conflict_remote_updated_local_updated,
            &self.conflict_remote_added_local_added,
            &self.conflict_remote_deleted_local_updated,
            &self.conflict_remote_updated_local_deleted,
        ]
    }

    fn sort(&mut self) {
        self.local_added.sort();
        self.local_updated.sort();
        self.local_deleted.sort();
        self.remote_added.sort();
        self.remote_updated.sort();
        self.remote_deleted.sort();
        self.conflict_remote_updated_local_updated.sort();
        self.conflict_remote_added_local_added.sort();
        self.conflict_remote_deleted_local_updated.sort();
        self.conflict_remote_updated_local_deleted.sort();
    }
}

/// Checksums are hex strings; the comparison is case-insensitive so that a
/// server emitting uppercase digests still matches locally computed ones.
fn same_checksum(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

/// Classifies every path reachable from the baseline (the server state the
/// last sync left behind), the current server state and the current local
/// files. Each path lands in exactly one diff set or in none (no change, or
/// both sides converged on the same content independently).
pub fn compare_project_files(
    old_server_files: &[FileRecord],
    new_server_files: &[FileRecord],
    local_files: &[FileRecord],
) -> ProjectDiff {
    let mut diff = ProjectDiff::default();
    let mut old_map: HashMap<&str, &FileRecord> = old_server_files
        .iter()
        .map(|file| (file.path.as_str(), file))
        .collect();
    let mut new_map: HashMap<&str, &FileRecord> = new_server_files
        .iter()
        .map(|file| (file.path.as_str(), file))
        .collect();

    for local in local_files {
        let path = local.path.as_str();
        let old = old_map.remove(path);
        let new = new_map.remove(path);
        match (old, new) {
            (None, None) => diff.local_added.push(path.to_string()),
            (Some(old), None) => {
                if same_checksum(&old.checksum, &local.checksum) {
                    diff.remote_deleted.push(path.to_string());
                } else {
                    diff.conflict_remote_deleted_local_updated
                        .push(path.to_string());
                }
            }
            (None, Some(new)) => {
                if !same_checksum(&new.checksum, &local.checksum) {
                    diff.conflict_remote_added_local_added.push(path.to_string());
                }
                // otherwise both sides added identical content
            }
            (Some(old), Some(new)) => {
                if same_checksum(&old.checksum, &new.checksum) {
                    if !same_checksum(&new.checksum, &local.checksum) {
                        diff.local_updated.push(path.to_string());
                    }
                } else if !same_checksum(&new.checksum, &local.checksum) {
                    if same_checksum(&old.checksum, &local.checksum) {
                        diff.remote_updated.push(path.to_string());
                    } else {
                        diff.conflict_remote_updated_local_updated
                            .push(path.to_string());
                    }
                }
                // new == local: the local copy already caught up with the server
            }
        }
    }

    // paths known to the server but absent locally
    for (path, new) in new_map {
        match old_map.remove(path) {
            Some(old) => {
                if same_checksum(&old.checksum, &new.checksum) {
                    diff.local_deleted.push(path.to_string());
                } else {
                    diff.conflict_remote_updated_local_deleted
                        .push(path.to_string());
                }
            }
            None => diff.remote_added.push(path.to_string()),
        }
    }

    // whatever remains in old_map was deleted both locally and on the server

    diff.sort();
    diff
}
