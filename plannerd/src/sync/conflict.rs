use time::OffsetDateTime;

use super::metadata::MetadataEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// The remote revision was already merged.
    Skip,
    ApplyRemote,
    /// Local is strictly newer: keep it and schedule a push.
    KeepLocal,
}

/// Last-writer-wins for a remote item that is already linked to a local task.
///
/// `last_known_remote` is the revision recorded on the last merge or push. Ties between
/// the remote revision and the local `updated_at` go to the remote side.
pub fn decide_pull(
    remote_updated: Option<OffsetDateTime>,
    last_known_remote: Option<OffsetDateTime>,
    local_updated: OffsetDateTime,
) -> PullDecision {
    let Some(remote) = remote_updated else {
        return if last_known_remote.is_some() {
            PullDecision::Skip
        } else {
            PullDecision::ApplyRemote
        };
    };
    if let Some(known) = last_known_remote
        && remote <= known
    {
        return PullDecision::Skip;
    }
    if remote >= local_updated {
        PullDecision::ApplyRemote
    } else {
        PullDecision::KeepLocal
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// The remote change is newer: merge it locally and drop the push.
    ApplyRemote,
    /// Retry the write with the given precondition.
    OverwriteRemote { if_match: Option<String> },
}

/// Resolution of a rejected conditional write, after re-fetching the remote entity.
pub fn resolve_conflict(
    remote_updated: Option<OffsetDateTime>,
    remote_etag: Option<&str>,
    local_updated: OffsetDateTime,
) -> ConflictDecision {
    match remote_updated {
        Some(remote) if remote >= local_updated => ConflictDecision::ApplyRemote,
        _ => ConflictDecision::OverwriteRemote {
            if_match: remote_etag.map(str::to_string),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    Local,
    Remote,
}

/// Picks the surviving metadata entry when two devices wrote the same remote task.
///
/// Newer `updated_at` wins, and a stamped entry beats an unstamped one. Otherwise the
/// lexically greater `device_id` wins, which carries no meaning beyond making every device
/// pick the same entry. A full tie keeps local.
pub fn resolve_metadata(local: &MetadataEntry, remote: &MetadataEntry) -> MergeSide {
    match (local.updated_at, remote.updated_at) {
        (Some(l), Some(r)) if r > l => return MergeSide::Remote,
        (Some(l), Some(r)) if l > r => return MergeSide::Local,
        (Some(_), None) => return MergeSide::Local,
        (None, Some(_)) => return MergeSide::Remote,
        _ => {}
    }
    if remote.device_id > local.device_id {
        MergeSide::Remote
    } else {
        MergeSide::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2025-03-01 10:00 UTC);
    const T_PLUS_1H: OffsetDateTime = datetime!(2025-03-01 11:00 UTC);

    fn entry(updated_at: Option<OffsetDateTime>, device: &str) -> MetadataEntry {
        MetadataEntry {
            task_id: 1,
            priority: 0,
            status: "todo".into(),
            updated_at,
            device_id: device.into(),
        }
    }

    #[test]
    fn pull_skips_already_seen_revisions() {
        assert_eq!(decide_pull(Some(T), Some(T), T), PullDecision::Skip);
        assert_eq!(decide_pull(Some(T), Some(T_PLUS_1H), T), PullDecision::Skip);
    }

    #[test]
    fn pull_applies_newer_or_equal_remote() {
        assert_eq!(decide_pull(Some(T_PLUS_1H), Some(T), T), PullDecision::ApplyRemote);
        assert_eq!(decide_pull(Some(T), None, T), PullDecision::ApplyRemote);
    }

    #[test]
    fn pull_keeps_strictly_newer_local() {
        assert_eq!(decide_pull(Some(T), None, T_PLUS_1H), PullDecision::KeepLocal);
    }

    #[test]
    fn conflict_applies_newer_remote_and_overwrites_older() {
        assert_eq!(
            resolve_conflict(Some(T_PLUS_1H), Some("e2"), T),
            ConflictDecision::ApplyRemote
        );
        assert_eq!(
            resolve_conflict(Some(T), Some("e2"), T_PLUS_1H),
            ConflictDecision::OverwriteRemote {
                if_match: Some("e2".into())
            }
        );
    }

    #[test]
    fn metadata_prefers_newer_entry() {
        assert_eq!(
            resolve_metadata(&entry(Some(T), "Z"), &entry(Some(T_PLUS_1H), "A")),
            MergeSide::Remote
        );
        assert_eq!(
            resolve_metadata(&entry(Some(T_PLUS_1H), "A"), &entry(Some(T), "Z")),
            MergeSide::Local
        );
    }

    #[test]
    fn metadata_ties_break_by_device_id() {
        assert_eq!(
            resolve_metadata(&entry(Some(T), "A"), &entry(Some(T), "B")),
            MergeSide::Remote
        );
        assert_eq!(
            resolve_metadata(&entry(None, "A"), &entry(None, "B")),
            MergeSide::Remote
        );
        assert_eq!(
            resolve_metadata(&entry(Some(T), "A"), &entry(Some(T), "A")),
            MergeSide::Local
        );
    }

    #[test]
    fn metadata_stamped_entry_beats_unstamped() {
        assert_eq!(
            resolve_metadata(&entry(None, "B"), &entry(Some(T), "A")),
            MergeSide::Remote
        );
        assert_eq!(
            resolve_metadata(&entry(Some(T), "A"), &entry(None, "B")),
            MergeSide::Local
        );
    }
}
