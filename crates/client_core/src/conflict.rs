use std::future::Future;

use shared::{
    domain::{FileId, VersionTag},
    error::PlatformError,
    protocol::{KeyHeader, RemoteHeader, TargetDrive},
};
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    model::{Conversation, Message},
    platform::DrivePlatform,
};

/// A record that is written with the version tag it last observed.
pub trait VersionedRecord {
    fn unique_id(&self) -> String;
    /// Takes the authoritative identity and version from a fresh header.
    fn adopt_remote(&mut self, header: &RemoteHeader);
}

fn adopt(
    file_id: &mut Option<FileId>,
    version_tag: &mut Option<VersionTag>,
    key_header: &mut Option<KeyHeader>,
    header: &RemoteHeader,
) {
    *file_id = Some(header.file_id.clone());
    *version_tag = Some(header.metadata.version_tag.clone());
    if header.key_header.is_some() {
        *key_header = header.key_header.clone();
    }
}

impl VersionedRecord for Message {
    fn unique_id(&self) -> String {
        self.id.to_string()
    }

    fn adopt_remote(&mut self, header: &RemoteHeader) {
        adopt(
            &mut self.file_id,
            &mut self.version_tag,
            &mut self.key_header,
            header,
        );
    }
}

impl VersionedRecord for Conversation {
    fn unique_id(&self) -> String {
        self.id.to_string()
    }

    fn adopt_remote(&mut self, header: &RemoteHeader) {
        adopt(
            &mut self.file_id,
            &mut self.version_tag,
            &mut self.key_header,
            header,
        );
    }
}

/// Runs `write` against `record`. On a version conflict the authoritative
/// version tag is fetched by unique id, copied onto `record`, and `write` runs
/// exactly once more. A second conflict is returned as
/// [`SyncError::VersionConflict`].
pub async fn patch_with_retry<R, T, F, Fut>(
    platform: &dyn DrivePlatform,
    drive: &TargetDrive,
    record: &mut R,
    mut write: F,
) -> SyncResult<T>
where
    R: VersionedRecord + Clone,
    F: FnMut(R) -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    match write(record.clone()).await {
        Ok(result) => return Ok(result),
        Err(err) if err.is_version_conflict() => {}
        Err(err) => return Err(err.into()),
    }

    let unique_id = record.unique_id();
    info!(unique_id = %unique_id, "sync: version conflict, refreshing version tag");
    let header = platform
        .get_file_header_by_unique_id(drive, &unique_id)
        .await?
        .ok_or_else(|| SyncError::NotFound(unique_id.clone()))?;
    record.adopt_remote(&header);

    match write(record.clone()).await {
        Ok(result) => Ok(result),
        Err(err) if err.is_version_conflict() => {
            warn!(unique_id = %unique_id, "sync: version conflict persisted after retry");
            Err(SyncError::VersionConflict { unique_id })
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
#[path = "tests/conflict_tests.rs"]
mod tests;
