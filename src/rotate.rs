//! Size-triggered rotation of a rotated-log sink: rename the current file
//! with a timestamp suffix, then reopen through the common descriptor
//! path. Grounded on `rotlog.c`.

use chrono::Local;

use crate::buf::SlabArena;
use crate::descriptor::{Descriptor, DescriptorError, OpenFlags, Origin};
use crate::reactor::{Reactor, Token};

const ROTATE_SUFFIX_FORMAT: &str = "%y%m%d.%H%M%S";

#[derive(Debug, snafu::Snafu)]
pub enum RotateError {
    #[snafu(display("failed to rename {from} -> {to}: {source}"))]
    Rename { from: String, to: String, source: std::io::Error },
    #[snafu(display("failed to reopen after rotation: {source}"))]
    Reopen { source: DescriptorError },
}

/// Renames `path` to `path.<timestamp>` and reopens the origin at the
/// original path. The caller (runtime) swaps the returned descriptor in
/// for the old one and carries over the old one's symbol-table/active-list
/// registration.
pub fn rotate(
    origin: &Origin,
    origin_id: usize,
    reactor: &mut dyn Reactor,
    arena: &mut SlabArena,
    token: Token,
) -> Result<Descriptor, RotateError> {
    let path = origin.path.as_ref().expect("rotated-log origin requires a path");
    let suffix = Local::now().format(ROTATE_SUFFIX_FORMAT).to_string();
    let renamed = path.with_file_name(format!("{}.{suffix}", path.file_name().unwrap().to_string_lossy()));

    std::fs::rename(path, &renamed).map_err(|source| RotateError::Rename {
        from: path.display().to_string(),
        to: renamed.display().to_string(),
        source,
    })?;

    Descriptor::open_from_origin(origin_id, origin, OpenFlags::default(), reactor, arena, token)
        .map_err(|source| RotateError::Reopen { source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_target_name_carries_timestamp_suffix() {
        let path = std::path::PathBuf::from("/var/log/app.log");
        let suffix = "260101.000000";
        let renamed = path.with_file_name(format!("{}.{suffix}", path.file_name().unwrap().to_string_lossy()));
        assert_eq!(renamed, std::path::PathBuf::from("/var/log/app.log.260101.000000"));
    }
}
