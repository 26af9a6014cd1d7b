//! Writing secret entries to local files
//!
//! Each data entry becomes `<dir>/<entry>`, readable by the owner only.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::secret::SecretRecord;
use crate::{Error, Result};

/// Default namespace of the exported secret
pub const DEFAULT_EXPORT_NAMESPACE: &str = "default";

/// Default name of the exported secret
pub const DEFAULT_EXPORT_SECRET: &str = "istio.default";

/// Write every entry of `record` into `dir`, creating it if needed.
///
/// Entry names must be plain file names; a name that would escape `dir` fails
/// the whole export before anything is written. Existing files are replaced.
/// Returns the written paths in entry order.
pub fn export_secret(record: &SecretRecord, dir: &Path) -> Result<Vec<PathBuf>> {
    for name in record.data.keys() {
        validate_entry_name(name)?;
    }

    fs::create_dir_all(dir)
        .map_err(|e| Error::export(format!("failed to create {}: {}", dir.display(), e)))?;

    let mut written = Vec::with_capacity(record.data.len());
    for (name, contents) in &record.data {
        let path = dir.join(name);
        write_private(&path, contents)
            .map_err(|e| Error::export(format!("failed to write {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = contents.len(), "wrote secret entry");
        written.push(path);
    }

    info!(
        namespace = %record.namespace,
        name = %record.name,
        dir = %dir.display(),
        files = written.len(),
        "secret exported"
    );
    Ok(written)
}

fn validate_entry_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(Error::export(format!(
            "secret entry {:?} is not a valid file name",
            name
        )));
    }
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;

    // mode() only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
