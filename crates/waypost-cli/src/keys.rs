//! Node identity key file: a single line holding the hex-encoded Ed25519 seed.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;
use waypost_types::error::{WaypostError, WaypostResult};
use waypost_types::identity::NodeKeys;
use zeroize::Zeroizing;

/// Load the key at `path`, generating and saving a new one if it does not exist.
pub fn load_or_create(path: &Path) -> WaypostResult<NodeKeys> {
    if path.exists() {
        let seed = Zeroizing::new(std::fs::read_to_string(path)?);
        let keys = NodeKeys::from_seed_hex(&seed)?;
        info!(path = %path.display(), identity = %keys.identity_id(), "Loaded node identity");
        return Ok(keys);
    }

    let keys = NodeKeys::generate();
    write(path, &keys)?;
    info!(path = %path.display(), identity = %keys.identity_id(), "Generated node identity");
    Ok(keys)
}

/// Generate a key and write it to `path`. Refuses to overwrite unless `force`.
pub fn generate(path: &Path, force: bool) -> WaypostResult<NodeKeys> {
    if path.exists() && !force {
        return Err(WaypostError::AlreadyExists(format!(
            "{} (use --force to replace it)",
            path.display()
        )));
    }
    let keys = NodeKeys::generate();
    write(path, &keys)?;
    Ok(keys)
}

fn write(path: &Path, keys: &NodeKeys) -> WaypostResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        restrict_dir_permissions(dir);
    }
    let seed = Zeroizing::new(format!("{}\n", keys.seed_hex()));
    let mut file = open_private(path)?;
    // An existing file keeps its old mode when opened, so tighten it before writing.
    restrict_file_permissions(path);
    file.write_all(seed.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Open `path` for writing, creating it owner-only (0600) on Unix.
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    File::create(path)
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

#[cfg(unix)]
fn restrict_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &Path) {}
