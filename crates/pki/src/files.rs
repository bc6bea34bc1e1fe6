use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{IssuedCertificate, Result};

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> { Ok(()) }

fn write_atomic(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    set_mode(&tmp, mode)?;
    fs::rename(&tmp, path)
}

/// Writes `<stem>.crt` (0644) and `<stem>.key` (0400) under `dir`, returning both paths.
pub fn write_pem_files(dir: &Path, stem: &str, pair: &IssuedCertificate) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let crt = dir.join(format!("{stem}.crt"));
    let key = dir.join(format!("{stem}.key"));
    write_atomic(&crt, pair.cert_pem.as_bytes(), 0o644)?;
    write_atomic(&key, pair.key_pem.as_bytes(), 0o400)?;
    debug!(dir = %dir.display(), stem, "wrote certificate pair");
    Ok((crt, key))
}

/// Concatenates PEM blocks, one blank line between entries, skipping empties.
pub fn trust_bundle<'a>(certs: impl IntoIterator<Item = &'a str>) -> String {
    let parts: Vec<&str> = certs.into_iter().map(str::trim).filter(|c| !c.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    parts.join("\n\n") + "\n"
}
