use super::certificate::CertificateBundle;
use anyhow::{Context, Result};
use std::{
    fs::{self, DirBuilder, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

pub const CACHE_FILE: &str = "certificate.json";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Last certificate bundle fetched from the API.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    /// Create the cache directory (0700) if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn create_dir(&self) -> Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }

        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)
            .with_context(|| format!("cannot create cache directory {}", self.dir.display()))
    }

    /// Read the cached bundle. `Ok(None)` when nothing has been cached yet.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn read(&self) -> Result<Option<CertificateBundle>> {
        let path = self.path();

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };

        let bundle = serde_json::from_slice(&data)
            .with_context(|| format!("corrupt certificate cache {}", path.display()))?;

        Ok(Some(bundle))
    }

    /// Replace the cached bundle (0600).
    ///
    /// # Errors
    /// Returns an error if the bundle cannot be encoded or written.
    #[instrument(skip(self, bundle), fields(path = %self.path().display()))]
    pub fn write(&self, bundle: &CertificateBundle) -> Result<()> {
        self.create_dir()?;

        let data = serde_json::to_vec(bundle).context("cannot encode certificate")?;

        let path = self.path();
        let tmp = self.dir.join(format!(".{CACHE_FILE}.tmp"));

        write_private(&tmp, &data)?;
        fs::rename(&tmp, &path).with_context(|| format!("cannot replace {}", path.display()))?;

        debug!("certificate cache written");

        Ok(())
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;

    file.write_all(data)
        .with_context(|| format!("cannot write {}", path.display()))?;

    fs::set_permissions(path, Permissions::from_mode(FILE_MODE))
        .with_context(|| format!("cannot set permissions on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::certificate::tests::bundle;
    use secrecy::ExposeSecret;
    use uuid::Uuid;

    fn cache() -> DiskCache {
        DiskCache::new(std::env::temp_dir().join(format!("radrotor-cache-{}", Uuid::new_v4())))
    }

    fn mode(path: &Path) -> Result<u32> {
        Ok(fs::metadata(path)?.permissions().mode() & 0o777)
    }

    #[test]
    fn empty_cache_reads_none() -> Result<()> {
        let cache = cache();
        assert!(cache.read()?.is_none());
        cache.create_dir()?;
        assert!(cache.read()?.is_none());
        assert_eq!(mode(&cache.dir)?, DIR_MODE);
        fs::remove_dir_all(&cache.dir)?;
        Ok(())
    }

    #[test]
    fn write_then_read() -> Result<()> {
        let cache = cache();
        let stored = bundle("cached.example.org");

        cache.write(&stored)?;
        assert_eq!(mode(&cache.path())?, FILE_MODE);

        let read = cache.read()?.ok_or_else(|| anyhow::anyhow!("empty cache"))?;
        assert_eq!(read.certificate, stored.certificate);
        assert_eq!(read.key.expose_secret(), stored.key.expose_secret());

        // overwrite
        let newer = bundle("newer.example.org");
        cache.write(&newer)?;
        let read = cache.read()?.ok_or_else(|| anyhow::anyhow!("empty cache"))?;
        assert_eq!(read.certificate, newer.certificate);

        fs::remove_dir_all(&cache.dir)?;
        Ok(())
    }

    #[test]
    fn corrupt_cache_is_an_error() -> Result<()> {
        let cache = cache();
        cache.create_dir()?;
        fs::write(cache.path(), "{not json")?;
        assert!(cache.read().is_err());
        fs::remove_dir_all(&cache.dir)?;
        Ok(())
    }
}
