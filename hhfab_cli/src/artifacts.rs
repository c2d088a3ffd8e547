use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use tokio::process::Command;
use uuid::Uuid;

use hhfab_definitions::RegistryConfig;

use crate::{ErrorKind, Result, ResultExt};

/// One file to materialize out of an artifact
#[derive(Clone, Debug)]
pub struct ArtifactFile {
    /// Logical name inside the artifact
    pub source: String,
    /// Filename to produce in the destination
    pub target: String,
}

impl ArtifactFile {
    pub fn new(source: &str, target: &str) -> ArtifactFile {
        ArtifactFile { source: source.into(), target: target.into() }
    }

    /// Same name on both sides
    pub fn plain(name: &str) -> ArtifactFile {
        ArtifactFile::new(name, name)
    }
}

/// Content-addressed artifact cache
///
/// Presents a synchronous "these files exist under that directory at this
/// version" contract over the opaque `oras` puller. Entries live under
/// `{cache}/{name}/{version}` and become visible atomically via rename, so
/// a crashed fetch never leaves a half-entry behind.
pub struct Cache {
    dir: PathBuf,
    registry: RegistryConfig,
}

impl Cache {
    pub fn new(dir: PathBuf, registry: RegistryConfig) -> Cache {
        Cache { dir, registry }
    }

    /// Default location under the user's home
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or("can't find home directory")?;
        Ok(home.join(".hhfab-cache"))
    }

    fn entry(&self, name: &str, version: &str) -> PathBuf {
        self.dir.join(name).join(version)
    }

    /// Make sure the artifact is cached, fetching it if needed
    async fn ensure(&self, name: &str, version: &str) -> Result<PathBuf> {
        let entry = self.entry(name, version);
        if entry.is_dir() {
            trace!("{}:{} already cached", name, version);
            return Ok(entry);
        }

        if Version::parse(version.trim_start_matches('v')).is_err() {
            // floating tags defeat the whole point of the cache
            warn!("artifact version {}:{} is not a pinned semver", name, version);
        }

        let reference = self.registry.reference(name, version);
        let staging = self.dir.join(format!(".fetch-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        info!("Fetching {}", reference);
        let res = self.pull(&reference, &staging).await;
        if let Err(e) = res {
            let _ = fs::remove_dir_all(&staging);
            return Err(e).chain_err(|| ErrorKind::ArtifactFetch(reference));
        }

        fs::create_dir_all(entry.parent().expect("entry has a parent"))?;
        match fs::rename(&staging, &entry) {
            Ok(()) => Ok(entry),
            Err(_) if entry.is_dir() => {
                // somebody else fetched it first; theirs is as good as ours
                let _ = fs::remove_dir_all(&staging);
                Ok(entry)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e).chain_err(|| ErrorKind::ArtifactFetch(self.registry.reference(name, version)))
            }
        }
    }

    async fn pull(&self, reference: &str, dest: &Path) -> Result<()> {
        let oras = which::which("oras").map_err(|_| "oras not found on PATH")?;
        debug!("oras pull {} -o {}", reference, dest.display());
        let out = Command::new(oras)
            .arg("pull")
            .arg(reference)
            .arg("-o")
            .arg(dest)
            .output()
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("oras pull {} failed: {}", reference, stderr.trim());
        }
        Ok(())
    }

    /// Materialize files of an artifact version into a directory
    ///
    /// On success every target file exists under `dest`; on failure none of
    /// them appear. Files are hard-linked out of the cache where the
    /// filesystem allows, copied otherwise.
    pub async fn materialize(
        &self,
        dest: &Path,
        name: &str,
        version: &str,
        files: &[ArtifactFile],
    ) -> Result<()> {
        let entry = self.ensure(name, version).await?;
        fs::create_dir_all(dest)?;

        // stage under temporary names so a failure mid-way is invisible
        let mut staged: Vec<(PathBuf, PathBuf)> = vec![];
        let tag = Uuid::new_v4().to_string();
        for f in files {
            let src = entry.join(&f.source);
            let tmp = dest.join(format!(".{}-{}", f.target, tag));
            let fin = dest.join(&f.target);
            let res = fs::hard_link(&src, &tmp).or_else(|_| fs::copy(&src, &tmp).map(|_| ()));
            match res {
                Ok(()) => staged.push((tmp, fin)),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    return Err(e).chain_err(|| {
                        ErrorKind::ArtifactFetch(format!("{}:{} file {}", name, version, f.source))
                    });
                }
            }
        }
        for (tmp, fin) in staged {
            fs::rename(tmp, fin)?;
        }
        debug!("Materialized {} files from {}:{} into {}", files.len(), name, version, dest.display());
        Ok(())
    }

    /// Run a closure against the cached artifact directory without copying
    pub async fn with_artifact<T, F>(&self, name: &str, version: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let entry = self.ensure(name, version).await?;
        f(&entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let d = std::env::temp_dir().join(format!("hhfab-cache-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&d).unwrap();
        d
    }

    fn cache_with(dir: &Path, name: &str, version: &str, files: &[(&str, &str)]) -> Cache {
        let entry = dir.join(name).join(version);
        fs::create_dir_all(&entry).unwrap();
        for (fname, content) in files {
            fs::write(entry.join(fname), content).unwrap();
        }
        let registry = RegistryConfig { repo: "localhost".into(), prefix: "test".into() };
        Cache::new(dir.to_path_buf(), registry)
    }

    #[tokio::test]
    async fn materialize_links_cached_files() {
        let root = scratch();
        let c = cache_with(&root, "flatcar", "v1.0.0", &[("os.img", "disk"), ("code.fd", "fw")]);
        let dest = root.join("out");
        let files = vec![ArtifactFile::plain("os.img"), ArtifactFile::new("code.fd", "efi_code.fd")];
        c.materialize(&dest, "flatcar", "v1.0.0", &files).await.unwrap();
        assert_eq!(fs::read_to_string(dest.join("os.img")).unwrap(), "disk");
        assert_eq!(fs::read_to_string(dest.join("efi_code.fd")).unwrap(), "fw");
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn materialize_is_all_or_nothing() {
        let root = scratch();
        let c = cache_with(&root, "flatcar", "v1.0.0", &[("os.img", "disk")]);
        let dest = root.join("out");
        let files = vec![ArtifactFile::plain("os.img"), ArtifactFile::plain("missing.fd")];
        assert!(c.materialize(&dest, "flatcar", "v1.0.0", &files).await.is_err());
        // the file that did stage must not be visible
        assert!(!dest.join("os.img").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn with_artifact_exposes_cache_dir() {
        let root = scratch();
        let c = cache_with(&root, "tools", "v2.0.0", &[("hhnet", "#!/bin/sh")]);
        let got = c
            .with_artifact("tools", "v2.0.0", |dir| Ok(fs::read_to_string(dir.join("hhnet"))?))
            .await
            .unwrap();
        assert_eq!(got, "#!/bin/sh");
        let _ = fs::remove_dir_all(root);
    }
}
