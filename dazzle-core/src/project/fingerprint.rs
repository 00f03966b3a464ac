//! Chunk fingerprinting.
//!
//! A chunk's fingerprint is a keyed 256-bit HighwayHash over a canonical
//! manifest of its inputs: the (digested) base reference, the Dockerfile
//! bytes, the enumerated context files and - for test images - the
//! YAML-serialized test specs. The key is baked in so fingerprints agree
//! bit-for-bit across machines; the fingerprint becomes the stable image tag
//! suffix, which is what makes registry lookups meaningful across runs.

use crate::error::{DazzleError, Result};
use crate::project::ProjectChunk;
use highway::{HighwayHash, HighwayHasher, Key};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use walkdir::WalkDir;

/// Fixed hash key. Changing this invalidates every previously pushed tag.
const HASH_KEY: [u8; 32] = [
    0x03, 0x40, 0xf3, 0xc8, 0x94, 0x7c, 0xad, 0x78, 0x75, 0x14, 0x0f, 0x4c, 0x4a, 0xf7, 0xc6,
    0x2b, 0x43, 0x13, 0x1d, 0xc2, 0xa8, 0xc7, 0xfc, 0x46, 0x28, 0xf0, 0x68, 0x5e, 0x36, 0x9a,
    0x3b, 0x0b,
];

fn keyed_hasher() -> HighwayHasher {
    let mut words = [0u64; 4];
    for (i, chunk) in HASH_KEY.chunks_exact(8).enumerate() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        words[i] = u64::from_le_bytes(buf);
    }
    HighwayHasher::new(Key(words))
}

fn finish_hex(hasher: HighwayHasher) -> String {
    let words = hasher.finalize256();
    let mut bytes = [0u8; 32];
    for (i, word) in words.iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
    }
    const_hex::encode(bytes)
}

impl ProjectChunk {
    /// Compute the chunk fingerprint. `base_ref` is the digested base
    /// reference, or the empty string when hashing the base chunk itself.
    pub fn fingerprint(&self, base_ref: &str, include_tests: bool) -> Result<String> {
        let mut manifest = Vec::new();
        self.write_hash_manifest(base_ref, include_tests, &mut manifest)?;
        let mut hasher = keyed_hasher();
        hasher.append(&manifest);
        Ok(finish_hex(hasher))
    }

    /// Write the canonical hash manifest. Exposed for debugging via the
    /// `project print-manifest` command.
    pub fn write_hash_manifest(
        &self,
        base_ref: &str,
        include_tests: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        let wrap = |e: std::io::Error| DazzleError::HashCompute {
            chunk: self.name.clone(),
            source: e.into(),
        };
        let wrap_yaml = |e: serde_yaml::Error| DazzleError::HashCompute {
            chunk: self.name.clone(),
            source: e.into(),
        };

        let sources = enumerate_sources(&self.name, &self.context_path)?;

        if !base_ref.is_empty() {
            writeln!(out, "Baseref: {base_ref}").map_err(wrap)?;
        }
        write!(out, "Dockerfile: ").map_err(wrap)?;
        out.write_all(&self.dockerfile).map_err(wrap)?;
        writeln!(out).map_err(wrap)?;
        writeln!(out, "Sources:\n{}", sources.join("\n")).map_err(wrap)?;
        if !self.args.is_empty() {
            let args = serde_yaml::to_string(&self.args).map_err(wrap_yaml)?;
            writeln!(out, "Args:\n{args}").map_err(wrap)?;
        }
        if include_tests {
            let tests = serde_yaml::to_string(&self.tests).map_err(wrap_yaml)?;
            writeln!(out, "Tests:\n{tests}").map_err(wrap)?;
        }
        Ok(())
    }
}

/// Enumerate the chunk context, producing one line per entry:
/// `/<relpath>:<hash>` for files, `/<relpath>` for directories, sorted
/// lexicographically by relative path. A missing context directory is
/// equivalent to an empty one.
fn enumerate_sources(chunk: &str, context: &Path) -> Result<Vec<String>> {
    if !context.exists() {
        return Ok(Vec::new());
    }
    let err = |source: Box<dyn std::error::Error + Send + Sync>| DazzleError::HashCompute {
        chunk: chunk.to_string(),
        source,
    };

    let root = context.canonicalize().map_err(|e| err(e.into()))?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(context).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| err(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(context)
            .map_err(|e| err(e.into()))?
            .to_string_lossy()
            .replace('\\', "/");

        if entry.path_is_symlink() {
            let target = entry.path().canonicalize().map_err(|e| err(e.into()))?;
            if !target.starts_with(&root) {
                return Err(err(format!(
                    "symlink {rel} points outside the chunk context"
                )
                .into()));
            }
        }

        let metadata = std::fs::metadata(entry.path()).map_err(|e| err(e.into()))?;
        if metadata.is_dir() {
            entries.push(format!("/{rel}"));
        } else {
            let content = std::fs::read(entry.path()).map_err(|e| err(e.into()))?;
            let mut hasher = keyed_hasher();
            hasher.append(&content);
            entries.push(format!("/{rel}:{}", finish_hex(hasher)));
        }
    }
    entries.sort();
    Ok(entries)
}

/// Fingerprint memoization, keyed by chunk name and the include-tests bit.
///
/// Owned by the build session rather than the chunk so that chunks stay
/// immutable. Two slots per chunk, invalidated only by a fresh project load
/// (which starts a fresh session).
#[derive(Debug, Default)]
pub struct FingerprintCache {
    inner: Mutex<HashMap<(String, bool), String>>,
}

impl FingerprintCache {
    pub fn get_or_compute(
        &self,
        chunk: &ProjectChunk,
        base_ref: &str,
        include_tests: bool,
    ) -> Result<String> {
        let key = (chunk.name.clone(), include_tests);
        if let Some(hit) = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return Ok(hit.clone());
        }
        let computed = chunk.fingerprint(base_ref, include_tests)?;
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, computed.clone());
        Ok(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::Spec;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn base_chunk() -> ProjectChunk {
        ProjectChunk {
            name: "base".to_string(),
            dockerfile: b"FROM alpine".to_vec(),
            // Deliberately nonexistent: the context enumeration of an absent
            // directory is empty.
            context_path: PathBuf::from("base"),
            ..Default::default()
        }
    }

    fn ls_test() -> Spec {
        Spec {
            desc: "it should run ls".to_string(),
            command: vec!["ls".to_string()],
            assertions: vec!["status == 0".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_base_fingerprint_is_pinned() {
        let hash = base_chunk().fingerprint("", false).unwrap();
        assert_eq!(
            hash,
            "550ccae3705ce9627190644ef89f404f94b8d6f9d13d8df537ca66080dd326b2"
        );
    }

    #[test]
    fn test_tests_do_not_affect_exclusive_fingerprint() {
        let without = base_chunk().fingerprint("", false).unwrap();
        let mut with_tests = base_chunk();
        with_tests.tests = vec![ls_test()];
        assert_eq!(with_tests.fingerprint("", false).unwrap(), without);
    }

    #[test]
    fn test_tests_affect_inclusive_fingerprint() {
        let mut chunk = base_chunk();
        let plain = chunk.fingerprint("", true).unwrap();
        chunk.tests = vec![ls_test()];
        let with_ls = chunk.fingerprint("", true).unwrap();
        assert_ne!(plain, with_ls);

        let mut pwd = ls_test();
        pwd.desc = "it should run pwd".to_string();
        pwd.command = vec!["pwd".to_string()];
        chunk.tests = vec![pwd];
        assert_ne!(chunk.fingerprint("", true).unwrap(), with_ls);
    }

    #[test]
    fn test_base_ref_affects_fingerprint() {
        let chunk = base_chunk();
        let without = chunk.fingerprint("", false).unwrap();
        let with = chunk
            .fingerprint("example.com/repo@sha256:abc", false)
            .unwrap();
        assert_ne!(without, with);
    }

    #[test]
    fn test_dockerfile_affects_fingerprint() {
        let mut chunk = base_chunk();
        let alpine = chunk.fingerprint("", false).unwrap();
        chunk.dockerfile = b"FROM ubuntu".to_vec();
        assert_ne!(chunk.fingerprint("", false).unwrap(), alpine);
    }

    #[test]
    fn test_context_files_affect_fingerprint() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine").unwrap();
        let chunk = ProjectChunk {
            name: "ctx".to_string(),
            dockerfile: b"FROM alpine".to_vec(),
            context_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let before = chunk.fingerprint("", false).unwrap();

        std::fs::write(dir.path().join("extra.txt"), "hello").unwrap();
        let after = chunk.fingerprint("", false).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_variants_produce_distinct_fingerprints() {
        // Two variants over the same Dockerfile, distinguished only by their
        // build args.
        let variant = |version: &str| {
            let mut args = std::collections::BTreeMap::new();
            args.insert("GO_VERSION".to_string(), version.to_string());
            ProjectChunk {
                name: format!("foobar:{version}"),
                dockerfile: b"ARG GO_VERSION\nFROM golang:${GO_VERSION}".to_vec(),
                context_path: PathBuf::from("does-not-exist"),
                args,
                ..Default::default()
            }
        };
        assert_ne!(
            variant("1.16.3").fingerprint("", false).unwrap(),
            variant("1.16.4").fingerprint("", false).unwrap()
        );
    }

    #[test]
    fn test_symlink_escape_is_an_error() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "boo").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();

        let chunk = ProjectChunk {
            name: "escape".to_string(),
            dockerfile: b"FROM alpine".to_vec(),
            context_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = chunk.fingerprint("", false).unwrap_err();
        assert!(matches!(err, DazzleError::HashCompute { .. }));
    }

    #[test]
    fn test_cache_returns_stable_values() {
        let cache = FingerprintCache::default();
        let chunk = base_chunk();
        let first = cache.get_or_compute(&chunk, "", false).unwrap();
        let second = cache.get_or_compute(&chunk, "", false).unwrap();
        assert_eq!(first, second);
        let with_tests = cache.get_or_compute(&chunk, "", true).unwrap();
        assert_ne!(first, with_tests);
    }
}
