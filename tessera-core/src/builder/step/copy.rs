use super::super::context::BuildContext;
use super::super::directive::{Directive, DirectiveKind};
use super::{cache_digester, commit_str};
use crate::error::{Result, TesseraError};
use crate::fsutil::{is_special, rel_path, trim_root};
use crate::image::{Digester, ImageConfig};
use crate::snapshot::{resolve_chown, CopyOperation};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// COPY and ADD.
#[derive(Debug)]
pub struct CopyStep {
    pub(super) directive: Directive,
    pub(super) cache_id: String,
    from_stage: Option<String>,
    chown: Option<String>,
    sources: Vec<String>,
    destination: String,
    from_add: bool,
    work_dir: String,
}

impl CopyStep {
    /// Copies out of the build context hash the content of every source
    /// into the cache ID. Copies out of another stage get a random ID,
    /// since the stage's output is not known yet.
    pub fn new(directive: Directive, seed: &str, context_dir: &Path) -> Result<Self> {
        let (from_stage, chown, sources, destination, from_add) = match &directive.kind {
            DirectiveKind::Copy { from_stage, chown, sources, destination } => {
                (from_stage.clone(), chown.clone(), sources.clone(), destination.clone(), false)
            }
            DirectiveKind::Add { chown, sources, destination } => {
                (None, chown.clone(), sources.clone(), destination.clone(), true)
            }
            _ => {
                return Err(TesseraError::Internal(format!("{} is not a COPY or ADD directive", directive)))
            }
        };

        let cache_id = if from_stage.is_some() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            let mut digester = cache_digester(seed, &directive);
            digester.update(commit_str(&directive).as_bytes());
            for source in &sources {
                for path in expand_sources(context_dir, source)? {
                    hash_tree(&mut digester, context_dir, &path)?;
                }
            }
            digester.finish().hex().to_string()
        };

        Ok(Self {
            directive,
            cache_id,
            from_stage,
            chown,
            sources,
            destination,
            from_add,
            work_dir: "/".to_string(),
        })
    }

    pub fn apply_config(&mut self, config: &ImageConfig) -> Result<()> {
        if !config.config.working_dir.is_empty() {
            self.work_dir = config.config.working_dir.clone();
        }
        Ok(())
    }

    /// Queues the copy for the next commit, and performs it on disk when
    /// `modify_fs` is set.
    pub fn execute(&mut self, ctx: &mut BuildContext, modify_fs: bool) -> Result<()> {
        let src_root = match &self.from_stage {
            Some(alias) => ctx.copy_from_root(alias),
            None => ctx.context_dir.clone(),
        };

        let mut srcs = Vec::new();
        for source in &self.sources {
            for path in expand_sources(&src_root, source)? {
                srcs.push(trim_root(&path, &src_root).map_err(|e| TesseraError::io(&path, e))?);
            }
        }

        let owner = match &self.chown {
            Some(spec) => resolve_chown(spec, &ctx.root_dir)?,
            None => None,
        };
        let op = CopyOperation::new(
            srcs,
            &src_root,
            &self.work_dir,
            &self.destination,
            owner,
            self.from_stage.is_some(),
            ctx.copy_blacklist(),
            self.from_add,
        )?;

        if modify_fs {
            op.execute(&ctx.root_dir)?;
        }
        ctx.copy_ops.push(op);
        Ok(())
    }
}

/// Expands `source` (relative to `root`, globs allowed) to existing paths.
fn expand_sources(root: &Path, source: &str) -> Result<Vec<PathBuf>> {
    let joined = root.join(rel_path(source));
    if !source.contains(['*', '?', '[']) {
        return match fs::symlink_metadata(&joined) {
            Ok(_) => Ok(vec![joined]),
            Err(e) => Err(TesseraError::io(&joined, e)),
        };
    }

    let pattern = joined.to_string_lossy().into_owned();
    let paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| TesseraError::InvalidConfig { reason: format!("bad source pattern {}: {}", source, e) })?
        .filter_map(|p| p.ok())
        .collect();
    if paths.is_empty() {
        return Err(TesseraError::io(
            &joined,
            io::Error::new(io::ErrorKind::NotFound, "no source files match"),
        ));
    }
    Ok(paths)
}

// Folds every file below `path` into the digest: its path and mode, plus
// link target or content. Special files are skipped.
fn hash_tree(digester: &mut Digester, context_dir: &Path, path: &Path) -> Result<()> {
    let io_err = |p: &Path, e: io::Error| TesseraError::io(p, e);
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let at = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
            io_err(&at, e.into())
        })?;
        let md = entry.metadata().map_err(|e| io_err(entry.path(), e.into()))?;
        if is_special(&md) {
            continue;
        }

        let rel = trim_root(entry.path(), context_dir).map_err(|e| io_err(entry.path(), e))?;
        digester.update(rel.as_bytes());
        digester.update(format!("{:o}", md.permissions().mode()).as_bytes());
        if md.file_type().is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| io_err(entry.path(), e))?;
            digester.update(target.to_string_lossy().as_bytes());
        } else if md.is_file() {
            let mut file = fs::File::open(entry.path()).map_err(|e| io_err(entry.path(), e))?;
            io::copy(&mut file, digester).map_err(|e| io_err(entry.path(), e))?;
        }
    }
    debug!(path = %path.display(), "Hashed copy source");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn copy(sources: &[&str], from_stage: Option<&str>) -> Directive {
        let args = sources.join(" ") + " /dst/";
        Directive::new(
            DirectiveKind::Copy {
                from_stage: from_stage.map(String::from),
                chown: None,
                sources: sources.iter().map(|s| s.to_string()).collect(),
                destination: "/dst/".into(),
            },
            args,
        )
    }

    #[test]
    fn test_cache_id_follows_content() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.txt"), b"one").unwrap();

        let first = CopyStep::new(copy(&["src"], None), "seed", dir.path()).unwrap().cache_id;
        let again = CopyStep::new(copy(&["src"], None), "seed", dir.path()).unwrap().cache_id;
        assert_eq!(first, again);

        fs::write(dir.path().join("src/a.txt"), b"two").unwrap();
        let changed = CopyStep::new(copy(&["src"], None), "seed", dir.path()).unwrap().cache_id;
        assert_ne!(first, changed);
    }

    #[test]
    fn test_globs_and_missing_sources() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let paths = expand_sources(dir.path(), "*.txt").unwrap();
        assert_eq!(paths.len(), 2);
        assert!(expand_sources(dir.path(), "*.md").is_err());
        assert!(CopyStep::new(copy(&["missing"], None), "seed", dir.path()).is_err());
    }

    #[test]
    fn test_stage_copies_get_unique_ids() {
        let dir = TempDir::new().unwrap();
        let a = CopyStep::new(copy(&["/out"], Some("build")), "seed", dir.path()).unwrap();
        let b = CopyStep::new(copy(&["/out"], Some("build")), "seed", dir.path()).unwrap();
        assert_ne!(a.cache_id, b.cache_id);
    }
}
