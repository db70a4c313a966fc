//! The per-session compilation workspace.

use std::collections::BTreeMap;
use std::future::Future;
use std::process::Output;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_cache::Cache;
use kiln_io::create_scratch_dir;
use kiln_proto::{ArtifactFile, CompilationResultMessage, Compression, ContentHash};
use tracing::{debug, trace, warn};

use crate::arguments::{Arguments, CompilerKind};
use crate::error::{EnvError, Result};
use crate::mapping::{self, unmap_path, unmap_text};
use crate::sandbox::PROBE_TIMEOUT;
use crate::shell::ShellEnvironment;

/// Settings an [`Environment`] is created with.
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    pub shell: ShellEnvironment,
    pub compression: Compression,
    pub compilation_timeout: Duration,
}

/// An isolated instance folder under the scratch root, holding one
/// client's files at their mapped paths.
///
/// The instance folder is deleted by [`Environment::remove`], or on drop
/// if it was never removed explicitly.
#[derive(Debug)]
pub struct Environment {
    instance: Utf8PathBuf,
    mapped_cwd: String,
    options: EnvironmentOptions,
    removed: bool,
}

impl Environment {
    /// Create a fresh instance folder under `scratch` and the client's
    /// working directory inside it.
    ///
    /// A `cwd` that resolves outside the instance folder fails with
    /// [`EnvError::PathOutsideInstance`].
    pub async fn create(scratch: &Utf8Path, cwd: &str, options: EnvironmentOptions) -> Result<Self> {
        let instance = create_scratch_dir(scratch)
            .await
            .map_err(|source| EnvError::InstanceFolder {
                path: scratch.to_path_buf(),
                source,
            })?;

        // Owned from here on, so a failure below still cleans up
        let mut env = Self {
            mapped_cwd: mapping::map_cwd(instance.as_str(), cwd),
            instance,
            options,
            removed: false,
        };
        env.mapped_cwd = mapping::confine(env.instance.as_str(), &env.mapped_cwd).ok_or_else(|| {
            EnvError::PathOutsideInstance {
                path: cwd.to_string(),
            }
        })?;

        tokio::fs::create_dir_all(&env.mapped_cwd)
            .await
            .map_err(|source| EnvError::InstanceFolder {
                path: Utf8PathBuf::from(&env.mapped_cwd),
                source,
            })?;

        debug!(
            instance = %env.instance,
            shell = %env.options.shell,
            "created environment"
        );
        Ok(env)
    }

    /// Delete the instance folder without blocking the runtime.
    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.instance).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(instance = %self.instance, error = %e, "failed to remove instance folder");
        }
    }

    pub fn instance(&self) -> &Utf8Path {
        &self.instance
    }

    pub fn mapped_cwd(&self) -> &str {
        &self.mapped_cwd
    }

    pub fn shell(&self) -> &ShellEnvironment {
        &self.options.shell
    }

    pub fn compression(&self) -> Compression {
        self.options.compression
    }

    pub fn compilation_timeout(&self) -> Duration {
        self.options.compilation_timeout
    }

    /// Map the invocation into the instance folder. The output file must
    /// stay inside it.
    pub fn map_args(&self, args: &Arguments) -> Result<Arguments> {
        let mapped = args.mapped(self.instance.as_str(), &self.mapped_cwd);
        if let Some(output) = mapped.output()
            && mapping::confine(self.instance.as_str(), output).is_none()
        {
            return Err(EnvError::PathOutsideInstance {
                path: args.output().unwrap_or(output).to_string(),
            });
        }
        Ok(mapped)
    }

    pub fn map_dependency_paths(
        &self,
        dependencies: &BTreeMap<String, ContentHash>,
    ) -> Result<BTreeMap<String, ContentHash>> {
        mapping::map_dependency_paths(self.instance.as_str(), &self.mapped_cwd, dependencies)
    }

    /// The dependencies that still have to be transferred.
    ///
    /// Entries already linked into this workspace are skipped; entries the
    /// cache already holds are linked on the spot.
    pub async fn get_needed_dependencies(
        &self,
        dependencies: &BTreeMap<String, ContentHash>,
        cache: &Cache,
    ) -> Result<BTreeMap<String, ContentHash>> {
        let mut needed = BTreeMap::new();
        for (path, hash) in dependencies {
            if self.is_linked(path, hash, cache).await {
                trace!(path, "dependency already linked");
                continue;
            }
            if cache.contains(hash).await {
                self.link_dependency_to_cache(path, hash, cache).await?;
                continue;
            }
            needed.insert(path.clone(), *hash);
        }
        Ok(needed)
    }

    async fn is_linked(&self, path: &str, hash: &ContentHash, cache: &Cache) -> bool {
        match tokio::fs::read_link(path).await {
            Ok(target) => target.as_path() == cache.path(hash).as_std_path(),
            Err(_) => false,
        }
    }

    /// Make the cached blob for `hash` visible at the mapped `path`.
    pub async fn link_dependency_to_cache(
        &self,
        path: &str,
        hash: &ContentHash,
        cache: &Cache,
    ) -> Result<()> {
        let link_error = |source| EnvError::Link {
            path: path.to_string(),
            source,
        };

        if mapping::confine(self.instance.as_str(), path).is_none() {
            return Err(EnvError::PathOutsideInstance {
                path: unmap_path(self.instance.as_str(), path),
            });
        }

        let link = Utf8Path::new(path);
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(link_error)?;
        }
        if tokio::fs::symlink_metadata(link).await.is_ok() {
            tokio::fs::remove_file(link).await.map_err(link_error)?;
        }
        tokio::fs::symlink(cache.path(hash), link)
            .await
            .map_err(link_error)?;

        trace!(path, hash = %hash.short_hex(), "linked dependency");
        Ok(())
    }

    async fn probe_compiler(&self, compiler: &str, args: &[&str]) -> Option<Output> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let mut cmd = self.options.shell.command(compiler, &args, None);
        match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => Some(output),
            Ok(Ok(output)) => {
                debug!(compiler, args = ?args, status = %output.status, "compiler probe failed");
                None
            }
            Ok(Err(e)) => {
                debug!(compiler, error = %e, "compiler probe could not be spawned");
                None
            }
            Err(_) => {
                debug!(compiler, "compiler probe timed out");
                None
            }
        }
    }

    /// Whether the compiler can be invoked in this environment.
    pub async fn compiler_exists(&self, args: &Arguments) -> bool {
        self.probe_compiler(args.compiler(), &["--version"])
            .await
            .is_some()
    }

    /// The compiler's default target triple.
    pub async fn compiler_target_triple(&self, args: &Arguments) -> Option<String> {
        let output = self.probe_compiler(args.compiler(), &["-dumpmachine"]).await?;
        let triple = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!triple.is_empty()).then_some(triple)
    }

    /// Whether the compiler can generate code for `target`.
    ///
    /// Fails with [`EnvError::UnsupportedCompiler`] when the compiler's
    /// multiarch support cannot be determined.
    pub async fn compiler_supports_target(&self, args: &Arguments, target: &str) -> Result<bool> {
        let compiler = args.compiler();
        let unsupported = || EnvError::UnsupportedCompiler(compiler.to_string());

        match args.compiler_kind() {
            CompilerKind::Clang => {
                if self.compiler_target_triple(args).await.as_deref() == Some(target) {
                    return Ok(true);
                }
                let output = self
                    .probe_compiler(compiler, &["-print-targets"])
                    .await
                    .ok_or_else(unsupported)?;
                let targets = parse_clang_targets(&String::from_utf8_lossy(&output.stdout));
                let arch = normalize_arch(target.split('-').next().unwrap_or(target));
                Ok(targets.iter().any(|t| normalize_arch(t) == arch))
            }
            CompilerKind::Gcc => {
                let default = self
                    .compiler_target_triple(args)
                    .await
                    .ok_or_else(unsupported)?;
                Ok(default == target)
            }
            CompilerKind::Unknown => Err(unsupported()),
        }
    }

    /// Run the (already mapped) invocation and collect its artifacts.
    ///
    /// `disconnected` resolves when the client goes away; the compiler is
    /// killed and [`EnvError::ClientDisconnected`] returned. Exceeding the
    /// compilation timeout kills the compiler and returns
    /// [`EnvError::CompilationTimeout`].
    pub async fn do_compilation<D>(
        &self,
        args: &Arguments,
        disconnected: D,
    ) -> Result<CompilationResultMessage>
    where
        D: Future<Output = ()>,
    {
        let timeout = self.options.compilation_timeout;
        let mut cmd =
            self.options
                .shell
                .command(args.compiler(), args.compiler_args(), Some(&self.mapped_cwd));

        debug!(args = %args, cwd = %self.mapped_cwd, "running compiler");

        let output = tokio::select! {
            result = tokio::time::timeout(timeout, cmd.output()) => match result {
                Ok(output) => output?,
                Err(_) => return Err(EnvError::CompilationTimeout { timeout }),
            },
            () = disconnected => return Err(EnvError::ClientDisconnected),
        };

        let instance = self.instance.as_str();
        let stdout = unmap_text(instance, &String::from_utf8_lossy(&output.stdout));
        let stderr = unmap_text(instance, &String::from_utf8_lossy(&output.stderr));
        let return_code = output.status.code().unwrap_or(-1);

        let mut result = CompilationResultMessage {
            object_files: Vec::new(),
            stdout,
            stderr,
            return_code,
            compression: self.options.compression,
            dwarf_files: Vec::new(),
        };

        if !output.status.success() {
            debug!(return_code, "compiler failed");
            return Ok(result);
        }

        for object in self.object_paths(args) {
            let Some(artifact) = self.read_artifact(&object).await? else {
                continue;
            };
            result.object_files.push(artifact);

            if args.splits_dwarf()
                && let Some(dwarf) = self.read_artifact(&object.with_extension("dwo")).await?
            {
                result.dwarf_files.push(dwarf);
            }
        }

        debug!(
            objects = result.object_files.len(),
            dwarf = result.dwarf_files.len(),
            "compilation finished"
        );
        Ok(result)
    }

    /// Objects the invocation writes: the `-o` target, otherwise
    /// `<stem>.o` in the working directory for every source file.
    fn object_paths(&self, args: &Arguments) -> Vec<Utf8PathBuf> {
        if let Some(output) = args.output() {
            return vec![Utf8PathBuf::from(output)];
        }
        args.source_files()
            .into_iter()
            .filter_map(|source| Utf8Path::new(source).file_stem())
            .map(|stem| Utf8Path::new(&self.mapped_cwd).join(format!("{stem}.o")))
            .collect()
    }

    async fn read_artifact(&self, path: &Utf8Path) -> Result<Option<ArtifactFile>> {
        match tokio::fs::read(path).await {
            Ok(content) => Ok(Some(ArtifactFile::new(
                unmap_path(self.instance.as_str(), path.as_str()),
                content,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "expected artifact was not produced");
                Ok(None)
            }
            Err(e) => Err(EnvError::Io(e)),
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.instance)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(instance = %self.instance, error = %e, "failed to remove instance folder");
        }
    }
}

/// Architecture names from `clang -print-targets`.
pub(crate) fn parse_clang_targets(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Registered Targets"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn normalize_arch(arch: &str) -> String {
    arch.to_ascii_lowercase().replace('_', "-")
}
