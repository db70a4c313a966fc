//! Client path ↔ sandbox path translation.
//!
//! Every session gets an instance folder `I`. A client path `p` lives at
//! `I/p` on the server: absolute paths are prefixed with `I`, relative
//! paths are resolved against the mapped working directory `I/cwd`.

use std::collections::BTreeMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use kiln_proto::ContentHash;

use crate::arguments::{PATH_FLAGS, is_source_file};
use crate::error::{EnvError, Result};

/// Flags whose operand is left alone (it is not a path we relocate).
const OPAQUE_OPERAND_FLAGS: &[&str] = &["-D", "-U", "-x", "-MT", "-MQ", "--param", "-Xclang"];

/// `I` + `cwd`, with the slash between them collapsed.
pub fn map_cwd(instance: &str, cwd: &str) -> String {
    format!(
        "{}/{}",
        instance.trim_end_matches('/'),
        cwd.trim_start_matches('/')
    )
}

/// Map a single client path into the sandbox.
pub fn map_path(instance: &str, mapped_cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", instance.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", mapped_cwd.trim_end_matches('/'), path)
    }
}

/// Map the file-path arguments of an invocation into the sandbox.
///
/// The compiler (first element) is kept as is. Source files and the path
/// operands of include and output flags are mapped; every other token is
/// passed through unchanged.
pub fn map_arguments(instance: &str, mapped_cwd: &str, args: &[String]) -> Vec<String> {
    let mut mapped = Vec::with_capacity(args.len());
    let mut iter = args.iter();

    if let Some(compiler) = iter.next() {
        mapped.push(compiler.clone());
    }

    while let Some(arg) = iter.next() {
        if PATH_FLAGS.contains(&arg.as_str()) {
            mapped.push(arg.clone());
            if let Some(operand) = iter.next() {
                mapped.push(map_path(instance, mapped_cwd, operand));
            }
        } else if OPAQUE_OPERAND_FLAGS.contains(&arg.as_str()) {
            mapped.push(arg.clone());
            if let Some(operand) = iter.next() {
                mapped.push(operand.clone());
            }
        } else if let Some((flag, path)) = split_path_flag(arg) {
            mapped.push(format!("{}{}", flag, map_path(instance, mapped_cwd, path)));
        } else if is_source_file(arg) {
            mapped.push(map_path(instance, mapped_cwd, arg));
        } else {
            mapped.push(arg.clone());
        }
    }

    mapped
}

/// Split `-I/usr/include` into (`-I`, `/usr/include`).
fn split_path_flag(arg: &str) -> Option<(&str, &str)> {
    PATH_FLAGS.iter().find_map(|flag| {
        arg.strip_prefix(flag)
            .filter(|path| !path.is_empty())
            .map(|path| (*flag, path))
    })
}

/// Map every dependency path, keeping its hash.
///
/// Fails with [`EnvError::PathOutsideInstance`] for a path that resolves
/// outside the instance folder.
pub fn map_dependency_paths(
    instance: &str,
    mapped_cwd: &str,
    dependencies: &BTreeMap<String, ContentHash>,
) -> Result<BTreeMap<String, ContentHash>> {
    dependencies
        .iter()
        .map(|(path, hash)| {
            let mapped = confine(instance, &map_path(instance, mapped_cwd, path)).ok_or_else(
                || EnvError::PathOutsideInstance {
                    path: path.clone(),
                },
            )?;
            Ok((mapped, *hash))
        })
        .collect()
}

/// Resolve `.` and `..` without touching the filesystem. `..` at the root
/// stays at the root.
pub fn normalize_path(path: &str) -> Utf8PathBuf {
    let mut normalized = Utf8PathBuf::new();
    for component in Utf8Path::new(path).components() {
        match component {
            Utf8Component::ParentDir => {
                normalized.pop();
            }
            Utf8Component::CurDir => {}
            other => normalized.push(other.as_str()),
        }
    }
    normalized
}

/// `path` normalized, or `None` if it leaves `instance`.
pub fn confine(instance: &str, path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    normalized
        .starts_with(normalize_path(instance))
        .then(|| normalized.into_string())
}

/// Inverse of [`map_path`] for absolute results: strip the instance prefix.
pub fn unmap_path(instance: &str, path: &str) -> String {
    let prefix = instance.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Strip the instance prefix from every path mentioned in compiler output.
pub fn unmap_text(instance: &str, text: &str) -> String {
    let prefix = format!("{}/", instance.trim_end_matches('/'));
    text.replace(&prefix, "/")
}
