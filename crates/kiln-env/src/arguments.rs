//! Compiler invocation model.

use camino::Utf8Path;

use crate::error::{EnvError, Result};
use crate::mapping::map_arguments;

/// File extensions treated as compilation units.
const SOURCE_EXTENSIONS: &[&str] = &[
    "c", "cc", "cp", "cpp", "cxx", "c++", "C", "i", "ii", "m", "mm", "s", "S",
];

/// Flags whose operand is a path that must be mapped into the sandbox.
/// Each accepts both `-Ipath` and `-I path` forms.
pub(crate) const PATH_FLAGS: &[&str] = &["-isystem", "-iquote", "-include", "-I", "-o"];

/// Flags that consume the following token as their operand.
const FLAGS_WITH_OPERAND: &[&str] = &[
    "-o",
    "-I",
    "-isystem",
    "-iquote",
    "-include",
    "-imacros",
    "-idirafter",
    "-isysroot",
    "-D",
    "-U",
    "-x",
    "-MF",
    "-MT",
    "-MQ",
    "-MJ",
    "-L",
    "-l",
    "-arch",
    "-target",
    "--param",
    "-Xlinker",
    "-Xpreprocessor",
    "-Xassembler",
    "-Xclang",
];

/// Compiler family, derived from the executable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Clang,
    Gcc,
    Unknown,
}

impl CompilerKind {
    pub fn from_compiler(compiler: &str) -> Self {
        let name = Utf8Path::new(compiler).file_name().unwrap_or(compiler);
        if name.contains("clang") {
            CompilerKind::Clang
        } else if name.contains("gcc") || name.contains("g++") {
            CompilerKind::Gcc
        } else {
            CompilerKind::Unknown
        }
    }
}

/// A compiler invocation: the compiler followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    args: Vec<String>,
}

impl Arguments {
    pub fn from_vec(args: Vec<String>) -> Result<Self> {
        if args.first().is_none_or(|compiler| compiler.is_empty()) {
            return Err(EnvError::EmptyArguments);
        }
        Ok(Self { args })
    }

    pub fn compiler(&self) -> &str {
        &self.args[0]
    }

    pub fn compiler_kind(&self) -> CompilerKind {
        CompilerKind::from_compiler(self.compiler())
    }

    /// Everything after the compiler
    pub fn compiler_args(&self) -> &[String] {
        &self.args[1..]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn into_vec(self) -> Vec<String> {
        self.args
    }

    pub fn source_files(&self) -> Vec<&str> {
        extract_source_files(&self.args)
    }

    /// Operand of `-o`, if any
    pub fn output(&self) -> Option<&str> {
        let mut iter = self.compiler_args().iter();
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                return iter.next().map(String::as_str);
            }
            if let Some(path) = arg.strip_prefix("-o")
                && !path.is_empty()
            {
                return Some(path);
            }
        }
        None
    }

    /// Whether debug info is split into `.dwo` files next to the objects
    pub fn splits_dwarf(&self) -> bool {
        self.compiler_args().iter().any(|arg| arg == "-gsplit-dwarf")
    }

    /// The same invocation with its file paths relocated into an instance
    /// folder (see [`crate::mapping::map_arguments`]).
    pub(crate) fn mapped(&self, instance: &str, mapped_cwd: &str) -> Self {
        Self {
            args: map_arguments(instance, mapped_cwd, &self.args),
        }
    }

    /// Request code generation for `target`. Only clang takes a target
    /// flag; other compilers are returned unchanged.
    #[must_use]
    pub fn with_target(mut self, target: &str) -> Self {
        if self.compiler_kind() == CompilerKind::Clang {
            self.args.push(format!("--target={target}"));
        }
        self
    }
}

impl std::fmt::Display for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

pub(crate) fn is_source_file(arg: &str) -> bool {
    !arg.starts_with('-')
        && Utf8Path::new(arg)
            .extension()
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// The compilation units named in an argument vector (compiler first).
///
/// Operands of flags such as `-o` or `-MF` are never reported, even if
/// they happen to carry a source extension.
pub fn extract_source_files(args: &[String]) -> Vec<&str> {
    let mut sources = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if FLAGS_WITH_OPERAND.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if is_source_file(arg) {
            sources.push(arg.as_str());
        }
    }
    sources
}
