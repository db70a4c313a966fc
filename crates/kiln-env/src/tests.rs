use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use kiln_cache::Cache;
use kiln_proto::{Compression, ContentHash};
use tempfile::TempDir;

use super::*;
use crate::environment::parse_clang_targets;
use crate::sandbox::parse_schroot_profiles;

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

const FAKE_GCC: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "fake-gcc 1.0"; exit 0 ;;
  -dumpmachine) echo "x86_64-linux-gnu"; exit 0 ;;
esac
out=""
dwarf=0
for arg in "$@"; do
  case "$arg" in
    *broken.c) echo "$arg:1:1: error: expected ';'" >&2; exit 1 ;;
    -gsplit-dwarf) dwarf=1 ;;
  esac
done
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
[ -n "$out" ] || out="main.o"
printf 'OBJ' > "$out"
if [ "$dwarf" = 1 ]; then printf 'DWO' > "${out%.o}.dwo"; fi
echo "wrote $out"
"#;

const SLOW_GCC: &str = r#"#!/bin/sh
case "$1" in
  --version) exit 0 ;;
esac
exec sleep 30
"#;

struct Fixture {
    _dir: TempDir,
    root: Utf8PathBuf,
    cache: Cache,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        let cache = Cache::open(&root).await.unwrap();
        Self {
            _dir: dir,
            root,
            cache,
        }
    }

    fn script(&self, name: &str, body: &str) -> String {
        let bin = self.root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.into_string()
    }

    async fn environment(&self, cwd: &str, timeout: Duration) -> Environment {
        Environment::create(
            &self.root,
            cwd,
            EnvironmentOptions {
                shell: ShellEnvironment::Host,
                compression: Compression::None,
                compilation_timeout: timeout,
            },
        )
        .await
        .unwrap()
    }
}

// === Path mapping ===

#[test]
fn maps_arguments_into_instance() {
    let args = strings(&[
        "gcc",
        "-Irelative_path/relative.h",
        "-I/var/includes/absolute.h",
        "main.cpp",
        "relative/relative.cpp",
        "/opt/src/absolute.cpp",
    ]);

    let mapped = map_arguments("/client1", "/client1/test/xyz", &args);

    assert_eq!(
        mapped,
        strings(&[
            "gcc",
            "-I/client1/test/xyz/relative_path/relative.h",
            "-I/client1/var/includes/absolute.h",
            "/client1/test/xyz/main.cpp",
            "/client1/test/xyz/relative/relative.cpp",
            "/client1/opt/src/absolute.cpp",
        ])
    );
}

#[test]
fn maps_cwd_collapsing_slashes() {
    assert_eq!(
        map_cwd("/client1/", "/home/xyz/query-engine"),
        "/client1/home/xyz/query-engine"
    );
    assert_eq!(map_cwd("/client1", "/"), "/client1/");
}

#[test]
fn extracts_source_files() {
    let args = strings(&[
        "gcc",
        "-Irelative_path/relative.h",
        "-I/var/includes/absolute.h",
        "main.cpp",
        "relative/relative.cpp",
        "/opt/src/absolute.cpp",
    ]);

    assert_eq!(
        extract_source_files(&args),
        vec!["main.cpp", "relative/relative.cpp", "/opt/src/absolute.cpp"]
    );
}

#[test]
fn flag_operands_are_not_sources() {
    let args = strings(&["cc", "-x", "c", "-MF", "deps.c", "-c", "a.c", "-o", "b.c"]);
    assert_eq!(extract_source_files(&args), vec!["a.c"]);
}

#[test]
fn maps_separate_operand_forms() {
    let args = strings(&[
        "gcc",
        "-isystem",
        "/usr/include/sys",
        "-include",
        "config.h",
        "-DNAME=file.c",
        "-c",
        "src/main.c",
        "-o",
        "out/main.o",
    ]);

    let mapped = map_arguments("/i", "/i/w", &args);

    assert_eq!(
        mapped,
        strings(&[
            "gcc",
            "-isystem",
            "/i/usr/include/sys",
            "-include",
            "/i/w/config.h",
            "-DNAME=file.c",
            "-c",
            "/i/w/src/main.c",
            "-o",
            "/i/w/out/main.o",
        ])
    );
}

#[test]
fn unmaps_paths_and_diagnostics() {
    assert_eq!(unmap_path("/scratch/abc", "/scratch/abc/home/u/a.o"), "/home/u/a.o");
    assert_eq!(unmap_path("/scratch/abc", "/scratch/abcdef/a.o"), "/scratch/abcdef/a.o");
    assert_eq!(
        unmap_text(
            "/scratch/abc/",
            "/scratch/abc/home/u/a.c:3:1: error\nIn file included from /scratch/abc/usr/include/x.h"
        ),
        "/home/u/a.c:3:1: error\nIn file included from /usr/include/x.h"
    );
}

// === Arguments ===

#[test]
fn compiler_kind_from_executable_name() {
    assert_eq!(CompilerKind::from_compiler("clang++-17"), CompilerKind::Clang);
    assert_eq!(CompilerKind::from_compiler("/usr/bin/gcc"), CompilerKind::Gcc);
    assert_eq!(
        CompilerKind::from_compiler("x86_64-linux-gnu-g++"),
        CompilerKind::Gcc
    );
    assert_eq!(CompilerKind::from_compiler("icc"), CompilerKind::Unknown);
}

#[test]
fn empty_invocation_is_rejected() {
    assert!(matches!(
        Arguments::from_vec(Vec::new()),
        Err(EnvError::EmptyArguments)
    ));
    assert!(matches!(
        Arguments::from_vec(strings(&[""])),
        Err(EnvError::EmptyArguments)
    ));
}

#[test]
fn output_and_split_dwarf_detection() {
    let separate = Arguments::from_vec(strings(&["gcc", "-c", "a.c", "-o", "a.o"])).unwrap();
    assert_eq!(separate.output(), Some("a.o"));
    assert!(!separate.splits_dwarf());

    let joined =
        Arguments::from_vec(strings(&["gcc", "-gsplit-dwarf", "-c", "a.c", "-obuild/a.o"]))
            .unwrap();
    assert_eq!(joined.output(), Some("build/a.o"));
    assert!(joined.splits_dwarf());

    let none = Arguments::from_vec(strings(&["gcc", "-c", "a.c"])).unwrap();
    assert_eq!(none.output(), None);
}

#[test]
fn target_flag_only_for_clang() {
    let clang = Arguments::from_vec(strings(&["clang", "-c", "a.c"]))
        .unwrap()
        .with_target("aarch64-linux-gnu");
    assert_eq!(
        clang.as_slice().last().map(String::as_str),
        Some("--target=aarch64-linux-gnu")
    );

    let gcc = Arguments::from_vec(strings(&["gcc", "-c", "a.c"]))
        .unwrap()
        .with_target("aarch64-linux-gnu");
    assert_eq!(gcc.as_slice().len(), 3);
}

// === Sandbox probing and shells ===

#[test]
fn parses_schroot_listing() {
    let listing = "chroot:bookworm\nchroot:jammy-amd64\nsource:bookworm\n\n";
    assert_eq!(parse_schroot_profiles(listing), vec!["bookworm", "jammy-amd64"]);
}

#[test]
fn parses_clang_target_listing() {
    let listing = "  Registered Targets:\n    aarch64    - AArch64 (little endian)\n    x86-64     - 64-bit X86: EM_X86_64\n";
    assert_eq!(parse_clang_targets(listing), vec!["aarch64", "x86-64"]);
}

#[test]
fn schroot_and_docker_commands() {
    let args = strings(&["-c", "main.c"]);

    let schroot = ShellEnvironment::from_request(Some("bookworm"), Some("ignored"));
    let cmd = schroot.command("gcc", &args, Some("/work"));
    let command = cmd.as_std();
    assert_eq!(command.get_program(), "schroot");
    let argv: Vec<&str> = command.get_args().map(|a| a.to_str().unwrap()).collect();
    assert_eq!(argv, ["-c", "bookworm", "-d", "/work", "--", "gcc", "-c", "main.c"]);

    let docker = ShellEnvironment::from_request(None, Some("builder"));
    let cmd = docker.command("gcc", &args, Some("/work"));
    let command = cmd.as_std();
    assert_eq!(command.get_program(), "docker");
    let argv: Vec<&str> = command.get_args().map(|a| a.to_str().unwrap()).collect();
    assert_eq!(argv, ["exec", "--workdir", "/work", "builder", "gcc", "-c", "main.c"]);

    assert_eq!(ShellEnvironment::from_request(None, None), ShellEnvironment::Host);
}

// === Environment ===

#[tokio::test]
async fn cache_hits_are_linked_and_not_needed() {
    let fx = Fixture::new().await;
    let env = fx.environment("/home/user/proj", Duration::from_secs(5)).await;

    let cached = b"int cached(void);".to_vec();
    let missing = b"int missing(void);".to_vec();
    let cached_hash = ContentHash::of(&cached);
    let missing_hash = ContentHash::of(&missing);
    fx.cache.put(&cached_hash, &cached).await.unwrap();

    let mut deps = BTreeMap::new();
    deps.insert("include/cached.h".to_string(), cached_hash);
    deps.insert("/usr/include/missing.h".to_string(), missing_hash);
    let mapped = env.map_dependency_paths(&deps).unwrap();

    let cached_path = format!("{}/include/cached.h", env.mapped_cwd());
    let missing_path = format!("{}/usr/include/missing.h", env.instance());
    assert_eq!(mapped.get(&cached_path), Some(&cached_hash));

    let needed = env.get_needed_dependencies(&mapped, &fx.cache).await.unwrap();
    assert_eq!(needed.len(), 1);
    assert_eq!(needed.get(&missing_path), Some(&missing_hash));
    assert_eq!(std::fs::read(&cached_path).unwrap(), cached);

    fx.cache.put(&missing_hash, &missing).await.unwrap();
    env.link_dependency_to_cache(&missing_path, &missing_hash, &fx.cache)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&missing_path).unwrap(), missing);

    let needed = env.get_needed_dependencies(&mapped, &fx.cache).await.unwrap();
    assert!(needed.is_empty());
}

#[tokio::test]
async fn dependencies_cannot_escape_the_instance() {
    let fx = Fixture::new().await;
    let env = fx.environment("/home/user/proj", Duration::from_secs(5)).await;

    let victim = fx.root.join("victim.txt");
    std::fs::write(&victim, "precious").unwrap();
    let hash = ContentHash::of(b"replaced");
    fx.cache.put(&hash, b"replaced").await.unwrap();

    let escapes = [
        format!("/../../../../../../../..{victim}"),
        "../../../../../../../../../../etc/passwd".to_string(),
    ];
    for path in escapes {
        let mut deps = BTreeMap::new();
        deps.insert(path.clone(), hash);
        match env.map_dependency_paths(&deps) {
            Err(EnvError::PathOutsideInstance { path: reported }) => assert_eq!(reported, path),
            other => panic!("expected PathOutsideInstance for {path}, got {other:?}"),
        }
    }

    let mapped_escape = format!("{}/../victim.txt", env.instance());
    assert!(matches!(
        env.link_dependency_to_cache(&mapped_escape, &hash, &fx.cache).await,
        Err(EnvError::PathOutsideInstance { .. })
    ));

    drop(env);
    assert!(!std::fs::symlink_metadata(&victim).unwrap().is_symlink());
    assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
}

#[tokio::test]
async fn dot_segments_inside_the_instance_are_normalized() {
    let fx = Fixture::new().await;
    let env = fx.environment("/home/user/./proj/", Duration::from_secs(5)).await;
    assert_eq!(env.mapped_cwd(), format!("{}/home/user/proj", env.instance()));

    let hash = ContentHash::of(b"int f(void);");
    let mut deps = BTreeMap::new();
    deps.insert("include/../src/./f.h".to_string(), hash);
    let mapped = env.map_dependency_paths(&deps).unwrap();

    let expected = format!("{}/home/user/proj/src/f.h", env.instance());
    assert_eq!(mapped.get(&expected), Some(&hash));
}

#[tokio::test]
async fn escaping_cwd_is_rejected_and_cleaned_up() {
    let fx = Fixture::new().await;
    let before: Vec<_> = std::fs::read_dir(&fx.root).unwrap().collect();

    let result = Environment::create(
        &fx.root,
        "/../../../../../../..",
        EnvironmentOptions {
            shell: ShellEnvironment::Host,
            compression: Compression::None,
            compilation_timeout: Duration::from_secs(5),
        },
    )
    .await;

    match result {
        Err(EnvError::PathOutsideInstance { path }) => assert_eq!(path, "/../../../../../../.."),
        other => panic!("expected PathOutsideInstance, got {other:?}"),
    }
    let after: Vec<_> = std::fs::read_dir(&fx.root).unwrap().collect();
    assert_eq!(before.len(), after.len());
}

#[tokio::test]
async fn escaping_output_is_rejected() {
    let fx = Fixture::new().await;
    let env = fx.environment("/src", Duration::from_secs(5)).await;

    let args = Arguments::from_vec(strings(&[
        "gcc",
        "-c",
        "main.c",
        "-o",
        "../../../../../../../../tmp/main.o",
    ]))
    .unwrap();
    match env.map_args(&args) {
        Err(EnvError::PathOutsideInstance { path }) => {
            assert_eq!(path, "../../../../../../../../tmp/main.o")
        }
        other => panic!("expected PathOutsideInstance, got {other:?}"),
    }
}

#[test]
fn normalize_path_resolves_dot_segments() {
    assert_eq!(normalize_path("/a/./b/../c"), Utf8PathBuf::from("/a/c"));
    assert_eq!(normalize_path("/../../etc"), Utf8PathBuf::from("/etc"));
    assert_eq!(confine("/i", "/i/a/../b").as_deref(), Some("/i/b"));
    assert_eq!(confine("/i", "/i/../i2/x"), None);
    assert_eq!(confine("/i/", "/i"), Some("/i".to_string()));
}

#[tokio::test]
async fn explicit_remove_deletes_instance() {
    let fx = Fixture::new().await;
    let env = fx.environment("/tmp/work", Duration::from_secs(5)).await;
    let instance = env.instance().to_path_buf();

    env.remove().await;
    assert!(!instance.exists());
}

#[tokio::test]
async fn dropping_environment_removes_instance() {
    let fx = Fixture::new().await;
    let env = fx.environment("/tmp/work", Duration::from_secs(5)).await;
    let instance = env.instance().to_path_buf();
    assert!(Utf8Path::new(env.mapped_cwd()).is_dir());

    drop(env);
    assert!(!instance.exists());
}

#[tokio::test]
async fn probes_compiler_and_target() {
    let fx = Fixture::new().await;
    let gcc = fx.script("fake-gcc", FAKE_GCC);
    let other = fx.script("mycc", FAKE_GCC);
    let env = fx.environment("/w", Duration::from_secs(5)).await;

    let args = Arguments::from_vec(vec![gcc, "-c".into(), "a.c".into()]).unwrap();
    assert!(env.compiler_exists(&args).await);
    assert_eq!(
        env.compiler_target_triple(&args).await.as_deref(),
        Some("x86_64-linux-gnu")
    );
    assert!(env.compiler_supports_target(&args, "x86_64-linux-gnu").await.unwrap());
    assert!(!env.compiler_supports_target(&args, "aarch64-linux-gnu").await.unwrap());

    let unknown = Arguments::from_vec(vec![other, "-c".into(), "a.c".into()]).unwrap();
    assert!(matches!(
        env.compiler_supports_target(&unknown, "x86_64-linux-gnu").await,
        Err(EnvError::UnsupportedCompiler(_))
    ));

    let missing = Arguments::from_vec(strings(&["/nonexistent/gcc-99", "-c", "a.c"])).unwrap();
    assert!(!env.compiler_exists(&missing).await);
}

#[test_log::test(tokio::test)]
async fn compilation_returns_unmapped_artifacts() {
    let fx = Fixture::new().await;
    let gcc = fx.script("fake-gcc", FAKE_GCC);
    let env = fx.environment("/home/user/proj", Duration::from_secs(10)).await;

    let args = Arguments::from_vec(vec![
        gcc,
        "-gsplit-dwarf".into(),
        "-c".into(),
        "main.c".into(),
        "-o".into(),
        "main.o".into(),
    ])
    .unwrap();
    let mapped = env.map_args(&args).unwrap();

    let result = env
        .do_compilation(&mapped, std::future::pending())
        .await
        .unwrap();

    assert_eq!(result.return_code, 0);
    assert_eq!(result.stdout, "wrote /home/user/proj/main.o\n");
    assert_eq!(result.object_files.len(), 1);
    assert_eq!(result.object_files[0].file_name, "/home/user/proj/main.o");
    assert_eq!(result.object_files[0].content, b"OBJ");
    assert_eq!(result.dwarf_files.len(), 1);
    assert_eq!(result.dwarf_files[0].file_name, "/home/user/proj/main.dwo");
    assert_eq!(result.dwarf_files[0].content, b"DWO");
}

#[tokio::test]
async fn default_object_name_is_derived_from_source() {
    let fx = Fixture::new().await;
    let gcc = fx.script("fake-gcc", FAKE_GCC);
    let env = fx.environment("/src", Duration::from_secs(10)).await;

    let args = Arguments::from_vec(vec![gcc, "-c".into(), "main.c".into()]).unwrap();
    let result = env
        .do_compilation(&env.map_args(&args).unwrap(), std::future::pending())
        .await
        .unwrap();

    assert_eq!(result.object_files.len(), 1);
    assert_eq!(result.object_files[0].file_name, "/src/main.o");
    assert!(result.dwarf_files.is_empty());
}

#[tokio::test]
async fn failed_compilation_has_no_artifacts() {
    let fx = Fixture::new().await;
    let gcc = fx.script("fake-gcc", FAKE_GCC);
    let env = fx.environment("/src", Duration::from_secs(10)).await;

    let args = Arguments::from_vec(vec![gcc, "-c".into(), "broken.c".into()]).unwrap();
    let result = env
        .do_compilation(&env.map_args(&args).unwrap(), std::future::pending())
        .await
        .unwrap();

    assert_eq!(result.return_code, 1);
    assert!(result.object_files.is_empty());
    assert_eq!(result.stderr, "/src/broken.c:1:1: error: expected ';'\n");
}

#[tokio::test]
async fn compilation_timeout_is_typed() {
    let fx = Fixture::new().await;
    let gcc = fx.script("slow-gcc", SLOW_GCC);
    let env = fx.environment("/src", Duration::from_millis(200)).await;

    let args = Arguments::from_vec(vec![gcc, "-c".into(), "main.c".into()]).unwrap();
    let err = env
        .do_compilation(&env.map_args(&args).unwrap(), std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EnvError::CompilationTimeout { timeout } if timeout == Duration::from_millis(200)
    ));
}

#[tokio::test]
async fn client_disconnect_aborts_compilation() {
    let fx = Fixture::new().await;
    let gcc = fx.script("slow-gcc", SLOW_GCC);
    let env = fx.environment("/src", Duration::from_secs(30)).await;

    let args = Arguments::from_vec(vec![gcc, "-c".into(), "main.c".into()]).unwrap();
    let err = env
        .do_compilation(&env.map_args(&args).unwrap(), std::future::ready(()))
        .await
        .unwrap_err();

    assert!(matches!(err, EnvError::ClientDisconnected));
}

#[tokio::test]
async fn launch_failure_is_io_error() {
    let fx = Fixture::new().await;
    let env = fx.environment("/src", Duration::from_secs(5)).await;

    let args = Arguments::from_vec(strings(&["/nonexistent/gcc", "-c", "main.c"])).unwrap();
    let err = env
        .do_compilation(&env.map_args(&args).unwrap(), std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, EnvError::Io(_)));
}
