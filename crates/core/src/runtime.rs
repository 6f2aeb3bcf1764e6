//! Locate the ONNX Runtime shared library (and optional GPU runtimes) before
//! the first session is built.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What `setup_runtime_libs` found, reported once logging is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    /// Value of `ORT_DYLIB_PATH` after setup, if any.
    pub ort_dylib: Option<PathBuf>,
    /// True when `ORT_DYLIB_PATH` was already set by the user.
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed for runtime libraries, in priority order:
///   1. `<data_dir>/lib/` when a data dir is known
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/` and `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libraries, `None` for anything not preloaded.
///
/// ORT's own provider libraries are excluded: they need symbols from the main
/// ORT library, which the `ort` crate loads later.
///
///   0: CUDA runtime and math libraries
///   1: cuDNN
///   2: TensorRT
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);

    const CUDA: [&str; 5] = ["cudart", "cublas", "cufft", "curand", "cublaslt"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_library(path: &Path) -> bool {
    let is_so = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(".so"));
    is_so && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU runtime libraries found in `dirs`, sorted so dependencies come first.
/// The first directory holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Load with `RTLD_GLOBAL` so later `dlopen` calls from ORT resolve against it.
/// The handle is leaked on purpose; the library must stay resident.
#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: loading a shared library runs its initializers; these are
    // vendor GPU runtimes picked by name from trusted directories.
    let loaded = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    match loaded {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime and preload GPU runtimes.
///
/// Call at the very start of `main()`, before any thread is spawned. The
/// dynamic loader caches `LD_LIBRARY_PATH` at process start, so libraries are
/// loaded by absolute path instead.
pub fn setup_runtime_libs(data_dir: Option<&Path>) -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs(data_dir);

    let (ort_dylib, ort_from_env) = match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => (Some(PathBuf::from(existing)), true),
        None => {
            let found = find_ort_dylib(&dirs);
            if let Some(path) = &found {
                env::set_var(ORT_DYLIB_ENV, path);
            }
            (found, false)
        }
    };

    let preloaded = preload_plan(&dirs)
        .into_iter()
        .filter(|path| load_library(path))
        .collect();

    RuntimeLibStatus {
        ort_dylib,
        ort_from_env,
        preloaded,
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = status.ort_from_env,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points to a missing file"
        ),
        None => warn!("{ORT_DYLIB_ENV} not set, ONNX Runtime will use the default search path"),
    }

    for lib in &status.preloaded {
        debug!(path = %lib.display(), "Preloaded GPU runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_lib_is_probed_first() {
        let dirs = candidate_lib_dirs(Some(Path::new("/srv/dehaze")));
        assert_eq!(dirs.first(), Some(&PathBuf::from("/srv/dehaze/lib")));
    }

    #[test]
    fn candidate_dirs_include_cwd_lib_once() {
        let dirs = candidate_lib_dirs(None);
        if let Ok(cwd) = env::current_dir() {
            let cwd_lib = cwd.join("lib");
            assert_eq!(dirs.iter().filter(|d| **d == cwd_lib).count(), 1);
        }
    }

    #[cfg(unix)]
    #[test]
    fn candidate_dirs_end_with_system_paths() {
        let dirs = candidate_lib_dirs(None);
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert_eq!(dirs.last(), Some(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn ort_dylib_found_in_first_matching_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty = temp.path().join("empty");
        let bundled = temp.path().join("bundled");
        std::fs::create_dir_all(&empty).expect("create empty dir");
        std::fs::create_dir_all(&bundled).expect("create bundled dir");
        std::fs::write(bundled.join(ORT_LIB_NAME), b"stub").expect("write stub lib");

        let found = find_ort_dylib(&[empty, bundled.clone()]);
        assert_eq!(found, Some(bundled.join(ORT_LIB_NAME)));
    }

    #[test]
    fn load_priority_orders_cuda_cudnn_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("cublas64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("libcudnn_ops.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("libnvonnxparser.so.10"), Some(2));
    }

    #[test]
    fn load_priority_skips_ort_and_unrelated_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.20.1"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libpng16.so.16"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_sorts_by_tier_and_dedupes_by_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");

        for name in ["libnvinfer.so.10", "libcudart.so.12", "libpng16.so.16"] {
            std::fs::write(first.join(name), b"").expect("write lib");
        }
        std::fs::write(second.join("libcudart.so.12"), b"").expect("write duplicate");
        std::fs::write(second.join("libcudnn.so.9"), b"").expect("write cudnn");

        let plan = preload_plan(&[first.clone(), second.clone()]);
        assert_eq!(
            plan,
            vec![
                first.join("libcudart.so.12"),
                second.join("libcudnn.so.9"),
                first.join("libnvinfer.so.10"),
            ]
        );
    }
}
