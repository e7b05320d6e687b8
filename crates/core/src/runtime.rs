//! Locating the ONNX Runtime shared library before the first session is built.
//!
//! `ort` is built with `load-dynamic`, so the library is opened at runtime
//! from `ORT_DYLIB_PATH`. When that variable is unset we probe a few
//! conventional directories and export the first hit.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ENV_ORT_DYLIB: &str = "ORT_DYLIB_PATH";
const ENV_LIB_DIR: &str = "PATCHDIFF_LIB_DIR";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for the runtime library, in priority order:
///   1. `$PATCHDIFF_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(ENV_LIB_DIR) {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Export `ORT_DYLIB_PATH` if it is unset and a library can be found.
///
/// Call at the very start of `main()`, before any session is created.
/// Returns the path in effect afterwards, if any.
pub fn setup_runtime_libs() -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ENV_ORT_DYLIB) {
        return Some(PathBuf::from(existing));
    }

    let found = find_ort_dylib_in_dirs(&candidate_lib_dirs())?;
    env::set_var(ENV_ORT_DYLIB, &found);
    Some(found)
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ENV_ORT_DYLIB) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ENV_ORT_DYLIB} set to {ort} but file not found"),
        Err(_) => {
            warn!("{ENV_ORT_DYLIB} not set; ORT will try default search paths");
            debug!(dirs = ?candidate_lib_dirs(), "Probed library directories");
        }
    }
}
