//! # External compile and dynamic load
//!
//! The [`Loader`] accumulates one C translation unit, writes it to
//! `_grad.c`, drives the platform C compiler twice (object, then
//! shared library), opens the resulting shared object and resolves the
//! registered entry points into typed function pointers.
//!
//! Artifacts (`_grad.c`, `_grad.o`/`_grad.lib`, `_grad.so`/`_grad.dll`)
//! land in the loader's directory (the working directory by default)
//! and are overwritten on every [`Loader::compile_and_load`]. The
//! previously loaded library is released first, since some platforms
//! lock the file while it is mapped.

use libloading::Library;
use log::debug;
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

/// Entry-point signature of a generated forward pass.
pub type ForwardFn = unsafe extern "C" fn() -> f32;
/// Entry-point signature of a generated backward pass.
pub type BackwardFn = unsafe extern "C" fn(f32);

/// Signature class of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// `float name(void)`
    Forward,
    /// `void name(float gradient)`
    Backward,
}

#[derive(Clone, Copy)]
enum Entry {
    Forward(ForwardFn),
    Backward(BackwardFn),
}

/// Errors surfaced by [`Loader::compile_and_load`] and the entry-point
/// accessors. All of them leave the engine usable in interpreted mode.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to write generated source to {}: {source}", path.display())]
    WriteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch C compiler `{compiler}`: {source}")]
    CompilerLaunch {
        compiler: String,
        #[source]
        source: std::io::Error,
    },
    #[error("C compiler failed ({status}):\n{stderr}")]
    CompilerFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed to load shared library {}: {source}", path.display())]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("symbol `{name}` missing from compiled library: {source}")]
    SymbolNotFound {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("no compiled entry point named `{name}`")]
    MissingEntry { name: String },
    #[error("entry point `{name}` was registered with a different signature")]
    SignatureMismatch { name: String },
}

const FILE_STEM: &str = "_grad";

/// Accumulates generated functions and turns them into callable
/// entry points through the external C compiler.
pub struct Loader {
    dir: PathBuf,
    headers: Vec<String>,
    functions: Vec<(String, FnKind, String)>,
    library: Option<Arc<Library>>,
    entries: FxHashMap<String, Entry>,
}

impl Default for Loader {
    fn default() -> Self {
        Loader::new(&["math.h"])
    }
}

impl Loader {
    /// A loader emitting one `#include <…>` per header plus the
    /// `v(x)` float-deref macro, building in the working directory.
    pub fn new(headers: &[&str]) -> Self {
        Loader::with_dir(".", headers)
    }

    /// Same, but artifacts go to `dir` (tests point this at a
    /// temporary directory).
    pub fn with_dir(dir: impl Into<PathBuf>, headers: &[&str]) -> Self {
        Loader {
            dir: dir.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            functions: Vec::new(),
            library: None,
            entries: FxHashMap::default(),
        }
    }

    fn compiler() -> String {
        std::env::var("CC").unwrap_or_else(|_| "cc".to_string())
    }

    /// Whether the external C compiler responds; tests skip the
    /// compiled path when it does not.
    pub fn is_available() -> bool {
        Command::new(Self::compiler())
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Register `body` as a function named `name` with the prolog
    /// dictated by `kind`. Registering the same name again replaces
    /// the previous body, so a root can be re-compiled through the
    /// same loader.
    pub fn add_function(&mut self, name: &str, kind: FnKind, body: &str) {
        if let Some(slot) = self.functions.iter_mut().find(|(n, _, _)| n.as_str() == name) {
            *slot = (name.to_string(), kind, body.to_string());
        } else {
            self.functions.push((name.to_string(), kind, body.to_string()));
        }
    }

    fn compose_source(&self) -> String {
        let mut source = String::new();
        for h in &self.headers {
            let _ = writeln!(source, "#include <{h}>");
        }
        source.push_str("#define v(x) (*((float*)(x)))\n");
        let export = if cfg!(windows) {
            "__declspec(dllexport) "
        } else {
            ""
        };
        for (name, kind, body) in &self.functions {
            match kind {
                FnKind::Forward => {
                    let _ = writeln!(source, "{export}float {name}(void) {{\n{body}}}");
                }
                FnKind::Backward => {
                    let _ = writeln!(source, "{export}void {name}(float gradient) {{\n{body}}}");
                }
            }
        }
        source
    }

    /// Write the translation unit, compile it to a shared object,
    /// load it, and resolve every registered entry point.
    pub fn compile_and_load(&mut self) -> Result<(), LoaderError> {
        // Release the previous library before overwriting its file.
        self.entries.clear();
        self.library = None;

        let source = self.compose_source();
        debug!("\n--- generated C ---\n{source}-------------------");

        let c_path = self.dir.join(format!("{FILE_STEM}.c"));
        std::fs::write(&c_path, &source).map_err(|source| LoaderError::WriteSource {
            path: c_path.clone(),
            source,
        })?;

        let (obj_ext, so_ext) = if cfg!(windows) { ("lib", "dll") } else { ("o", "so") };
        let obj_path = self.dir.join(format!("{FILE_STEM}.{obj_ext}"));
        let so_path = self.dir.join(format!("{FILE_STEM}.{so_ext}"));
        let arch = if cfg!(target_pointer_width = "64") {
            "-m64"
        } else {
            "-m32"
        };

        let mut compile = Command::new(Self::compiler());
        compile.args(["-O2", arch]);
        if !cfg!(windows) {
            compile.arg("-fPIC");
        }
        compile.arg("-c").arg("-o").arg(&obj_path).arg(&c_path);
        run_compiler(compile)?;

        let mut link = Command::new(Self::compiler());
        link.args(["-O2", arch, "-shared", "-o"])
            .arg(&so_path)
            .arg(&obj_path);
        run_compiler(link)?;

        let library = Arc::new(unsafe { Library::new(&so_path) }.map_err(|source| {
            LoaderError::LibraryLoad {
                path: so_path.clone(),
                source,
            }
        })?);

        for (name, kind, _) in &self.functions {
            let entry = unsafe {
                match kind {
                    FnKind::Forward => {
                        let symbol: libloading::Symbol<ForwardFn> = library
                            .get(name.as_bytes())
                            .map_err(|source| LoaderError::SymbolNotFound {
                                name: name.clone(),
                                source,
                            })?;
                        Entry::Forward(*symbol)
                    }
                    FnKind::Backward => {
                        let symbol: libloading::Symbol<BackwardFn> = library
                            .get(name.as_bytes())
                            .map_err(|source| LoaderError::SymbolNotFound {
                                name: name.clone(),
                                source,
                            })?;
                        Entry::Backward(*symbol)
                    }
                }
            };
            self.entries.insert(name.clone(), entry);
        }
        self.library = Some(library);
        Ok(())
    }

    /// Resolved forward entry point plus the library keeping it alive.
    pub fn forward_entry(&self, name: &str) -> Result<(ForwardFn, Arc<Library>), LoaderError> {
        match self.entries.get(name) {
            Some(Entry::Forward(f)) => Ok((*f, self.loaded_library(name)?)),
            Some(Entry::Backward(_)) => Err(LoaderError::SignatureMismatch {
                name: name.to_string(),
            }),
            None => Err(LoaderError::MissingEntry {
                name: name.to_string(),
            }),
        }
    }

    /// Resolved backward entry point plus the library keeping it alive.
    pub fn backward_entry(&self, name: &str) -> Result<(BackwardFn, Arc<Library>), LoaderError> {
        match self.entries.get(name) {
            Some(Entry::Backward(f)) => Ok((*f, self.loaded_library(name)?)),
            Some(Entry::Forward(_)) => Err(LoaderError::SignatureMismatch {
                name: name.to_string(),
            }),
            None => Err(LoaderError::MissingEntry {
                name: name.to_string(),
            }),
        }
    }

    fn loaded_library(&self, name: &str) -> Result<Arc<Library>, LoaderError> {
        self.library
            .clone()
            .ok_or_else(|| LoaderError::MissingEntry {
                name: name.to_string(),
            })
    }
}

fn run_compiler(mut command: Command) -> Result<(), LoaderError> {
    debug!("running compile command: {command:?}");
    let compiler = command.get_program().to_string_lossy().into_owned();
    let output = command
        .output()
        .map_err(|source| LoaderError::CompilerLaunch { compiler, source })?;
    if !output.status.success() {
        return Err(LoaderError::CompilerFailed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
