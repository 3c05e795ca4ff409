//! Dynamic library loading and symbol resolution.

use crate::error::FfiError;
use libloading::Library;
use std::ffi::c_void;
use std::path::Path;

/// A loaded native library.
pub struct NativeLibrary {
    library: Library,
    path: String,
}

impl NativeLibrary {
    /// Open a library from an explicit path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FfiError> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(|e| FfiError::LibraryOpen {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            library,
            path: path.display().to_string(),
        })
    }

    /// Open by base name, decorating with the platform's prefix/extension.
    pub fn open_by_name(name: &str) -> Result<Self, FfiError> {
        let file = Self::platform_lib_name(name);
        let library = unsafe { Library::new(&file) }.map_err(|e| FfiError::LibraryOpen {
            path: file.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            library,
            path: file,
        })
    }

    /// Open the calling process itself (`dlopen(NULL)`), exposing symbols
    /// already linked in, libc included.
    pub fn open_self() -> Result<Self, FfiError> {
        #[cfg(unix)]
        {
            use libloading::os::unix::Library as UnixLibrary;
            let library = UnixLibrary::this();
            Ok(Self {
                library: library.into(),
                path: "<self>".to_string(),
            })
        }
        #[cfg(windows)]
        {
            use libloading::os::windows::Library as WinLibrary;
            let library = WinLibrary::this().map_err(|e| FfiError::LibraryOpen {
                path: "<self>".to_string(),
                detail: e.to_string(),
            })?;
            Ok(Self {
                library: library.into(),
                path: "<self>".to_string(),
            })
        }
    }

    fn platform_lib_name(name: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            format!("{name}.dll")
        }
        #[cfg(target_os = "macos")]
        {
            format!("lib{name}.dylib")
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            format!("lib{name}.so")
        }
    }

    /// Raw address of a symbol: code or data.
    pub fn symbol(&self, name: &str) -> Result<*mut c_void, FfiError> {
        let symbol: libloading::Symbol<'_, *mut c_void> = unsafe {
            self.library
                .get(name.as_bytes())
                .map_err(|e| FfiError::MissingSymbol {
                    name: name.to_string(),
                    detail: e.to_string(),
                })?
        };
        // take the slot address out of the guarded wrapper; lifetime is
        // managed by keeping the library alive alongside its cdata users
        Ok(unsafe { symbol.try_as_raw_ptr() }.unwrap_or(std::ptr::null_mut()))
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
