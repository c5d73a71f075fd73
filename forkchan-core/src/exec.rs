//! Program Image Replacement
//!
//! Arguments are converted to C strings before the process is duplicated, so
//! the child only has to build the pointer array and call `execv`.

use crate::process::ProcessError;
use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Executable path and argument vector, ready for `execv`
#[derive(Debug, Clone)]
pub struct ProgramImage {
    path: CString,
    argv: Vec<CString>,
}

impl ProgramImage {
    /// Prepare `path` with `args`; `argv[0]` is the path itself.
    pub fn new<P, S>(path: P, args: &[S]) -> Result<Self, ProcessError>
    where
        P: AsRef<Path>,
        S: AsRef<OsStr>,
    {
        let path = to_cstring(path.as_ref().as_os_str())?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(path.clone());
        for arg in args {
            argv.push(to_cstring(arg.as_ref())?);
        }

        Ok(Self { path, argv })
    }

    /// Executable path
    pub fn path(&self) -> &CStr {
        &self.path
    }

    /// Argument vector, including `argv[0]`
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Replace the running process image. Returns only if `execv` failed.
    pub(crate) fn exec(&self) -> io::Error {
        let mut argv: Vec<*const libc::c_char> = self.argv.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());

        // SAFETY: `path` and every `argv` entry are NUL-terminated strings that
        // outlive the call, and the pointer array is NULL-terminated.
        unsafe {
            libc::execv(self.path.as_ptr(), argv.as_ptr());
        }
        io::Error::last_os_error()
    }
}

fn to_cstring(value: &OsStr) -> Result<CString, ProcessError> {
    CString::new(value.as_bytes()).map_err(|_| {
        ProcessError::InvalidProgram(format!("{:?} contains an interior NUL byte", value))
    })
}
