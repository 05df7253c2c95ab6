//! Pid file handling.

use std::fs;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use crate::config::PidOptions;

/// Writes the pid once the daemon is ready to serve; the file is removed on
/// drop. With `fd=`, the pid goes to the inherited descriptor instead and
/// nothing is cleaned up.
pub struct PidFile {
    path: Option<PathBuf>,
}

impl PidFile {
    /// Write the pid per the options.
    pub fn create(opts: &PidOptions) -> std::io::Result<PidFile> {
        let pid = std::process::id();
        if let Some(fd) = opts.fd {
            // The descriptor was handed over; it closes when `file` drops.
            let mut file = unsafe { fs::File::from_raw_fd(fd) };
            writeln!(file, "{pid}")?;
            return Ok(PidFile { path: None });
        }
        let path = opts.file.clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid options carry no target")
        })?;
        fs::write(&path, format!("{pid}\n"))?;
        Ok(PidFile { path: Some(path) })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vtpmd.pid");
        let opts = PidOptions { file: Some(path.clone()), fd: None };
        {
            let _pid = PidFile::create(&opts).unwrap();
            let content = fs::read_to_string(&path).unwrap();
            assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
        }
        assert!(!path.exists());
    }
}
