//! Small [`std::process::Command`] helpers shared by the ports that shell
//! out to host binaries (supervisor, labeler, rootless spec rewriter,
//! fetch). Grounded on the teacher's (now-removed async-process-free)
//! `CommandRunExt`/`ExitStatusExt` pair.

use std::io::{Read, Seek};
use std::process::Command;

use anyhow::Result;

/// Helpers intended for [`std::process::Command`].
pub(crate) trait CommandRunExt {
    /// Run the child, capturing stderr, and return an error including the
    /// tail of stderr if it exits unsuccessfully.
    fn run(&mut self) -> Result<()>;
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0)
        .min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut buf = Vec::with_capacity(size.into());
    match f.seek(std::io::SeekFrom::End(seek_offset.into())).and_then(|_| f.read_to_end(&mut buf)) {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => "<failed to read stderr>".to_string(),
    }
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        let status = self.status()?;
        if status.success() {
            return Ok(());
        }
        let stderr_buf = last_utf8_content_from_file(stderr);
        anyhow::bail!("subprocess failed: {status:?}\n{stderr_buf}")
    }
}
