//! Scoped temporary files for generated attachments.
//!
//! Modules that produce binary artifacts write them into a
//! [`TempAttachment`]: an OS-unique file whose handle and path live exactly
//! as long as the value. Removal happens on drop, so every exit path,
//! error returns included, releases the file.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// A temporary attachment file, deleted when dropped.
#[derive(Debug)]
pub struct TempAttachment {
    file: NamedTempFile,
}

impl TempAttachment {
    /// Create an empty attachment with `suffix` (e.g. `".txt"`, `".png"`)
    /// in the OS temp directory.
    ///
    /// # Errors
    ///
    /// Propagates temp-file creation failures.
    pub fn new(suffix: &str) -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("straylight-")
            .suffix(suffix)
            .tempfile()?;
        Ok(Self { file })
    }

    /// Create an attachment holding `contents`.
    ///
    /// # Errors
    ///
    /// Propagates creation and write failures.
    pub fn with_contents(suffix: &str, contents: &[u8]) -> std::io::Result<Self> {
        let mut attachment = Self::new(suffix)?;
        attachment.file.write_all(contents)?;
        attachment.file.flush()?;
        Ok(attachment)
    }

    /// The path to hand to a driver send call. Valid only while this value
    /// lives, so keep the attachment alive until the send returns.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Writable handle to the underlying file.
    pub fn file_mut(&mut self) -> &mut std::fs::File {
        self.file.as_file_mut()
    }
}
