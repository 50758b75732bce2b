//! Memory-mapped page backing file
//!
//! A page file is a raw memory-mappable byte region whose first bytes
//! are the page header. There is no page-level magic number; magic and
//! version live in the volume metadata, managed above this layer.

use super::{Page, PageType, HEADER_SIZE, MAX_PAGE_SIZE};
use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// A single page mapped from a backing file.
///
/// Opening a file whose header fails validation marks the page
/// read-only: reads remain available but every write attempt surfaces
/// [`Error::Corruption`].
pub struct PageFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    read_only: bool,
    corruption: Option<String>,
}

impl PageFile {
    /// Create a new page file of `length` bytes and format it as an
    /// empty page with one open write session.
    pub fn create(path: impl AsRef<Path>, length: u64, page_type: PageType, page_id: u32) -> Result<Self> {
        let path = path.as_ref();
        if length < HEADER_SIZE as u64 || length > MAX_PAGE_SIZE {
            return Err(Error::BadArg(format!("invalid page file length: {}", length)));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(length)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        {
            let mut page = Page::format(&mut mmap[..], page_type, page_id)?;
            page.reuse();
        }
        mmap.flush()?;
        info!(path = %path.display(), length, page_id, "created page file");

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            read_only: false,
            corruption: None,
        })
    }

    /// Map an existing page file, validating the header. Validation
    /// failure logs the cause and opens the page read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let (read_only, corruption) = match Page::from_buffer(&mmap[..]) {
            Ok(_) => (false, None),
            Err(Error::Corruption(msg)) => {
                error!(path = %path.display(), "page header corrupt, opening read-only: {}", msg);
                (true, Some(msg))
            }
            Err(err) => return Err(err),
        };
        if !read_only {
            info!(path = %path.display(), "opened page file");
        }

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            read_only,
            corruption,
        })
    }

    /// Read view of the mapped page
    pub fn page(&self) -> Page<&[u8]> {
        Page::view(&self.mmap[..])
    }

    /// Writable view of the mapped page. Fails if the page was opened
    /// read-only after header validation failure.
    pub fn page_mut(&mut self) -> Result<Page<&mut [u8]>> {
        if self.read_only {
            let cause = self.corruption.as_deref().unwrap_or("page is read-only");
            return Err(Error::Corruption(cause.to_string()));
        }
        Ok(Page::view(&mut self.mmap[..]))
    }

    /// Whether the page rejects writes
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Validation failure that made the page read-only, if any
    pub fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the whole mapping to the backing file
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Flush only the header region
    pub fn flush_header(&self) -> Result<()> {
        self.mmap.flush_range(0, HEADER_SIZE)?;
        Ok(())
    }

    /// Close the current write session and sync the file
    pub fn close(&mut self) -> Result<()> {
        if !self.read_only {
            self.page_mut()?.close();
        }
        self.mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
