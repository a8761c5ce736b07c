use std::fs::File;
use std::ops::Deref;
use std::ops::Range;
use std::sync::Arc;

use memmap2::Mmap as Mapping;
use memmap2::MmapOptions;

use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// A type encapsulating a region of mapped memory.
///
/// Clones share the underlying mapping, which is unmapped once the last
/// of them is dropped.
#[derive(Clone, Debug)]
pub(crate) struct Mmap {
    /// The actual memory mapping.
    mapping: Option<Arc<Mapping>>,
    /// The view on the memory mapping that this object represents.
    view: Range<u64>,
}

impl Mmap {
    /// Map the provided file into memory, in its entirety.
    pub(crate) fn map(file: &File) -> Result<Self> {
        let len = libc::size_t::try_from(file.metadata()?.len())
            .map_err(|err| Error::with_invalid_data(err.to_string()))
            .context("file is too large to mmap")?;

        // The kernel does not allow mmap'ing a region of size 0. We
        // want to enable this case transparently, though.
        let mmap = if len == 0 {
            Mmap {
                mapping: None,
                view: 0..1,
            }
        } else {
            let mapping = unsafe { MmapOptions::new().map(file) }?;
            Mmap {
                mapping: Some(Arc::new(mapping)),
                view: 0..len as u64,
            }
        };
        Ok(mmap)
    }

    /// Create a new `Mmap` object (sharing the same underlying memory mapping
    /// as the current one) that restricts its view to the provided `range`.
    /// Adjustment happens relative to the current view.
    pub(crate) fn constrain(&self, range: Range<u64>) -> Option<Self> {
        if range.start > range.end || self.view.start + range.end > self.view.end {
            return None
        }

        let mut mmap = self.clone();
        mmap.view.end = mmap.view.start + range.end;
        mmap.view.start += range.start;
        Some(mmap)
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        if let Some(mapping) = &self.mapping {
            mapping
                .deref()
                .get(self.view.start as usize..self.view.end as usize)
                .unwrap_or(&[])
        } else {
            &[]
        }
    }
}
