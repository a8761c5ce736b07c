use std::fmt::Debug;
use std::fs::File;
use std::os::unix::fs::FileExt as _;
use std::sync::Mutex;

use crate::util::unpoison;


/// The size of the window buffered by [`FileData`].
const WINDOW_SIZE: u64 = 0x1000;
/// The maximum length of a NUL terminated string we are willing to
/// read.
const MAX_CSTR_LEN: usize = 64 * 1024;


/// Random access to the bytes of a line table.
///
/// All offsets are relative to the start of the table. Reads that are
/// not fully contained in the table fail with `None`.
pub(crate) trait ReadAt: Debug {
    /// Retrieve the size of the table, in bytes.
    fn len(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<()>;

    /// Read a NUL terminated string starting at `offset`, excluding the
    /// terminator.
    fn read_cstr(&self, offset: u64) -> Option<Vec<u8>> {
        let mut string = Vec::new();
        let mut offset = offset;
        let mut chunk = [0u8; 64];

        loop {
            let remaining = self.len().checked_sub(offset)?;
            if remaining == 0 {
                return None
            }
            let count = remaining.min(chunk.len() as u64) as usize;
            let chunk = &mut chunk[..count];
            let () = self.read_at(offset, chunk)?;

            if let Some(idx) = chunk.iter().position(|byte| *byte == b'\0') {
                let () = string.extend_from_slice(&chunk[..idx]);
                return Some(string)
            }

            let () = string.extend_from_slice(chunk);
            if string.len() > MAX_CSTR_LEN {
                return None
            }
            offset += count as u64;
        }
    }
}


/// Line table data fully residing in memory.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct MemData<T>(pub T);

#[cfg(test)]
impl<T> ReadAt for MemData<T>
where
    T: AsRef<[u8]> + Debug,
{
    #[inline]
    fn len(&self) -> u64 {
        self.0.as_ref().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<()> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(buf.len())?;
        let src = self.0.as_ref().get(start..end)?;
        let () = buf.copy_from_slice(src);
        Some(())
    }
}


#[derive(Debug)]
struct Window {
    /// The absolute file offset of the first byte in `buf`.
    offset: u64,
    buf: Vec<u8>,
}

impl Window {
    fn get(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset.checked_sub(self.offset)?).ok()?;
        self.buf.get(start..start.checked_add(len)?)
    }
}


/// Line table data read from a file on demand.
///
/// Reads are served from a single page aligned window that is moved
/// as necessary. Reads crossing a window boundary bypass it.
#[derive(Debug)]
pub(crate) struct FileData {
    file: File,
    /// The file offset at which the table starts.
    base: u64,
    /// The size of the table.
    len: u64,
    window: Mutex<Window>,
}

impl FileData {
    pub(crate) fn new(file: File, base: u64, len: u64) -> Self {
        Self {
            file,
            base,
            len,
            window: Mutex::new(Window {
                offset: 0,
                buf: Vec::new(),
            }),
        }
    }

    fn fill(&self, window: &mut Window, offset: u64) -> Option<()> {
        let () = window.buf.resize(WINDOW_SIZE as usize, 0);
        let mut filled = 0;

        while filled < window.buf.len() {
            match self
                .file
                .read_at(&mut window.buf[filled..], offset + filled as u64)
            {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(..) => {
                    let () = window.buf.clear();
                    return None
                }
            }
        }

        let () = window.buf.truncate(filled);
        window.offset = offset;
        Some(())
    }
}

impl ReadAt for FileData {
    #[inline]
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<()> {
        let end = offset.checked_add(buf.len() as u64)?;
        if end > self.len {
            return None
        }

        let start = self.base.checked_add(offset)?;
        let end = self.base.checked_add(end)?;
        let mut window = unpoison(self.window.lock());

        if let Some(src) = window.get(start, buf.len()) {
            let () = buf.copy_from_slice(src);
            return Some(())
        }

        let window_start = start / WINDOW_SIZE * WINDOW_SIZE;
        if end > window_start + WINDOW_SIZE {
            drop(window);
            return self.file.read_exact_at(buf, start).ok()
        }

        let () = self.fill(&mut window, window_start)?;
        let src = window.get(start, buf.len())?;
        let () = buf.copy_from_slice(src);
        Some(())
    }
}
