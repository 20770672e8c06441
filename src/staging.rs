use core::borrow::BorrowMut;
use core::cmp::min;

/// Byte queue over a fixed buffer, used to stage IRP payloads while they are
/// moved one packet at a time
pub struct Staging<T: BorrowMut<[u8]>> {
    inner: T,
    rpos: usize, // next byte to read from
    wpos: usize, // next byte to write into
}

impl<T: BorrowMut<[u8]>> Staging<T> {
    pub fn new(inner: T) -> Staging<T> {
        Staging {
            inner,
            rpos: 0,
            wpos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn available_read(&self) -> usize {
        self.wpos - self.rpos
    }

    pub fn available_write(&self) -> usize {
        self.capacity() - self.wpos
    }

    /// Returns number of bytes actually written
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.available_write() < data.len() {
            self.shift();
        }
        let count = min(self.available_write(), data.len());
        let inner = self.inner.borrow_mut();
        inner[self.wpos..(self.wpos + count)].copy_from_slice(&data[..count]);
        self.wpos += count;
        count
    }

    /// Lets `f` fill up to `max_count` bytes in place, returning `overflow_err`
    /// when that much space cannot be made
    pub fn write_with<E>(
        &mut self,
        max_count: usize,
        overflow_err: E,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        if self.available_write() < max_count {
            self.shift();
            if self.available_write() < max_count {
                return Err(overflow_err);
            }
        }

        let wpos = self.wpos;
        let inner = self.inner.borrow_mut();
        let count = f(&mut inner[wpos..(wpos + max_count)])?;
        let advance_by = min(count, max_count);
        self.wpos += advance_by;
        Ok(advance_by)
    }

    /// Hands the readable bytes to `f` and consumes as many as it reports
    pub fn read<E>(&mut self, f: impl FnOnce(&[u8]) -> Result<usize, E>) -> Result<usize, E> {
        let (rpos, wpos) = (self.rpos, self.wpos);
        let count = f(&self.inner.borrow()[rpos..wpos])?;
        let advance_by = min(count, wpos - rpos);
        self.rpos += advance_by;
        Ok(advance_by)
    }

    pub fn clean(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    fn shift(&mut self) {
        if self.rpos != self.wpos {
            let (rpos, wpos) = (self.rpos, self.wpos);
            self.inner.borrow_mut().copy_within(rpos..wpos, 0);
            self.wpos -= rpos;
            self.rpos = 0;
        } else {
            self.clean();
        }
    }
}
