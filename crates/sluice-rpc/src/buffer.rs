use std::{
    cell::{Cell, Ref, RefCell},
    io,
};

/// Contiguous byte region with consume/fill cursors.
///
/// Valid bytes live in `[start, end)`. `start` only advances when bytes are
/// consumed, `end` only advances when bytes are filled in. The bytes sit in
/// a `RefCell` separate from the `Cell` cursors so a continuation holding a
/// delivered [`window`](Self::window) slice can still consume further bytes
/// or enqueue writes on the owning stream.
pub(crate) struct IoBuffer {
    bytes: RefCell<Vec<u8>>,
    start: Cell<usize>,
    end: Cell<usize>,
}

impl IoBuffer {
    pub fn new(size: usize) -> Self {
        Self { bytes: RefCell::new(vec![0; size]), start: Cell::new(0), end: Cell::new(0) }
    }

    pub fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn start(&self) -> usize {
        self.start.get()
    }

    pub fn end(&self) -> usize {
        self.end.get()
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.end.get() - self.start.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance the consume cursor by `n`, returning its prior position.
    pub fn consume(&self, n: usize) -> usize {
        let start = self.start.get();
        self.start.set(start + n);
        start
    }

    /// Shared view of `[offset, offset + n)`. Hold only for the duration of
    /// a callback; resizing is never attempted while a window is out.
    pub fn window(&self, offset: usize, n: usize) -> Ref<'_, [u8]> {
        Ref::map(self.bytes.borrow(), |bytes| &bytes[offset..offset + n])
    }

    /// Copy `data` in at the fill cursor. The caller has made room.
    pub fn fill(&self, data: &[u8]) {
        let end = self.end.get();
        self.bytes.borrow_mut()[end..end + data.len()].copy_from_slice(data);
        self.end.set(end + data.len());
    }

    /// Read up to `max` bytes from `src` into the fill region.
    pub fn fill_from(&self, src: &mut dyn io::Read, max: usize) -> io::Result<usize> {
        let end = self.end.get();
        let n = {
            let mut bytes = self.bytes.borrow_mut();
            src.read(&mut bytes[end..end + max])?
        };
        self.end.set(end + n);
        Ok(n)
    }

    /// Write the valid region to `dst`, advancing the consume cursor by
    /// however much was accepted.
    pub fn drain_into(&self, dst: &mut dyn io::Write) -> io::Result<usize> {
        let (start, end) = (self.start.get(), self.end.get());
        let n = {
            let bytes = self.bytes.borrow();
            dst.write(&bytes[start..end])?
        };
        self.start.set(start + n);
        Ok(n)
    }

    /// Resize for `incoming` more bytes and compact the valid region to
    /// offset zero.
    ///
    /// Policy, with `need = len + incoming`:
    /// shrink to half (never below `min`) when `need` is under a quarter of
    /// the current size; keep the allocation while `need` stays under three
    /// quarters; otherwise double until `need` fits under three quarters of
    /// the new size, capping at `max`.
    ///
    /// Returns the amount subtracted from both cursors (the old `start`) so
    /// callers can rebase absolute positions, or `None` when `need` exceeds
    /// `max` — the buffer is left untouched in that case.
    pub fn make_room(&self, incoming: usize, min: usize, max: usize) -> Option<usize> {
        let len = self.len();
        let need = len + incoming;
        if need > max {
            return None;
        }
        let size = self.size();
        let new_size = if need < size / 4 {
            if size > min { (size / 2).max(min) } else { size }
        } else if need < size * 3 / 4 {
            size
        } else {
            let mut grown = size;
            while grown < max && need >= grown * 3 / 4 {
                grown = (grown * 2).min(max);
            }
            grown
        };

        let (start, end) = (self.start.get(), self.end.get());
        {
            let mut bytes = self.bytes.borrow_mut();
            if new_size == bytes.len() {
                bytes.copy_within(start..end, 0);
            } else {
                let mut fresh = vec![0; new_size];
                fresh[..len].copy_from_slice(&bytes[start..end]);
                *bytes = fresh;
            }
        }
        self.start.set(0);
        self.end.set(len);
        Some(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(size: usize, data: &[u8]) -> IoBuffer {
        let buf = IoBuffer::new(size);
        buf.fill(data);
        buf
    }

    #[test]
    fn grows_until_need_fits_under_three_quarters() {
        let buf = filled(64, &[7; 30]);
        let shift = buf.make_room(40, 64, 1024).expect("room");
        assert_eq!(shift, 0);
        assert_eq!(buf.size(), 128);
        assert_eq!((buf.start(), buf.end()), (0, 30));
        assert_eq!(&*buf.window(0, 30), &[7; 30]);
    }

    #[test]
    fn keeps_allocation_but_compacts() {
        let data: Vec<u8> = (0..40).collect();
        let buf = filled(64, &data);
        buf.consume(30);
        let shift = buf.make_room(20, 64, 1024).expect("room");
        assert_eq!(shift, 30);
        assert_eq!(buf.size(), 64);
        assert_eq!((buf.start(), buf.end()), (0, 10));
        assert_eq!(&*buf.window(0, 10), &data[30..]);
    }

    #[test]
    fn shrinks_by_half_below_quarter_occupancy() {
        let buf = filled(256, &[3; 10]);
        let shift = buf.make_room(5, 64, 1024).expect("room");
        assert_eq!(shift, 0);
        assert_eq!(buf.size(), 128);
        assert_eq!(&*buf.window(0, 10), &[3; 10]);
    }

    #[test]
    fn never_shrinks_below_min() {
        let buf = filled(128, &[3; 10]);
        buf.make_room(5, 128, 1024).expect("room");
        assert_eq!(buf.size(), 128);

        let buf = filled(96, &[3; 4]);
        buf.make_room(1, 64, 1024).expect("room");
        assert_eq!(buf.size(), 64);
    }

    #[test]
    fn caps_growth_at_max() {
        let buf = filled(64, &[9; 40]);
        let shift = buf.make_room(150, 64, 256).expect("room");
        assert_eq!(shift, 0);
        assert_eq!(buf.size(), 256);
        assert_eq!(&*buf.window(0, 40), &[9; 40]);
    }

    #[test]
    fn refuses_need_beyond_max() {
        let data: Vec<u8> = (0..40).collect();
        let buf = filled(64, &data);
        buf.consume(8);
        assert!(buf.make_room(300, 64, 256).is_none());
        // Untouched on refusal.
        assert_eq!((buf.start(), buf.end(), buf.size()), (8, 40, 64));
        assert_eq!(&*buf.window(8, 32), &data[8..]);
    }

    #[test]
    fn drains_and_fills_through_io_traits() {
        let buf = IoBuffer::new(32);
        let mut src: &[u8] = b"abcdefgh";
        assert_eq!(buf.fill_from(&mut src, 8).expect("fill"), 8);
        assert_eq!(buf.len(), 8);

        let mut dst = Vec::new();
        assert_eq!(buf.drain_into(&mut dst).expect("drain"), 8);
        assert_eq!(dst, b"abcdefgh");
        assert!(buf.is_empty());
    }
}
