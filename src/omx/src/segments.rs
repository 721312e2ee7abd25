//! A list of application buffers seen as one byte range.
use smallvec::SmallVec;

/// Position inside a `Segments`: which buffer, and how far into it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCursor {
    seg: usize,
    offset: usize,
    pos: usize,
}

impl SegmentCursor {
    /// Bytes of the whole range before the cursor.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Owned scatter-gather buffers. There is always at least one, possibly empty, buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segments {
    segs: SmallVec<[Vec<u8>; 1]>,
    total_length: usize,
}

impl Default for Segments {
    fn default() -> Self {
        Segments::single(Vec::new())
    }
}

impl From<Vec<u8>> for Segments {
    fn from(buf: Vec<u8>) -> Self {
        Segments::single(buf)
    }
}

impl From<Vec<Vec<u8>>> for Segments {
    fn from(bufs: Vec<Vec<u8>>) -> Self {
        Segments::new(bufs)
    }
}

impl Segments {
    pub fn new(bufs: Vec<Vec<u8>>) -> Self {
        if bufs.is_empty() {
            return Segments::default();
        }
        let total_length = bufs.iter().map(Vec::len).sum();
        Segments {
            segs: SmallVec::from_vec(bufs),
            total_length,
        }
    }

    pub fn single(buf: Vec<u8>) -> Self {
        let total_length = buf.len();
        let mut segs = SmallVec::new();
        segs.push(buf);
        Segments { segs, total_length }
    }

    /// A single zeroed buffer of `length` bytes.
    pub fn with_length(length: usize) -> Self {
        Segments::single(vec![0u8; length])
    }

    #[inline]
    pub fn nseg(&self) -> usize {
        self.segs.len()
    }

    #[inline]
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    #[inline]
    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.segs
    }

    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        self.segs.into_vec()
    }

    /// Concatenates all buffers. Free when there is only one.
    pub fn into_contiguous(self) -> Vec<u8> {
        if self.segs.len() == 1 {
            return self.segs.into_iter().next().unwrap_or_default();
        }
        let mut buf = Vec::with_capacity(self.total_length);
        for seg in self.segs.iter() {
            buf.extend_from_slice(seg);
        }
        buf
    }

    /// The whole range as one slice, if it is made of a single buffer.
    pub fn as_contiguous(&self) -> Option<&[u8]> {
        match self.segs.as_slice() {
            [seg] => Some(seg),
            _ => None,
        }
    }

    /// Returns a cursor `offset` bytes into the range.
    pub fn seek(&self, offset: usize) -> SegmentCursor {
        assert!(
            offset <= self.total_length,
            "seeking to {} past the end of {} bytes",
            offset,
            self.total_length
        );
        let mut cursor = SegmentCursor::default();
        let mut left = offset;
        while left > 0 {
            let seg_len = self.segs[cursor.seg].len();
            if left < seg_len || cursor.seg + 1 == self.segs.len() {
                cursor.offset = left;
                break;
            }
            left -= seg_len;
            cursor.seg += 1;
        }
        cursor.pos = offset;
        cursor.normalize(&self.segs);
        cursor
    }

    /// Fills `dst` with the first `dst.len()` bytes of the range.
    pub fn copy_from_segments(&self, dst: &mut [u8]) {
        let mut cursor = SegmentCursor::default();
        self.partial_copy_from_segments(dst, &mut cursor);
    }

    /// Writes `src` at the beginning of the range.
    pub fn copy_to_segments(&mut self, src: &[u8]) {
        let mut cursor = SegmentCursor::default();
        self.partial_copy_to_segments(src, &mut cursor);
    }

    pub fn copy_from_segments_at(&self, offset: usize, dst: &mut [u8]) {
        let mut cursor = self.seek(offset);
        self.partial_copy_from_segments(dst, &mut cursor);
    }

    pub fn copy_to_segments_at(&mut self, offset: usize, src: &[u8]) {
        let mut cursor = self.seek(offset);
        self.partial_copy_to_segments(src, &mut cursor);
    }

    /// Copies out the `dst.len()` bytes following `cursor` and moves the cursor past them.
    pub fn partial_copy_from_segments(&self, dst: &mut [u8], cursor: &mut SegmentCursor) {
        assert!(
            cursor.pos + dst.len() <= self.total_length,
            "copying {} bytes at {} out of {}",
            dst.len(),
            cursor.pos,
            self.total_length
        );
        let mut done = 0;
        while done < dst.len() {
            let seg = &self.segs[cursor.seg];
            let chunk = (seg.len() - cursor.offset).min(dst.len() - done);
            dst[done..done + chunk].copy_from_slice(&seg[cursor.offset..cursor.offset + chunk]);
            done += chunk;
            cursor.advance(chunk, &self.segs);
        }
    }

    /// Copies `src` in after `cursor` and moves the cursor past it.
    pub fn partial_copy_to_segments(&mut self, src: &[u8], cursor: &mut SegmentCursor) {
        assert!(
            cursor.pos + src.len() <= self.total_length,
            "copying {} bytes at {} into {}",
            src.len(),
            cursor.pos,
            self.total_length
        );
        let mut done = 0;
        while done < src.len() {
            let seg = &mut self.segs[cursor.seg];
            let chunk = (seg.len() - cursor.offset).min(src.len() - done);
            seg[cursor.offset..cursor.offset + chunk].copy_from_slice(&src[done..done + chunk]);
            done += chunk;
            cursor.advance(chunk, &self.segs);
        }
    }
}

impl SegmentCursor {
    #[inline]
    fn advance(&mut self, len: usize, segs: &[Vec<u8>]) {
        self.offset += len;
        self.pos += len;
        self.normalize(segs);
    }

    /// Steps over exhausted and empty buffers, stopping at the last one.
    #[inline]
    fn normalize(&mut self, segs: &[Vec<u8>]) {
        while self.offset == segs[self.seg].len() && self.seg + 1 < segs.len() {
            self.seg += 1;
            self.offset = 0;
        }
    }
}
