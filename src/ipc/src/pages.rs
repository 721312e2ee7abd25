use spin::Mutex;

/// A fixed number of fixed-size byte pages, addressed by index.
pub struct Pages {
    page_size: usize,
    pages: Box<[Mutex<Box<[u8]>>]>,
}

impl Pages {
    pub fn new(nr: usize, page_size: usize) -> Self {
        assert!(nr > 0, "a page set needs at least one page");
        let pages = (0..nr)
            .map(|_| Mutex::new(vec![0u8; page_size].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Pages { page_size, pages }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Copies `data` to the beginning of page `index`.
    pub fn write(&self, index: usize, data: &[u8]) {
        assert!(
            data.len() <= self.page_size,
            "{} bytes do not fit in a page of {}",
            data.len(),
            self.page_size
        );
        self.pages[index].lock()[..data.len()].copy_from_slice(data);
    }

    /// Fills `buf` from the beginning of page `index`.
    pub fn read(&self, index: usize, buf: &mut [u8]) {
        assert!(buf.len() <= self.page_size);
        buf.copy_from_slice(&self.pages[index].lock()[..buf.len()]);
    }

    /// Lets `f` fill the first `len` bytes of page `index`.
    pub fn with_page_mut<R>(&self, index: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        assert!(len <= self.page_size);
        f(&mut self.pages[index].lock()[..len])
    }

    /// Runs `f` on the first `len` bytes of page `index`.
    pub fn with_page<R>(&self, index: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        assert!(len <= self.page_size);
        f(&self.pages[index].lock()[..len])
    }
}
