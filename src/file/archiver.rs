// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::paged::PagedFile;
use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_64;

/// Bytes reserved per page for the payload checksum
const HEADER_SIZE: usize = 8;

/// Stream reader/writer over the dense pages of the index dump
///
/// Values split transparently across page boundaries. Every page
/// carries a 64-bit xxh3 of its payload, so truncated or torn dumps
/// fail deterministically on load.
pub(crate) struct Archiver<'a> {
    file: &'a PagedFile,
    update: bool,
    page_id: u32,
    payload: Vec<u8>,
    pos: usize,
    pages_done: u32,
}

impl<'a> Archiver<'a> {
    pub(crate) fn new_writer(file: &'a PagedFile) -> Self {
        let payload_size = file.page_size() - HEADER_SIZE;

        Self {
            file,
            update: true,
            page_id: 0,
            payload: vec![0u8; payload_size],
            pos: 0,
            pages_done: 0,
        }
    }

    pub(crate) fn new_reader(file: &'a PagedFile) -> crate::Result<Self> {
        let mut archiver = Self {
            file,
            update: false,
            page_id: 0,
            payload: Vec::new(),
            pos: 0,
            pages_done: 0,
        };
        archiver.read_next_page()?;
        Ok(archiver)
    }

    pub fn write_bytes(&mut self, mut data: &[u8]) -> crate::Result<()> {
        debug_assert!(self.update);

        while !data.is_empty() {
            let rest = self.payload.len() - self.pos;
            let n = data.len().min(rest);

            #[allow(clippy::indexing_slicing)]
            self.payload[self.pos..self.pos + n].copy_from_slice(&data[..n]);
            self.pos += n;

            #[allow(clippy::indexing_slicing)]
            {
                data = &data[n..];
            }

            if !data.is_empty() {
                self.flush_page();
            }
        }

        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> crate::Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_i32(&mut self, v: i32) -> crate::Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, v);
        self.write_bytes(&buf)
    }

    pub fn write_u32(&mut self, v: u32) -> crate::Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v);
        self.write_bytes(&buf)
    }

    pub fn write_f32(&mut self, v: f32) -> crate::Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, v);
        self.write_bytes(&buf)
    }

    /// Seals the final (possibly partial, zero-padded) page and returns
    /// the total page count. The pages are buffered in the file and
    /// still need a flush.
    pub fn finish(mut self) -> crate::Result<u32> {
        debug_assert!(self.update);

        if self.pos > 0 || self.pages_done == 0 {
            self.flush_page();
        }
        Ok(self.pages_done)
    }

    fn flush_page(&mut self) {
        #[allow(clippy::indexing_slicing)]
        {
            // the unwritten tail stays zeroed; the checksum covers it
            for b in &mut self.payload[self.pos..] {
                *b = 0;
            }
        }

        let checksum = xxh3_64(&self.payload);

        let mut page = vec![0u8; self.file.page_size()];
        #[allow(clippy::indexing_slicing)]
        {
            LittleEndian::write_u64(&mut page[..HEADER_SIZE], checksum);
            page[HEADER_SIZE..].copy_from_slice(&self.payload);
        }

        self.file.update(self.page_id, page);
        self.page_id += 1;
        self.pages_done += 1;
        self.pos = 0;
        self.payload.fill(0);
    }

    pub fn read_bytes(&mut self, mut out: &mut [u8]) -> crate::Result<()> {
        debug_assert!(!self.update);

        while !out.is_empty() {
            let rest = self.payload.len() - self.pos;
            let n = out.len().min(rest);

            #[allow(clippy::indexing_slicing)]
            out[..n].copy_from_slice(&self.payload[self.pos..self.pos + n]);
            self.pos += n;

            #[allow(clippy::indexing_slicing)]
            {
                out = &mut out[n..];
            }

            if !out.is_empty() {
                self.read_next_page()?;
            }
        }

        Ok(())
    }

    pub fn read_u8(&mut self) -> crate::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i32(&mut self) -> crate::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    pub fn read_u32(&mut self) -> crate::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_f32(&mut self) -> crate::Result<f32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_f32(&buf))
    }

    fn read_next_page(&mut self) -> crate::Result<()> {
        let Some(page) = self.file.try_fix(self.page_id)? else {
            return Err(crate::Error::IndexFileCorrupted(
                "index dump ends unexpectedly",
            ));
        };
        self.page_id += 1;

        #[allow(clippy::indexing_slicing)]
        let expected = LittleEndian::read_u64(&page[..HEADER_SIZE]);
        #[allow(clippy::indexing_slicing)]
        let payload = &page[HEADER_SIZE..];

        let got = xxh3_64(payload);
        if got != expected {
            return Err(crate::Error::ChecksumMismatch { got, expected });
        }

        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.pos = 0;
        Ok(())
    }
}
