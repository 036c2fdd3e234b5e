//! Changed block bitmap of a virtual disk.
//!
//! One bit per block of `block_size` bytes. The serialized form is the
//! decimal bit count, a NUL byte, and the bits packed MSB first:
//!
//! ```text
//! "20\0" 0b1000_0000 0b0000_0000 0b0001_0000
//! ```

use std::fmt;
use std::path::Path;

use anyhow::{bail, format_err, Error};

/// Default block size (1 MiB per bit).
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangedBlockBitmap {
    disk_size: u64,
    block_size: u64,
    bit_count: usize,
    bits: Vec<u8>,
}

fn byte_count(bit_count: usize) -> usize {
    bit_count / 8 + usize::from(bit_count % 8 != 0)
}

impl ChangedBlockBitmap {
    pub fn new(disk_size: u64, block_size: u64) -> Result<Self, Error> {
        if block_size == 0 {
            bail!("invalid bitmap block size 0");
        }
        let bit_count = disk_size / block_size + u64::from(disk_size % block_size != 0);
        let bit_count = usize::try_from(bit_count)
            .map_err(|_| format_err!("disk size {} too large for bitmap", disk_size))?;
        Ok(Self {
            disk_size,
            block_size,
            bit_count,
            bits: vec![0u8; byte_count(bit_count)],
        })
    }

    pub fn with_default_block_size(disk_size: u64) -> Result<Self, Error> {
        Self::new(disk_size, DEFAULT_BLOCK_SIZE)
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.bit_count
    }

    /// Mark all blocks touched by the byte range as changed.
    pub fn set_range(&mut self, offset: u64, length: u64) -> Result<(), Error> {
        if length == 0 {
            bail!("invalid range length 0 at offset {}", offset);
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| format_err!("range {}+{} overflows", offset, length))?;

        let start_block = offset / self.block_size;
        let end_block = (end - 1) / self.block_size + 1;
        let end_block = end_block.min(self.bit_count as u64) as usize;

        if start_block >= self.bit_count as u64 {
            log::warn!(
                "range {}+{} beyond disk size {}, ignored",
                offset,
                length,
                self.disk_size
            );
            return Ok(());
        }

        for i in start_block as usize..end_block {
            self.bits[i / 8] |= 0x80 >> (i % 8);
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.bit_count {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// True if no block is marked, i.e. the disk did not change.
    pub fn is_all_zero(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn changed_blocks(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = format!("{}\0", self.bit_count).into_bytes();
        data.extend_from_slice(&self.bits);
        data
    }

    /// Decode a serialized bitmap, `block_size` is not part of the format.
    pub fn decode(data: &[u8], block_size: u64) -> Result<Self, Error> {
        let nul = data
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| format_err!("bitmap header not terminated"))?;

        let header = std::str::from_utf8(&data[..nul])
            .map_err(|_| format_err!("bitmap header is not valid utf8"))?;
        if header.is_empty() || !header.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid bitmap header {:?}", header);
        }
        let bit_count: usize = header
            .parse()
            .map_err(|err| format_err!("invalid bitmap length {:?} - {}", header, err))?;

        let payload = &data[nul + 1..];
        let needed = byte_count(bit_count);
        if payload.len() < needed {
            bail!(
                "bitmap truncated - expected {} bytes, got {}",
                needed,
                payload.len()
            );
        }
        if payload.len() > needed {
            log::debug!("ignoring {} trailing bitmap bytes", payload.len() - needed);
        }

        let disk_size = (bit_count as u64)
            .checked_mul(block_size)
            .ok_or_else(|| format_err!("bitmap length {} too large", bit_count))?;
        let mut bitmap = Self::new(disk_size, block_size)?;
        bitmap.bits.copy_from_slice(&payload[..needed]);

        // bits beyond bit_count must stay clear
        if bit_count % 8 != 0 {
            if let Some(last) = bitmap.bits.last_mut() {
                *last &= 0xffu8 << (8 - bit_count % 8);
            }
        }
        Ok(bitmap)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        vmbkp_tools::fs::replace_file_synced(path, &self.encode())
    }

    pub fn load<P: AsRef<Path>>(path: P, block_size: u64) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read bitmap {:?} - {}", path, err))?;
        Self::decode(&data, block_size).map_err(|err| format_err!("{:?}: {}", path, err))
    }
}

impl fmt::Display for ChangedBlockBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bit_count {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_set_range() -> Result<(), Error> {
        let bs = 1024;
        let mut bitmap = ChangedBlockBitmap::new(10 * bs + 1, bs)?;
        assert_eq!(bitmap.block_count(), 11);
        assert!(bitmap.is_all_zero());
        assert!(bitmap.set_range(0, 0).is_err());
        assert!(bitmap.is_all_zero());

        // [1500, 2600) touches blocks 1 and 2
        bitmap.set_range(1500, 1100)?;
        assert_eq!(bitmap.to_string(), "01100000000");

        // exact block boundary
        bitmap.set_range(4 * bs, bs)?;
        assert_eq!(bitmap.to_string(), "01101000000");

        // clamped at the end of the disk
        bitmap.set_range(10 * bs, 100 * bs)?;
        assert!(bitmap.get(10));
        assert!(!bitmap.get(11));
        bitmap.set_range(50 * bs, bs)?;
        assert_eq!(bitmap.changed_blocks(), 4);

        bitmap.clear();
        assert!(bitmap.is_all_zero());
        Ok(())
    }

    #[test]
    fn test_set_range_property() -> Result<(), Error> {
        let bs = 512u64;
        let ranges = [(0u64, 1u64), (511, 2), (1000, 24), (1023, 1), (4096, 5000)];
        for (offset, length) in ranges.iter() {
            let mut bitmap = ChangedBlockBitmap::new(64 * bs, bs)?;
            bitmap.set_range(*offset, *length)?;
            let first = offset / bs;
            let last = (offset + length + bs - 1) / bs;
            for i in 0..bitmap.block_count() {
                let expected = (i as u64) >= first && (i as u64) < last;
                assert_eq!(bitmap.get(i), expected, "bit {} for {}+{}", i, offset, length);
            }
        }
        Ok(())
    }

    #[test]
    fn test_wire_format() -> Result<(), Error> {
        let mut bitmap = ChangedBlockBitmap::new(20, 1)?;
        bitmap.set_range(0, 1)?;
        bitmap.set_range(19, 1)?;
        let data = bitmap.encode();
        assert_eq!(data, b"20\0\x80\x00\x10".to_vec());
        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<(), Error> {
        for count in [1usize, 7, 8, 9, 1024 * 1024].iter() {
            let count = *count;
            let mut bitmap = ChangedBlockBitmap::new(count as u64, 1)?;
            for i in (0..count).step_by(3) {
                bitmap.set_range(i as u64, 1)?;
            }
            bitmap.set_range(count as u64 - 1, 1)?;

            let decoded = ChangedBlockBitmap::decode(&bitmap.encode(), 1)?;
            assert_eq!(decoded.block_count(), count);
            for i in 0..count {
                assert_eq!(decoded.get(i), bitmap.get(i));
            }
            assert_eq!(decoded, bitmap);
        }
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert!(ChangedBlockBitmap::decode(b"9\0\xff", 1).is_err());
        assert!(ChangedBlockBitmap::decode(b"8\xff", 1).is_err());
        assert!(ChangedBlockBitmap::decode(b"x\0\xff", 1).is_err());
        assert!(ChangedBlockBitmap::decode(b"\0", 1).is_err());
        assert!(ChangedBlockBitmap::decode(b"0\0", 0).is_err());
        assert!(ChangedBlockBitmap::decode(b"18446744073709551615\0\xff", 1).is_err());
        assert!(ChangedBlockBitmap::decode(b"18446744073709551609\0\xff", 1).is_err());

        let empty = ChangedBlockBitmap::decode(b"0\0", 1).unwrap();
        assert_eq!(empty.block_count(), 0);
        assert!(empty.is_all_zero());
    }
}
