use usbd_bulk_only::subclass::disk::{BlockDevice, BlockError};

pub const BLOCK_SIZE: u32 = 512;

/// In-memory block device
pub struct RamDisk {
    pub data: Vec<u8>,
    pub write_protected: bool,
    pub fail_at: Option<u32>,
}

impl RamDisk {
    pub fn new(blocks: u32) -> Self {
        let mut data = vec![0u8; (blocks * BLOCK_SIZE) as usize];
        for (i, block) in data.chunks_mut(BLOCK_SIZE as usize).enumerate() {
            block.fill(i as u8);
        }
        Self {
            data,
            write_protected: false,
            fail_at: None,
        }
    }

    pub fn block(&self, lba: u32) -> &[u8] {
        let start = (lba * BLOCK_SIZE) as usize;
        &self.data[start..start + BLOCK_SIZE as usize]
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u32 {
        self.data.len() as u32 / BLOCK_SIZE
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn read_block(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_at == Some(lba) {
            return Err(BlockError);
        }
        dst.copy_from_slice(self.block(lba));
        Ok(())
    }

    fn write_block(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockError> {
        if self.fail_at == Some(lba) {
            return Err(BlockError);
        }
        let start = (lba * BLOCK_SIZE) as usize;
        self.data[start..start + BLOCK_SIZE as usize].copy_from_slice(src);
        Ok(())
    }
}
