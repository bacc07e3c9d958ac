pub mod builder;
pub mod iterator;

use bytes::{Buf, BufMut, Bytes};

pub(crate) const SIZEOF_U32: usize = std::mem::size_of::<u32>();

/// A sorted run of records framed as `[klen:u32][internal key][vlen:u32]
/// [value]`, followed by the record start offsets (u32 each) and the record
/// count (u32). All integers little-endian.
pub struct Block {
    pub(crate) data: Bytes,
    pub(crate) offsets: Vec<u32>,
}

impl Block {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.size());
        buf.put_slice(&self.data);
        for offset in &self.offsets {
            buf.put_u32_le(*offset);
        }
        buf.put_u32_le(self.offsets.len() as u32);
        buf.into()
    }

    pub fn decode(data: Bytes) -> Self {
        // count sits at the tail, the offset array right before it.
        let count = (&data[data.len() - SIZEOF_U32..]).get_u32_le() as usize;
        let data_end = data.len() - SIZEOF_U32 - count * SIZEOF_U32;
        let offsets = data[data_end..data.len() - SIZEOF_U32]
            .chunks(SIZEOF_U32)
            .map(|mut x| x.get_u32_le())
            .collect();
        let data = data.slice(..data_end);
        Self { data, offsets }
    }

    /// Number of records.
    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.data.len() + self.offsets.len() * SIZEOF_U32 + SIZEOF_U32
    }
}
