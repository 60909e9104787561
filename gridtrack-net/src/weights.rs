//! Binary weight file shared by training exports and the converter.
//!
//! Layout (all integers little-endian `u32`):
//! magic `GTNW`, version, tensor count, then per tensor the name length,
//! UTF-8 name, rank, dims and `f32` data.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::MmapOptions;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{NetError, Result};

pub const MAGIC: &[u8; 4] = b"GTNW";
pub const VERSION: u32 = 1;

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| NetError::InvalidWeights(format!("truncated at byte {}", self.offset)))?;
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Read every tensor in a weights file, keyed by name.
pub fn read_weights(path: &Path) -> Result<HashMap<String, ArrayD<f32>>> {
    if !path.exists() {
        return Err(NetError::WeightsNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(NetError::InvalidWeights("empty file".into()));
    }
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    parse(&mmap[..])
}

fn parse(buf: &[u8]) -> Result<HashMap<String, ArrayD<f32>>> {
    let mut r = Reader { buf, offset: 0 };
    if r.bytes(4)? != MAGIC {
        return Err(NetError::InvalidWeights("bad magic".into()));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(NetError::InvalidWeights(format!("unsupported version {version}")));
    }
    let count = r.u32()? as usize;
    let mut tensors = HashMap::new();
    for _ in 0..count {
        let name_len = r.u32()? as usize;
        let name = std::str::from_utf8(r.bytes(name_len)?)
            .map_err(|e| NetError::InvalidWeights(format!("tensor name: {e}")))?
            .to_string();
        let rank = r.u32()? as usize;
        if rank > r.remaining() / 4 {
            return Err(NetError::InvalidWeights(format!("tensor {name}: rank {rank} exceeds file size")));
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(r.u32()? as usize);
        }
        let overflow = || NetError::InvalidWeights(format!("tensor {name}: dims {dims:?} overflow"));
        let numel = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(overflow)?;
        let byte_len = numel.checked_mul(4).ok_or_else(overflow)?;
        let bytes = r.bytes(byte_len)?;
        // mmap offsets are not f32-aligned, so copy into an aligned buffer
        let mut data = vec![0f32; numel];
        bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(bytes);
        let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data)?;
        if tensors.insert(name.clone(), tensor).is_some() {
            return Err(NetError::InvalidWeights(format!("duplicate tensor {name}")));
        }
    }
    Ok(tensors)
}

/// Write named tensors in the `GTNW` layout.
pub fn write_weights(path: &Path, tensors: &[(String, ArrayViewD<'_, f32>)]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(MAGIC)?;
    f.write_all(&VERSION.to_le_bytes())?;
    f.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for (name, tensor) in tensors {
        f.write_all(&(name.len() as u32).to_le_bytes())?;
        f.write_all(name.as_bytes())?;
        f.write_all(&(tensor.ndim() as u32).to_le_bytes())?;
        for d in tensor.shape() {
            f.write_all(&(*d as u32).to_le_bytes())?;
        }
        let data = tensor.as_standard_layout();
        let values = data
            .as_slice()
            .ok_or_else(|| NetError::InvalidWeights(format!("tensor {name} is not contiguous")))?;
        f.write_all(bytemuck::cast_slice(values))?;
    }
    f.flush()?;
    Ok(())
}
