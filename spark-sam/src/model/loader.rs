use super::hparams::Hyperparameters;
use super::weights::WeightStore;
use crate::error::LoadError;
use half::f16;
use ndarray::{ArrayD, IxDyn};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"SPARKSAM";
const VERSION: u32 = 1;
const MAX_DIMS: u32 = 4;
const MAX_NAME_LEN: usize = 1 << 12;
// larger than any released SAM tensor
const MAX_TENSOR_BYTES: u64 = 1 << 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
}

impl DType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F16),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
        }
    }

    pub fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

pub fn read_model_file(path: impl AsRef<Path>) -> Result<(Hyperparameters, WeightStore), LoadError> {
    let file = File::open(path.as_ref())?;
    read_model(BufReader::new(file))
}

/// Parses a weight file: header, hyperparameters, then tensor records.
pub fn read_model<R: Read>(mut reader: R) -> Result<(Hyperparameters, WeightStore), LoadError> {
    let mut magic = [0u8; 8];
    read_exact(&mut reader, &mut magic, "magic header")?;
    if &magic != MAGIC {
        return Err(LoadError::BadMagic { found: magic });
    }

    let version = read_u32(&mut reader, "version")?;
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let hparams = read_hparams(&mut reader)?;
    hparams.validate()?;

    let count = read_u32(&mut reader, "tensor count")?;
    let mut store = WeightStore::new();
    for i in 0..count {
        let (name, tensor) = read_tensor(&mut reader, i)?;
        store.insert(name, tensor);
    }

    Ok((hparams, store))
}

fn read_hparams<R: Read>(reader: &mut R) -> Result<Hyperparameters, LoadError> {
    let mut ints = [0i32; 12];
    for value in ints.iter_mut() {
        *value = read_i32(reader, "hyperparameters")?;
    }
    if let Some(negative) = ints.iter().find(|v| **v < 0) {
        return Err(LoadError::InvalidHparams(format!(
            "negative hyperparameter {negative}"
        )));
    }
    let mut floats = [0f32; 6];
    for value in floats.iter_mut() {
        *value = read_f32(reader, "hyperparameters")?;
    }

    let [n_enc_state, n_enc_layer, n_enc_head, n_enc_out_chans, n_pt_embd, n_dec_layer, n_dec_heads, n_mask_tokens, n_img_size, n_patch_size, n_window_size, ftype] =
        ints;
    let [mask_threshold, iou_threshold, stability_score_threshold, stability_score_offset, eps, eps_decoder_transformer] =
        floats;

    Ok(Hyperparameters {
        n_enc_state: n_enc_state as usize,
        n_enc_layer: n_enc_layer as usize,
        n_enc_head: n_enc_head as usize,
        n_enc_out_chans: n_enc_out_chans as usize,
        n_pt_embd: n_pt_embd as usize,
        n_dec_layer: n_dec_layer as usize,
        n_dec_heads: n_dec_heads as usize,
        n_mask_tokens: n_mask_tokens as usize,
        n_img_size: n_img_size as usize,
        n_patch_size: n_patch_size as usize,
        n_window_size: n_window_size as usize,
        ftype,
        mask_threshold,
        iou_threshold,
        stability_score_threshold,
        stability_score_offset,
        eps,
        eps_decoder_transformer,
    })
}

fn read_tensor<R: Read>(reader: &mut R, index: u32) -> Result<(String, ArrayD<f32>), LoadError> {
    let context = format!("tensor record {index}");
    let n_dims = read_u32(reader, &context)?;
    let name_len = read_u32(reader, &context)? as usize;
    let dtype_tag = read_u32(reader, &context)?;

    let mut dims = Vec::with_capacity(n_dims.min(MAX_DIMS) as usize);
    for _ in 0..n_dims.min(MAX_DIMS) {
        dims.push(read_u64(reader, &context)? as usize);
    }

    if name_len > MAX_NAME_LEN {
        return Err(LoadError::InvalidName);
    }
    let name_bytes = read_bytes(reader, name_len as u64, &context)?;
    let name = String::from_utf8(name_bytes).map_err(|_| LoadError::InvalidName)?;

    if n_dims == 0 || n_dims > MAX_DIMS {
        return Err(LoadError::InvalidRank { name, n_dims });
    }
    let dtype = DType::from_tag(dtype_tag).ok_or_else(|| LoadError::UnsupportedDtype {
        name: name.clone(),
        tag: dtype_tag,
    })?;

    let byte_len = read_u64(reader, &name)?;
    let expected = dims
        .iter()
        .try_fold(dtype.size() as u64, |acc, &d| acc.checked_mul(d as u64))
        .unwrap_or(u64::MAX);
    if byte_len != expected {
        return Err(LoadError::ByteLengthMismatch {
            name,
            expected,
            actual: byte_len,
        });
    }
    if byte_len > MAX_TENSOR_BYTES {
        return Err(LoadError::TensorTooLarge {
            name,
            bytes: byte_len,
        });
    }

    let raw = read_bytes(reader, byte_len, &name)?;

    let data: Vec<f32> = match dtype {
        DType::F32 => raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        DType::F16 => raw
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
    };
    let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data).map_err(|_| {
        LoadError::ByteLengthMismatch {
            name: name.clone(),
            expected,
            actual: byte_len,
        }
    })?;

    Ok((name, tensor))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], context: &str) -> Result<(), LoadError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => LoadError::Truncated(context.to_string()),
        _ => LoadError::Io(err),
    })
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives.
fn read_bytes<R: Read>(reader: &mut R, len: u64, context: &str) -> Result<Vec<u8>, LoadError> {
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(LoadError::Truncated(context.to_string()));
    }
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R, context: &str) -> Result<u32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, context)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R, context: &str) -> Result<i32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, context)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R, context: &str) -> Result<f32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, context)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, context: &str) -> Result<u64, LoadError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, context)?;
    Ok(u64::from_le_bytes(buf))
}

/// Serializes hyperparameters and tensors in the layout [`read_model`] expects.
pub struct ModelWriter {
    hparams: Hyperparameters,
    tensors: Vec<(String, DType, ArrayD<f32>)>,
}

impl ModelWriter {
    pub fn new(hparams: Hyperparameters) -> Self {
        ModelWriter {
            hparams,
            tensors: Vec::new(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> &mut Self {
        self.tensors.push((name.into(), DType::F32, tensor));
        self
    }

    pub fn add_f16(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> &mut Self {
        self.tensors.push((name.into(), DType::F16, tensor));
        self
    }

    /// Drops a previously added tensor, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tensors.len();
        self.tensors.retain(|(n, _, _)| n != name);
        before != self.tensors.len()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let h = &self.hparams;
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;

        let ints = [
            h.n_enc_state as i32,
            h.n_enc_layer as i32,
            h.n_enc_head as i32,
            h.n_enc_out_chans as i32,
            h.n_pt_embd as i32,
            h.n_dec_layer as i32,
            h.n_dec_heads as i32,
            h.n_mask_tokens as i32,
            h.n_img_size as i32,
            h.n_patch_size as i32,
            h.n_window_size as i32,
            h.ftype,
        ];
        for value in ints {
            writer.write_all(&value.to_le_bytes())?;
        }
        let floats = [
            h.mask_threshold,
            h.iou_threshold,
            h.stability_score_threshold,
            h.stability_score_offset,
            h.eps,
            h.eps_decoder_transformer,
        ];
        for value in floats {
            writer.write_all(&value.to_le_bytes())?;
        }

        writer.write_all(&(self.tensors.len() as u32).to_le_bytes())?;
        for (name, dtype, tensor) in &self.tensors {
            writer.write_all(&(tensor.ndim() as u32).to_le_bytes())?;
            writer.write_all(&(name.len() as u32).to_le_bytes())?;
            writer.write_all(&dtype.tag().to_le_bytes())?;
            for &dim in tensor.shape() {
                writer.write_all(&(dim as u64).to_le_bytes())?;
            }
            writer.write_all(name.as_bytes())?;
            writer.write_all(&((tensor.len() * dtype.size()) as u64).to_le_bytes())?;
            for &value in tensor.iter() {
                match dtype {
                    DType::F32 => writer.write_all(&value.to_le_bytes())?,
                    DType::F16 => writer.write_all(&f16::from_f32(value).to_le_bytes())?,
                }
            }
        }

        Ok(())
    }
}
