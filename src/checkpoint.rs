//! Binary parameter checkpoints
//!
//! ## Format
//!
//! ```text
//! "TISSLM"            6 bytes magic
//! version             u8 (currently 1)
//! count               u32 LE, number of parameters
//! per parameter:
//!   rank              u32 LE
//!   dims              rank × u32 LE
//!   len               u32 LE, number of values
//!   values            len × f32 LE
//! ```
//!
//! Parameters are written in `Model::parameters` order. Reading checks the
//! count, every shape and every data length against the live parameters and
//! only overwrites values once the whole stream has been validated.
//!
//! [`write_model`] / [`read_model`] prefix the parameter block with the
//! model's JSON configuration (u32 LE length, then UTF-8 bytes) so a model
//! can be rebuilt from the stream alone. The prefix is capped at 1 MiB.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::{Model, TransformerModel};
use crate::parameter::Parameter;
use crate::tensor::Tensor;
use log::{info, warn};
use std::io::{self, Read, Write};

const MAGIC: &[u8; 6] = b"TISSLM";
const VERSION: u8 = 1;
/// Upper bound on the JSON configuration prefix read by [`read_model`]
const MAX_CONFIG_BYTES: usize = 1 << 20;

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| Error::CheckpointMismatch(format!("{value} does not fit in u32")))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes) as usize)
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.ndim())?;
    for &dim in tensor.shape() {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.numel())?;
    for &val in tensor.data() {
        w.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Read one tensor, checking it against the live parameter it will replace
fn read_tensor<R: Read>(r: &mut R, expected: &Parameter) -> Result<Tensor> {
    let rank = read_u32(r)?;
    if rank != expected.value.ndim() {
        return Err(Error::CheckpointMismatch(format!(
            "{}: rank {} in checkpoint, {} in model",
            expected.name,
            rank,
            expected.value.ndim()
        )));
    }
    let shape = (0..rank).map(|_| read_u32(r)).collect::<Result<Vec<_>>>()?;
    if shape != expected.shape() {
        return Err(Error::CheckpointMismatch(format!(
            "{}: shape {:?} in checkpoint, {:?} in model",
            expected.name,
            shape,
            expected.shape()
        )));
    }
    let len = read_u32(r)?;
    if len != expected.numel() {
        return Err(Error::CheckpointMismatch(format!(
            "{}: {} values in checkpoint, {} expected",
            expected.name,
            len,
            expected.numel()
        )));
    }

    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Tensor::new(data, shape)
}

/// Serialize parameter values (gradients are not stored)
pub fn write_parameters<W: Write>(w: &mut W, params: &[&Parameter]) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&[VERSION])?;
    write_u32(w, params.len())?;
    for p in params {
        write_tensor(w, &p.value)?;
    }
    info!(
        "wrote {} parameters ({} values)",
        params.len(),
        params.iter().map(|p| p.numel()).sum::<usize>()
    );
    Ok(())
}

/// Load parameter values written by [`write_parameters`] into `params`
pub fn read_parameters<R: Read>(r: &mut R, params: &mut [&mut Parameter]) -> Result<()> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::CheckpointMismatch("bad magic header".into()));
    }
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != VERSION {
        return Err(Error::CheckpointMismatch(format!(
            "unsupported version {}",
            version[0]
        )));
    }
    let count = read_u32(r)?;
    if count != params.len() {
        return Err(Error::CheckpointMismatch(format!(
            "{} parameters in checkpoint, {} in model",
            count,
            params.len()
        )));
    }

    let values = params
        .iter()
        .map(|p| read_tensor(r, p))
        .collect::<Result<Vec<_>>>()?;

    warn!("replacing values of {} live parameters", params.len());
    for (p, value) in params.iter_mut().zip(values) {
        p.value = value;
    }
    info!("read {} parameters", count);
    Ok(())
}

/// Write the configuration followed by every parameter of `model`
pub fn write_model<W: Write>(w: &mut W, model: &TransformerModel) -> Result<()> {
    let config = serde_json::to_vec(&model.config)?;
    write_u32(w, config.len())?;
    w.write_all(&config)?;
    write_parameters(w, &model.parameters())
}

/// Rebuild a model from a stream produced by [`write_model`]
pub fn read_model<R: Read>(r: &mut R) -> Result<TransformerModel> {
    let len = read_u32(r)?;
    if len > MAX_CONFIG_BYTES {
        return Err(Error::CheckpointMismatch(format!(
            "configuration of {len} bytes exceeds the {MAX_CONFIG_BYTES} byte limit"
        )));
    }
    let mut config = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut config)?;
    if config.len() != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    let config: ModelConfig = serde_json::from_slice(&config)?;

    let mut model = TransformerModel::new(config)?;
    read_parameters(r, &mut model.parameters_mut())?;
    Ok(model)
}
