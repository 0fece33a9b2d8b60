use std::fs::File;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype, SafeTensors};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{Result, TensorIoError};

/// Serialize named tensors into a safetensors blob. Everything is written
/// as little-endian f32 on the CPU.
pub fn to_safetensors(tensors: &[(String, Tensor)]) -> Result<Vec<u8>> {
    let mut owned: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let t = tensor
            .detach()
            .to_device(Device::Cpu)
            .totype(Kind::Float)
            .contiguous();
        let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
        let numel = t.numel();
        let mut values = vec![0f32; numel];
        t.copy_data(&mut values, numel);
        let mut bytes = Vec::with_capacity(numel * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        owned.push((name.clone(), shape, bytes));
    }

    let mut views = Vec::with_capacity(owned.len());
    for (name, shape, bytes) in &owned {
        views.push((
            name.clone(),
            TensorView::new(Dtype::F32, shape.clone(), bytes)?,
        ));
    }
    Ok(serialize(views, &None)?)
}

/// Decode a safetensors blob into named CPU tensors.
pub fn from_safetensors(bytes: &[u8]) -> Result<Vec<(String, Tensor)>> {
    let st = SafeTensors::deserialize(bytes)?;
    let mut out = Vec::new();
    for (name, view) in st.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            other => return Err(TensorIoError::UnsupportedDtype(format!("{:?}", other))),
        };
        out.push((
            name.to_string(),
            Tensor::from_data_size(view.data(), &shape, kind),
        ));
    }
    Ok(out)
}

/// Copy the tensors whose names start with `prefix` into the matching
/// variables of a VarStore, checking shapes. Every variable in the store
/// must receive a value.
pub fn load_into_varstore(
    vs: &nn::VarStore,
    tensors: &[(String, Tensor)],
    prefix: &str,
) -> Result<()> {
    let mut variables = vs.variables();
    let device = vs.device();
    let mut matched = 0usize;
    for (name, tensor) in tensors {
        let stripped = match name.strip_prefix(prefix) {
            Some(s) => s,
            None => continue,
        };
        let var = variables
            .get_mut(stripped)
            .ok_or_else(|| TensorIoError::MissingVariable(stripped.to_string()))?;
        if var.size() != tensor.size() {
            return Err(TensorIoError::ShapeMismatch {
                name: stripped.to_string(),
                expected: var.size(),
                found: tensor.size(),
            });
        }
        let src = tensor.to_device(device);
        tch::no_grad(|| {
            var.copy_(&src);
        });
        matched += 1;
    }
    if matched < variables.len() {
        // At least one live variable has no stored counterpart.
        for (name, _) in variables.iter() {
            let key = format!("{}{}", prefix, name);
            if !tensors.iter().any(|(n, _)| *n == key) {
                return Err(TensorIoError::MissingVariable(name.clone()));
            }
        }
    }
    Ok(())
}

/// Write a safetensors file.
pub fn write_safetensors_file<P: AsRef<Path>>(path: P, tensors: &[(String, Tensor)]) -> Result<()> {
    let bytes = to_safetensors(tensors)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read a safetensors file through a memory map.
pub fn read_safetensors_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tensor)>> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    from_safetensors(&buffer)
}
