//! Per-field block layout shared by every archive backend.
//!
//! A normalized field is stored as zero or more contiguous blocks. Numeric and array
//! sequences become one block keyed by the field name; composite sequences become one
//! block per sub-field keyed `field/subfield`. Block bytes are little-endian and
//! uncompressed here; compression is the backend's concern.

use std::collections::BTreeMap;

use crate::{
    ArchiveError, DType, FieldKind, FieldValue, Scalar, StorageContext, Tensor, TensorData,
    COMPOSITE_SEPARATOR,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub key: String,
    pub dtype: DType,
    pub element_shape: Vec<usize>,
    pub steps: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedField {
    pub name: String,
    pub kind: FieldKind,
    pub text: Option<String>,
    pub blocks: Vec<EncodedBlock>,
}

#[must_use]
pub fn composite_key(field: &str, sub_field: &str) -> String {
    format!("{field}{COMPOSITE_SEPARATOR}{sub_field}")
}

#[must_use]
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(COMPOSITE_SEPARATOR)
}

/// Lay out one already-normalized field as blocks.
///
/// Empty sequences produce no blocks; the field kind alone is enough to rebuild them.
#[must_use]
pub fn encode_field(name: &str, value: &FieldValue) -> EncodedField {
    let mut encoded =
        EncodedField { name: name.to_string(), kind: value.kind(), text: None, blocks: Vec::new() };

    match value {
        FieldValue::ScalarText(text) => encoded.text = Some(text.clone()),
        FieldValue::NumericSequence(values) => {
            if let Some(first) = values.first() {
                let mut bytes = Vec::with_capacity(values.len() * first.dtype().byte_width());
                for scalar in values {
                    match *scalar {
                        Scalar::Bool(flag) => bytes.push(u8::from(flag)),
                        Scalar::Int(number) => bytes.extend_from_slice(&number.to_le_bytes()),
                        Scalar::Float(number) => bytes.extend_from_slice(&number.to_le_bytes()),
                    }
                }
                encoded.blocks.push(EncodedBlock {
                    key: name.to_string(),
                    dtype: first.dtype(),
                    element_shape: Vec::new(),
                    steps: values.len(),
                    bytes,
                });
            }
        }
        FieldValue::ArraySequence(values) => {
            if let Some(block) = encode_tensors(name.to_string(), values.len(), values.iter()) {
                encoded.blocks.push(block);
            }
        }
        FieldValue::DictSequence(values) => {
            if let Some(first) = values.first() {
                for sub_field in first.keys() {
                    let tensors = values.iter().filter_map(|step| step.get(sub_field));
                    let key = composite_key(name, sub_field);
                    if let Some(block) = encode_tensors(key, values.len(), tensors) {
                        encoded.blocks.push(block);
                    }
                }
            }
        }
    }

    encoded
}

fn encode_tensors<'a>(
    key: String,
    steps: usize,
    tensors: impl Iterator<Item = &'a Tensor>,
) -> Option<EncodedBlock> {
    let mut tensors = tensors.peekable();
    let first = tensors.peek()?;
    let dtype = first.dtype();
    let element_shape = first.shape.clone();
    let mut bytes = Vec::with_capacity(steps * first.element_count() * dtype.byte_width());
    for tensor in tensors {
        extend_le_bytes(&mut bytes, &tensor.data);
    }
    Some(EncodedBlock { key, dtype, element_shape, steps, bytes })
}

fn extend_le_bytes(out: &mut Vec<u8>, data: &TensorData) {
    match data {
        TensorData::U8(values) => out.extend_from_slice(values),
        TensorData::I32(values) => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        TensorData::I64(values) => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        TensorData::F32(values) => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        TensorData::F64(values) => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        TensorData::Bool(values) => out.extend(values.iter().map(|flag| u8::from(*flag))),
    }
}

/// Rebuild a field from its stored kind, step count and blocks.
///
/// # Errors
/// Returns [`ArchiveError::Storage`] when blocks are missing, mis-sized or of an unexpected dtype.
pub fn decode_field(
    name: &str,
    kind: FieldKind,
    steps: usize,
    text: Option<String>,
    blocks: Vec<EncodedBlock>,
) -> Result<FieldValue, ArchiveError> {
    match kind {
        FieldKind::Text => Ok(FieldValue::ScalarText(text.unwrap_or_default())),
        FieldKind::Numeric => {
            if steps == 0 {
                return Ok(FieldValue::NumericSequence(Vec::new()));
            }
            let block = single_block(name, steps, blocks)?;
            let scalars = match data_from_le_bytes(block.dtype, &block.bytes)? {
                TensorData::Bool(values) => values.into_iter().map(Scalar::Bool).collect(),
                TensorData::I64(values) => values.into_iter().map(Scalar::Int).collect(),
                TensorData::F64(values) => values.into_iter().map(Scalar::Float).collect(),
                other => {
                    return Err(corrupt(
                        name,
                        format!("numeric field stored as {}", other.dtype().as_str()),
                    ));
                }
            };
            Ok(FieldValue::NumericSequence(scalars))
        }
        FieldKind::Array => {
            if steps == 0 {
                return Ok(FieldValue::ArraySequence(Vec::new()));
            }
            let block = single_block(name, steps, blocks)?;
            Ok(FieldValue::ArraySequence(split_block(name, block)?))
        }
        FieldKind::Dict => {
            let mut frames = vec![BTreeMap::new(); steps];
            for block in blocks {
                let Some((field, sub_field)) = split_composite_key(&block.key) else {
                    return Err(corrupt(name, format!("block `{}` is not composite", block.key)));
                };
                if field != name {
                    return Err(corrupt(name, format!("block `{}` belongs elsewhere", block.key)));
                }
                if block.steps != steps {
                    return Err(corrupt(
                        name,
                        format!("block `{}` holds {} steps, expected {steps}", block.key, block.steps),
                    ));
                }
                let sub_field = sub_field.to_string();
                for (frame, tensor) in frames.iter_mut().zip(split_block(name, block)?) {
                    frame.insert(sub_field.clone(), tensor);
                }
            }
            Ok(FieldValue::DictSequence(frames))
        }
    }
}

fn single_block(
    name: &str,
    steps: usize,
    blocks: Vec<EncodedBlock>,
) -> Result<EncodedBlock, ArchiveError> {
    let mut blocks = blocks.into_iter();
    let (Some(block), None) = (blocks.next(), blocks.next()) else {
        return Err(corrupt(name, "expected exactly one block".to_string()));
    };
    if block.key != name || block.steps != steps {
        return Err(corrupt(
            name,
            format!("block `{}` holds {} steps, expected `{name}` with {steps}", block.key, block.steps),
        ));
    }
    Ok(block)
}

fn split_block(name: &str, block: EncodedBlock) -> Result<Vec<Tensor>, ArchiveError> {
    let chunk = block.element_shape.iter().product::<usize>();
    let data = data_from_le_bytes(block.dtype, &block.bytes)?;
    if data.len() != chunk * block.steps {
        return Err(corrupt(
            name,
            format!(
                "block `{}` holds {} values, expected {} x {chunk}",
                block.key,
                data.len(),
                block.steps
            ),
        ));
    }

    let shape = block.element_shape;
    let steps = block.steps;
    let tensors = match data {
        TensorData::U8(values) => chunked(values, chunk, steps).map(TensorData::U8).collect::<Vec<_>>(),
        TensorData::I32(values) => chunked(values, chunk, steps).map(TensorData::I32).collect(),
        TensorData::I64(values) => chunked(values, chunk, steps).map(TensorData::I64).collect(),
        TensorData::F32(values) => chunked(values, chunk, steps).map(TensorData::F32).collect(),
        TensorData::F64(values) => chunked(values, chunk, steps).map(TensorData::F64).collect(),
        TensorData::Bool(values) => chunked(values, chunk, steps).map(TensorData::Bool).collect(),
    };

    Ok(tensors.into_iter().map(|data| Tensor { shape: shape.clone(), data }).collect())
}

fn chunked<T>(values: Vec<T>, chunk: usize, steps: usize) -> impl Iterator<Item = Vec<T>> {
    let mut values = values.into_iter();
    (0..steps).map(move |_| values.by_ref().take(chunk).collect())
}

/// Decode little-endian bytes into typed values.
///
/// # Errors
/// Returns [`ArchiveError::Storage`] when the byte length is not a multiple of the dtype width
/// or a boolean byte is neither 0 nor 1.
pub fn data_from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<TensorData, ArchiveError> {
    Ok(match dtype {
        DType::U8 => TensorData::U8(bytes.to_vec()),
        DType::I32 => TensorData::I32(decode_chunks::<4, _>(bytes, i32::from_le_bytes)?),
        DType::I64 => TensorData::I64(decode_chunks::<8, _>(bytes, i64::from_le_bytes)?),
        DType::F32 => TensorData::F32(decode_chunks::<4, _>(bytes, f32::from_le_bytes)?),
        DType::F64 => TensorData::F64(decode_chunks::<8, _>(bytes, f64::from_le_bytes)?),
        DType::Bool => TensorData::Bool(
            bytes
                .iter()
                .map(|byte| match byte {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(ArchiveError::storage(
                        "failed to decode bool block",
                        format!("invalid bool byte {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
    })
}

fn decode_chunks<const N: usize, T>(
    bytes: &[u8],
    convert: fn([u8; N]) -> T,
) -> Result<Vec<T>, ArchiveError> {
    if bytes.len() % N != 0 {
        return Err(ArchiveError::storage(
            "failed to decode block",
            format!("{} bytes is not a multiple of {N}", bytes.len()),
        ));
    }
    bytes
        .chunks_exact(N)
        .map(|chunk| <[u8; N]>::try_from(chunk).map(convert).storage_context("failed to decode block"))
        .collect()
}

fn corrupt(name: &str, detail: String) -> ArchiveError {
    ArchiveError::storage(format!("stored field `{name}` is inconsistent"), detail)
}
