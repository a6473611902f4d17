//! Raw conditioner inputs and feature-file loading.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// One raw conditioning value taken from a metadata dictionary.
#[derive(Debug, Clone)]
pub enum ConditionValue {
    Text(String),
    Int(i64),
    Float(f64),
    Tensor(Tensor),
    List(Vec<ConditionValue>),
}

/// Per-example metadata: `key -> value`.
pub type Metadata = HashMap<String, ConditionValue>;

impl ConditionValue {
    /// Convert a JSON value. Strings become text (or file paths), numbers
    /// keep their integer-ness, arrays become lists.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;
        match value {
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Bool(b) => Ok(Self::Int(i64::from(*b))),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| Error::Config(format!("unrepresentable number {n}"))),
            },
            Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            Value::Null | Value::Object(_) => Err(Error::Config(format!(
                "unsupported conditioning value {value}"
            ))),
        }
    }

    /// Parse a JSON object into [`Metadata`].
    pub fn metadata_from_json(value: &serde_json::Value) -> Result<Metadata> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Config("conditioning metadata must be a JSON object".into()))?;
        object
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| Ok((k.clone(), Self::from_json(v)?)))
            .collect()
    }

    /// Unwrap a single-element list, as produced by list-wrapping collate functions.
    pub fn unwrap_single(&self) -> &ConditionValue {
        match self {
            Self::List(items) if items.len() == 1 => &items[0],
            other => other,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Tensor(_) => "tensor",
            Self::List(_) => "list",
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for ConditionValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<i64> for ConditionValue {
    fn from(x: i64) -> Self {
        Self::Int(x)
    }
}

impl From<Tensor> for ConditionValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

fn mismatch(expected: &str, got: &ConditionValue) -> Error {
    Error::Config(format!(
        "expected {expected} conditioning input, got {}",
        got.kind_name()
    ))
}

pub(crate) fn texts(values: &[ConditionValue]) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| match v {
            ConditionValue::Text(s) => Ok(s.clone()),
            other => Err(mismatch("text", other)),
        })
        .collect()
}

pub(crate) fn floats(values: &[ConditionValue]) -> Result<Vec<f64>> {
    values
        .iter()
        .map(|v| match v {
            ConditionValue::Float(x) => Ok(*x),
            ConditionValue::Int(i) => Ok(*i as f64),
            ConditionValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::Config(format!("cannot parse {s:?} as a number"))),
            other => Err(mismatch("numeric", other)),
        })
        .collect()
}

pub(crate) fn ints(values: &[ConditionValue]) -> Result<Vec<i64>> {
    values
        .iter()
        .map(|v| match v {
            ConditionValue::Int(i) => Ok(*i),
            ConditionValue::Float(x) => Ok(x.trunc() as i64),
            other => Err(mismatch("integer", other)),
        })
        .collect()
}

/// Collect tensor inputs without loading files (raw audio).
pub(crate) fn tensors(values: &[ConditionValue]) -> Result<Vec<Tensor>> {
    values
        .iter()
        .map(|v| match v {
            ConditionValue::Tensor(t) => Ok(t.clone()),
            other => Err(mismatch("tensor", other)),
        })
        .collect()
}

/// Load one feature file.
///
/// - a path containing `.npy` is read as a whole array
/// - a path containing `.pth` is a torch archive; `pth_key` selects the tensor
/// - anything else is an `.npz` archive holding `feat`
pub fn load_feature_file(path: &str, pth_key: Option<&str>) -> Result<Tensor> {
    if path.contains(".npy") {
        return Ok(Tensor::read_npy(path)?);
    }
    if path.contains(".pth") {
        let key = pth_key.ok_or_else(|| {
            Error::Config(format!("{path}: torch archives are not accepted here"))
        })?;
        let tensors = candle_core::pickle::read_all(path)?;
        return tensors
            .into_iter()
            .find_map(|(name, t)| (name == key).then_some(t))
            .ok_or_else(|| Error::WeightLoad(format!("{path}: no tensor named {key}")));
    }
    let mut found = Tensor::read_npz_by_name(Path::new(path), &["feat"])?;
    found
        .pop()
        .ok_or_else(|| Error::WeightLoad(format!("{path}: no array named feat")))
}

/// Stack per-example features (tensors or file paths) into `[B, ...]` on `device` in `dtype`.
pub(crate) fn feature_batch(
    values: &[ConditionValue],
    pth_key: Option<&str>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let items = values
        .iter()
        .map(|v| match v {
            ConditionValue::Tensor(t) => Ok(t.clone()),
            ConditionValue::Text(path) => load_feature_file(path, pth_key),
            other => Err(mismatch("feature path or tensor", other)),
        })
        .map(|t: Result<Tensor>| -> Result<Tensor> { Ok(t?.to_device(device)?.to_dtype(dtype)?) })
        .collect::<Result<Vec<_>>>()?;
    if items.is_empty() {
        return Err(Error::Invariant("empty conditioning batch".into()));
    }
    Ok(Tensor::stack(&items, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_numbers_keep_integer_kind() {
        let v = ConditionValue::from_json(&serde_json::json!(3)).unwrap();
        assert!(matches!(v, ConditionValue::Int(3)));
        let v = ConditionValue::from_json(&serde_json::json!(2.5)).unwrap();
        assert!(matches!(v, ConditionValue::Float(x) if x == 2.5));
    }

    #[test]
    fn single_element_lists_unwrap() {
        let v = ConditionValue::from_json(&serde_json::json!(["a prompt"])).unwrap();
        assert!(matches!(v.unwrap_single(), ConditionValue::Text(s) if s == "a prompt"));

        let v = ConditionValue::from_json(&serde_json::json!(["a", "b"])).unwrap();
        assert!(matches!(v.unwrap_single(), ConditionValue::List(items) if items.len() == 2));
    }

    #[test]
    fn float_ints_truncate_toward_zero() {
        let values = [
            ConditionValue::Int(4),
            ConditionValue::Float(2.9),
            ConditionValue::Float(-1.7),
        ];
        assert_eq!(ints(&values).unwrap(), vec![4, 2, -1]);
        assert!(ints(&[ConditionValue::Text("x".into())]).is_err());
    }

    #[test]
    fn metadata_skips_nulls() {
        let meta = ConditionValue::metadata_from_json(&serde_json::json!({
            "caption": "rain on a tin roof",
            "seconds_total": 8,
            "unused": null
        }))
        .unwrap();
        assert_eq!(meta.len(), 2);
    }

    #[test]
    fn npy_features_load_and_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.npy");
        let feat = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        feat.write_npy(&path).unwrap();

        let path = path.to_string_lossy().to_string();
        let batch = feature_batch(
            &[ConditionValue::Text(path.clone()), ConditionValue::Text(path)],
            None,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap();
        assert_eq!(batch.dims(), &[2, 4, 8]);
    }

    #[test]
    fn npz_features_use_feat_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.npz");
        let feat = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        Tensor::write_npz(&[("feat", &feat)], &path).unwrap();

        let loaded = load_feature_file(&path.to_string_lossy(), None).unwrap();
        assert_eq!(loaded.dims(), &[3, 2]);
    }

    #[test]
    fn floats_accept_ints_and_strings() {
        let values = vec![
            ConditionValue::Int(2),
            ConditionValue::Float(0.5),
            ConditionValue::Text(" 1.25 ".into()),
        ];
        assert_eq!(floats(&values).unwrap(), vec![2.0, 0.5, 1.25]);
    }
}
