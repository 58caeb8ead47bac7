use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

pub mod codec;

/// Reserved field name holding the human-readable task description.
pub const INSTRUCTION_FIELD: &str = "instruction";

/// Separator between a composite field and its sub-field in on-disk block keys.
pub const COMPOSITE_SEPARATOR: char = '/';

/// Highest disambiguating suffix tried when a timestamp key is already taken.
pub const MAX_TIMESTAMP_SUFFIX: u8 = 99;

const TIMESTAMP_BASE_LEN: usize = 15;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: BoxedSource,
    },
}

impl ArchiveError {
    pub fn storage(context: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Storage { context: context.into(), source: source.into() }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Attach storage context to foreign errors, in the manner of `anyhow::Context`.
pub trait StorageContext<T> {
    /// # Errors
    /// Wraps the original error as [`ArchiveError::Storage`].
    fn storage_context(self, context: &str) -> Result<T, ArchiveError>;

    /// # Errors
    /// Wraps the original error as [`ArchiveError::Storage`].
    fn with_storage_context<F>(self, context: F) -> Result<T, ArchiveError>
    where
        F: FnOnce() -> String;
}

impl<T, E> StorageContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, context: &str) -> Result<T, ArchiveError> {
        self.map_err(|err| ArchiveError::storage(context, err))
    }

    fn with_storage_context<F>(self, context: F) -> Result<T, ArchiveError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| ArchiveError::storage(context(), err))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bool => "bool",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "u8" => Some(Self::U8),
            "i32" => Some(Self::I32),
            "i64" => Some(Self::I64),
            "f32" => Some(Self::F32),
            "f64" => Some(Self::F64),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    #[must_use]
    pub fn byte_width(self) -> usize {
        match self {
            Self::U8 | Self::Bool => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
}

impl TensorData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::Bool(_) => DType::Bool,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(values) => values.len(),
            Self::I32(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
            Self::Bool(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense, row-major numeric array such as one camera frame or one joint vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that `shape` covers exactly the provided values.
    ///
    /// # Errors
    /// Returns [`ArchiveError::MalformedRecord`] when the element count does not match the shape.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, ArchiveError> {
        let tensor = Self { shape, data };
        tensor.validate()?;
        Ok(tensor)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// # Errors
    /// Returns [`ArchiveError::MalformedRecord`] when the element count does not match the shape.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.element_count() != self.data.len() {
            return Err(ArchiveError::MalformedRecord(format!(
                "tensor shape {:?} expects {} values but holds {}",
                self.shape,
                self.element_count(),
                self.data.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int(_) => DType::I64,
            Self::Float(_) => DType::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Numeric,
    Array,
    Dict,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Numeric => "numeric",
            Self::Array => "array",
            Self::Dict => "dict",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "numeric" => Some(Self::Numeric),
            "array" => Some(Self::Array),
            "dict" => Some(Self::Dict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    ScalarText(String),
    NumericSequence(Vec<Scalar>),
    ArraySequence(Vec<Tensor>),
    DictSequence(Vec<BTreeMap<String, Tensor>>),
}

impl FieldValue {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::ScalarText(_) => FieldKind::Text,
            Self::NumericSequence(_) => FieldKind::Numeric,
            Self::ArraySequence(_) => FieldKind::Array,
            Self::DictSequence(_) => FieldKind::Dict,
        }
    }

    /// Number of recorded steps, or `None` for the scalar text field.
    #[must_use]
    pub fn sequence_len(&self) -> Option<usize> {
        match self {
            Self::ScalarText(_) => None,
            Self::NumericSequence(values) => Some(values.len()),
            Self::ArraySequence(values) => Some(values.len()),
            Self::DictSequence(values) => Some(values.len()),
        }
    }

    /// Keep only the first `len` steps; text is left untouched.
    pub fn truncate(&mut self, len: usize) {
        match self {
            Self::ScalarText(_) => {}
            Self::NumericSequence(values) => values.truncate(len),
            Self::ArraySequence(values) => values.truncate(len),
            Self::DictSequence(values) => values.truncate(len),
        }
    }

    fn validate_steps(&self, name: &str, steps: usize) -> Result<(), ArchiveError> {
        match self {
            Self::ScalarText(_) => Ok(()),
            Self::NumericSequence(values) => {
                let values = values.get(..steps).unwrap_or(values);
                let Some(first) = values.first() else {
                    return Ok(());
                };
                if let Some(step) = values.iter().position(|value| value.dtype() != first.dtype()) {
                    return Err(ArchiveError::MalformedRecord(format!(
                        "field `{name}` step {step} is {} but step 0 is {}",
                        values[step].dtype().as_str(),
                        first.dtype().as_str()
                    )));
                }
                Ok(())
            }
            Self::ArraySequence(values) => {
                validate_uniform_tensors(name, values.iter().take(steps))
            }
            Self::DictSequence(values) => {
                let values = values.get(..steps).unwrap_or(values);
                let Some(first) = values.first() else {
                    return Ok(());
                };
                let expected = first.keys().collect::<BTreeSet<_>>();
                for sub in &expected {
                    validate_name(&format!("sub-field of `{name}`"), sub)?;
                }
                for (step, value) in values.iter().enumerate() {
                    let keys = value.keys().collect::<BTreeSet<_>>();
                    if keys != expected {
                        return Err(ArchiveError::MalformedRecord(format!(
                            "field `{name}` step {step} has sub-fields {keys:?}, expected {expected:?}"
                        )));
                    }
                }
                for sub in expected {
                    let label = codec::composite_key(name, sub);
                    validate_uniform_tensors(&label, values.iter().filter_map(|step| step.get(sub)))?;
                }
                Ok(())
            }
        }
    }
}

fn validate_uniform_tensors<'a>(
    name: &str,
    mut tensors: impl Iterator<Item = &'a Tensor>,
) -> Result<(), ArchiveError> {
    let Some(first) = tensors.next() else {
        return Ok(());
    };
    first.validate()?;
    for (offset, tensor) in tensors.enumerate() {
        tensor.validate()?;
        if tensor.dtype() != first.dtype() || tensor.shape != first.shape {
            return Err(ArchiveError::MalformedRecord(format!(
                "field `{name}` step {} is {}{:?} but step 0 is {}{:?}",
                offset + 1,
                tensor.dtype().as_str(),
                tensor.shape,
                first.dtype().as_str(),
                first.shape
            )));
        }
    }
    Ok(())
}

fn validate_name(label: &str, name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() {
        return Err(ArchiveError::MalformedRecord(format!("{label} name MUST be non-empty")));
    }
    if name.contains(COMPOSITE_SEPARATOR) {
        return Err(ArchiveError::MalformedRecord(format!(
            "{label} name `{name}` MUST NOT contain `{COMPOSITE_SEPARATOR}`"
        )));
    }
    Ok(())
}

/// One recorded episode: named per-step sequences plus an optional instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DemonstrationRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl DemonstrationRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(name.into(), value)
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_instruction(self, instruction: impl Into<String>) -> Self {
        self.with_field(INSTRUCTION_FIELD, FieldValue::ScalarText(instruction.into()))
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn instruction(&self) -> Option<&str> {
        match self.fields.get(INSTRUCTION_FIELD) {
            Some(FieldValue::ScalarText(text)) => Some(text),
            _ => None,
        }
    }

    /// Shortest sequence length across all sequence fields.
    #[must_use]
    pub fn common_length(&self) -> Option<usize> {
        self.fields.values().filter_map(FieldValue::sequence_len).min()
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.common_length().unwrap_or(0)
    }

    /// Check naming, the reserved instruction field and per-field shape uniformity.
    ///
    /// Only the leading `common_length()` steps of each sequence are inspected, since
    /// anything past them is dropped on save.
    ///
    /// # Errors
    /// Returns [`ArchiveError::MalformedRecord`] when the record cannot be persisted.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let Some(steps) = self.common_length() else {
            return Err(ArchiveError::MalformedRecord(
                "record MUST contain at least one sequence field".to_string(),
            ));
        };

        for (name, value) in &self.fields {
            validate_name("field", name)?;
            match (name.as_str() == INSTRUCTION_FIELD, value) {
                (true, FieldValue::ScalarText(_)) | (false, FieldValue::NumericSequence(_))
                | (false, FieldValue::ArraySequence(_))
                | (false, FieldValue::DictSequence(_)) => {}
                (true, other) => {
                    return Err(ArchiveError::MalformedRecord(format!(
                        "`{INSTRUCTION_FIELD}` MUST be scalar text, got {}",
                        other.kind().as_str()
                    )));
                }
                (false, FieldValue::ScalarText(_)) => {
                    return Err(ArchiveError::MalformedRecord(format!(
                        "field `{name}` holds scalar text; only `{INSTRUCTION_FIELD}` may"
                    )));
                }
            }

            value.validate_steps(name, steps)?;
        }

        Ok(())
    }

    /// Validate and cut every sequence field down to the common minimum length.
    ///
    /// # Errors
    /// Returns [`ArchiveError::MalformedRecord`] when validation fails.
    pub fn normalized(&self) -> Result<(Self, usize), ArchiveError> {
        self.validate()?;
        let steps = self.step_count();
        let mut normalized = self.clone();
        for value in normalized.fields.values_mut() {
            value.truncate(steps);
        }
        Ok((normalized, steps))
    }

    /// Borrow every field's value at one step, as the playback view consumes it.
    #[must_use]
    pub fn step(&self, index: usize) -> Option<BTreeMap<&str, StepValue<'_>>> {
        if index >= self.step_count() {
            return None;
        }
        let mut view = BTreeMap::new();
        for (name, value) in &self.fields {
            let step = match value {
                FieldValue::ScalarText(text) => StepValue::Text(text),
                FieldValue::NumericSequence(values) => StepValue::Scalar(*values.get(index)?),
                FieldValue::ArraySequence(values) => StepValue::Tensor(values.get(index)?),
                FieldValue::DictSequence(values) => StepValue::Dict(values.get(index)?),
            };
            view.insert(name.as_str(), step);
        }
        Some(view)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StepValue<'a> {
    Text(&'a str),
    Scalar(Scalar),
    Tensor(&'a Tensor),
    Dict(&'a BTreeMap<String, Tensor>),
}

/// Second-granularity `YYYYMMDD_HHMMSS` key, optionally followed by a `-NN` collision suffix.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(String);

impl Timestamp {
    /// Current local wall-clock time; UTC when the local offset is unavailable.
    ///
    /// # Errors
    /// Same as [`Timestamp::from_datetime`].
    pub fn now() -> Result<Self, ArchiveError> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        Self::from_datetime(now)
    }

    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] when `value` cannot be written as a key.
    pub fn from_datetime(value: OffsetDateTime) -> Result<Self, ArchiveError> {
        value.format(TIMESTAMP_FORMAT).map(Self).map_err(|err| {
            ArchiveError::InvalidArgument(format!("cannot format timestamp {value}: {err}"))
        })
    }

    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] when `raw` is not a valid timestamp key.
    pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
        let invalid = || ArchiveError::InvalidArgument(format!("invalid timestamp `{raw}`"));
        let (base, suffix) = match raw.get(..TIMESTAMP_BASE_LEN) {
            Some(base) => (base, &raw[TIMESTAMP_BASE_LEN..]),
            None => return Err(invalid()),
        };

        PrimitiveDateTime::parse(base, TIMESTAMP_FORMAT).map_err(|_| invalid())?;

        if !suffix.is_empty() {
            let digits = suffix.strip_prefix('-').ok_or_else(invalid)?;
            if digits.len() != 2 {
                return Err(invalid());
            }
            let value = digits.parse::<u8>().map_err(|_| invalid())?;
            if !(2..=MAX_TIMESTAMP_SUFFIX).contains(&value) {
                return Err(invalid());
            }
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.0[..TIMESTAMP_BASE_LEN]
    }

    #[must_use]
    pub fn suffix(&self) -> Option<u8> {
        self.0.get(TIMESTAMP_BASE_LEN + 1..).and_then(|digits| digits.parse().ok())
    }

    #[must_use]
    pub fn with_suffix(&self, suffix: u8) -> Self {
        Self(format!("{}-{suffix:02}", self.base()))
    }

    /// Keys to try, in order, when placing a new entry at this timestamp.
    pub fn candidates(&self) -> impl Iterator<Item = Timestamp> + '_ {
        let start = self.suffix().map_or(2, |suffix| suffix.saturating_add(1));
        std::iter::once(self.clone())
            .chain((start..=MAX_TIMESTAMP_SUFFIX).map(move |suffix| self.with_suffix(suffix)))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Timestamp {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = ArchiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

/// Address of one stored demonstration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArchiveEntry {
    pub environment: String,
    pub task: String,
    pub timestamp: Timestamp,
}

impl ArchiveEntry {
    #[must_use]
    pub fn new(environment: impl Into<String>, task: impl Into<String>, timestamp: Timestamp) -> Self {
        Self { environment: environment.into(), task: task.into(), timestamp }
    }

    /// Parse the `environment/task/timestamp` form shown in listings.
    ///
    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] when the path is not three valid segments.
    pub fn parse_path(path: &str) -> Result<Self, ArchiveError> {
        let mut parts = path.split('/');
        let (Some(environment), Some(task), Some(timestamp), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ArchiveError::InvalidArgument(format!(
                "entry path `{path}` MUST be environment/task/timestamp"
            )));
        };
        validate_identifier("environment", environment)?;
        validate_identifier("task", task)?;
        Ok(Self::new(environment, task, Timestamp::parse(timestamp)?))
    }
}

impl Display for ArchiveEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.environment, self.task, self.timestamp)
    }
}

/// Check an environment or task name before it is used to address a storage unit.
///
/// # Errors
/// Returns [`ArchiveError::InvalidArgument`] for empty names, path separators or dot-prefixed names.
pub fn validate_identifier(label: &str, value: &str) -> Result<(), ArchiveError> {
    if value.trim().is_empty() {
        return Err(ArchiveError::InvalidArgument(format!("{label} MUST be non-empty")));
    }
    if value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        return Err(ArchiveError::InvalidArgument(format!(
            "{label} `{value}` MUST NOT start with `.` or contain path separators"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    /// # Errors
    /// Returns [`ArchiveError::InvalidArgument`] when `page` or `page_size` is zero.
    pub fn new(page: usize, page_size: usize) -> Result<Self, ArchiveError> {
        if page == 0 {
            return Err(ArchiveError::InvalidArgument("page is 1-indexed".to_string()));
        }
        if page_size == 0 {
            return Err(ArchiveError::InvalidArgument("page_size MUST be >= 1".to_string()));
        }
        Ok(Self { page, page_size })
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }

    /// Page count for `total_count` items; never less than one.
    #[must_use]
    pub fn total_pages(&self, total_count: usize) -> usize {
        total_count.div_ceil(self.page_size).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    #[must_use]
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            page: request.page,
            page_size: request.page_size,
            total_count: 0,
            total_pages: 1,
        }
    }

    #[must_use]
    pub fn new(request: PageRequest, items: Vec<T>, total_count: usize) -> Self {
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total_count,
            total_pages: request.total_pages(total_count),
        }
    }
}

/// Frame position over a loaded demonstration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlaybackCursor {
    total: usize,
    current: usize,
}

impl PlaybackCursor {
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self { total, current: 0 }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.current >= self.total
    }

    pub fn step_forward(&mut self) {
        if self.current + 1 < self.total {
            self.current += 1;
        }
    }

    pub fn step_back(&mut self) {
        self.current = self.current.saturating_sub(1).min(self.total.saturating_sub(1));
    }

    pub fn jump_to_start(&mut self) {
        self.current = 0;
    }

    pub fn jump_to_end(&mut self) {
        self.current = self.total.saturating_sub(1);
    }

    /// Yield the current frame and move past it; `None` once playback ran off the end.
    pub fn advance(&mut self) -> Option<usize> {
        if self.is_finished() {
            return None;
        }
        let frame = self.current;
        self.current += 1;
        Some(frame)
    }

    /// Restart from the first frame when the previous run finished.
    pub fn rewind_if_finished(&mut self) {
        if self.is_finished() {
            self.current = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn frame(value: u8) -> Tensor {
        match Tensor::new(vec![2, 2], TensorData::U8(vec![value; 4])) {
            Ok(tensor) => tensor,
            Err(err) => panic!("invalid fixture tensor: {err}"),
        }
    }

    fn floats(count: usize) -> FieldValue {
        FieldValue::NumericSequence((0..count).map(|step| Scalar::Float(step as f64)).collect())
    }

    // Test IDs: TREC-001
    #[test]
    fn normalized_truncates_to_shortest_sequence_keeping_leading_steps() -> Result<(), ArchiveError> {
        let record = DemonstrationRecord::new()
            .with_field("action", floats(10))
            .with_field("frames", FieldValue::ArraySequence((0..7).map(frame).collect()))
            .with_instruction("pick up the cube");

        let (normalized, steps) = record.normalized()?;
        assert_eq!(steps, 7);
        assert_eq!(normalized.get("action"), Some(&floats(7)));
        assert_eq!(normalized.get("frames").and_then(FieldValue::sequence_len), Some(7));
        assert_eq!(normalized.instruction(), Some("pick up the cube"));
        Ok(())
    }

    // Test IDs: TREC-002
    #[test]
    fn validate_rejects_record_without_sequence_fields() {
        let record = DemonstrationRecord::new().with_instruction("only text");
        assert!(matches!(record.validate(), Err(ArchiveError::MalformedRecord(_))));
    }

    // Test IDs: TREC-003
    #[test]
    fn validate_rejects_inconsistent_composite_sub_fields() {
        let mut first = BTreeMap::new();
        first.insert("cam0".to_string(), frame(1));
        first.insert("cam1".to_string(), frame(2));
        let mut second = BTreeMap::new();
        second.insert("cam0".to_string(), frame(3));

        let record = DemonstrationRecord::new()
            .with_field("frames", FieldValue::DictSequence(vec![first, second]));
        assert!(matches!(record.validate(), Err(ArchiveError::MalformedRecord(_))));
    }

    // Test IDs: TREC-004
    #[test]
    fn validate_ignores_mismatch_past_common_length() -> Result<(), ArchiveError> {
        let mut frames = (0..3).map(frame).collect::<Vec<_>>();
        frames.push(Tensor::new(vec![1], TensorData::F32(vec![0.5]))?);
        let record = DemonstrationRecord::new()
            .with_field("frames", FieldValue::ArraySequence(frames))
            .with_field("reward", floats(3));

        record.validate()
    }

    // Test IDs: TREC-005
    #[test]
    fn validate_enforces_reserved_instruction_field() {
        let misplaced_text = DemonstrationRecord::new()
            .with_field("reward", floats(2))
            .with_field("note", FieldValue::ScalarText("hi".to_string()));
        assert!(matches!(misplaced_text.validate(), Err(ArchiveError::MalformedRecord(_))));

        let numeric_instruction =
            DemonstrationRecord::new().with_field(INSTRUCTION_FIELD, floats(2));
        assert!(matches!(numeric_instruction.validate(), Err(ArchiveError::MalformedRecord(_))));
    }

    // Test IDs: TREC-006
    #[test]
    fn validate_rejects_separator_in_field_names_and_mixed_scalars() {
        let slashed = DemonstrationRecord::new().with_field("obs/joint", floats(2));
        assert!(matches!(slashed.validate(), Err(ArchiveError::MalformedRecord(_))));

        let mixed = DemonstrationRecord::new().with_field(
            "done",
            FieldValue::NumericSequence(vec![Scalar::Bool(false), Scalar::Int(1)]),
        );
        assert!(matches!(mixed.validate(), Err(ArchiveError::MalformedRecord(_))));
    }

    // Test IDs: TREC-007
    #[test]
    fn empty_sequences_yield_zero_steps() -> Result<(), ArchiveError> {
        let record = DemonstrationRecord::new()
            .with_field("action", floats(0))
            .with_field("frames", FieldValue::ArraySequence(vec![frame(0)]));
        let (normalized, steps) = record.normalized()?;
        assert_eq!(steps, 0);
        assert_eq!(normalized.get("frames"), Some(&FieldValue::ArraySequence(vec![])));
        Ok(())
    }

    // Test IDs: TREC-008
    #[test]
    fn step_view_exposes_one_value_per_field() {
        let record = DemonstrationRecord::new()
            .with_field("reward", floats(3))
            .with_field("frames", FieldValue::ArraySequence((0..3).map(frame).collect()))
            .with_instruction("push");

        let Some(view) = record.step(2) else {
            panic!("step 2 should exist");
        };
        assert_eq!(view.get("reward"), Some(&StepValue::Scalar(Scalar::Float(2.0))));
        assert_eq!(view.get(INSTRUCTION_FIELD), Some(&StepValue::Text("push")));
        assert!(record.step(3).is_none());
    }

    // Test IDs: TTS-001
    #[test]
    fn timestamp_formats_and_parses_second_granularity_keys() -> Result<(), ArchiveError> {
        let at = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000);
        let timestamp = Timestamp::from_datetime(at)?;
        assert_eq!(timestamp.as_str(), "20231114_221320");

        let padded = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        let padded = Timestamp::from_datetime(padded)?;
        assert_eq!(padded.as_str(), "20240305_070809");
        assert_eq!(Timestamp::parse(padded.as_str())?, padded);
        assert_eq!(Timestamp::parse("20231114_221320")?, timestamp);

        let suffixed = timestamp.with_suffix(2);
        assert_eq!(suffixed.as_str(), "20231114_221320-02");
        assert_eq!(suffixed.suffix(), Some(2));
        assert!(timestamp < suffixed);
        assert!(suffixed < Timestamp::parse("20231114_221321")?);

        for bad in ["2023", "20231314_221320", "20231114_221320-1", "20231114_221320-01", "x"] {
            assert!(Timestamp::parse(bad).is_err(), "{bad} should be rejected");
        }
        Ok(())
    }

    // Test IDs: TTS-002
    #[test]
    fn timestamp_candidates_start_with_self_then_suffixes() -> Result<(), ArchiveError> {
        let base = Timestamp::parse("20240101_120000")?;
        let first = base.candidates().take(3).map(String::from).collect::<Vec<_>>();
        assert_eq!(first, ["20240101_120000", "20240101_120000-02", "20240101_120000-03"]);
        assert_eq!(base.candidates().count(), 99);

        let suffixed = Timestamp::parse("20240101_120000-05")?;
        let next = suffixed.candidates().nth(1).map(String::from);
        assert_eq!(next.as_deref(), Some("20240101_120000-06"));
        Ok(())
    }

    // Test IDs: TENT-001
    #[test]
    fn entry_path_round_trips_through_display() -> Result<(), ArchiveError> {
        let entry = ArchiveEntry::parse_path("metaworld/pick-place-v2/20240101_120000")?;
        assert_eq!(entry.environment, "metaworld");
        assert_eq!(entry.task, "pick-place-v2");
        assert_eq!(entry.to_string(), "metaworld/pick-place-v2/20240101_120000");
        assert!(ArchiveEntry::parse_path("metaworld/20240101_120000").is_err());
        assert!(ArchiveEntry::parse_path("../x/20240101_120000").is_err());
        Ok(())
    }

    // Test IDs: TPAGE-001
    #[test]
    fn page_request_rejects_zero_and_reports_at_least_one_page() -> Result<(), ArchiveError> {
        assert!(PageRequest::new(0, 10).is_err());
        assert!(PageRequest::new(1, 0).is_err());

        let request = PageRequest::new(3, 10)?;
        assert_eq!(request.offset(), 20);
        assert_eq!(request.total_pages(25), 3);
        assert_eq!(request.total_pages(0), 1);
        assert_eq!(Page::<String>::empty(request).total_pages, 1);
        Ok(())
    }

    // Test IDs: TPLAY-001
    #[test]
    fn playback_cursor_clamps_and_autoplays_to_end() {
        let mut cursor = PlaybackCursor::new(3);
        cursor.step_back();
        assert_eq!(cursor.position(), 0);
        cursor.jump_to_end();
        cursor.step_forward();
        assert_eq!(cursor.position(), 2);
        cursor.jump_to_start();

        let frames = std::iter::from_fn(|| cursor.advance()).collect::<Vec<_>>();
        assert_eq!(frames, [0, 1, 2]);
        assert!(cursor.is_finished());
        cursor.rewind_if_finished();
        assert_eq!(cursor.position(), 0);

        let mut empty = PlaybackCursor::new(0);
        assert_eq!(empty.advance(), None);
    }

    // Test IDs: TSER-001
    #[test]
    fn field_value_json_is_tagged_by_kind() -> Result<(), serde_json::Error> {
        let record = DemonstrationRecord::new()
            .with_field("done", FieldValue::NumericSequence(vec![Scalar::Bool(false)]))
            .with_instruction("open the drawer");
        let json = serde_json::to_value(&record)?;
        assert_eq!(json["done"]["kind"], "numeric_sequence");
        assert_eq!(json["instruction"]["value"], "open the drawer");

        let parsed: DemonstrationRecord = serde_json::from_value(json)?;
        assert_eq!(parsed, record);
        Ok(())
    }

    proptest! {
        // Test IDs: TREC-P01
        #[test]
        fn property_normalized_length_is_minimum(lengths in proptest::collection::vec(0_usize..20, 1..6)) {
            let mut record = DemonstrationRecord::new();
            for (index, len) in lengths.iter().enumerate() {
                record.insert(format!("field{index}"), floats(*len));
            }
            let normalized = record.normalized();
            prop_assert!(normalized.is_ok());
            let (normalized, steps) = normalized.unwrap_or_else(|_| unreachable!());
            let expected = lengths.iter().copied().min().unwrap_or(0);
            prop_assert_eq!(steps, expected);
            for (_, value) in normalized.fields() {
                prop_assert_eq!(value.sequence_len(), Some(expected));
            }
        }

        // Test IDs: TPAGE-P01
        #[test]
        fn property_pages_cover_every_item_once(total in 0_usize..200, page_size in 1_usize..30) {
            let request = PageRequest::new(1, page_size).unwrap_or_else(|_| unreachable!());
            let pages = request.total_pages(total);
            prop_assert!(pages >= 1);
            let mut covered = 0;
            for page in 1..=pages {
                let offset = PageRequest::new(page, page_size).unwrap_or_else(|_| unreachable!()).offset();
                covered += total.saturating_sub(offset).min(page_size);
            }
            prop_assert_eq!(covered, total);
        }
    }
}
