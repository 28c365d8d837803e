//! Tag values, typed tag schemas and the delimited tag-index encoding.
//!
//! A tag is a `(name, value)` pair taken from a cached call's arguments. The
//! metadata index stores every tag of a cached call as a single string of
//! delimiter-wrapped tokens:
//!
//! ```text
//! {group_id: 3, problem_id: [1, 2]}  ->  "|group_id_3|problem_id_1|problem_id_2|"
//! ```
//!
//! and invalidation finds rows by looking for `|token|` substrings.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::CacheError;

/// Keyword reserved for the bypass switch; never usable as a tag name.
pub const RESERVED_TAG: &str = "cache";
/// Upper bound for an encoded tag index (matches the `cache_meta.tag_index` column).
pub const MAX_TAG_INDEX_LEN: usize = 4096;

const DELIMITER: char = '|';

/// A single tag value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagScalar {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl TagScalar {
    /// Empty strings carry no invalidation information and are never encoded.
    pub fn is_empty(&self) -> bool {
        matches!(self, TagScalar::Str(value) if value.is_empty())
    }

    fn tag_type(&self) -> TagType {
        match self {
            TagScalar::Int(_) => TagType::Int,
            TagScalar::Bool(_) => TagType::Bool,
            TagScalar::Str(_) => TagType::Str,
        }
    }
}

impl fmt::Display for TagScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagScalar::Int(value) => write!(f, "{value}"),
            TagScalar::Bool(value) => write!(f, "{value}"),
            TagScalar::Str(value) => f.write_str(value),
        }
    }
}

/// A tag value: either one scalar or a list of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    One(TagScalar),
    Many(Vec<TagScalar>),
}

impl TagValue {
    pub fn scalars(&self) -> std::slice::Iter<'_, TagScalar> {
        match self {
            TagValue::One(scalar) => std::slice::from_ref(scalar).iter(),
            TagValue::Many(values) => values.iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scalars().all(TagScalar::is_empty)
    }
}

macro_rules! int_tag_conversions {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for TagScalar {
                fn from(value: $ty) -> Self {
                    TagScalar::Int(i64::from(value))
                }
            }

            impl From<$ty> for TagValue {
                fn from(value: $ty) -> Self {
                    TagValue::One(value.into())
                }
            }

            impl From<Vec<$ty>> for TagValue {
                fn from(values: Vec<$ty>) -> Self {
                    TagValue::Many(values.into_iter().map(TagScalar::from).collect())
                }
            }

            impl From<&[$ty]> for TagValue {
                fn from(values: &[$ty]) -> Self {
                    TagValue::Many(values.iter().copied().map(TagScalar::from).collect())
                }
            }
        )*
    };
}

int_tag_conversions!(i64, i32, u32, i16, u16, u8);

impl From<bool> for TagScalar {
    fn from(value: bool) -> Self {
        TagScalar::Bool(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::One(value.into())
    }
}

impl From<String> for TagScalar {
    fn from(value: String) -> Self {
        TagScalar::Str(value)
    }
}

impl From<&str> for TagScalar {
    fn from(value: &str) -> Self {
        TagScalar::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::One(value.into())
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::One(value.into())
    }
}

impl From<Vec<String>> for TagValue {
    fn from(values: Vec<String>) -> Self {
        TagValue::Many(values.into_iter().map(TagScalar::Str).collect())
    }
}

impl From<Vec<&str>> for TagValue {
    fn from(values: Vec<&str>) -> Self {
        TagValue::Many(values.into_iter().map(TagScalar::from).collect())
    }
}

impl From<TagScalar> for TagValue {
    fn from(value: TagScalar) -> Self {
        TagValue::One(value)
    }
}

impl From<Vec<TagScalar>> for TagValue {
    fn from(values: Vec<TagScalar>) -> Self {
        TagValue::Many(values)
    }
}

/// The tag arguments of one call, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, TagValue>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&TagValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, TagValue> {
        self.0.iter()
    }
}

impl<N: Into<String>, V: Into<TagValue>> FromIterator<(N, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = (&'a String, &'a TagValue);
    type IntoIter = btree_map::Iter<'a, String, TagValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Int,
    Str,
    Bool,
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagType::Int => "int",
            TagType::Str => "str",
            TagType::Bool => "bool",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Scalar,
    List,
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagKind::Scalar => "scalar",
            TagKind::List => "list",
        })
    }
}

/// Declares one taggable argument: its name, value type and arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub name: String,
    pub ty: TagType,
    pub kind: TagKind,
}

impl TagSpec {
    pub fn new(name: impl Into<String>, ty: TagType, kind: TagKind) -> Self {
        Self {
            name: name.into(),
            ty,
            kind,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TagType::Int, TagKind::Scalar)
    }

    pub fn int_list(name: impl Into<String>) -> Self {
        Self::new(name, TagType::Int, TagKind::List)
    }

    pub fn str(name: impl Into<String>) -> Self {
        Self::new(name, TagType::Str, TagKind::Scalar)
    }

    pub fn str_list(name: impl Into<String>) -> Self {
        Self::new(name, TagType::Str, TagKind::List)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, TagType::Bool, TagKind::Scalar)
    }

    /// Checks a call value against the declaration. A scalar given for a list tag is
    /// promoted to a one-element list.
    fn coerce(&self, value: &TagValue) -> Result<TagValue, CacheError> {
        if value.scalars().any(|scalar| scalar.tag_type() != self.ty) {
            return Err(self.mismatch());
        }

        match (self.kind, value) {
            (TagKind::Scalar, TagValue::One(_)) => Ok(value.clone()),
            (TagKind::Scalar, TagValue::Many(_)) => Err(self.mismatch()),
            (TagKind::List, TagValue::One(scalar)) => Ok(TagValue::Many(vec![scalar.clone()])),
            (TagKind::List, TagValue::Many(_)) => Ok(value.clone()),
        }
    }

    fn mismatch(&self) -> CacheError {
        CacheError::TagMismatch {
            name: self.name.clone(),
            expected: format!("{} {}", self.ty, self.kind),
        }
    }
}

/// An ordered, validated set of tag declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSchema {
    specs: Vec<TagSpec>,
}

impl TagSchema {
    /// Validates the declarations. `owner` names the function or invalidator the
    /// schema belongs to and only feeds error messages.
    pub fn try_new(
        owner: &str,
        specs: impl IntoIterator<Item = TagSpec>,
    ) -> Result<Self, CacheError> {
        let specs: Vec<TagSpec> = specs.into_iter().collect();

        for (position, spec) in specs.iter().enumerate() {
            validate_tag_name(owner, &spec.name)?;
            if specs[..position].iter().any(|other| other.name == spec.name) {
                return Err(CacheError::invalid_spec(
                    owner,
                    format!("tag `{}` is declared twice", spec.name),
                ));
            }
        }

        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[TagSpec] {
        &self.specs
    }

    /// Keeps only the declared tags, type-checking each one. Undeclared tags are
    /// dropped silently.
    pub fn project(&self, tags: &Tags) -> Result<Tags, CacheError> {
        let mut projected = Tags::new();
        for spec in &self.specs {
            if let Some(value) = tags.get(&spec.name) {
                projected.insert(spec.name.clone(), spec.coerce(value)?);
            }
        }
        Ok(projected)
    }
}

/// Rejects names that cannot appear in a tag index or collide with the bypass switch.
pub fn validate_tag_name(owner: &str, name: &str) -> Result<(), CacheError> {
    if name.trim().is_empty() {
        return Err(CacheError::invalid_spec(owner, "tag name must not be empty"));
    }
    if name == RESERVED_TAG {
        return Err(CacheError::invalid_spec(
            owner,
            format!("`{RESERVED_TAG}` is reserved for the bypass switch"),
        ));
    }
    if name.contains(DELIMITER) || name.contains('%') {
        return Err(CacheError::invalid_spec(
            owner,
            format!("tag name `{name}` contains a reserved character"),
        ));
    }
    Ok(())
}

/// Flattens tags into `name_value` tokens; list values expand to one token per
/// element and empty values produce nothing.
pub fn tokens(tags: &Tags) -> Vec<String> {
    tags.iter()
        .flat_map(|(name, value)| {
            value
                .scalars()
                .filter(|scalar| !scalar.is_empty())
                .map(move |scalar| format!("{name}_{}", escape_value(&scalar.to_string())))
        })
        .collect()
}

/// `["problem_1", "problem_2"]` -> `"|problem_1|problem_2|"`; no tokens -> `""`.
///
/// The result never exceeds [`MAX_TAG_INDEX_LEN`]; tokens that do not fit are
/// dropped whole.
pub fn encode_tag_index(tokens: &[String]) -> String {
    if tokens.is_empty() {
        return String::new();
    }

    let mut index = String::from(DELIMITER);
    for (position, token) in tokens.iter().enumerate() {
        if index.len() + token.len() + 1 > MAX_TAG_INDEX_LEN {
            warn!(
                kept = position,
                dropped = tokens.len() - position,
                limit = MAX_TAG_INDEX_LEN,
                "Tag index truncated"
            );
            break;
        }
        index.push_str(token);
        index.push(DELIMITER);
    }

    if index.len() == 1 { String::new() } else { index }
}

/// `["problem_1"]` -> `["%|problem\_1|%"]`, ready for a SQL `LIKE` with the
/// default backslash escape.
pub fn like_patterns(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .map(|token| format!("%{DELIMITER}{}{DELIMITER}%", escape_like(token)))
        .collect()
}

/// Whether an encoded index holds the exact token.
pub fn index_contains(tag_index: &str, token: &str) -> bool {
    tag_index.contains(&format!("{DELIMITER}{token}{DELIMITER}"))
}

fn escape_value(raw: &str) -> String {
    raw.replace('%', "%25").replace(DELIMITER, "%7C")
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
