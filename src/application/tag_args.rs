//! `name=value` tag arguments for the command line.

use crate::cache::{TagScalar, TagValue, Tags, validate_tag_name};

use super::error::AppError;

fn parse_scalar(raw: &str) -> TagScalar {
    if let Ok(value) = raw.parse::<i64>() {
        return TagScalar::Int(value);
    }
    match raw {
        "true" => TagScalar::Bool(true),
        "false" => TagScalar::Bool(false),
        _ => TagScalar::Str(raw.to_string()),
    }
}

/// Parses `name=value` pairs. A value containing commas becomes a list;
/// repeating a name is an error.
pub fn parse_tag_args(args: &[String]) -> Result<Tags, AppError> {
    let mut tags = Tags::new();
    for arg in args {
        let (name, raw) = arg
            .split_once('=')
            .ok_or_else(|| AppError::validation(format!("tag `{arg}` is not `name=value`")))?;
        let name = name.trim();
        validate_tag_name("--tag", name)?;

        let value = if raw.contains(',') {
            TagValue::Many(
                raw.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(parse_scalar)
                    .collect(),
            )
        } else {
            TagValue::One(parse_scalar(raw.trim()))
        };

        if tags.insert(name, value).is_some() {
            return Err(AppError::validation(format!("tag `{name}` given twice")));
        }
    }
    Ok(tags)
}
