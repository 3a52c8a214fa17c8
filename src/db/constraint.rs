//! Schema constraint enforcement for incoming attribute elements.
//!
//! Two rules guard every write: a single-valued attribute may never end up
//! with more than one value, and the same value may not appear twice on one
//! attribute. The permissive modifier downgrades the duplicate rule from an
//! error to silent suppression; it never relaxes the single-value rule.

use crate::db::cache::SchemaView;
use crate::error::{Error, Result};
use crate::model::{Attribute, Value};

/// Drops or rejects duplicate values in `incoming`.
///
/// A value is a duplicate if it equals (per the effective schema) another
/// value of the same element or a value already stored on `existing`. With
/// `permissive`, duplicates are removed from `incoming` and the call
/// succeeds; without it, the first duplicate fails the element with
/// [`Error::AttributeOrValueExists`].
pub fn check_no_duplicates(
    existing: Option<&Attribute>,
    incoming: &mut Attribute,
    permissive: bool,
    view: &SchemaView<'_>,
) -> Result<()> {
    let attr = incoming.name.clone();
    let candidates = std::mem::take(&mut incoming.values);
    let mut kept: Vec<Value> = Vec::with_capacity(candidates.len());
    for value in candidates {
        let dup = kept
            .iter()
            .any(|k| view.values_equal(&attr, k, &value))
            || existing.map_or(false, |e| {
                e.values.iter().any(|k| view.values_equal(&attr, k, &value))
            });
        if dup {
            if permissive {
                continue;
            }
            return Err(Error::AttributeOrValueExists);
        }
        kept.push(value);
    }
    incoming.values = kept;
    Ok(())
}

/// Rejects an element that would leave a single-valued attribute with more
/// than one value.
///
/// `single_valued` is the effective answer for this element (schema,
/// `@ATTRIBUTES` override, or element flag); callers that carry the
/// skip-check flag simply pass `false`.
pub fn check_single_valued(
    existing: Option<&Attribute>,
    incoming: &Attribute,
    single_valued: bool,
) -> Result<()> {
    if !single_valued {
        return Ok(());
    }
    let merged = incoming.values.len() + existing.map_or(0, |e| e.values.len());
    if incoming.values.len() > 1 || merged > 1 {
        return Err(Error::ConstraintViolation(format!(
            "attribute {} is single-valued",
            incoming.name
        )));
    }
    Ok(())
}
