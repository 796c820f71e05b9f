//! Reference paths: where in a dependent's spec a reference lives, and what shape it has.
//!
//! Shapes form a closed set (cardinality x form). Each combination has exactly one
//! extraction routine, chosen by `match`, so adding a shape is a compile error until
//! every site handles it.

use serde_json::Value;
use smallvec::SmallVec;
use trellis_core::{Object, Reference};

use crate::IndexError;

/// How many references a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Single value; zero value means "no reference".
    One,
    /// Nullable single value; null or missing means "no reference".
    Optional,
    /// Named collection; every entry is a reference.
    Map,
}

/// How a single reference is spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefForm {
    /// A bare name string. Kind comes from the registration.
    Name,
    /// An object with `name` and optional `kind` / `namespace`.
    Typed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefShape {
    pub cardinality: Cardinality,
    pub form: RefForm,
}

impl RefShape {
    pub const NAME: RefShape = RefShape { cardinality: Cardinality::One, form: RefForm::Name };
    pub const OPTIONAL_NAME: RefShape = RefShape { cardinality: Cardinality::Optional, form: RefForm::Name };
    pub const TYPED: RefShape = RefShape { cardinality: Cardinality::One, form: RefForm::Typed };
    pub const OPTIONAL_TYPED: RefShape = RefShape { cardinality: Cardinality::Optional, form: RefForm::Typed };
    pub const NAME_MAP: RefShape = RefShape { cardinality: Cardinality::Map, form: RefForm::Name };
    pub const TYPED_MAP: RefShape = RefShape { cardinality: Cardinality::Map, form: RefForm::Typed };
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(String, usize),
}

/// A parsed `spec.<field>[.<field>...]` path plus the shape found at its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPath {
    raw: String,
    segments: Vec<Segment>,
    shape: RefShape,
}

pub type Refs = SmallVec<[Reference; 4]>;

impl RefPath {
    /// Accepts dotted keys with an optional trailing `[index]` per segment, rooted at `spec`.
    pub fn parse(path: &str, shape: RefShape) -> Result<Self, IndexError> {
        let invalid = |reason: &str| IndexError::InvalidPath { path: path.to_string(), reason: reason.to_string() };
        let s = path.strip_prefix('.').unwrap_or(path);
        if s.contains('?') || s.contains('*') {
            return Err(invalid("filters and wildcards are not supported"));
        }
        let mut parts = s.split('.');
        if parts.next() != Some("spec") {
            return Err(invalid("references must live under spec"));
        }
        let mut segments = Vec::new();
        for seg in parts {
            segments.push(parse_segment(seg).ok_or_else(|| invalid("malformed segment"))?);
        }
        if segments.is_empty() {
            return Err(invalid("path names no field"));
        }
        Ok(Self { raw: s.to_string(), segments, shape })
    }

    pub fn as_str(&self) -> &str { &self.raw }
    pub fn shape(&self) -> RefShape { self.shape }

    /// Last key of the path, used as the field name in status attributes and messages.
    pub fn field(&self) -> &str {
        match self.segments.last() {
            Some(Segment::Key(k)) | Some(Segment::Index(k, _)) => k,
            None => "",
        }
    }

    fn locate<'a>(&self, spec: &'a Value) -> Option<&'a Value> {
        let mut cur = spec;
        for seg in &self.segments {
            match seg {
                Segment::Key(k) => cur = cur.as_object()?.get(k)?,
                Segment::Index(k, i) => cur = cur.as_object()?.get(k)?.as_array()?.get(*i)?,
            }
        }
        Some(cur)
    }

    /// All present references at this path on `object`. Zero values and nulls are skipped.
    pub fn references(&self, object: &Object) -> Refs {
        let mut out = Refs::new();
        if let Some(v) = self.locate(&object.spec) {
            extract(self.shape, v, &mut out);
        }
        out
    }
}

fn parse_segment(seg: &str) -> Option<Segment> {
    let valid_key = |k: &str| !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    match seg.find('[') {
        None => valid_key(seg).then(|| Segment::Key(seg.to_string())),
        Some(open) => {
            let key = &seg[..open];
            let rest = seg[open + 1..].strip_suffix(']')?;
            if !valid_key(key) || rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some(Segment::Index(key.to_string(), rest.parse().ok()?))
        }
    }
}

fn extract(shape: RefShape, v: &Value, out: &mut Refs) {
    match shape.cardinality {
        Cardinality::One | Cardinality::Optional => {
            if let Some(r) = single(shape.form, v) { out.push(r); }
        }
        Cardinality::Map => {
            if let Some(map) = v.as_object() {
                for entry in map.values() {
                    if let Some(r) = single(shape.form, entry) { out.push(r); }
                }
            }
        }
    }
}

fn single(form: RefForm, v: &Value) -> Option<Reference> {
    let r = match form {
        RefForm::Name => Reference::named(v.as_str()?),
        RefForm::Typed => {
            if !v.is_object() { return None; }
            serde_json::from_value::<Reference>(v.clone()).ok()?
        }
    };
    (!r.is_absent()).then_some(r)
}
