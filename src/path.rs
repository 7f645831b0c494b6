//! Dynamic field paths (spec §9 "Dynamic field paths"): a parsed sequence
//! of `Field`/`Index` segments applied over a `serde_json::Value`, instead
//! of the source's dotted-string eval (e.g. `"phoneNumbers[0].value"`).

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path(Vec<Segment>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("malformed path segment: {0}")]
    Malformed(String),
}

impl Path {
    /// Parses `"phoneNumbers[0].value"` into
    /// `[Field("phoneNumbers"), Index(0), Field("value")]`.
    pub fn parse(s: &str) -> Result<Path, PathError> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let mut segments = Vec::new();
        for part in s.split('.') {
            if part.is_empty() {
                return Err(PathError::Malformed(s.to_string()));
            }
            let mut chars = part.chars().peekable();
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c == '[' {
                    break;
                }
                name.push(c);
                chars.next();
            }
            if name.is_empty() {
                return Err(PathError::Malformed(part.to_string()));
            }
            segments.push(Segment::Field(name));
            while chars.peek() == Some(&'[') {
                chars.next();
                let mut digits = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    digits.push(c);
                }
                let idx: usize = digits
                    .parse()
                    .map_err(|_| PathError::Malformed(part.to_string()))?;
                segments.push(Segment::Index(idx));
            }
        }
        Ok(Path(segments))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Returns a reference to the value at this path, or `None` if any
    /// segment doesn't resolve.
    pub fn get<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut cur = root;
        for seg in &self.0 {
            cur = match seg {
                Segment::Field(name) => cur.as_object()?.get(name)?,
                Segment::Index(i) => cur.as_array()?.get(*i)?,
            };
        }
        Some(cur)
    }

    /// Sets the value at this path, creating intermediate objects/arrays
    /// as needed. Fails if an existing node has the wrong shape for the
    /// next segment (e.g. indexing into an object).
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let mut cur = root;
        let last = match self.0.last() {
            Some(l) => l,
            None => return Err(PathError::Empty),
        };
        for seg in &self.0[..self.0.len() - 1] {
            cur = step_mut(cur, seg)?;
        }
        match last {
            Segment::Field(name) => {
                if !cur.is_object() {
                    *cur = Value::Object(Default::default());
                }
                cur.as_object_mut()
                    .expect("just ensured object")
                    .insert(name.clone(), value);
            }
            Segment::Index(i) => {
                if !cur.is_array() {
                    *cur = Value::Array(Vec::new());
                }
                let arr = cur.as_array_mut().expect("just ensured array");
                if *i >= arr.len() {
                    arr.resize(*i + 1, Value::Null);
                }
                arr[*i] = value;
            }
        }
        Ok(())
    }
}

fn step_mut<'v>(cur: &'v mut Value, seg: &Segment) -> Result<&'v mut Value, PathError> {
    match seg {
        Segment::Field(name) => {
            if !cur.is_object() {
                *cur = Value::Object(Default::default());
            }
            Ok(cur
                .as_object_mut()
                .expect("just ensured object")
                .entry(name.clone())
                .or_insert(Value::Null))
        }
        Segment::Index(i) => {
            if !cur.is_array() {
                *cur = Value::Array(Vec::new());
            }
            let arr = cur.as_array_mut().expect("just ensured array");
            if *i >= arr.len() {
                arr.resize(*i + 1, Value::Null);
            }
            Ok(&mut arr[*i])
        }
    }
}
