//! The object model: references, names, and the primitive object enum.

use crate::object::dict::Dict;
use crate::object::stream::Stream;
use siphasher::sip::SipHasher13;
use smallvec::SmallVec;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hasher;
use std::sync::Arc;

pub mod dict;
pub(crate) mod parse;
pub mod stream;

/// A reference to an indirect object: an (object number, generation) pair.
///
/// References carry no ownership; they are lookup keys resolved through the
/// cross-reference table. The canonical string form `"<num> <gen> R"` is the
/// cache key collaborators use.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    /// The object number.
    pub num: u32,
    /// The generation number.
    pub generation: u16,
}

impl ObjRef {
    /// Create a new object reference.
    pub fn new(num: u32, generation: u16) -> Self {
        Self { num, generation }
    }
}

impl Display for ObjRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R", self.num, self.generation)
    }
}

/// A name object, stored with its `#xx` escapes already resolved.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Name(SmallVec<[u8; 16]>);

impl Name {
    /// Create a name from unescaped bytes.
    pub fn new(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }

    /// The unescaped bytes of the name.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The name as a string, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl Debug for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::ops::Deref for Name {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Name {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

/// A primitive object.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// The null object.
    Null,
    /// A boolean object.
    Bool(bool),
    /// An integer object.
    Int(i64),
    /// A real-number object.
    Real(f64),
    /// A string object (raw bytes, already decrypted where applicable).
    String(Vec<u8>),
    /// A name object.
    Name(Name),
    /// An array object.
    Array(Arc<Vec<Object>>),
    /// A dictionary object.
    Dict(Dict),
    /// A stream object.
    Stream(Stream),
    /// A reference to an indirect object.
    Ref(ObjRef),
    /// The sentinel returned when resolving a reference cycle.
    Circular,
}

impl Object {
    /// Whether the object is the null object.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The object as an integer, truncating reals.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Real(r) if r.trunc() == *r => Some(*r as i64),
            _ => None,
        }
    }

    /// The object as an unsigned size.
    pub fn as_usize(&self) -> Option<usize> {
        self.as_int().and_then(|i| usize::try_from(i).ok())
    }

    /// The object as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// The object as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The object as a name.
    pub fn as_name(&self) -> Option<&Name> {
        match self {
            Self::Name(n) => Some(n),
            _ => None,
        }
    }

    /// The object as a reference.
    pub fn as_ref_id(&self) -> Option<ObjRef> {
        match self {
            Self::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// The object as string bytes.
    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into a dictionary. Streams yield their stream dictionary.
    pub fn into_dict(self) -> Option<Dict> {
        match self {
            Self::Dict(d) => Some(d),
            Self::Stream(s) => Some(s.dict().clone()),
            _ => None,
        }
    }

    /// Convert into an array.
    pub fn into_array(self) -> Option<Arc<Vec<Object>>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Convert into a stream.
    pub fn into_stream(self) -> Option<Stream> {
        match self {
            Self::Stream(s) => Some(s),
            _ => None,
        }
    }
}

/// Hash the structural content of an object.
///
/// Structurally identical objects hash equally regardless of where their
/// bytes came from, which is what lets the alias map share one cached
/// resolution between duplicate indirect objects.
pub fn content_hash(obj: &Object) -> u64 {
    let mut hasher = SipHasher13::new();
    hash_into(obj, &mut hasher);
    hasher.finish()
}

fn hash_into(obj: &Object, h: &mut SipHasher13) {
    match obj {
        Object::Null => h.write_u8(0),
        Object::Bool(b) => {
            h.write_u8(1);
            h.write_u8(*b as u8);
        }
        Object::Int(i) => {
            h.write_u8(2);
            h.write_i64(*i);
        }
        Object::Real(r) => {
            h.write_u8(3);
            h.write_u64(r.to_bits());
        }
        Object::String(s) => {
            h.write_u8(4);
            h.write(s);
        }
        Object::Name(n) => {
            h.write_u8(5);
            h.write(n);
        }
        Object::Array(a) => {
            h.write_u8(6);
            h.write_usize(a.len());
            for el in a.iter() {
                hash_into(el, h);
            }
        }
        Object::Dict(d) => {
            h.write_u8(7);
            h.write_usize(d.len());
            for (key, val) in d.entries_sorted() {
                h.write(key);
                hash_into(val, h);
            }
        }
        Object::Stream(s) => {
            h.write_u8(8);
            hash_into(&Object::Dict(s.dict().clone()), h);
            h.write(s.raw_data());
        }
        Object::Ref(r) => {
            h.write_u8(9);
            h.write_u32(r.num);
            h.write_u16(r.generation);
        }
        Object::Circular => h.write_u8(10),
    }
}

#[cfg(test)]
mod tests {
    use crate::object::{Name, ObjRef, Object, content_hash};

    #[test]
    fn ref_display() {
        assert_eq!(ObjRef::new(34, 1).to_string(), "34 1 R");
    }

    #[test]
    fn int_accessors() {
        assert_eq!(Object::Int(12).as_int(), Some(12));
        assert_eq!(Object::Real(12.0).as_int(), Some(12));
        assert_eq!(Object::Real(12.5).as_int(), None);
    }

    #[test]
    fn content_hash_ignores_provenance() {
        let a = Object::Name(Name::new(b"Font"));
        let b = Object::Name(Name::new(b"Font"));
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&Object::Name(Name::new(b"Fonts"))));
    }
}
