//! Dictionaries.

use crate::error::Result;
use crate::object::{Name, ObjRef, Object};
use crate::xref::XRef;
use log::warn;
use rustc_hash::FxHashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A dictionary: a name-keyed map whose values are direct objects or
/// references into the cross-reference table.
///
/// Dictionaries are immutable after construction, except for the deferred
/// object id (stamped at most once, when it becomes known which indirect
/// object produced the dictionary) and the decryption-suppression flag.
#[derive(Clone)]
pub struct Dict(Arc<Repr>);

struct Repr {
    map: FxHashMap<Name, Object>,
    obj_id: OnceLock<ObjRef>,
    suppress_decryption: AtomicBool,
}

impl Default for Dict {
    fn default() -> Self {
        Self::empty()
    }
}

// Structural equality over the entries; the deferred id and the decryption
// flag don't participate.
impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.map == other.0.map
    }
}

impl Dict {
    /// Create a new empty dictionary.
    pub fn empty() -> Self {
        Self::from_map(FxHashMap::default())
    }

    pub(crate) fn from_map(map: FxHashMap<Name, Object>) -> Self {
        Self(Arc::new(Repr {
            map,
            obj_id: OnceLock::new(),
            suppress_decryption: AtomicBool::new(false),
        }))
    }

    /// Returns the number of entries in the dictionary.
    pub fn len(&self) -> usize {
        self.0.map.len()
    }

    /// Return whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.0.map.is_empty()
    }

    /// Checks whether the dictionary contains an entry with a specific key.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.0.map.contains_key(&Name::new(key))
    }

    /// Return the raw entry for a specific key, without dereferencing.
    pub fn get_raw(&self, key: &[u8]) -> Option<&Object> {
        self.0.map.get(&Name::new(key))
    }

    /// Like [`get_raw`](Self::get_raw), but falls back to a second key
    /// spelling. The keys are tried in exactly the given order.
    pub fn get_raw2(&self, key: &[u8], fallback: &[u8]) -> Option<&Object> {
        self.get_raw(key).or_else(|| self.get_raw(fallback))
    }

    /// Return the reference stored under a key, if the value is one.
    pub fn get_ref(&self, key: &[u8]) -> Option<ObjRef> {
        self.get_raw(key).and_then(Object::as_ref_id)
    }

    /// Returns the entry of a key, resolving it through the table in case
    /// it's an object reference.
    ///
    /// Nothing is memoized here; the table's object cache is the
    /// memoization point, so repeated access stays correct if the cache is
    /// ever invalidated.
    pub fn get(&self, key: &[u8], xref: &XRef) -> Result<Option<Object>> {
        match self.get_raw(key) {
            Some(Object::Ref(r)) => xref
                .fetch(*r, self.suppresses_decryption())
                .map(Some),
            Some(obj) => Ok(Some(obj.clone())),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get), but falls back to a second key spelling.
    ///
    /// The keys are tried in exactly the given order; callers put the modern
    /// key first and the legacy abbreviation second, since abbreviations may
    /// shadow unrelated short keys.
    pub fn get2(&self, key: &[u8], fallback: &[u8], xref: &XRef) -> Result<Option<Object>> {
        match self.get(key, xref)? {
            Some(obj) => Ok(Some(obj)),
            None => self.get(fallback, xref),
        }
    }

    /// Like [`get2`](Self::get2), with a third key spelling.
    pub fn get3(
        &self,
        key: &[u8],
        fallback: &[u8],
        fallback2: &[u8],
        xref: &XRef,
    ) -> Result<Option<Object>> {
        match self.get2(key, fallback, xref)? {
            Some(obj) => Ok(Some(obj)),
            None => self.get(fallback2, xref),
        }
    }

    /// Resolve a key to an array and dereference each of its elements.
    pub fn get_array(&self, key: &[u8], xref: &XRef) -> Result<Option<Vec<Object>>> {
        let Some(obj) = self.get(key, xref)? else {
            return Ok(None);
        };

        let Some(arr) = obj.into_array() else {
            return Ok(None);
        };

        let mut out = Vec::with_capacity(arr.len());

        for el in arr.iter() {
            match el {
                Object::Ref(r) => out.push(xref.fetch(*r, self.suppresses_decryption())?),
                other => out.push(other.clone()),
            }
        }

        Ok(Some(out))
    }

    /// Returns an iterator over all keys in the dictionary.
    pub fn keys(&self) -> impl Iterator<Item = &Name> {
        self.0.map.keys()
    }

    /// An iterator over all raw entries in the dictionary.
    pub fn entries(&self) -> impl Iterator<Item = (&Name, &Object)> {
        self.0.map.iter()
    }

    /// All raw entries, sorted by key. Used wherever a stable order matters
    /// (content hashing, debug output).
    pub fn entries_sorted(&self) -> Vec<(&Name, &Object)> {
        let mut entries = self.0.map.iter().collect::<Vec<_>>();
        entries.sort_by(|(k1, _), (k2, _)| k1.as_bytes().cmp(k2.as_bytes()));
        entries
    }

    /// Return the object id of the dict, if it stems from an indirect object.
    pub fn obj_id(&self) -> Option<ObjRef> {
        self.0.obj_id.get().copied()
    }

    /// Stamp the object id. Only the first stamp takes effect.
    pub(crate) fn stamp_obj_id(&self, id: ObjRef) {
        if self.0.obj_id.set(id).is_err() && self.obj_id() != Some(id) {
            warn!("object id of dictionary was already set to a different reference");
        }
    }

    /// Mark values resolved through this dictionary as exempt from
    /// decryption. Used for the `/Encrypt` dictionary itself.
    pub fn set_suppress_decryption(&self) {
        self.0.suppress_decryption.store(true, Ordering::Relaxed);
    }

    /// Whether decryption is suppressed for values resolved through this
    /// dictionary.
    pub fn suppresses_decryption(&self) -> bool {
        self.0.suppress_decryption.load(Ordering::Relaxed)
    }

    /// Union the given dictionaries left-to-right, the first dictionary
    /// winning per key.
    ///
    /// If `merge_subdicts` is set and both colliding values are
    /// dictionaries, they are merged recursively with the same precedence.
    /// This is how page, annotation and form resource dictionaries are
    /// combined.
    pub fn merge(dicts: &[Dict], merge_subdicts: bool) -> Dict {
        let mut map: FxHashMap<Name, Object> = FxHashMap::default();

        for dict in dicts {
            for (key, val) in dict.entries() {
                match map.get_mut(key) {
                    None => {
                        map.insert(key.clone(), val.clone());
                    }
                    Some(existing) => {
                        if merge_subdicts
                            && let (Object::Dict(first), Object::Dict(second)) = (&*existing, val)
                        {
                            let merged =
                                Self::merge(&[first.clone(), second.clone()], merge_subdicts);
                            *existing = Object::Dict(merged);
                        }
                        // Otherwise the earlier dictionary wins.
                    }
                }
            }
        }

        Self::from_map(map)
    }
}

impl Debug for Dict {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Dict");

        for (key, val) in self.entries_sorted() {
            debug.field(&String::from_utf8_lossy(key.as_bytes()), val);
        }

        debug.finish()
    }
}

/// The dictionary keys this crate reads. Spellings follow the published
/// format; abbreviation constants carry the `_ABBREVIATION` suffix.
#[allow(missing_docs)]
pub mod keys {
    macro_rules! key {
        ($i:ident, $e:expr) => {
            pub const $i: &'static [u8] = $e;
        };
    }

    key!(BITS_PER_COMPONENT, b"BitsPerComponent");
    key!(CATALOG, b"Catalog");
    key!(COLORS, b"Colors");
    key!(COLUMNS, b"Columns");
    key!(COUNT, b"Count");
    key!(DECODE_PARMS, b"DecodeParms");
    key!(DECODE_PARMS_ABBREVIATION, b"DP");
    key!(ENCRYPT, b"Encrypt");
    key!(EXTENDS, b"Extends");
    key!(F, b"F");
    key!(FILTER, b"Filter");
    key!(FILTER_ABBREVIATION, b"F");
    key!(FIRST, b"First");
    key!(FLATE_DECODE, b"FlateDecode");
    key!(FLATE_DECODE_ABBREVIATION, b"Fl");
    key!(ID, b"ID");
    key!(INDEX, b"Index");
    key!(INFO, b"Info");
    key!(KIDS, b"Kids");
    key!(LENGTH, b"Length");
    key!(N, b"N");
    key!(OBJ_STM, b"ObjStm");
    key!(PAGES, b"Pages");
    key!(PARENT, b"Parent");
    key!(PREDICTOR, b"Predictor");
    key!(PREV, b"Prev");
    key!(ROOT, b"Root");
    key!(SIZE, b"Size");
    key!(TYPE, b"Type");
    key!(VERSION, b"Version");
    key!(W, b"W");
    key!(XREF, b"XRef");
    key!(XREF_STM, b"XRefStm");
}

#[cfg(test)]
mod tests {
    use crate::object::dict::Dict;
    use crate::object::{Name, Object};
    use rustc_hash::FxHashMap;

    pub(crate) fn dict_of(entries: &[(&[u8], Object)]) -> Dict {
        let mut map = FxHashMap::default();
        for (k, v) in entries {
            map.insert(Name::new(k), v.clone());
        }
        Dict::from_map(map)
    }

    #[test]
    fn merge_first_wins() {
        let a = dict_of(&[(b"A", Object::Int(1)), (b"B", Object::Int(2))]);
        let b = dict_of(&[(b"A", Object::Int(10)), (b"C", Object::Int(3))]);

        let merged = Dict::merge(&[a, b], false);
        assert_eq!(merged.get_raw(b"A"), Some(&Object::Int(1)));
        assert_eq!(merged.get_raw(b"B"), Some(&Object::Int(2)));
        assert_eq!(merged.get_raw(b"C"), Some(&Object::Int(3)));
    }

    #[test]
    fn merge_subdicts() {
        let inner_a = dict_of(&[(b"X", Object::Int(1))]);
        let inner_b = dict_of(&[(b"X", Object::Int(9)), (b"Y", Object::Int(2))]);
        let a = dict_of(&[(b"Res", Object::Dict(inner_a.clone()))]);
        let b = dict_of(&[(b"Res", Object::Dict(inner_b.clone()))]);

        // Without the flag, the first sub-dictionary is kept wholesale.
        let flat = Dict::merge(&[a.clone(), b.clone()], false);
        let res = flat.get_raw(b"Res").unwrap().clone().into_dict().unwrap();
        assert!(!res.contains_key(b"Y"));

        // With the flag, keys union and the first dictionary's keys still win.
        let deep = Dict::merge(&[a, b], true);
        let res = deep.get_raw(b"Res").unwrap().clone().into_dict().unwrap();
        assert_eq!(res.get_raw(b"X"), Some(&Object::Int(1)));
        assert_eq!(res.get_raw(b"Y"), Some(&Object::Int(2)));
    }

    #[test]
    fn fallback_keys_are_tried_in_order() {
        use crate::chunk::ChunkedSource;
        use crate::object::dict::keys::{DECODE_PARMS, DECODE_PARMS_ABBREVIATION};
        use crate::xref::XRef;
        use std::sync::Arc;

        let xref = XRef::new(Arc::new(ChunkedSource::from_bytes(b"", 64)));

        // The abbreviation doubles as an unrelated short key, so it must
        // never shadow the full spelling.
        let both = dict_of(&[
            (DECODE_PARMS, Object::Int(1)),
            (DECODE_PARMS_ABBREVIATION, Object::Int(2)),
        ]);
        assert_eq!(
            both.get2(DECODE_PARMS, DECODE_PARMS_ABBREVIATION, &xref)
                .unwrap(),
            Some(Object::Int(1))
        );
        assert_eq!(
            both.get_raw2(DECODE_PARMS, DECODE_PARMS_ABBREVIATION),
            Some(&Object::Int(1))
        );

        let only_short = dict_of(&[(DECODE_PARMS_ABBREVIATION, Object::Int(2))]);
        assert_eq!(
            only_short
                .get2(DECODE_PARMS, DECODE_PARMS_ABBREVIATION, &xref)
                .unwrap(),
            Some(Object::Int(2))
        );

        // A third spelling keeps the caller's order.
        let third = dict_of(&[(b"Legacy" as &[u8], Object::Int(3))]);
        assert_eq!(
            third
                .get3(DECODE_PARMS, DECODE_PARMS_ABBREVIATION, b"Legacy", &xref)
                .unwrap(),
            Some(Object::Int(3))
        );
    }

    #[test]
    fn obj_id_set_once() {
        let d = dict_of(&[]);
        d.stamp_obj_id(crate::object::ObjRef::new(4, 0));
        d.stamp_obj_id(crate::object::ObjRef::new(5, 0));
        assert_eq!(d.obj_id(), Some(crate::object::ObjRef::new(4, 0)));
    }
}
