//! The cross-reference table: maps object references to byte offsets and
//! resolves them into objects.
//!
//! The table is populated from the newest cross-reference section backwards
//! along the `/Prev` chain, with entries from newer sections winning. All
//! parsing is restartable: a parse that runs into missing bytes fails with
//! [`Error::Unavailable`] without mutating the table, and the async layer
//! re-runs it once the bytes arrive.

use crate::chunk::{ChunkedSource, ResidentRun, RunEnd};
use crate::crypto::Decryptor;
use crate::error::{Error, Result};
use crate::object::dict::Dict;
use crate::object::dict::keys::{FIRST, INDEX, N, PREV, ROOT, SIZE, W, XREF_STM};
use crate::object::parse::{ParseCtx, parse_header, parse_indirect, parse_object, parse_plain_u64};
use crate::object::stream::Stream;
use crate::object::{ObjRef, Object, content_hash};
use crate::reader::Reader;
use crate::trivia::is_white_space_character;
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// How many bytes of the document tail are scanned for the `startxref`
/// keyword.
const STARTXREF_WINDOW: usize = 2048;

/// The initial byte budget for parsing one object or section. Doubled until
/// the parse fits.
const INITIAL_PARSE_CAP: usize = 4096;

/// One cross-reference entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum XRefEntry {
    /// The object number is unused.
    Free,
    /// An object stored at a byte offset of the document.
    Uncompressed {
        /// Byte offset of the `num gen obj` header.
        offset: usize,
        /// The generation recorded in the table.
        generation: u16,
    },
    /// An object stored inside an object stream.
    Compressed {
        /// Object number of the containing object stream.
        container: u32,
        /// Index of the object within the stream.
        index: u32,
    },
}

struct Inner {
    entries: FxHashMap<u32, XRefEntry>,
    trailer: Option<Dict>,
    /// One higher than the largest allocated object number.
    size: u32,
    /// Resolved objects by object number.
    cache: FxHashMap<u32, Object>,
    /// Cache entries displaced by temporary references, restored on reset.
    saved_cache: FxHashMap<u32, Object>,
    temporary: Vec<u32>,
    /// Object numbers currently being resolved, for cycle detection.
    pending: FxHashSet<u32>,
    /// Content hash to first reference seen with that content.
    aliases: FxHashMap<u64, ObjRef>,
    /// Set once a generation mismatch has been tolerated; later mismatches
    /// pass silently.
    gen_fallback: bool,
    recovered: bool,
}

/// The cross-reference table of one document.
pub struct XRef {
    source: Arc<ChunkedSource>,
    decryptor: RwLock<Option<Arc<dyn Decryptor>>>,
    inner: Mutex<Inner>,
}

impl XRef {
    /// Create an empty table over the given source. Call
    /// [`parse`](Self::parse) to populate it.
    pub fn new(source: Arc<ChunkedSource>) -> Self {
        Self {
            source,
            decryptor: RwLock::new(None),
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                trailer: None,
                size: 0,
                cache: FxHashMap::default(),
                saved_cache: FxHashMap::default(),
                temporary: vec![],
                pending: FxHashSet::default(),
                aliases: FxHashMap::default(),
                gen_fallback: false,
                recovered: false,
            }),
        }
    }

    /// The source this table reads from.
    pub fn source(&self) -> &Arc<ChunkedSource> {
        &self.source
    }

    /// Install the document's decryption transform. Objects fetched from
    /// then on run their strings and stream data through it.
    pub fn set_decryptor(&self, decryptor: Arc<dyn Decryptor>) {
        *self.decryptor.write().unwrap() = Some(decryptor);
    }

    /// Populate the table by walking the cross-reference sections from the
    /// `startxref` pointer backwards along `/Prev`.
    ///
    /// The walk builds a fresh table and commits it only when every section
    /// parsed, so a run interrupted by [`Error::Unavailable`] can simply be
    /// repeated.
    pub fn parse(&self) -> Result<()> {
        let tail = self.source.tail_window(STARTXREF_WINDOW)?;

        let Some(start) = find_startxref(&tail) else {
            return Err(Error::NoTrailer);
        };

        if start >= self.source.len() {
            warn!("startxref points past the end of the document");

            return Err(Error::NoTrailer);
        }

        let mut entries: FxHashMap<u32, XRefEntry> = FxHashMap::default();
        let mut trailers: Vec<Dict> = vec![];
        let mut queue = VecDeque::from([start]);
        let mut visited: FxHashSet<usize> = FxHashSet::default();

        while let Some(pos) = queue.pop_front() {
            if !visited.insert(pos) {
                continue;
            }

            self.parse_section(pos, &mut entries, &mut trailers, &mut queue)?;
        }

        if trailers.is_empty() {
            return Err(Error::NoTrailer);
        }

        // The newest section's trailer keys win.
        let trailer = Dict::merge(&trailers, false);

        self.install(entries, Some(trailer), false);

        Ok(())
    }

    /// Replace the table wholesale. Used by the parse commit and by the
    /// recovery scan.
    pub(crate) fn install(
        &self,
        entries: FxHashMap<u32, XRefEntry>,
        trailer: Option<Dict>,
        recovered: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();

        let max_num = entries.keys().max().copied().unwrap_or(0);
        let size = trailer
            .as_ref()
            .and_then(|t| t.get_raw(SIZE))
            .and_then(Object::as_usize)
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0)
            .max(max_num + 1);

        inner.entries = entries;
        inner.trailer = trailer;
        inner.size = size;
        inner.recovered |= recovered;

        if recovered {
            inner.cache.clear();
        }
    }

    /// The trailer dictionary, if the table has been populated.
    pub fn trailer(&self) -> Option<Dict> {
        self.inner.lock().unwrap().trailer.clone()
    }

    pub(crate) fn set_trailer(&self, trailer: Dict) {
        self.inner.lock().unwrap().trailer = Some(trailer);
    }

    /// Add an entry for an object number that has none yet.
    pub(crate) fn add_entry_if_absent(&self, num: u32, entry: XRefEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.entry(num).or_insert(entry);
        inner.size = inner.size.max(num + 1);
    }

    /// The reference to the document catalog from the trailer.
    pub fn root_ref(&self) -> Option<ObjRef> {
        self.trailer().and_then(|t| t.get_ref(ROOT))
    }

    /// The number of entries in the table.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table was rebuilt by scanning the document.
    pub fn is_recovered(&self) -> bool {
        self.inner.lock().unwrap().recovered
    }

    /// Whether a generation mismatch has been tolerated.
    pub fn uses_generation_fallback(&self) -> bool {
        self.inner.lock().unwrap().gen_fallback
    }

    /// The table entry for an object number.
    pub fn entry(&self, num: u32) -> Option<XRefEntry> {
        self.inner.lock().unwrap().entries.get(&num).copied()
    }

    /// Resolve an object reference into the object it names.
    ///
    /// Results are cached per object number. A free or absent entry
    /// resolves to null. If the target is itself a reference, resolution
    /// follows it; a reference cycle resolves to [`Object::Circular`],
    /// which is never cached.
    pub fn fetch(&self, id: ObjRef, suppress_decryption: bool) -> Result<Object> {
        {
            let mut inner = self.inner.lock().unwrap();

            if let Some(obj) = inner.cache.get(&id.num) {
                let obj = obj.clone();
                drop(inner);
                stamp_obj_id(&obj, id);

                return Ok(obj);
            }

            if !inner.pending.insert(id.num) {
                return Ok(Object::Circular);
            }
        }

        let result = self.fetch_uncached(id, suppress_decryption);

        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&id.num);

        match result {
            Ok(Object::Circular) => Ok(Object::Circular),
            Ok(obj) => {
                inner.cache.insert(id.num, obj.clone());

                Ok(obj)
            }
            Err(e @ (Error::Unavailable { .. } | Error::Aborted(_) | Error::Transport(_))) => {
                // Retryable; the entry may still resolve later.
                Err(e)
            }
            Err(e) => {
                // A permanently broken entry resolves to null from now on.
                inner.cache.insert(id.num, Object::Null);

                Err(e)
            }
        }
    }

    /// Dereference `obj` if it is a reference, else return it unchanged.
    pub fn resolve(&self, obj: Object) -> Result<Object> {
        match obj {
            Object::Ref(id) => self.fetch(id, false),
            other => Ok(other),
        }
    }

    fn fetch_uncached(&self, id: ObjRef, suppress_decryption: bool) -> Result<Object> {
        let entry = self.inner.lock().unwrap().entries.get(&id.num).copied();

        let obj = match entry {
            None | Some(XRefEntry::Free) => Object::Null,
            Some(XRefEntry::Uncompressed { offset, generation }) => {
                self.check_generation(id, generation);
                self.fetch_uncompressed(id, offset, suppress_decryption)?
            }
            Some(XRefEntry::Compressed { container, index }) => {
                self.fetch_compressed(id, container, index, suppress_decryption)?
            }
        };

        match obj {
            Object::Ref(next) => self.fetch(next, suppress_decryption),
            other => Ok(other),
        }
    }

    fn check_generation(&self, id: ObjRef, found_gen: u16) {
        if id.generation == found_gen {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if !inner.gen_fallback {
            inner.gen_fallback = true;
            warn!(
                "generation mismatch for object {id} (found {found_gen}); \
                 ignoring generations from now on"
            );
        }
    }

    fn fetch_uncompressed(
        &self,
        id: ObjRef,
        offset: usize,
        suppress_decryption: bool,
    ) -> Result<Object> {
        let decryptor = self.decryptor.read().unwrap().clone();

        let parsed = self.with_run(offset, |run| {
            let mut r = Reader::new(&run.bytes);
            let ctx = ParseCtx {
                xref: Some(self),
                obj_id: None,
                suppress_decryption,
                decryptor: decryptor.as_ref(),
                base: run.start,
                terminator: run.terminator,
            };

            parse_indirect(&mut r, &ctx)
        })?;

        let Some((parsed_id, obj)) = parsed else {
            return Err(Error::Entry {
                num: id.num,
                generation: id.generation,
            });
        };

        if parsed_id.num != id.num {
            warn!("object at offset {offset} is {parsed_id}, expected {id}");

            return Err(Error::Entry {
                num: id.num,
                generation: id.generation,
            });
        }

        if parsed_id.generation != id.generation {
            self.check_generation(id, parsed_id.generation);
        }

        stamp_obj_id(&obj, parsed_id);

        Ok(obj)
    }

    fn fetch_compressed(
        &self,
        id: ObjRef,
        container: u32,
        index: u32,
        suppress_decryption: bool,
    ) -> Result<Object> {
        if id.generation != 0 {
            warn!("compressed object {id} with a nonzero generation");
        }

        let entry_error = Error::Entry {
            num: id.num,
            generation: id.generation,
        };

        let Some(stream) = self
            .fetch(ObjRef::new(container, 0), suppress_decryption)?
            .into_stream()
        else {
            warn!("object stream {container} 0 R is not a stream");

            return Err(entry_error);
        };

        let object_stream = ObjectStream::new(&stream, self)?;
        let mut wanted = None;

        // One pass resolves every object in the stream; the siblings go
        // straight into the cache.
        for (i, &(num, _)) in object_stream.slots.iter().enumerate() {
            let Some(obj) = object_stream.get(i, self)? else {
                if i as u32 == index {
                    return Err(entry_error);
                }

                continue;
            };

            let slot_id = ObjRef::new(num, 0);
            stamp_obj_id(&obj, slot_id);

            if i as u32 == index {
                if num != id.num {
                    warn!("slot {index} of object stream {container} holds {slot_id}, expected {id}");
                }

                wanted = Some(obj);
            } else {
                self.cache_sibling(num, container, obj);
            }
        }

        wanted.ok_or(entry_error)
    }

    /// Cache an object parsed as a byproduct of resolving its container,
    /// unless its table entry points elsewhere.
    fn cache_sibling(&self, num: u32, container: u32, obj: Object) {
        let mut inner = self.inner.lock().unwrap();

        let belongs_here = matches!(
            inner.entries.get(&num),
            Some(XRefEntry::Compressed { container: c, .. }) if *c == container
        );

        if belongs_here && !inner.pending.contains(&num) {
            inner.cache.entry(num).or_insert(obj);
        }
    }

    /// Store a caller-built object under a reference, typically one from
    /// [`new_temporary_ref`](Self::new_temporary_ref).
    pub fn insert(&self, id: ObjRef, obj: Object) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(old) = inner.cache.insert(id.num, obj)
            && inner.temporary.contains(&id.num)
        {
            inner.saved_cache.entry(id.num).or_insert(old);
        }
    }

    /// Allocate a fresh object number that stays allocated.
    pub fn new_persistent_ref(&self) -> ObjRef {
        let mut inner = self.inner.lock().unwrap();
        let num = inner.size;
        inner.size += 1;

        ObjRef::new(num, 0)
    }

    /// Allocate an object number that is reclaimed by
    /// [`reset_temporary_refs`](Self::reset_temporary_refs).
    ///
    /// Temporary numbers start where the persistent numbers currently end,
    /// so after a reset the same numbers are handed out again. A cached
    /// object displaced by a colliding temporary number is restored on
    /// reset.
    pub fn new_temporary_ref(&self) -> ObjRef {
        let mut inner = self.inner.lock().unwrap();
        let num = inner.size + inner.temporary.len() as u32;

        if let Some(old) = inner.cache.remove(&num) {
            inner.saved_cache.entry(num).or_insert(old);
        }

        inner.temporary.push(num);

        ObjRef::new(num, 0)
    }

    /// Drop all temporary references and whatever was cached under them.
    pub fn reset_temporary_refs(&self) {
        let mut inner = self.inner.lock().unwrap();

        let temporary = std::mem::take(&mut inner.temporary);
        for num in temporary {
            inner.cache.remove(&num);
        }

        let saved = std::mem::take(&mut inner.saved_cache);
        for (num, obj) in saved {
            inner.cache.insert(num, obj);
        }
    }

    /// Return the first reference registered for content identical to
    /// `obj`, registering `id` if it is the first.
    ///
    /// Documents produced by naive generators duplicate identical objects
    /// under many numbers; collaborators use the canonical reference as a
    /// shared cache key.
    pub fn canonical_ref(&self, obj: &Object, id: ObjRef) -> ObjRef {
        let hash = content_hash(obj);
        let mut inner = self.inner.lock().unwrap();

        *inner.aliases.entry(hash).or_insert(id)
    }

    /// Run `f` over growing resident runs starting at `start` until it
    /// succeeds or the data genuinely ends.
    ///
    /// `Ok(None)` from `f` means the parse did not fit the run: with more
    /// resident data behind the cap the cap doubles, at a hole the missing
    /// chunk is reported, and at the document end the failure is final.
    fn with_run<T>(
        &self,
        start: usize,
        mut f: impl FnMut(&ResidentRun) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let mut cap = INITIAL_PARSE_CAP;

        loop {
            let run = self.source.resident_run(start, cap)?;

            match f(&run)? {
                Some(value) => return Ok(Some(value)),
                None => match run.terminator {
                    RunEnd::Cap => cap = cap.saturating_mul(2),
                    RunEnd::Hole => {
                        return Err(Error::Unavailable {
                            begin: run.end(),
                            end: run.end() + self.source.chunk_size(),
                        });
                    }
                    RunEnd::DocumentEnd => return Ok(None),
                },
            }
        }
    }

    /// Parse one cross-reference section and queue the sections it chains
    /// to.
    fn parse_section(
        &self,
        pos: usize,
        entries: &mut FxHashMap<u32, XRefEntry>,
        trailers: &mut Vec<Dict>,
        queue: &mut VecDeque<usize>,
    ) -> Result<()> {
        let section = self.with_run(pos, |run| {
            let mut r = Reader::new(&run.bytes);
            r.skip_white_spaces_and_comments();

            let ctx = ParseCtx {
                xref: Some(self),
                obj_id: None,
                // Cross-reference streams are never encrypted.
                suppress_decryption: true,
                decryptor: None,
                base: run.start,
                terminator: run.terminator,
            };

            if r.peek_tag(b"xref").is_some() {
                parse_classic_section(&mut r, &ctx)
            } else if parse_header(&mut r.clone()).is_some() {
                match parse_indirect(&mut r, &ctx)? {
                    Some((_, Object::Stream(stream))) => Ok(Some(stream_section(&stream)?)),
                    Some(_) | None => Ok(None),
                }
            } else {
                Ok(None)
            }
        })?;

        let Some(section) = section else {
            return Err(Error::Format("malformed cross-reference section"));
        };

        // First write wins: the newest section is processed first.
        for (num, entry) in section.entries {
            entries.entry(num).or_insert(entry);
        }

        // A hybrid file's xref stream outranks the chained sections but
        // not the table that names it.
        if let Some(stm) = section
            .trailer
            .get_raw(XREF_STM)
            .and_then(Object::as_usize)
        {
            queue.push_back(stm);
        }

        if let Some(prev) = section.trailer.get_raw(PREV).and_then(Object::as_usize) {
            queue.push_back(prev);
        }

        trailers.push(section.trailer);

        Ok(())
    }
}

fn stamp_obj_id(obj: &Object, id: ObjRef) {
    match obj {
        Object::Dict(d) => d.stamp_obj_id(id),
        Object::Stream(s) => s.dict().stamp_obj_id(id),
        _ => {}
    }
}

struct Section {
    entries: Vec<(u32, XRefEntry)>,
    trailer: Dict,
}

/// Parse a classic `xref` table section, reader at the keyword.
fn parse_classic_section(r: &mut Reader<'_>, ctx: &ParseCtx<'_>) -> Result<Option<Section>> {
    if r.forward_tag(b"xref").is_none() {
        return Ok(None);
    }

    let mut entries = vec![];

    loop {
        r.skip_white_spaces_and_comments();

        if r.forward_tag(b"trailer").is_some() {
            break;
        }

        // A subsection header: the first object number and the entry count.
        let Some(start) = parse_plain_u64(r) else {
            return Ok(None);
        };
        r.skip_white_spaces();
        let Some(count) = parse_plain_u64(r) else {
            return Ok(None);
        };

        let mut start = match u32::try_from(start) {
            Ok(s) => s,
            Err(_) => return Ok(None),
        };

        for i in 0..count {
            r.skip_white_spaces();

            let Some(offset) = parse_plain_u64(r) else {
                return Ok(None);
            };
            r.forward_while_1(is_white_space_character);
            let Some(generation) = parse_plain_u64(r) else {
                return Ok(None);
            };
            r.forward_while_1(is_white_space_character);
            let Some(flag) = r.eat(|b| b == b'n' || b == b'f') else {
                return Ok(None);
            };

            // Some writers omit object 0 and number the free head 1.
            if i == 0 && start == 1 && flag == b'f' && offset == 0 && generation == 65535 {
                start = 0;
            }

            let num = start + i as u32;

            let entry = if flag == b'f' {
                XRefEntry::Free
            } else {
                XRefEntry::Uncompressed {
                    offset: offset as usize,
                    generation: u16::try_from(generation).unwrap_or(u16::MAX),
                }
            };

            entries.push((num, entry));
        }
    }

    let Some(trailer) = parse_object(r, ctx)?.and_then(Object::into_dict) else {
        return Ok(None);
    };

    Ok(Some(Section { entries, trailer }))
}

/// Extract the entries of a cross-reference stream.
fn stream_section(stream: &Stream) -> Result<Section> {
    let dict = stream.dict();

    let size = dict
        .get_raw(SIZE)
        .and_then(Object::as_usize)
        .ok_or(Error::Format("cross-reference stream without a size"))?;

    let widths: Vec<usize> = dict
        .get_raw(W)
        .cloned()
        .and_then(Object::into_array)
        .map(|a| a.iter().filter_map(Object::as_usize).collect())
        .ok_or(Error::Format("cross-reference stream without field widths"))?;

    let [w1, w2, w3] = widths[..] else {
        return Err(Error::Format("cross-reference stream needs three field widths"));
    };

    if w1.max(w2).max(w3) > size_of::<u64>() {
        return Err(Error::Format("cross-reference stream field is too wide"));
    }

    let ranges: Vec<(usize, usize)> = match dict.get_raw(INDEX).cloned().and_then(Object::into_array)
    {
        Some(index) => {
            let nums: Vec<usize> = index.iter().filter_map(Object::as_usize).collect();

            if nums.len() % 2 != 0 || nums.len() != index.len() {
                return Err(Error::Format("malformed cross-reference stream index"));
            }

            nums.chunks(2).map(|pair| (pair[0], pair[1])).collect()
        }
        None => vec![(0, size)],
    };

    let data = stream.decoded()?;
    let mut r = Reader::new(data);
    let mut entries = vec![];

    for (start, count) in ranges {
        for i in 0..count {
            let Ok(num) = u32::try_from(start + i) else {
                return Err(Error::Format("cross-reference entry number overflows"));
            };

            // A zero-width type field defaults to an uncompressed entry.
            let entry_type = if w1 == 0 {
                1
            } else {
                field_value(
                    r.read_bytes(w1)
                        .ok_or(Error::Format("cross-reference stream data is cut off"))?,
                )
            };
            let f2 = field_value(
                r.read_bytes(w2)
                    .ok_or(Error::Format("cross-reference stream data is cut off"))?,
            );
            let f3 = field_value(
                r.read_bytes(w3)
                    .ok_or(Error::Format("cross-reference stream data is cut off"))?,
            );

            let entry = match entry_type {
                0 => XRefEntry::Free,
                1 => XRefEntry::Uncompressed {
                    offset: f2 as usize,
                    generation: u16::try_from(f3).unwrap_or(u16::MAX),
                },
                2 => {
                    let (Ok(container), Ok(index)) = (u32::try_from(f2), u32::try_from(f3)) else {
                        warn!("compressed entry for object {num} overflows");

                        continue;
                    };

                    XRefEntry::Compressed { container, index }
                }
                other => {
                    warn!("cross-reference entry for object {num} has unknown type {other}");

                    continue;
                }
            };

            entries.push((num, entry));
        }
    }

    Ok(Section {
        entries,
        trailer: dict.clone(),
    })
}

/// Big-endian value of a cross-reference stream field.
fn field_value(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

/// Find the offset recorded after the last `startxref` keyword in the tail
/// window.
fn find_startxref(tail: &ResidentRun) -> Option<usize> {
    let mut finder = Reader::new(&tail.bytes);
    let mut pos = finder.len().checked_sub(1)?;
    finder.jump(pos);

    loop {
        if finder.forward_tag(b"startxref").is_some() {
            finder.skip_white_spaces_and_comments();

            return parse_plain_u64(&mut finder).and_then(|v| usize::try_from(v).ok());
        }

        pos = pos.checked_sub(1)?;
        finder.jump(pos);
    }
}

/// A parsed object stream: the decoded bytes plus the `(number, offset)`
/// slot directory from its header.
pub(crate) struct ObjectStream {
    pub(crate) slots: Vec<(u32, usize)>,
    data: Vec<u8>,
}

impl ObjectStream {
    pub(crate) fn new(stream: &Stream, xref: &XRef) -> Result<Self> {
        let n = stream
            .dict()
            .get(N, xref)?
            .and_then(|o| o.as_usize())
            .ok_or(Error::Format("object stream without an object count"))?;
        let first = stream
            .dict()
            .get(FIRST, xref)?
            .and_then(|o| o.as_usize())
            .ok_or(Error::Format("object stream without a first-object offset"))?;

        let data = stream.decoded()?.to_vec();
        let mut r = Reader::new(&data);
        let mut slots = Vec::with_capacity(n);

        for _ in 0..n {
            r.skip_white_spaces();
            let num = parse_plain_u64(&mut r)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(Error::Format("malformed object stream directory"))?;
            r.skip_white_spaces();
            let offset = parse_plain_u64(&mut r)
                .and_then(|v| usize::try_from(v).ok())
                .ok_or(Error::Format("malformed object stream directory"))?;

            slots.push((num, first + offset));
        }

        Ok(Self { slots, data })
    }

    /// Parse the object in slot `i`.
    pub(crate) fn get(&self, i: usize, xref: &XRef) -> Result<Option<Object>> {
        let &(num, offset) = match self.slots.get(i) {
            Some(slot) => slot,
            None => return Ok(None),
        };

        if offset >= self.data.len() {
            warn!("object stream slot for {num} 0 R points past the stream data");

            return Ok(None);
        }

        let mut r = Reader::new_at(&self.data, offset);
        let ctx = ParseCtx {
            xref: Some(xref),
            obj_id: Some(ObjRef::new(num, 0)),
            // The containing stream was already decrypted as a whole.
            suppress_decryption: true,
            decryptor: None,
            base: 0,
            terminator: RunEnd::DocumentEnd,
        };

        parse_object(&mut r, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::ChunkedSource;
    use crate::object::dict::keys::{COUNT, PAGES, TYPE};
    use crate::object::{ObjRef, Object};
    use crate::xref::XRef;
    use std::fmt::Write;
    use std::sync::Arc;

    /// Assemble a document from body parts, a classic table covering them
    /// and a trailer.
    fn classic_doc(bodies: &[(u32, &str)], trailer: &str) -> Vec<u8> {
        let mut buf = String::from("%PDF-1.7\n");
        let mut offsets = vec![];

        for (num, body) in bodies {
            offsets.push((*num, buf.len()));
            writeln!(buf, "{num} 0 obj\n{body}\nendobj").unwrap();
        }

        let xref_pos = buf.len();
        let max = bodies.iter().map(|(n, _)| *n).max().unwrap_or(0);

        buf.push_str("xref\n");
        writeln!(buf, "0 {}", max + 1).unwrap();
        buf.push_str("0000000000 65535 f \n");

        for num in 1..=max {
            match offsets.iter().find(|(n, _)| *n == num) {
                Some((_, offset)) => writeln!(buf, "{offset:010} 00000 n ").unwrap(),
                None => buf.push_str("0000000000 65535 f \n"),
            }
        }

        writeln!(buf, "trailer\n{trailer}\nstartxref\n{xref_pos}\n%%EOF").unwrap();

        buf.into_bytes()
    }

    fn xref_for(data: Vec<u8>) -> XRef {
        let source = Arc::new(ChunkedSource::from_bytes(&data, 512));
        let xref = XRef::new(source);
        xref.parse().unwrap();

        xref
    }

    #[test]
    fn classic_table_resolves_objects() {
        let xref = xref_for(classic_doc(
            &[
                (1, "<< /Type /Catalog /Pages 2 0 R >>"),
                (2, "<< /Type /Pages /Kids [] /Count 0 >>"),
            ],
            "<< /Size 3 /Root 1 0 R >>",
        ));

        let root = xref.root_ref().unwrap();
        assert_eq!(root, ObjRef::new(1, 0));

        let catalog = xref.fetch(root, false).unwrap().into_dict().unwrap();
        assert_eq!(catalog.obj_id(), Some(root));

        let pages = catalog.get(PAGES, &xref).unwrap().unwrap().into_dict().unwrap();
        assert_eq!(pages.get(COUNT, &xref).unwrap(), Some(Object::Int(0)));
    }

    #[test]
    fn absent_and_free_entries_are_null() {
        let xref = xref_for(classic_doc(
            &[(1, "<< /Type /Catalog /Pages 2 0 R >>"), (3, "42")],
            "<< /Size 4 /Root 1 0 R >>",
        ));

        // Object 2 is a free slot, object 99 absent.
        assert_eq!(xref.fetch(ObjRef::new(2, 0), false).unwrap(), Object::Null);
        assert_eq!(xref.fetch(ObjRef::new(99, 0), false).unwrap(), Object::Null);
        assert_eq!(xref.fetch(ObjRef::new(3, 0), false).unwrap(), Object::Int(42));
    }

    #[test]
    fn reference_chains_and_cycles() {
        let xref = xref_for(classic_doc(
            &[(1, "2 0 R"), (2, "7"), (3, "3 0 R"), (4, "5 0 R"), (5, "4 0 R")],
            "<< /Size 6 /Root 1 0 R >>",
        ));

        // A chain resolves to its end.
        assert_eq!(xref.fetch(ObjRef::new(1, 0), false).unwrap(), Object::Int(7));
        // Self-reference and a two-step cycle resolve to the sentinel.
        assert_eq!(xref.fetch(ObjRef::new(3, 0), false).unwrap(), Object::Circular);
        assert_eq!(xref.fetch(ObjRef::new(4, 0), false).unwrap(), Object::Circular);
        // The sentinel is not cached; a later fetch goes through the guard
        // again rather than seeing a stale value.
        assert_eq!(xref.fetch(ObjRef::new(3, 0), false).unwrap(), Object::Circular);
    }

    #[test]
    fn generation_fallback_is_sticky() {
        let xref = xref_for(classic_doc(
            &[(1, "<< /Type /Catalog >>"), (2, "true")],
            "<< /Size 3 /Root 1 0 R >>",
        ));

        assert!(!xref.uses_generation_fallback());
        // The table records generation 0; ask for 5.
        assert_eq!(
            xref.fetch(ObjRef::new(2, 5), false).unwrap(),
            Object::Bool(true)
        );
        assert!(xref.uses_generation_fallback());
    }

    #[test]
    fn newest_section_wins() {
        // An original document where object 2 is 1, updated so that it
        // becomes 2.
        let mut buf = String::from("%PDF-1.7\n");

        let obj1 = buf.len();
        buf.push_str("1 0 obj\n<< /Type /Catalog >>\nendobj\n");
        let obj2_old = buf.len();
        buf.push_str("2 0 obj\n1\nendobj\n");
        let xref1 = buf.len();
        write!(
            buf,
            "xref\n0 3\n0000000000 65535 f \n{obj1:010} 00000 n \n{obj2_old:010} 00000 n \n\
             trailer\n<< /Size 3 /Root 1 0 R >>\nstartxref\n{xref1}\n%%EOF\n"
        )
        .unwrap();

        let obj2_new = buf.len();
        buf.push_str("2 0 obj\n2\nendobj\n");
        let xref2 = buf.len();
        write!(
            buf,
            "xref\n2 1\n{obj2_new:010} 00000 n \n\
             trailer\n<< /Size 3 /Root 1 0 R /Prev {xref1} >>\nstartxref\n{xref2}\n%%EOF"
        )
        .unwrap();

        let xref = xref_for(buf.into_bytes());
        assert_eq!(xref.fetch(ObjRef::new(2, 0), false).unwrap(), Object::Int(2));
        assert_eq!(
            xref.fetch(ObjRef::new(1, 0), false)
                .unwrap()
                .into_dict()
                .unwrap()
                .get_raw(TYPE),
            Some(&Object::Name(crate::object::Name::new(b"Catalog")))
        );
    }

    #[test]
    fn xref_stream_and_object_stream() {
        let mut buf = Vec::from(&b"%PDF-1.7\n"[..]);

        // Objects 1 and 2 live in the object stream, which is object 3.
        let objstm_content = b"1 0 2 34\n<< /Type /Catalog /Pages 9 0 R >> 17";
        let first = 9;

        let obj3 = buf.len();
        buf.extend_from_slice(
            format!(
                "3 0 obj\n<< /Type /ObjStm /N 2 /First {first} /Length {} >>\nstream\n",
                objstm_content.len()
            )
            .as_bytes(),
        );
        buf.extend_from_slice(objstm_content);
        buf.extend_from_slice(b"\nendstream\nendobj\n");

        // The xref stream is object 4: W [1 2 1], entries for 0..=4.
        let obj4 = buf.len();
        let mut rows: Vec<u8> = vec![];
        rows.extend_from_slice(&[0, 0, 0, 255]); // 0: free
        rows.extend_from_slice(&[2, 0, 3, 0]); // 1: in stream 3, slot 0
        rows.extend_from_slice(&[2, 0, 3, 1]); // 2: in stream 3, slot 1
        rows.extend_from_slice(&[1, (obj3 >> 8) as u8, obj3 as u8, 0]); // 3
        rows.extend_from_slice(&[1, (obj4 >> 8) as u8, obj4 as u8, 0]); // 4

        buf.extend_from_slice(
            format!(
                "4 0 obj\n<< /Type /XRef /Size 5 /W [1 2 1] /Root 1 0 R /Length {} >>\nstream\n",
                rows.len()
            )
            .as_bytes(),
        );
        buf.extend_from_slice(&rows);
        buf.extend_from_slice(b"\nendstream\nendobj\n");
        buf.extend_from_slice(format!("startxref\n{obj4}\n%%EOF").as_bytes());

        let xref = xref_for(buf);

        let catalog = xref
            .fetch(ObjRef::new(1, 0), false)
            .unwrap()
            .into_dict()
            .unwrap();
        assert_eq!(catalog.get_ref(b"Pages"), Some(ObjRef::new(9, 0)));

        // The sibling slot was cached in the same pass.
        assert_eq!(xref.fetch(ObjRef::new(2, 0), false).unwrap(), Object::Int(17));
    }

    #[test]
    fn temporary_refs_reset_cleanly() {
        let xref = xref_for(classic_doc(
            &[(1, "<< /Type /Catalog >>")],
            "<< /Size 2 /Root 1 0 R >>",
        ));

        let t1 = xref.new_temporary_ref();
        let t2 = xref.new_temporary_ref();
        assert_ne!(t1, t2);

        xref.insert(t1, Object::Int(100));
        assert_eq!(xref.fetch(t1, false).unwrap(), Object::Int(100));

        xref.reset_temporary_refs();
        assert_eq!(xref.fetch(t1, false).unwrap(), Object::Null);

        // After a reset the same numbers come back.
        assert_eq!(xref.new_temporary_ref(), t1);
    }

    #[test]
    fn canonical_refs_dedup_by_content() {
        let xref = xref_for(classic_doc(
            &[(1, "<< /Type /Catalog >>"), (2, "(same)"), (3, "(same)")],
            "<< /Size 4 /Root 1 0 R >>",
        ));

        let a = xref.fetch(ObjRef::new(2, 0), false).unwrap();
        let b = xref.fetch(ObjRef::new(3, 0), false).unwrap();

        let canon_a = xref.canonical_ref(&a, ObjRef::new(2, 0));
        let canon_b = xref.canonical_ref(&b, ObjRef::new(3, 0));
        assert_eq!(canon_a, ObjRef::new(2, 0));
        assert_eq!(canon_b, ObjRef::new(2, 0));
    }
}
