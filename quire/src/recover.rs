//! Rebuilding a cross-reference table by scanning the raw document.
//!
//! Used when the regular table is missing, unreadable, or names a catalog
//! that does not check out. The scan walks the whole document for indirect
//! object headers, so it needs every byte: on a partially loaded source it
//! reports the remainder as unavailable and is re-run once everything has
//! arrived.

use crate::chunk::RunEnd;
use crate::error::{Error, Result};
use crate::object::dict::Dict;
use crate::object::dict::keys::{COUNT, ENCRYPT, ID, OBJ_STM, PAGES, ROOT, TYPE, XREF};
use crate::object::parse::{ParseCtx, parse_header, parse_indirect, parse_object};
use crate::object::{Name, Object};
use crate::reader::Reader;
use crate::trivia::{is_digit, is_regular_character, is_white_space_character};
use crate::xref::{ObjectStream, XRef, XRefEntry};
use log::{info, warn};
use memchr::memmem;
use rustc_hash::{FxHashMap, FxHashSet};

/// Rebuild the table of `xref` from a byte scan of its source.
///
/// On success the table holds an entry for every indirect object found in
/// the document, the later of two definitions winning, and the best trailer
/// candidate the scan could rank.
pub(crate) fn recover(xref: &XRef) -> Result<()> {
    let source = xref.source();

    if !source.is_fully_loaded() {
        return Err(Error::Unavailable {
            begin: 0,
            end: source.len(),
        });
    }

    let data = source.read_range(0, source.len())?;

    info!("rebuilding the cross-reference table from a document scan");

    let mut entries: FxHashMap<u32, XRefEntry> = FxHashMap::default();
    let mut parsed_bodies: FxHashSet<u32> = FxHashSet::default();
    let mut object_streams = vec![];
    let mut stream_trailers = vec![];

    for offset in header_candidates(&data) {
        let mut r = Reader::new_at(&data, offset);

        let parsed = match parse_indirect(&mut r, &scan_ctx(xref)) {
            Ok(parsed) => parsed,
            Err(e) if e.is_unavailable() => return Err(e),
            Err(_) => None,
        };

        let (id, obj) = match parsed {
            Some((id, obj)) => (id, Some(obj)),
            // The body does not parse, but the header is sound. The entry
            // is recorded anyway; fetching it reports the broken object
            // instead of pretending it is absent.
            None => {
                let mut r = Reader::new_at(&data, offset);

                match parse_header(&mut r) {
                    Some(id) => (id, None),
                    None => continue,
                }
            }
        };

        // A later definition of the same number shadows an earlier one,
        // matching how incremental updates append. A body that failed to
        // parse never shadows one that parsed.
        if obj.is_some() || !parsed_bodies.contains(&id.num) {
            entries.insert(
                id.num,
                XRefEntry::Uncompressed {
                    offset,
                    generation: id.generation,
                },
            );
        }

        let Some(obj) = obj else {
            continue;
        };
        parsed_bodies.insert(id.num);

        if let Object::Stream(stream) = &obj {
            match stream.dict().get_raw(TYPE).and_then(Object::as_name) {
                Some(name) if name == &Name::new(OBJ_STM) => {
                    object_streams.push((id.num, stream.clone()));
                }
                // A cross-reference stream's dictionary doubles as a
                // trailer.
                Some(name) if name == &Name::new(XREF) => {
                    stream_trailers.push(stream.dict().clone());
                }
                _ => {}
            }
        }
    }

    if entries.is_empty() {
        return Err(Error::NoTrailer);
    }

    let mut trailer_candidates = collect_trailers(&data, xref);
    trailer_candidates.extend(stream_trailers);

    xref.install(entries, None, true);

    // Expanding the object streams needs a populated table, since their
    // directories may be reached through references.
    for (container, stream) in object_streams {
        expand_object_stream(xref, container, &stream);
    }

    let trailer =
        choose_trailer(xref, trailer_candidates).or_else(|| top_dictionary(&data, xref));

    match trailer {
        Some(trailer) => {
            xref.set_trailer(trailer);

            Ok(())
        }
        None => Err(Error::NoTrailer),
    }
}

/// The first dictionary after the first standalone `xref` keyword, the last
/// resort when no trailer keyword survived in the document.
fn top_dictionary(data: &[u8], xref: &XRef) -> Option<Dict> {
    let pos = memmem::find_iter(data, b"xref").find(|&pos| {
        let before = pos.checked_sub(1).map(|i| data[i]);
        let after = data.get(pos + b"xref".len()).copied();

        !before.is_some_and(is_regular_character) && !after.is_some_and(is_regular_character)
    })?;

    let dict_pos = pos + memmem::find(&data[pos..], b"<<")?;

    warn!("no usable trailer found; trying the top dictionary after the first xref keyword");

    let mut r = Reader::new_at(data, dict_pos);

    parse_object(&mut r, &scan_ctx(xref))
        .ok()
        .flatten()
        .and_then(Object::into_dict)
}

fn scan_ctx(xref: &XRef) -> ParseCtx<'_> {
    ParseCtx {
        xref: Some(xref),
        obj_id: None,
        suppress_decryption: true,
        decryptor: None,
        base: 0,
        terminator: RunEnd::DocumentEnd,
    }
}

/// Offsets of plausible `num gen obj` headers, found by scanning for the
/// keyword and walking the two numbers backwards from it.
fn header_candidates(data: &[u8]) -> Vec<usize> {
    let mut candidates = vec![];

    for pos in memmem::find_iter(data, b"obj") {
        // The keyword must stand alone.
        match data.get(pos + 3) {
            Some(&b) if is_regular_character(b) => continue,
            _ => {}
        }

        let Some(gen_end) = walk_back_while(data, pos, is_white_space_character) else {
            continue;
        };
        let Some(gen_start) = walk_back_while(data, gen_end, is_digit) else {
            continue;
        };
        let Some(num_end) = walk_back_while(data, gen_start, is_white_space_character) else {
            continue;
        };
        let Some(num_start) = walk_back_while(data, num_end, is_digit) else {
            continue;
        };

        if num_start > 0 && is_regular_character(data[num_start - 1]) {
            continue;
        }

        candidates.push(num_start);
    }

    candidates
}

/// Walk left from `end` over bytes matching `f`, returning the start of the
/// walked span, or `None` if no byte matched.
fn walk_back_while(data: &[u8], end: usize, f: impl Fn(u8) -> bool) -> Option<usize> {
    let mut start = end;

    while start > 0 && f(data[start - 1]) {
        start -= 1;
    }

    (start < end).then_some(start)
}

/// Parse the dictionary after every `trailer` keyword, in document order.
fn collect_trailers(data: &[u8], xref: &XRef) -> Vec<Dict> {
    let mut trailers = vec![];

    for pos in memmem::find_iter(data, b"trailer") {
        let mut r = Reader::new_at(data, pos + b"trailer".len());

        if let Ok(Some(obj)) = parse_object(&mut r, &scan_ctx(xref))
            && let Some(dict) = obj.into_dict()
        {
            trailers.push(dict);
        }
    }

    trailers
}

/// Pick the best trailer among the candidates.
///
/// A candidate is sound if its catalog chain checks out: `/Root` resolves
/// to a dictionary whose `/Pages` has an integer `/Count`. Among sound
/// candidates the last one wins, preferring those that carry `/ID` and,
/// when any candidate names `/Encrypt`, those that name it too. With no
/// sound candidate the last parsed one is used as-is.
fn choose_trailer(xref: &XRef, candidates: Vec<Dict>) -> Option<Dict> {
    let any_encrypted = candidates.iter().any(|t| t.contains_key(ENCRYPT));

    let mut best: Option<(u8, &Dict)> = None;

    for candidate in &candidates {
        if !catalog_checks_out(xref, candidate) {
            continue;
        }

        let mut score = 1;
        if candidate.contains_key(ID) {
            score += 1;
        }
        if !any_encrypted || candidate.contains_key(ENCRYPT) {
            score += 2;
        }

        // Later candidates win ties.
        if best.is_none_or(|(s, _)| score >= s) {
            best = Some((score, candidate));
        }
    }

    if let Some((_, trailer)) = best {
        return Some(trailer.clone());
    }

    if let Some(last) = candidates.last() {
        warn!("no recovered trailer has a sound catalog; using the last one found");

        return Some(last.clone());
    }

    None
}

fn catalog_checks_out(xref: &XRef, trailer: &Dict) -> bool {
    let root = match trailer.get(ROOT, xref) {
        Ok(Some(obj)) => obj,
        _ => return false,
    };

    let Some(catalog) = root.into_dict() else {
        return false;
    };

    let pages = match catalog.get(PAGES, xref) {
        Ok(Some(obj)) => obj,
        _ => return false,
    };

    let Some(pages) = pages.into_dict() else {
        return false;
    };

    matches!(pages.get(COUNT, xref), Ok(Some(obj)) if obj.as_int().is_some())
}

/// Register compressed entries for the objects inside a recovered object
/// stream, unless a plain definition was found for them as well.
fn expand_object_stream(xref: &XRef, container: u32, stream: &crate::object::stream::Stream) {
    let directory = match ObjectStream::new(stream, xref) {
        Ok(directory) => directory,
        Err(_) => {
            warn!("recovered object stream {container} 0 R has no readable directory");

            return;
        }
    };

    for (index, &(num, _)) in directory.slots.iter().enumerate() {
        let Ok(index) = u32::try_from(index) else {
            break;
        };

        xref.add_entry_if_absent(num, XRefEntry::Compressed { container, index });
    }
}
