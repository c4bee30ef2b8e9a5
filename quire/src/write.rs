//! Serializing objects and cross-reference sections.
//!
//! The write side of the crate, used when appending incremental updates to
//! a document. Everything written here parses back through the read side.

use crate::object::dict::Dict;
use crate::object::{Name, Object};
use crate::trivia::is_regular_character;
use crate::xref::XRefEntry;
use log::warn;
use std::io::Write;

/// Serialize a single object into `out`.
pub fn serialize_object(obj: &Object, out: &mut Vec<u8>) {
    match obj {
        // The cycle sentinel has no syntax of its own.
        Object::Null | Object::Circular => out.extend_from_slice(b"null"),
        Object::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Object::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Object::Real(r) => {
            // Debug formatting keeps the decimal point on whole reals, so
            // they do not come back as integers.
            let _ = write!(out, "{r:?}");
        }
        Object::String(s) => serialize_literal_string(s, out),
        Object::Name(n) => serialize_name(n, out),
        Object::Array(a) => {
            out.push(b'[');

            for (i, el) in a.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }

                serialize_object(el, out);
            }

            out.push(b']');
        }
        Object::Dict(d) => serialize_dict(d, out),
        Object::Stream(s) => {
            serialize_dict(s.dict(), out);
            out.extend_from_slice(b"\nstream\n");
            out.extend_from_slice(s.raw_data());
            out.extend_from_slice(b"\nendstream");
        }
        Object::Ref(id) => {
            let _ = write!(out, "{id}");
        }
    }
}

/// Serialize an object as the body of the indirect object `num gen`.
pub fn serialize_indirect(num: u32, generation: u16, obj: &Object, out: &mut Vec<u8>) {
    let _ = write!(out, "{num} {generation} obj\n");
    serialize_object(obj, out);
    out.extend_from_slice(b"\nendobj\n");
}

fn serialize_dict(dict: &Dict, out: &mut Vec<u8>) {
    out.extend_from_slice(b"<<");

    // Sorted entries keep the output stable across runs.
    for (key, value) in dict.entries_sorted() {
        out.push(b' ');
        serialize_name(key, out);
        out.push(b' ');
        serialize_object(value, out);
    }

    out.extend_from_slice(b" >>");
}

fn serialize_name(name: &Name, out: &mut Vec<u8>) {
    out.push(b'/');

    for &b in name.as_bytes() {
        if is_regular_character(b) && b != b'#' && (0x21..0x7f).contains(&b) {
            out.push(b);
        } else {
            let _ = write!(out, "#{b:02X}");
        }
    }
}

fn serialize_literal_string(s: &[u8], out: &mut Vec<u8>) {
    out.push(b'(');

    for &b in s {
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }

    out.push(b')');
}

/// Serialize entries as a classic `xref` section with its trailer.
///
/// Entries must be sorted by object number; contiguous runs become
/// subsections. Compressed entries cannot be expressed in a classic table
/// and are written as free.
pub fn write_classic_section(entries: &[(u32, XRefEntry)], trailer: &Dict) -> Vec<u8> {
    let mut out = vec![];
    out.extend_from_slice(b"xref\n");

    for run in contiguous_entry_runs(entries) {
        let _ = writeln!(out, "{} {}", run[0].0, run.len());

        for (num, entry) in run {
            match entry {
                XRefEntry::Free => out.extend_from_slice(b"0000000000 65535 f\r\n"),
                XRefEntry::Uncompressed { offset, generation } => {
                    let _ = write!(out, "{offset:010} {generation:05} n\r\n");
                }
                XRefEntry::Compressed { .. } => {
                    warn!("object {num} is compressed and cannot go in a classic table");

                    out.extend_from_slice(b"0000000000 65535 f\r\n");
                }
            }
        }
    }

    out.extend_from_slice(b"trailer\n");
    serialize_object(&Object::Dict(trailer.clone()), &mut out);
    out.push(b'\n');

    out
}

/// Serialize entries as cross-reference stream rows.
///
/// Entries must be sorted by object number. Returns the raw row bytes and
/// the `/Index` pairs describing them; the caller wraps both in a stream
/// object with the matching `/W`.
pub fn write_stream_entries(
    entries: &[(u32, XRefEntry)],
    widths: [usize; 3],
) -> (Vec<u8>, Vec<(u32, u32)>) {
    let [w1, w2, w3] = widths;
    let mut rows = vec![];
    let mut index = vec![];

    for run in contiguous_entry_runs(entries) {
        index.push((run[0].0, run.len() as u32));

        for (_, entry) in run {
            let (entry_type, f2, f3) = match *entry {
                XRefEntry::Free => (0u64, 0u64, u16::MAX as u64),
                XRefEntry::Uncompressed { offset, generation } => (1, offset as u64, generation as u64),
                XRefEntry::Compressed { container, index } => {
                    (2, container as u64, index as u64)
                }
            };

            push_field(entry_type, w1, &mut rows);
            push_field(f2, w2, &mut rows);
            push_field(f3, w3, &mut rows);
        }
    }

    (rows, index)
}

/// Append `value` big-endian in exactly `width` bytes. Values that do not
/// fit are truncated to their low bytes, so callers pick widths from the
/// largest value they write.
fn push_field(value: u64, width: usize, out: &mut Vec<u8>) {
    for i in (0..width).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

/// Split sorted `(num, entry)` pairs into runs of consecutive numbers.
fn contiguous_entry_runs(entries: &[(u32, XRefEntry)]) -> Vec<&[(u32, XRefEntry)]> {
    let mut runs = vec![];
    let mut start = 0;

    for i in 1..entries.len() {
        if entries[i].0 != entries[i - 1].0 + 1 {
            runs.push(&entries[start..i]);
            start = i;
        }
    }

    if start < entries.len() {
        runs.push(&entries[start..]);
    }

    runs
}

#[cfg(test)]
mod tests {
    use crate::chunk::ChunkedSource;
    use crate::object::dict::Dict;
    use crate::object::parse::{ParseCtx, parse_object};
    use crate::object::{Name, ObjRef, Object};
    use crate::reader::Reader;
    use crate::write::{
        serialize_object, write_classic_section, write_stream_entries,
    };
    use crate::xref::{XRef, XRefEntry};
    use rustc_hash::FxHashMap;
    use std::sync::Arc;

    fn reparse(obj: &Object) -> Object {
        let mut bytes = vec![];
        serialize_object(obj, &mut bytes);

        let mut r = Reader::new(&bytes);
        parse_object(&mut r, &ParseCtx::bare()).unwrap().unwrap()
    }

    #[test]
    fn objects_survive_a_round_trip() {
        let mut map = FxHashMap::default();
        map.insert(Name::new(b"Odd key"), Object::Real(-1.5));
        map.insert(Name::new(b"Next"), Object::Ref(ObjRef::new(9, 1)));

        let obj = Object::Array(Arc::new(vec![
            Object::Null,
            Object::Bool(false),
            Object::Int(-42),
            Object::String(b"with (parens) and \\".to_vec()),
            Object::Name(Name::new(b"Type")),
            Object::Dict(Dict::from_map(map)),
        ]));

        assert_eq!(reparse(&obj), obj);
    }

    #[test]
    fn classic_section_round_trips_through_the_table() {
        // Entry layout with a gap, so two subsections are written.
        let entries = vec![
            (0, XRefEntry::Free),
            (1, XRefEntry::Uncompressed { offset: 17, generation: 0 }),
            (2, XRefEntry::Uncompressed { offset: 81, generation: 2 }),
            (7, XRefEntry::Uncompressed { offset: 320, generation: 0 }),
        ];

        let mut trailer_map = FxHashMap::default();
        trailer_map.insert(Name::new(b"Size"), Object::Int(8));
        trailer_map.insert(Name::new(b"Root"), Object::Ref(ObjRef::new(1, 0)));
        let trailer = Dict::from_map(trailer_map);

        let mut doc = write_classic_section(&entries, &trailer);
        let xref_pos = 0;
        doc.extend_from_slice(format!("startxref\n{xref_pos}\n%%EOF").as_bytes());

        let xref = XRef::new(Arc::new(ChunkedSource::from_bytes(&doc, 256)));
        xref.parse().unwrap();

        for (num, entry) in entries {
            assert_eq!(xref.entry(num), Some(entry), "entry {num}");
        }
        assert_eq!(xref.root_ref(), Some(ObjRef::new(1, 0)));
    }

    #[test]
    fn stream_entries_round_trip_through_the_table() {
        let entries = vec![
            (0, XRefEntry::Free),
            (1, XRefEntry::Uncompressed { offset: 9, generation: 0 }),
            (2, XRefEntry::Compressed { container: 1, index: 4 }),
            (5, XRefEntry::Uncompressed { offset: 700, generation: 1 }),
        ];

        let (rows, index) = write_stream_entries(&entries, [1, 2, 2]);
        assert_eq!(index, vec![(0, 3), (5, 1)]);

        // Wrap the rows in an xref stream object at offset 0.
        let index_text = index
            .iter()
            .flat_map(|&(a, b)| [a.to_string(), b.to_string()])
            .collect::<Vec<_>>()
            .join(" ");
        let mut doc = format!(
            "0 0 obj\n<< /Type /XRef /Size 6 /W [1 2 2] /Index [{index_text}] \
             /Root 1 0 R /Length {} >>\nstream\n",
            rows.len()
        )
        .into_bytes();
        doc.extend_from_slice(&rows);
        doc.extend_from_slice(b"\nendstream\nendobj\nstartxref\n0\n%%EOF");

        let xref = XRef::new(Arc::new(ChunkedSource::from_bytes(&doc, 256)));
        xref.parse().unwrap();

        for (num, entry) in entries {
            assert_eq!(xref.entry(num), Some(entry), "entry {num}");
        }
    }
}
