//! The recursive-descent parser for object syntax.
//!
//! All parsers work over a [`Reader`] that views a copied resident run of
//! the chunked source. A parse that fails can mean two things: the bytes are
//! genuinely malformed, or the run ended before the object did. The parsers
//! report `Ok(None)` for both and leave the distinction to the caller, which
//! knows how the run terminated. Only a stream body whose `/Length` names
//! bytes past the run produces a precise [`Error::Unavailable`] here.

use crate::chunk::RunEnd;
use crate::crypto::{DecryptionTarget, Decryptor};
use crate::error::{Error, Result};
use crate::object::dict::Dict;
use crate::object::dict::keys::LENGTH;
use crate::object::stream::Stream;
use crate::object::{Name, ObjRef, Object};
use crate::reader::Reader;
use crate::trivia::{is_digit, is_regular_character, is_white_space_character};
use crate::xref::XRef;
use log::warn;
use memchr::memmem;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// Extra bytes past a stream body that must be resident before the body can
/// be committed, covering the `endstream` keyword and surrounding EOLs.
const ENDSTREAM_MARGIN: usize = 20;

/// The context a parse runs in.
pub(crate) struct ParseCtx<'a> {
    /// The table used to resolve an indirect `/Length`.
    pub(crate) xref: Option<&'a XRef>,
    /// The indirect object the parsed bytes belong to, if known.
    pub(crate) obj_id: Option<ObjRef>,
    /// Skip the decryption transform for this parse.
    pub(crate) suppress_decryption: bool,
    /// The document's decryption transform, if the document is encrypted.
    pub(crate) decryptor: Option<&'a Arc<dyn Decryptor>>,
    /// Absolute offset of the reader's first byte within the document.
    pub(crate) base: usize,
    /// How the resident run backing the reader ends.
    pub(crate) terminator: RunEnd,
}

impl ParseCtx<'_> {
    /// A context for parsing fully present, standalone bytes.
    pub(crate) fn bare() -> Self {
        Self {
            xref: None,
            obj_id: None,
            suppress_decryption: true,
            decryptor: None,
            base: 0,
            terminator: RunEnd::DocumentEnd,
        }
    }

    fn decrypt(&self, data: Vec<u8>, target: DecryptionTarget) -> Vec<u8> {
        match (self.decryptor, self.obj_id) {
            (Some(decryptor), Some(id)) if !self.suppress_decryption => {
                decryptor.decrypt(id, data, target)
            }
            _ => data,
        }
    }
}

/// Parse a single object at the reader's position.
pub(crate) fn parse_object(r: &mut Reader<'_>, ctx: &ParseCtx<'_>) -> Result<Option<Object>> {
    r.skip_white_spaces_and_comments();

    let Some(b) = r.peek_byte() else {
        return Ok(None);
    };

    match b {
        b'/' => Ok(parse_name(r).map(Object::Name)),
        b'(' => Ok(parse_literal_string(r).map(|s| Object::String(ctx.decrypt(s, DecryptionTarget::String)))),
        b'<' => {
            if r.peek_bytes(2) == Some(b"<<") {
                parse_dict_or_stream(r, ctx)
            } else {
                Ok(parse_hex_string(r).map(|s| Object::String(ctx.decrypt(s, DecryptionTarget::String))))
            }
        }
        b'[' => parse_array(r, ctx),
        b't' => Ok(parse_keyword(r, b"true").map(|()| Object::Bool(true))),
        b'f' => Ok(parse_keyword(r, b"false").map(|()| Object::Bool(false))),
        b'n' => Ok(parse_keyword(r, b"null").map(|()| Object::Null)),
        b'R' => Ok(None),
        _ if is_digit(b) || b == b'+' || b == b'-' || b == b'.' => {
            // An unsigned integer might instead start a `num gen R`
            // reference; try that first.
            if let Some(id) = r.attempt(parse_ref) {
                return Ok(Some(Object::Ref(id)));
            }

            Ok(parse_number(r))
        }
        _ => Ok(None),
    }
}

/// Parse an indirect object: `num generation obj <object> endobj`.
///
/// A missing `endobj` keyword only passes when other content follows the
/// object, so a body truncated at the end of the run never parses as a
/// shorter valid object.
pub(crate) fn parse_indirect(
    r: &mut Reader<'_>,
    ctx: &ParseCtx<'_>,
) -> Result<Option<(ObjRef, Object)>> {
    let Some(id) = parse_header(r) else {
        return Ok(None);
    };

    let ctx = ParseCtx {
        xref: ctx.xref,
        obj_id: Some(id),
        suppress_decryption: ctx.suppress_decryption,
        decryptor: ctx.decryptor,
        base: ctx.base,
        terminator: ctx.terminator,
    };

    let Some(obj) = parse_object(r, &ctx)? else {
        return Ok(None);
    };

    r.skip_white_spaces_and_comments();

    if r.forward_tag(b"endobj").is_none() {
        if r.at_end() {
            return Ok(None);
        }

        warn!("object {id} is not closed by an endobj keyword");
    }

    Ok(Some((id, obj)))
}

/// Parse an indirect object header: `num gen obj`.
pub(crate) fn parse_header(r: &mut Reader<'_>) -> Option<ObjRef> {
    r.attempt(|r| {
        r.skip_white_spaces_and_comments();
        let num = parse_plain_u64(r)?;
        let num = u32::try_from(num).ok()?;
        r.forward_while_1(is_white_space_character)?;
        let generation = parse_plain_u64(r)?;
        let generation = u16::try_from(generation).ok()?;
        r.forward_while_1(is_white_space_character)?;
        r.forward_tag(b"obj")?;
        at_token_boundary(r)?;

        Some(ObjRef::new(num, generation))
    })
}

/// Parse an unsigned integer with no sign and no fraction.
pub(crate) fn parse_plain_u64(r: &mut Reader<'_>) -> Option<u64> {
    r.attempt(|r| {
        let start = r.offset();
        r.forward_while_1(is_digit)?;
        let digits = r.range(start..r.offset())?;

        std::str::from_utf8(digits).ok()?.parse().ok()
    })
}

fn parse_ref(r: &mut Reader<'_>) -> Option<ObjRef> {
    let num = parse_plain_u64(r)?;
    let num = u32::try_from(num).ok()?;
    r.forward_while_1(is_white_space_character)?;
    let generation = parse_plain_u64(r)?;
    let generation = u16::try_from(generation).ok()?;
    r.forward_while_1(is_white_space_character)?;
    r.forward_if(|b| b == b'R')?;
    at_token_boundary(r)?;

    Some(ObjRef::new(num, generation))
}

/// Succeeds if the reader sits at a token boundary, so that keywords do not
/// match as prefixes of longer regular-character runs.
fn at_token_boundary(r: &Reader<'_>) -> Option<()> {
    match r.peek_byte() {
        None => Some(()),
        Some(b) if !is_regular_character(b) => Some(()),
        Some(_) => None,
    }
}

fn parse_keyword(r: &mut Reader<'_>, keyword: &[u8]) -> Option<()> {
    r.attempt(|r| {
        r.forward_tag(keyword)?;
        at_token_boundary(r)
    })
}

fn parse_number(r: &mut Reader<'_>) -> Option<Object> {
    r.attempt(|r| {
        let start = r.offset();
        r.forward_if(|b| b == b'+' || b == b'-');

        let int_digits = r.offset();
        r.forward_while(is_digit);
        let mut has_digits = r.offset() > int_digits;
        let mut is_real = false;

        if r.forward_if(|b| b == b'.').is_some() {
            is_real = true;
            let frac_digits = r.offset();
            r.forward_while(is_digit);
            has_digits |= r.offset() > frac_digits;
        }

        if !has_digits {
            return None;
        }

        at_token_boundary(r)?;

        let text = std::str::from_utf8(r.range(start..r.offset())?).ok()?;

        if is_real {
            text.parse().ok().map(Object::Real)
        } else {
            // Out-of-range integers degrade to reals rather than failing.
            text.parse()
                .map(Object::Int)
                .ok()
                .or_else(|| text.parse().ok().map(Object::Real))
        }
    })
}

fn parse_name(r: &mut Reader<'_>) -> Option<Name> {
    r.forward_if(|b| b == b'/')?;

    let mut bytes: SmallVec<[u8; 16]> = SmallVec::new();

    while let Some(b) = r.peek_byte() {
        if !is_regular_character(b) {
            break;
        }

        r.forward();

        if b == b'#' {
            let escaped = r.attempt(|r| {
                let hi = hex_value(r.eat(|b| b.is_ascii_hexdigit())?)?;
                let lo = hex_value(r.eat(|b| b.is_ascii_hexdigit())?)?;

                Some(hi << 4 | lo)
            });

            match escaped {
                Some(byte) => bytes.push(byte),
                // Lenient: a stray `#` stays literal.
                None => bytes.push(b'#'),
            }
        } else {
            bytes.push(b);
        }
    }

    Some(Name(bytes))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_literal_string(r: &mut Reader<'_>) -> Option<Vec<u8>> {
    r.attempt(|r| {
        r.forward_if(|b| b == b'(')?;

        let mut out = vec![];
        let mut depth = 1u32;

        loop {
            let b = r.read_byte()?;

            match b {
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;

                    if depth == 0 {
                        return Some(out);
                    }

                    out.push(b);
                }
                b'\\' => {
                    let esc = r.read_byte()?;

                    match esc {
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'(' | b')' | b'\\' => out.push(esc),
                        // A backslash before an EOL continues the string on
                        // the next line.
                        b'\r' => {
                            r.forward_if(|b| b == b'\n');
                        }
                        b'\n' => {}
                        b'0'..=b'7' => {
                            let mut value = (esc - b'0') as u16;

                            for _ in 0..2 {
                                match r.eat(|b| (b'0'..=b'7').contains(&b)) {
                                    Some(d) => value = value * 8 + (d - b'0') as u16,
                                    None => break,
                                }
                            }

                            out.push(value as u8);
                        }
                        // An unknown escape drops the backslash.
                        other => out.push(other),
                    }
                }
                // Raw EOLs are normalized to a single line feed.
                b'\r' => {
                    r.forward_if(|b| b == b'\n');
                    out.push(b'\n');
                }
                _ => out.push(b),
            }
        }
    })
}

fn parse_hex_string(r: &mut Reader<'_>) -> Option<Vec<u8>> {
    r.attempt(|r| {
        r.forward_if(|b| b == b'<')?;

        let mut out = vec![];
        let mut pending: Option<u8> = None;

        loop {
            let b = r.read_byte()?;

            if b == b'>' {
                // An odd final digit is padded with a trailing zero.
                if let Some(hi) = pending {
                    out.push(hi << 4);
                }

                return Some(out);
            }

            if is_white_space_character(b) {
                continue;
            }

            let digit = hex_value(b)?;

            match pending.take() {
                Some(hi) => out.push(hi << 4 | digit),
                None => pending = Some(digit),
            }
        }
    })
}

fn parse_array(r: &mut Reader<'_>, ctx: &ParseCtx<'_>) -> Result<Option<Object>> {
    let start = r.offset();
    r.forward();

    let mut elements = vec![];

    loop {
        r.skip_white_spaces_and_comments();

        if r.forward_if(|b| b == b']').is_some() {
            return Ok(Some(Object::Array(Arc::new(elements))));
        }

        match parse_object(r, ctx)? {
            Some(obj) => elements.push(obj),
            None => {
                r.jump(start);

                return Ok(None);
            }
        }
    }
}

fn parse_dict_or_stream(r: &mut Reader<'_>, ctx: &ParseCtx<'_>) -> Result<Option<Object>> {
    let start = r.offset();

    let Some(dict) = parse_dict(r, ctx)? else {
        return Ok(None);
    };

    let keyword = r.attempt(|r| {
        r.skip_white_spaces_and_comments();
        r.forward_tag(b"stream")?;
        // The keyword is terminated by CRLF or LF; a lone CR appears in
        // the wild and is tolerated.
        r.forward_if(|b| b == b'\r');
        r.forward_if(|b| b == b'\n');

        Some(())
    });

    if keyword.is_none() {
        return Ok(Some(Object::Dict(dict)));
    }

    match finish_stream(r, dict, ctx)? {
        Some(stream) => Ok(Some(Object::Stream(stream))),
        None => {
            r.jump(start);

            Ok(None)
        }
    }
}

fn parse_dict(r: &mut Reader<'_>, ctx: &ParseCtx<'_>) -> Result<Option<Dict>> {
    let start = r.offset();

    if r.forward_tag(b"<<").is_none() {
        return Ok(None);
    }

    let mut map: FxHashMap<Name, Object> = FxHashMap::default();

    loop {
        r.skip_white_spaces_and_comments();

        if r.forward_tag(b">>").is_some() {
            return Ok(Some(Dict::from_map(map)));
        }

        let Some(key) = parse_name(r) else {
            r.jump(start);

            return Ok(None);
        };

        match parse_object(r, ctx)? {
            // A later duplicate of a key replaces the earlier value.
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                r.jump(start);

                return Ok(None);
            }
        }
    }
}

/// Parse a stream body. The reader sits at the first data byte.
fn finish_stream(r: &mut Reader<'_>, dict: Dict, ctx: &ParseCtx<'_>) -> Result<Option<Stream>> {
    let data_start = r.offset();

    let length = match dict.get_raw(LENGTH) {
        Some(Object::Ref(id)) => match ctx.xref {
            Some(xref) => xref.fetch(*id, ctx.suppress_decryption)?.as_usize(),
            None => None,
        },
        Some(obj) => obj.as_usize(),
        None => None,
    };

    if let Some(len) = length {
        match r.range(data_start..data_start + len) {
            Some(data) => {
                // The declared length is trusted only if the endstream
                // keyword follows it.
                let mut probe = r.clone();
                probe.jump(data_start + len);
                probe.skip_white_spaces();

                if probe.forward_tag(b"endstream").is_some() {
                    let data = data.to_vec();
                    r.jump(probe.offset());

                    return Ok(Some(make_stream(dict, data, ctx)));
                }

                if probe.at_end() && ctx.terminator != RunEnd::DocumentEnd {
                    // The keyword may still be on its way.
                    return Ok(None);
                }

                warn!("stream length {len} does not lead to an endstream keyword");
            }
            None => match ctx.terminator {
                // The body provably extends past the run; name the exact
                // missing bytes instead of probing chunk by chunk.
                RunEnd::Hole => {
                    return Err(Error::Unavailable {
                        begin: ctx.base + r.len(),
                        end: ctx.base + data_start + len + ENDSTREAM_MARGIN,
                    });
                }
                RunEnd::Cap => return Ok(None),
                // The length overruns the document; the keyword scan
                // below decides where the data really ends.
                RunEnd::DocumentEnd => {
                    warn!("stream length {len} runs past the end of the document");
                }
            },
        }
    }

    // No trustworthy length; scan for the endstream keyword instead.
    let tail = r.tail().unwrap_or_default();

    match memmem::find(tail, b"endstream") {
        Some(pos) => {
            let mut data = &tail[..pos];

            // Strip the EOL that separates the data from the keyword.
            if data.ends_with(b"\n") {
                data = &data[..data.len() - 1];
            }
            if data.ends_with(b"\r") {
                data = &data[..data.len() - 1];
            }

            let data = data.to_vec();
            r.jump(data_start + pos + b"endstream".len());

            Ok(Some(make_stream(dict, data, ctx)))
        }
        None => {
            // Without the keyword a declared length that reached the end
            // of the document delimits what is left.
            if length.is_some() && ctx.terminator == RunEnd::DocumentEnd {
                warn!("stream body is cut off by the end of the document");

                let data = tail.to_vec();
                r.jump(r.len());

                return Ok(Some(make_stream(dict, data, ctx)));
            }

            Ok(None)
        }
    }
}

fn make_stream(dict: Dict, data: Vec<u8>, ctx: &ParseCtx<'_>) -> Stream {
    let data = ctx.decrypt(data, DecryptionTarget::Stream);

    Stream::new(dict, data)
}

#[cfg(test)]
mod tests {
    use crate::object::dict::keys::LENGTH;
    use crate::object::parse::{ParseCtx, parse_header, parse_indirect, parse_object};
    use crate::object::{Name, ObjRef, Object};
    use crate::reader::Reader;
    use std::sync::Arc;

    fn parse(data: &[u8]) -> Option<Object> {
        let mut r = Reader::new(data);

        parse_object(&mut r, &ParseCtx::bare()).unwrap()
    }

    #[test]
    fn numbers() {
        assert_eq!(parse(b"34"), Some(Object::Int(34)));
        assert_eq!(parse(b"-12"), Some(Object::Int(-12)));
        assert_eq!(parse(b"+17"), Some(Object::Int(17)));
        assert_eq!(parse(b"4."), Some(Object::Real(4.0)));
        assert_eq!(parse(b"-.002"), Some(Object::Real(-0.002)));
        assert_eq!(parse(b"."), None);
    }

    #[test]
    fn keywords_respect_boundaries() {
        assert_eq!(parse(b"null"), Some(Object::Null));
        assert_eq!(parse(b"true "), Some(Object::Bool(true)));
        assert_eq!(parse(b"nullx"), None);
    }

    #[test]
    fn names() {
        assert_eq!(parse(b"/Type"), Some(Object::Name(Name::new(b"Type"))));
        assert_eq!(
            parse(b"/Name#20with#20spaces"),
            Some(Object::Name(Name::new(b"Name with spaces")))
        );
        // A broken escape stays literal.
        assert_eq!(parse(b"/A#zB"), Some(Object::Name(Name::new(b"A#zB"))));
    }

    #[test]
    fn literal_strings() {
        assert_eq!(parse(b"(hello)"), Some(Object::String(b"hello".to_vec())));
        assert_eq!(
            parse(b"(a (nested) one)"),
            Some(Object::String(b"a (nested) one".to_vec()))
        );
        assert_eq!(
            parse(br"(line\nbreak \(esc\) \101)"),
            Some(Object::String(b"line\nbreak (esc) A".to_vec()))
        );
        // Unterminated.
        assert_eq!(parse(b"(oops"), None);
    }

    #[test]
    fn hex_strings() {
        assert_eq!(parse(b"<48 65 6C>"), Some(Object::String(b"Hel".to_vec())));
        // Odd digit count pads with zero.
        assert_eq!(parse(b"<901fa>"), Some(Object::String(vec![0x90, 0x1f, 0xa0])));
    }

    #[test]
    fn refs_and_arrays() {
        assert_eq!(parse(b"3 0 R"), Some(Object::Ref(ObjRef::new(3, 0))));
        // `R` needs a generation; two integers stay two integers.
        assert_eq!(
            parse(b"[1 2 R 3]"),
            Some(Object::Array(Arc::new(vec![
                Object::Ref(ObjRef::new(1, 2)),
                Object::Int(3),
            ])))
        );
        assert_eq!(
            parse(b"[1 2]"),
            Some(Object::Array(Arc::new(vec![Object::Int(1), Object::Int(2)])))
        );
    }

    #[test]
    fn dicts() {
        let obj = parse(b"<< /Type /Catalog /Pages 2 0 R >>").unwrap();
        let dict = obj.into_dict().unwrap();
        assert_eq!(dict.get_ref(b"Pages"), Some(ObjRef::new(2, 0)));
        assert_eq!(
            dict.get_raw(b"Type"),
            Some(&Object::Name(Name::new(b"Catalog")))
        );
    }

    #[test]
    fn stream_with_direct_length() {
        let obj = parse(b"<< /Length 5 >>\nstream\nabcde\nendstream").unwrap();
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw_data(), b"abcde");
        assert_eq!(stream.dict().get_raw(LENGTH), Some(&Object::Int(5)));
    }

    #[test]
    fn stream_with_broken_length_scans() {
        // The declared length overruns the document; the keyword still
        // delimits the data.
        let obj = parse(b"<< /Length 99 >>\nstream\nabcde\nendstream").unwrap();
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw_data(), b"abcde");
    }

    #[test]
    fn truncated_stream_keeps_the_resident_tail() {
        // No endstream anywhere; what is left of the body is kept.
        let obj = parse(b"<< /Length 99 >>\nstream\nabc").unwrap();
        let stream = obj.into_stream().unwrap();
        assert_eq!(stream.raw_data(), b"abc");
    }

    #[test]
    fn indirect_objects() {
        let mut r = Reader::new(b"7 0 obj\n<< /A 1 >>\nendobj");
        let (id, obj) = parse_indirect(&mut r, &ParseCtx::bare()).unwrap().unwrap();
        assert_eq!(id, ObjRef::new(7, 0));
        assert!(obj.into_dict().is_some());

        // A bare number cut off at the end of the data does not parse.
        let mut r = Reader::new(b"7 0 obj 123");
        assert!(parse_indirect(&mut r, &ParseCtx::bare()).unwrap().is_none());

        // With following content the missing endobj is tolerated.
        let mut r = Reader::new(b"7 0 obj 123\n8 0 obj");
        let (_, obj) = parse_indirect(&mut r, &ParseCtx::bare()).unwrap().unwrap();
        assert_eq!(obj, Object::Int(123));
    }

    #[test]
    fn headers() {
        let mut r = Reader::new(b"12 0 obj");
        assert_eq!(parse_header(&mut r), Some(ObjRef::new(12, 0)));

        let mut r = Reader::new(b"12 0 object");
        assert_eq!(parse_header(&mut r), None);
    }
}
