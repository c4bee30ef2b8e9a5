//! Stream objects.

use crate::error::{Error, Result};
use crate::filter;
use crate::object::dict::keys::{DECODE_PARMS, DECODE_PARMS_ABBREVIATION, FILTER, FLATE_DECODE, FLATE_DECODE_ABBREVIATION};
use crate::object::dict::Dict;
use crate::object::{Name, Object};
use log::warn;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, OnceLock};

/// A stream of arbitrary data, with its stream dictionary.
///
/// The raw data has already been through the decryption transform (unless
/// suppressed); decoding the filter chain happens lazily and is memoized.
#[derive(Clone)]
pub struct Stream(Arc<Repr>);

struct Repr {
    dict: Dict,
    data: Vec<u8>,
    decoded: OnceLock<Result<Vec<u8>>>,
}

impl Stream {
    pub(crate) fn new(dict: Dict, data: Vec<u8>) -> Self {
        Self(Arc::new(Repr {
            dict,
            data,
            decoded: OnceLock::new(),
        }))
    }

    /// The stream dictionary.
    pub fn dict(&self) -> &Dict {
        &self.0.dict
    }

    /// Return the raw (potentially still filtered) data of the stream.
    pub fn raw_data(&self) -> &[u8] {
        &self.0.data
    }

    /// Return the decoded data of the stream.
    ///
    /// The result is computed once and cached.
    pub fn decoded(&self) -> Result<&[u8]> {
        self.0
            .decoded
            .get_or_init(|| decode(&self.0.dict, &self.0.data))
            .as_deref()
            .map_err(Clone::clone)
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.dict == other.0.dict && self.0.data == other.0.data)
    }
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Stream (len: {})", self.0.data.len())
    }
}

fn decode(dict: &Dict, data: &[u8]) -> Result<Vec<u8>> {
    // Filter specifications in the stream dictionaries this core decodes
    // (cross-reference and object streams) are required to be direct.
    let filters: Vec<Name> = match dict.get_raw(FILTER) {
        None => return Ok(data.to_vec()),
        Some(Object::Name(n)) => vec![n.clone()],
        Some(Object::Array(a)) => {
            let mut names = vec![];
            for el in a.iter() {
                match el {
                    Object::Name(n) => names.push(n.clone()),
                    _ => return Err(Error::Format("non-name entry in filter array")),
                }
            }
            names
        }
        Some(_) => return Err(Error::Format("indirect or malformed filter specification")),
    };

    let params: Vec<Option<Dict>> = match dict.get_raw2(DECODE_PARMS, DECODE_PARMS_ABBREVIATION) {
        None => vec![None; filters.len()],
        Some(Object::Dict(d)) => vec![Some(d.clone())],
        Some(Object::Array(a)) => a
            .iter()
            .map(|el| match el {
                Object::Dict(d) => Some(d.clone()),
                _ => None,
            })
            .collect(),
        Some(Object::Null) => vec![None; filters.len()],
        Some(_) => vec![None; filters.len()],
    };

    let mut current = data.to_vec();

    for (i, f) in filters.iter().enumerate() {
        let params = params.get(i).cloned().flatten();

        current = match f.as_bytes() {
            f if f == FLATE_DECODE || f == FLATE_DECODE_ABBREVIATION => {
                filter::flate_decode(&current, params.as_ref())?
            }
            _ => {
                warn!("stream uses a filter this core does not decode: {f:?}");

                return Err(Error::Format("unsupported filter"));
            }
        };
    }

    Ok(current)
}
