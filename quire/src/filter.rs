//! Stream filters needed by the resolution core: FlateDecode plus predictors.

use crate::error::{Error, Result};
use crate::object::dict::Dict;
use crate::object::dict::keys::{BITS_PER_COMPONENT, COLORS, COLUMNS, PREDICTOR};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use std::io::Read;

struct PredictorParams {
    predictor: u8,
    colors: u8,
    bits_per_component: u8,
    columns: usize,
}

impl Default for PredictorParams {
    fn default() -> Self {
        Self {
            predictor: 1,
            colors: 1,
            bits_per_component: 8,
            columns: 1,
        }
    }
}

impl PredictorParams {
    fn from_params(dict: &Dict) -> Self {
        let int = |key: &[u8], default: i64| {
            dict.get_raw(key)
                .and_then(|o| o.as_int())
                .unwrap_or(default)
        };

        Self {
            predictor: int(PREDICTOR, 1).clamp(1, 15) as u8,
            colors: int(COLORS, 1).clamp(1, 32) as u8,
            bits_per_component: int(BITS_PER_COMPONENT, 8).clamp(1, 16) as u8,
            columns: int(COLUMNS, 1).max(1) as usize,
        }
    }

    fn bytes_per_pixel(&self) -> usize {
        ((self.bits_per_component as usize * self.colors as usize) + 7) / 8
    }

    fn row_length_in_bytes(&self) -> usize {
        (self.columns * self.colors as usize * self.bits_per_component as usize + 7) / 8
    }
}

/// Decode flate-compressed data, applying the predictor from the decode
/// parameters.
pub(crate) fn flate_decode(data: &[u8], params: Option<&Dict>) -> Result<Vec<u8>> {
    let decoded = zlib(data)
        .or_else(|| deflate(data))
        .ok_or(Error::Format("corrupt flate stream"))?;
    let params = params.map(PredictorParams::from_params).unwrap_or_default();

    apply_predictor(decoded, &params)
}

fn zlib(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = vec![];
    ZlibDecoder::new(data).read_to_end(&mut out).ok()?;

    Some(out)
}

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = vec![];
    DeflateDecoder::new(data).read_to_end(&mut out).ok()?;

    Some(out)
}

fn apply_predictor(data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    match params.predictor {
        1 => Ok(data),
        2 => tiff_predictor(data, params),
        10..=15 => png_predictor(data, params),
        _ => Err(Error::Format("unknown predictor")),
    }
}

fn tiff_predictor(mut data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    if params.bits_per_component != 8 {
        return Err(Error::Format("unsupported TIFF predictor component size"));
    }

    let bpp = params.bytes_per_pixel();
    let row_len = params.row_length_in_bytes();

    for row in data.chunks_mut(row_len) {
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
    }

    Ok(data)
}

fn png_predictor(data: Vec<u8>, params: &PredictorParams) -> Result<Vec<u8>> {
    let bpp = params.bytes_per_pixel();
    let row_len = params.row_length_in_bytes();
    // Each row starts with the byte naming the filter in use for that row.
    let num_rows = data.len() / (row_len + 1);

    if num_rows * (row_len + 1) != data.len() {
        return Err(Error::Format("predicted data is not a whole number of rows"));
    }

    let mut out = vec![0u8; num_rows * row_len];

    for row_idx in 0..num_rows {
        let in_row = &data[row_idx * (row_len + 1)..(row_idx + 1) * (row_len + 1)];
        let filter = in_row[0];
        let in_row = &in_row[1..];

        let (prev_rows, cur) = out.split_at_mut(row_idx * row_len);
        let prev = prev_rows.get(prev_rows.len().wrapping_sub(row_len)..);
        let cur = &mut cur[..row_len];

        match filter {
            0 => cur.copy_from_slice(in_row),
            // Sub
            1 => {
                for i in 0..row_len {
                    let left = if i >= bpp { cur[i - bpp] } else { 0 };
                    cur[i] = in_row[i].wrapping_add(left);
                }
            }
            // Up
            2 => {
                for i in 0..row_len {
                    let up = prev.map(|p| p[i]).unwrap_or(0);
                    cur[i] = in_row[i].wrapping_add(up);
                }
            }
            // Average
            3 => {
                for i in 0..row_len {
                    let left = if i >= bpp { cur[i - bpp] } else { 0 } as u16;
                    let up = prev.map(|p| p[i]).unwrap_or(0) as u16;
                    cur[i] = in_row[i].wrapping_add(((left + up) / 2) as u8);
                }
            }
            // Paeth
            4 => {
                for i in 0..row_len {
                    let left = if i >= bpp { cur[i - bpp] } else { 0 };
                    let up = prev.map(|p| p[i]).unwrap_or(0);
                    let up_left = if i >= bpp {
                        prev.map(|p| p[i - bpp]).unwrap_or(0)
                    } else {
                        0
                    };
                    cur[i] = in_row[i].wrapping_add(paeth(left, up, up_left));
                }
            }
            _ => return Err(Error::Format("unknown PNG row filter")),
        }
    }

    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();

    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use crate::filter::{PredictorParams, apply_predictor, flate_decode};
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    #[test]
    fn roundtrip_plain() {
        let mut enc = ZlibEncoder::new(vec![], Compression::default());
        enc.write_all(b"some xref data").unwrap();
        let data = enc.finish().unwrap();

        assert_eq!(flate_decode(&data, None).unwrap(), b"some xref data");
    }

    #[test]
    fn png_up_rows() {
        // Two rows of four bytes, all rows filtered with Up (2).
        let params = PredictorParams {
            predictor: 12,
            colors: 1,
            bits_per_component: 8,
            columns: 4,
        };
        let data = vec![
            2, 1, 2, 3, 4, // row 0: no previous row, deltas are absolute
            2, 1, 1, 1, 1, // row 1: adds to row 0
        ];

        let out = apply_predictor(data, &params).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 2, 3, 4, 5]);
    }

    #[test]
    fn ragged_rows_rejected() {
        let params = PredictorParams {
            predictor: 12,
            colors: 1,
            bits_per_component: 8,
            columns: 4,
        };
        assert!(apply_predictor(vec![2, 1, 2], &params).is_err());
    }
}
