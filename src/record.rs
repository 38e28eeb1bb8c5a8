//! Record codec: one row's field values to the payload stored in the heap.
//!
//! ```text
//! +-------------------+-----------------------------------------------+
//! | null bitmask      | values of the non-null fields, schema order   |
//! | ceil(nullable/8)  | (object id skipped, geometry = len + blob)    |
//! +-------------------+-----------------------------------------------+
//! ```
//!
//! One bit per nullable field, in schema order; a SET bit means NULL.
//! The mask starts as all ones and every written value clears its bit.

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::bintuco::{write_utf16_string, write_utf8_string, write_var_uint, BintucoEncode, ByteReader};
use crate::config::TextEncoding;
use crate::constant::{GUID_BYTES, GUID_TEXT_LEN, SECONDS_PER_DAY};
use crate::dberror::DbError;
use crate::geometry::Geometry;
use crate::schema::{Extent, FieldKind, FieldValue, TableSchema};
use crate::shape::{decode_geometry, encode_geometry};

/// Encoded payload, plus the extent of its geometry for the running bbox.
#[derive(Debug)]
pub struct EncodedRecord {
    pub bytes: Vec<u8>,
    pub extent: Option<Extent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub values: Vec<Option<FieldValue>>,
    pub geometry: Option<Geometry>,
}

fn datetime_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub fn datetime_to_days(dt: &NaiveDateTime) -> f64 {
    let delta = *dt - datetime_epoch();
    delta.num_milliseconds() as f64 / (SECONDS_PER_DAY * 1000.0)
}

pub fn days_to_datetime(days: f64) -> Result<NaiveDateTime, DbError> {
    let millis = (days * SECONDS_PER_DAY * 1000.0).round();
    if !millis.is_finite() || millis.abs() > 1e17 {
        return Err(DbError::corrupt(format!("date-time {} days out of range", days)));
    }
    datetime_epoch()
        .checked_add_signed(Duration::milliseconds(millis as i64))
        .ok_or_else(|| DbError::corrupt(format!("date-time {} days out of range", days)))
}

// text byte k is stored at position GUID_ORDER[k]
const GUID_ORDER: [usize; GUID_BYTES] = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];
const GUID_DASHES: [usize; 4] = [9, 14, 19, 24];

pub fn encode_guid(text: &str, out: &mut Vec<u8>) -> Result<(), DbError> {
    let b = text.as_bytes();
    let bad = || DbError::constraint(format!("'{}' is not a {{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}} guid", text));
    if b.len() != GUID_TEXT_LEN || b[0] != b'{' || b[GUID_TEXT_LEN - 1] != b'}' {
        return Err(bad());
    }
    if GUID_DASHES.iter().any(|&i| b[i] != b'-') {
        return Err(bad());
    }
    let hex: Vec<u8> = b[1..GUID_TEXT_LEN - 1].iter().copied().filter(|c| *c != b'-').collect();
    if hex.len() != GUID_BYTES * 2 || !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(bad());
    }
    let mut stored = [0u8; GUID_BYTES];
    for k in 0..GUID_BYTES {
        let pair = std::str::from_utf8(&hex[2 * k..2 * k + 2]).map_err(|_| bad())?;
        stored[GUID_ORDER[k]] = u8::from_str_radix(pair, 16).map_err(|_| bad())?;
    }
    out.extend_from_slice(&stored);
    Ok(())
}

pub fn decode_guid(stored: &[u8]) -> String {
    let t: Vec<u8> = (0..GUID_BYTES).map(|k| stored[GUID_ORDER[k]]).collect();
    format!(
        "{{{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
        t[0], t[1], t[2], t[3], t[4], t[5], t[6], t[7], t[8], t[9], t[10], t[11], t[12], t[13], t[14], t[15]
    )
}

fn mismatch(field: &str, kind: &FieldKind, value: &FieldValue) -> DbError {
    DbError::constraint(format!("field '{}' of type {} cannot hold {:?}", field, kind.name(), value))
}

/// Encodes `values` (aligned with the schema) and the geometry value.
///
/// The object id and geometry slots of `values` must be `None`; the
/// geometry travels in `geometry`. Nothing outside the returned buffer is
/// touched, so a failure leaves the table as it was.
pub fn encode_feature(
    schema: &TableSchema,
    text: TextEncoding,
    values: &[Option<FieldValue>],
    geometry: Option<&Geometry>,
) -> Result<EncodedRecord, DbError> {
    if values.len() != schema.len() {
        return Err(DbError::constraint(format!(
            "{} values given for {} fields",
            values.len(),
            schema.len()
        )));
    }
    if geometry.is_some() && schema.geometry_index().is_none() {
        return Err(DbError::constraint("geometry given for a table without geometry field"));
    }

    let mask_len = (schema.nullable_count() + 7) / 8;
    let mut out = vec![0xFFu8; mask_len];
    let mut extent = None;
    let mut bit = 0usize;

    for (field, value) in schema.fields().iter().zip(values) {
        if field.kind == FieldKind::ObjectId {
            if value.is_some() {
                return Err(DbError::constraint(format!("object id field '{}' is assigned by the table", field.name)));
            }
            continue;
        }

        if let FieldKind::Geometry(def) = &field.kind {
            if value.is_some() {
                return Err(DbError::constraint(format!("geometry field '{}' takes its value separately", field.name)));
            }
            match geometry {
                None => {
                    if !field.nullable {
                        return Err(DbError::constraint(format!("geometry field '{}' is not nullable", field.name)));
                    }
                    bit += 1;
                }
                Some(g) => {
                    if !def.accepts(g) {
                        return Err(DbError::constraint(format!(
                            "geometry field '{}' does not accept a {}",
                            field.name,
                            g.type_name()
                        )));
                    }
                    let blob = encode_geometry(g, &def.quant)?;
                    extent = Extent::of_geometry(g);
                    write_var_uint(&mut out, blob.len() as u64);
                    out.extend_from_slice(&blob);
                    if field.nullable {
                        out[bit / 8] &= !(1 << (bit % 8));
                        bit += 1;
                    }
                }
            }
            continue;
        }

        let value = match value {
            None => {
                if !field.nullable {
                    return Err(DbError::constraint(format!("field '{}' is not nullable", field.name)));
                }
                bit += 1;
                continue;
            }
            Some(v) => v,
        };

        match (&field.kind, value) {
            (FieldKind::Int16, FieldValue::Int16(v)) => v.encode(&mut out),
            (FieldKind::Int32, FieldValue::Int32(v)) => v.encode(&mut out),
            (FieldKind::Float32, FieldValue::Float32(v)) => v.encode(&mut out),
            (FieldKind::Float64, FieldValue::Float64(v)) => v.encode(&mut out),
            (FieldKind::String, FieldValue::String(s)) => match text {
                TextEncoding::Utf8 => write_utf8_string(&mut out, s),
                TextEncoding::Utf16 => write_utf16_string(&mut out, s),
            },
            (FieldKind::Xml, FieldValue::String(s)) => write_utf8_string(&mut out, s),
            (FieldKind::DateTime, FieldValue::DateTime(dt)) => datetime_to_days(dt).encode(&mut out),
            (FieldKind::Binary, FieldValue::Binary(b)) => {
                write_var_uint(&mut out, b.len() as u64);
                out.extend_from_slice(b);
            }
            (FieldKind::Guid | FieldKind::GlobalId, FieldValue::Guid(s)) => encode_guid(s, &mut out)?,
            (kind, v) => return Err(mismatch(&field.name, kind, v)),
        }
        if field.nullable {
            out[bit / 8] &= !(1 << (bit % 8));
            bit += 1;
        }
    }

    // negative lengths mark tombstones, so payloads stay below i32::MAX
    if out.len() > i32::MAX as usize {
        return Err(DbError::RecordTooLarge(format!("record of {} bytes", out.len())));
    }
    Ok(EncodedRecord { bytes: out, extent })
}

/// Decodes a payload. Trailing bytes past the last field (slot padding)
/// are ignored. The object id slot is left `None`.
pub fn decode_feature(schema: &TableSchema, text: TextEncoding, payload: &[u8]) -> Result<DecodedRecord, DbError> {
    let mask_len = (schema.nullable_count() + 7) / 8;
    let mut r = ByteReader::new(payload);
    let mask = r.read_bytes(mask_len)?;
    let mut values = Vec::with_capacity(schema.len());
    let mut geometry = None;
    let mut bit = 0usize;

    for field in schema.fields() {
        if field.kind == FieldKind::ObjectId {
            values.push(None);
            continue;
        }
        if field.nullable {
            let is_null = mask[bit / 8] & (1 << (bit % 8)) != 0;
            bit += 1;
            if is_null {
                values.push(None);
                continue;
            }
        }
        let value = match &field.kind {
            FieldKind::Int16 => FieldValue::Int16(r.read()?),
            FieldKind::Int32 => FieldValue::Int32(r.read()?),
            FieldKind::Float32 => FieldValue::Float32(r.read()?),
            FieldKind::Float64 => FieldValue::Float64(r.read()?),
            FieldKind::String => FieldValue::String(match text {
                TextEncoding::Utf8 => r.read_utf8_string()?,
                TextEncoding::Utf16 => r.read_utf16_string()?,
            }),
            FieldKind::Xml => FieldValue::String(r.read_utf8_string()?),
            FieldKind::DateTime => FieldValue::DateTime(days_to_datetime(r.read::<f64>()?)?),
            FieldKind::Binary => {
                let len = r.read_var_uint()? as usize;
                FieldValue::Binary(r.read_bytes(len)?.to_vec())
            }
            FieldKind::Guid | FieldKind::GlobalId => FieldValue::Guid(decode_guid(r.read_bytes(GUID_BYTES)?)),
            FieldKind::Geometry(def) => {
                let len = r.read_var_uint()? as usize;
                geometry = decode_geometry(r.read_bytes(len)?, &def.quant)?;
                values.push(None);
                continue;
            }
            FieldKind::ObjectId => unreachable!("object id handled above"),
        };
        values.push(Some(value));
    }
    Ok(DecodedRecord { values, geometry })
}
