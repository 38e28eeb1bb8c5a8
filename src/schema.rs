//! Field schema of a table and its on-disk descriptor block.
//!
//! The descriptor block sits right after the heap header (and the
//! creator block when present):
//!
//! ```text
//! +-----------+-----------+---------+-------------------------------------------+
//! | u32 ver=4 | u32 flags | u16 cnt | field * cnt                               |
//! +-----------+-----------+---------+-------------------------------------------+
//!   flags bit 0: strings stored as UTF-16
//!
//!   field = [u8 len][name utf-16] [u8 type] [u8 nullable]
//!           geometry only: [u8 class] [u8 z] [u8 m] [f64 * 7 quantization]
//!                          [f64 * 8 extent]   <- patched in place on sync
//! ```

use chrono::NaiveDateTime;

use crate::bintuco::{write_short_utf16, BintucoEncode, ByteReader};
use crate::config::TextEncoding;
use crate::constant::FIELD_DESC_VERSION;
use crate::dberror::DbError;
use crate::geometry::Geometry;
use crate::shape::{Quantization, ShapeClass};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Int16,
    Int32,
    Float32,
    Float64,
    String,
    /// Always stored as UTF-8, whatever the table text encoding.
    Xml,
    DateTime,
    Binary,
    Guid,
    GlobalId,
    /// Implicit row id, never stored in records.
    ObjectId,
    Geometry(GeometryDef),
}

impl FieldKind {
    pub fn type_code(&self) -> u8 {
        match self {
            FieldKind::Int16 => 0,
            FieldKind::Int32 => 1,
            FieldKind::Float32 => 2,
            FieldKind::Float64 => 3,
            FieldKind::String => 4,
            FieldKind::DateTime => 5,
            FieldKind::ObjectId => 6,
            FieldKind::Geometry(_) => 7,
            FieldKind::Binary => 8,
            FieldKind::Guid => 10,
            FieldKind::GlobalId => 11,
            FieldKind::Xml => 12,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Int16 => "int16",
            FieldKind::Int32 => "int32",
            FieldKind::Float32 => "float32",
            FieldKind::Float64 => "float64",
            FieldKind::String => "string",
            FieldKind::Xml => "xml",
            FieldKind::DateTime => "datetime",
            FieldKind::Binary => "binary",
            FieldKind::Guid => "guid",
            FieldKind::GlobalId => "globalid",
            FieldKind::ObjectId => "objectid",
            FieldKind::Geometry(_) => "geometry",
        }
    }
}

/// Declared shape and quantization of the geometry field.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryDef {
    pub class: ShapeClass,
    pub has_z: bool,
    pub has_m: bool,
    pub quant: Quantization,
}

impl GeometryDef {
    pub fn new(class: ShapeClass, quant: Quantization) -> Self {
        GeometryDef { class, has_z: false, has_m: false, quant }
    }

    pub fn with_z(mut self) -> Self {
        self.has_z = true;
        self
    }

    pub fn with_m(mut self) -> Self {
        self.has_m = true;
        self
    }

    /// The family a geometry value must belong to for this field.
    pub fn accepts(&self, geom: &Geometry) -> bool {
        let class = match geom {
            Geometry::Point(_) => ShapeClass::Point,
            Geometry::MultiPoint(_) => ShapeClass::MultiPoint,
            Geometry::Curve(_) | Geometry::MultiCurve(_) => ShapeClass::Polyline,
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) => ShapeClass::Polygon,
            Geometry::Tin(_) | Geometry::PolyhedralSurface(_) | Geometry::GeometryCollection(_) | Geometry::MultiPatch(_) => {
                ShapeClass::MultiPatch
            }
        };
        class == self.class
    }
}

fn class_code(class: ShapeClass) -> u8 {
    match class {
        ShapeClass::Null => 0,
        ShapeClass::Point => 1,
        ShapeClass::MultiPoint => 2,
        ShapeClass::Polyline => 3,
        ShapeClass::Polygon => 4,
        ShapeClass::MultiPatch => 5,
    }
}

fn class_from_code(code: u8) -> Result<ShapeClass, DbError> {
    Ok(match code {
        1 => ShapeClass::Point,
        2 => ShapeClass::MultiPoint,
        3 => ShapeClass::Polyline,
        4 => ShapeClass::Polygon,
        5 => ShapeClass::MultiPatch,
        other => return Err(DbError::corrupt(format!("unknown geometry class {}", other))),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: &str, kind: FieldKind, nullable: bool) -> Self {
        Field { name: name.to_string(), kind, nullable }
    }

    pub fn object_id(name: &str) -> Self {
        Field::new(name, FieldKind::ObjectId, false)
    }

    pub fn geometry(name: &str, def: GeometryDef, nullable: bool) -> Self {
        Field::new(name, FieldKind::Geometry(def), nullable)
    }
}

/// One attribute value. `Guid` also carries global ids, `String` also XML.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int16(i16),
    Int32(i32),
    Float32(f32),
    Float64(f64),
    String(String),
    DateTime(NaiveDateTime),
    Binary(Vec<u8>),
    Guid(String),
}

/// Running bounding box of the geometry field; NaN until the first write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub zmin: f64,
    pub zmax: f64,
    pub mmin: f64,
    pub mmax: f64,
}

impl Default for Extent {
    fn default() -> Self {
        Extent::empty()
    }
}

fn merge_min(a: f64, b: f64) -> f64 {
    if a.is_nan() { b } else if b.is_nan() { a } else { a.min(b) }
}

fn merge_max(a: f64, b: f64) -> f64 {
    if a.is_nan() { b } else if b.is_nan() { a } else { a.max(b) }
}

impl Extent {
    pub fn empty() -> Self {
        Extent {
            xmin: f64::NAN,
            ymin: f64::NAN,
            xmax: f64::NAN,
            ymax: f64::NAN,
            zmin: f64::NAN,
            zmax: f64::NAN,
            mmin: f64::NAN,
            mmax: f64::NAN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xmin.is_nan()
    }

    pub fn of_geometry(geom: &Geometry) -> Option<Extent> {
        let coords = geom.coords();
        let mut e = Extent::empty();
        for c in coords.iter().filter(|c| !c.x.is_nan() && !c.y.is_nan()) {
            e.xmin = merge_min(e.xmin, c.x);
            e.ymin = merge_min(e.ymin, c.y);
            e.xmax = merge_max(e.xmax, c.x);
            e.ymax = merge_max(e.ymax, c.y);
            if let Some(z) = c.z {
                e.zmin = merge_min(e.zmin, z);
                e.zmax = merge_max(e.zmax, z);
            }
            if let Some(m) = c.m {
                e.mmin = merge_min(e.mmin, m);
                e.mmax = merge_max(e.mmax, m);
            }
        }
        if e.is_empty() { None } else { Some(e) }
    }

    pub fn merge(&mut self, o: &Extent) {
        self.xmin = merge_min(self.xmin, o.xmin);
        self.ymin = merge_min(self.ymin, o.ymin);
        self.xmax = merge_max(self.xmax, o.xmax);
        self.ymax = merge_max(self.ymax, o.ymax);
        self.zmin = merge_min(self.zmin, o.zmin);
        self.zmax = merge_max(self.zmax, o.zmax);
        self.mmin = merge_min(self.mmin, o.mmin);
        self.mmax = merge_max(self.mmax, o.mmax);
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        for v in [self.xmin, self.ymin, self.xmax, self.ymax, self.zmin, self.zmax, self.mmin, self.mmax] {
            v.encode(out);
        }
    }

    fn decode(r: &mut ByteReader) -> Result<Extent, DbError> {
        Ok(Extent {
            xmin: r.read()?,
            ymin: r.read()?,
            xmax: r.read()?,
            ymax: r.read()?,
            zmin: r.read()?,
            zmax: r.read()?,
            mmin: r.read()?,
            mmax: r.read()?,
        })
    }
}

// ══════════════════════════════════════ SCHEMA ══════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    fields: Vec<Field>,
}

impl TableSchema {
    /// At most one geometry and one object id field, object id not
    /// nullable, names unique (case-insensitive), positive scales.
    pub fn new(fields: Vec<Field>) -> Result<Self, DbError> {
        let mut geometry = 0;
        let mut object_id = 0;
        for (i, f) in fields.iter().enumerate() {
            if f.name.is_empty() {
                return Err(DbError::constraint(format!("field {} has an empty name", i)));
            }
            if fields[..i].iter().any(|o| o.name.eq_ignore_ascii_case(&f.name)) {
                return Err(DbError::constraint(format!("duplicate field name '{}'", f.name)));
            }
            match &f.kind {
                FieldKind::Geometry(def) => {
                    geometry += 1;
                    def.quant.validate()?;
                    if def.class == ShapeClass::Null {
                        return Err(DbError::constraint("geometry field needs a shape class"));
                    }
                }
                FieldKind::ObjectId => {
                    object_id += 1;
                    if f.nullable {
                        return Err(DbError::constraint("object id field cannot be nullable"));
                    }
                }
                _ => {}
            }
        }
        if geometry > 1 {
            return Err(DbError::constraint("a table holds at most one geometry field"));
        }
        if object_id > 1 {
            return Err(DbError::constraint("a table holds at most one object id field"));
        }
        Ok(TableSchema { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn geometry_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| matches!(f.kind, FieldKind::Geometry(_)))
    }

    pub fn geometry_def(&self) -> Option<&GeometryDef> {
        self.fields.iter().find_map(|f| match &f.kind {
            FieldKind::Geometry(def) => Some(def),
            _ => None,
        })
    }

    pub fn object_id_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.kind == FieldKind::ObjectId)
    }

    pub fn nullable_count(&self) -> usize {
        self.fields.iter().filter(|f| f.nullable && f.kind != FieldKind::ObjectId).count()
    }
}

// ══════════════════════════════════════ DESCRIPTOR BLOCK ══════════════════════════════════════

/// Encoded descriptor body plus the position of the extent inside it.
pub struct Descriptors {
    pub body: Vec<u8>,
    pub extent_offset: Option<usize>,
}

pub fn encode_descriptors(schema: &TableSchema, text: TextEncoding, extent: &Extent) -> Result<Descriptors, DbError> {
    let mut out = Vec::new();
    FIELD_DESC_VERSION.encode(&mut out);
    let flags: u32 = if text == TextEncoding::Utf16 { 1 } else { 0 };
    flags.encode(&mut out);
    let count = u16::try_from(schema.len()).map_err(|_| DbError::constraint("too many fields"))?;
    count.encode(&mut out);

    let mut extent_offset = None;
    for f in schema.fields() {
        write_short_utf16(&mut out, &f.name)?;
        f.kind.type_code().encode(&mut out);
        (f.nullable as u8).encode(&mut out);
        if let FieldKind::Geometry(def) = &f.kind {
            class_code(def.class).encode(&mut out);
            (def.has_z as u8).encode(&mut out);
            (def.has_m as u8).encode(&mut out);
            let q = &def.quant;
            for v in [q.x_origin, q.y_origin, q.xy_scale, q.z_origin, q.z_scale, q.m_origin, q.m_scale] {
                v.encode(&mut out);
            }
            extent_offset = Some(out.len());
            extent.encode(&mut out);
        }
    }
    Ok(Descriptors { body: out, extent_offset })
}

pub struct DecodedDescriptors {
    pub schema: TableSchema,
    pub text: TextEncoding,
    pub extent: Extent,
    pub extent_offset: Option<usize>,
}

pub fn decode_descriptors(body: &[u8]) -> Result<DecodedDescriptors, DbError> {
    let mut r = ByteReader::new(body);
    let version: u32 = r.read()?;
    if version != FIELD_DESC_VERSION {
        return Err(DbError::corrupt(format!("unsupported field descriptor version {}", version)));
    }
    let flags: u32 = r.read()?;
    let text = if flags & 1 != 0 { TextEncoding::Utf16 } else { TextEncoding::Utf8 };
    let count: u16 = r.read()?;

    let mut fields = Vec::with_capacity(count as usize);
    let mut extent = Extent::empty();
    let mut extent_offset = None;
    for _ in 0..count {
        let name = r.read_short_utf16()?;
        let code = r.read_u8()?;
        let nullable = r.read_u8()? != 0;
        let kind = match code {
            0 => FieldKind::Int16,
            1 => FieldKind::Int32,
            2 => FieldKind::Float32,
            3 => FieldKind::Float64,
            4 => FieldKind::String,
            5 => FieldKind::DateTime,
            6 => FieldKind::ObjectId,
            7 => {
                let class = class_from_code(r.read_u8()?)?;
                let has_z = r.read_u8()? != 0;
                let has_m = r.read_u8()? != 0;
                let quant = Quantization {
                    x_origin: r.read()?,
                    y_origin: r.read()?,
                    xy_scale: r.read()?,
                    z_origin: r.read()?,
                    z_scale: r.read()?,
                    m_origin: r.read()?,
                    m_scale: r.read()?,
                };
                extent_offset = Some(r.position());
                extent = Extent::decode(&mut r)?;
                FieldKind::Geometry(GeometryDef { class, has_z, has_m, quant })
            }
            8 => FieldKind::Binary,
            10 => FieldKind::Guid,
            11 => FieldKind::GlobalId,
            12 => FieldKind::Xml,
            other => return Err(DbError::corrupt(format!("unknown field type {} for '{}'", other, name))),
        };
        fields.push(Field { name, kind, nullable });
    }
    let schema = TableSchema::new(fields).map_err(|e| DbError::corrupt(format!("stored schema is invalid: {}", e)))?;
    Ok(DecodedDescriptors { schema, text, extent, extent_offset })
}

#[cfg(test)]
mod schema_test {
    use super::*;
    use crate::geometry::Coord;

    fn sample() -> TableSchema {
        TableSchema::new(vec![
            Field::object_id("OBJECTID"),
            Field::new("name", FieldKind::String, true),
            Field::geometry("SHAPE", GeometryDef::new(ShapeClass::Point, Quantization::new(-400.0, -400.0, 1e4)).with_z(), true),
            Field::new("when", FieldKind::DateTime, false),
        ])
        .unwrap()
    }

    #[test]
    fn schema_rules() {
        let geom = || Field::geometry("g", GeometryDef::new(ShapeClass::Point, Quantization::new(0.0, 0.0, 1.0)), true);
        let mut second = geom();
        second.name = "g2".to_string();
        assert!(TableSchema::new(vec![geom(), second]).is_err());
        assert!(TableSchema::new(vec![Field::object_id("a"), Field::object_id("b")]).is_err());
        assert!(TableSchema::new(vec![Field::new("id", FieldKind::ObjectId, true)]).is_err());
        assert!(TableSchema::new(vec![Field::new("a", FieldKind::Int16, true), Field::new("A", FieldKind::Int32, true)]).is_err());

        let bad_scale = Field::geometry("g", GeometryDef::new(ShapeClass::Point, Quantization::new(0.0, 0.0, 0.0)), true);
        assert!(matches!(TableSchema::new(vec![bad_scale]), Err(DbError::ConstraintViolation(_))));
    }

    #[test]
    fn schema_accessors() {
        let s = sample();
        assert_eq!(s.object_id_index(), Some(0));
        assert_eq!(s.geometry_index(), Some(2));
        assert_eq!(s.nullable_count(), 2);
        assert_eq!(s.index_of("NAME"), Some(1));
        assert!(s.geometry_def().unwrap().has_z);
    }

    #[test]
    fn descriptors_keep_extent_position() {
        let s = sample();
        let mut extent = Extent::empty();
        extent.merge(&Extent::of_geometry(&Geometry::Point(Coord::xyz(1.0, 2.0, 3.0))).unwrap());
        let d = encode_descriptors(&s, TextEncoding::Utf16, &extent).unwrap();
        let off = d.extent_offset.unwrap();
        assert_eq!(f64::from_le_bytes(d.body[off..off + 8].try_into().unwrap()), 1.0);

        let back = decode_descriptors(&d.body).unwrap();
        assert_eq!(back.schema, s);
        assert_eq!(back.text, TextEncoding::Utf16);
        assert_eq!(back.extent_offset, Some(off));
        assert_eq!(back.extent.zmax, 3.0);
        assert!(back.extent.mmin.is_nan());
    }

    #[test]
    fn extent_merge_ignores_nan() {
        let mut e = Extent::empty();
        assert!(e.is_empty());
        e.merge(&Extent::of_geometry(&Geometry::Point(Coord::xy(5.0, -1.0))).unwrap());
        e.merge(&Extent::of_geometry(&Geometry::Point(Coord::xy(-2.0, 4.0))).unwrap());
        assert_eq!((e.xmin, e.ymin, e.xmax, e.ymax), (-2.0, -1.0, 5.0, 4.0));
        assert!(e.zmin.is_nan());
    }
}
