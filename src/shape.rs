//! Geometry blob codec.
//!
//! A geometry is stored as a shape type varuint followed by quantized,
//! delta-coded coordinate streams:
//!
//! ```text
//!  Point       [tag] [x+1] [y+1] ([z+1]) ([m+1])                 varuints
//!  MultiPoint  [tag] [n] [env] [dx dy]*n ([dz]*n) ([dm]*n)
//!  Polyline /  [tag] [n] [parts] ([curves]) [env] [count]*(parts-1)
//!  Polygon           [dx dy]*n ([dz]*n) ([dm]*n) [curve descriptor]*curves
//!  MultiPatch  [tag] [n] [bufsize] [parts] [env] [count]*(parts-1)
//!                    [type]*parts [dx dy]*n [dz]*n
//!
//!  env = minx miny width height, varuints in quantized units
//!  dx  = signed varint delta from the previous quantized value
//!  curve descriptor = [start index] [u8 type] [f64 mid x] [f64 mid y] [u32 flags]
//! ```
//!
//! Every quantized value is `round((v - origin) * scale)`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::bintuco::{write_var_int, write_var_uint, BintucoEncode, ByteReader};
use crate::constant::{
    ARC_FLAG_DEFINED_IP, M_ABSENT_MARKER, SEGMENT_ARC, SEGMENT_BEZIER, SEGMENT_ELLIPSE, SHAPE_FLAG_CURVES,
    SHAPE_FLAG_M, SHAPE_FLAG_Z, SHAPE_TYPE_MASK,
};
use crate::dberror::DbError;
use crate::geometry::{Coord, Curve, Envelope, Geometry, Patch, PatchKind};

// ══════════════════════════════════════ SHAPE TYPES ══════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeType {
    Null,
    Point,
    PointZ,
    PointM,
    PointZM,
    MultiPoint,
    MultiPointZ,
    MultiPointM,
    MultiPointZM,
    Polyline,
    PolylineZ,
    PolylineM,
    PolylineZM,
    Polygon,
    PolygonZ,
    PolygonM,
    PolygonZM,
    MultiPatchM,
    MultiPatch,
    GeneralPolyline,
    GeneralPolygon,
    GeneralPoint,
    GeneralMultiPoint,
    GeneralMultiPatch,
}

/// Geometry family a shape type decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeClass {
    Null,
    Point,
    MultiPoint,
    Polyline,
    Polygon,
    MultiPatch,
}

const SHAPE_CODES: [(ShapeType, u32); 24] = [
    (ShapeType::Null, 0),
    (ShapeType::Point, 1),
    (ShapeType::Polyline, 3),
    (ShapeType::Polygon, 5),
    (ShapeType::MultiPoint, 8),
    (ShapeType::PointZ, 9),
    (ShapeType::PolylineZ, 10),
    (ShapeType::PointZM, 11),
    (ShapeType::PolylineZM, 13),
    (ShapeType::PolygonZM, 15),
    (ShapeType::MultiPointZM, 18),
    (ShapeType::PolygonZ, 19),
    (ShapeType::MultiPointZ, 20),
    (ShapeType::PointM, 21),
    (ShapeType::PolylineM, 23),
    (ShapeType::PolygonM, 25),
    (ShapeType::MultiPointM, 28),
    (ShapeType::MultiPatchM, 31),
    (ShapeType::MultiPatch, 32),
    (ShapeType::GeneralPolyline, 50),
    (ShapeType::GeneralPolygon, 51),
    (ShapeType::GeneralPoint, 52),
    (ShapeType::GeneralMultiPoint, 53),
    (ShapeType::GeneralMultiPatch, 54),
];

impl ShapeType {
    pub fn code(self) -> u32 {
        SHAPE_CODES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn from_code(code: u32) -> Result<Self, DbError> {
        SHAPE_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(t, _)| *t)
            .ok_or_else(|| DbError::corrupt(format!("unknown shape type {}", code)))
    }

    pub fn class(self) -> ShapeClass {
        use ShapeType::*;
        match self {
            Null => ShapeClass::Null,
            Point | PointZ | PointM | PointZM | GeneralPoint => ShapeClass::Point,
            MultiPoint | MultiPointZ | MultiPointM | MultiPointZM | GeneralMultiPoint => ShapeClass::MultiPoint,
            Polyline | PolylineZ | PolylineM | PolylineZM | GeneralPolyline => ShapeClass::Polyline,
            Polygon | PolygonZ | PolygonM | PolygonZM | GeneralPolygon => ShapeClass::Polygon,
            MultiPatchM | MultiPatch | GeneralMultiPatch => ShapeClass::MultiPatch,
        }
    }

    fn is_general(self) -> bool {
        matches!(
            self,
            ShapeType::GeneralPolyline
                | ShapeType::GeneralPolygon
                | ShapeType::GeneralPoint
                | ShapeType::GeneralMultiPoint
                | ShapeType::GeneralMultiPatch
        )
    }

    /// Z and M presence: fixed by the code, or carried in the high flag
    /// bits for the general types.
    pub fn dimensions(self, raw: u32) -> (bool, bool) {
        use ShapeType::*;
        if self.is_general() {
            return (raw & SHAPE_FLAG_Z != 0, raw & SHAPE_FLAG_M != 0);
        }
        match self {
            PointZ | MultiPointZ | PolylineZ | PolygonZ | MultiPatch => (true, false),
            PointZM | MultiPointZM | PolylineZM | PolygonZM | MultiPatchM => (true, true),
            PointM | MultiPointM | PolylineM | PolygonM => (false, true),
            _ => (false, false),
        }
    }

    fn for_class(class: ShapeClass, z: bool, m: bool) -> ShapeType {
        use ShapeType::*;
        match (class, z, m) {
            (ShapeClass::Point, false, false) => Point,
            (ShapeClass::Point, true, false) => PointZ,
            (ShapeClass::Point, false, true) => PointM,
            (ShapeClass::Point, true, true) => PointZM,
            (ShapeClass::MultiPoint, false, false) => MultiPoint,
            (ShapeClass::MultiPoint, true, false) => MultiPointZ,
            (ShapeClass::MultiPoint, false, true) => MultiPointM,
            (ShapeClass::MultiPoint, true, true) => MultiPointZM,
            (ShapeClass::Polyline, false, false) => Polyline,
            (ShapeClass::Polyline, true, false) => PolylineZ,
            (ShapeClass::Polyline, false, true) => PolylineM,
            (ShapeClass::Polyline, true, true) => PolylineZM,
            (ShapeClass::Polygon, false, false) => Polygon,
            (ShapeClass::Polygon, true, false) => PolygonZ,
            (ShapeClass::Polygon, false, true) => PolygonM,
            (ShapeClass::Polygon, true, true) => PolygonZM,
            (ShapeClass::MultiPatch, _, _) => MultiPatch,
            (ShapeClass::Null, _, _) => Null,
        }
    }
}

// ══════════════════════════════════════ QUANTIZATION ══════════════════════════════════════

/// Per-axis origin and scale of a geometry field. X and Y share a scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
    pub x_origin: f64,
    pub y_origin: f64,
    pub xy_scale: f64,
    pub z_origin: f64,
    pub z_scale: f64,
    pub m_origin: f64,
    pub m_scale: f64,
}

impl Quantization {
    pub fn new(x_origin: f64, y_origin: f64, xy_scale: f64) -> Self {
        Quantization {
            x_origin,
            y_origin,
            xy_scale,
            z_origin: -100_000.0,
            z_scale: 10_000.0,
            m_origin: -100_000.0,
            m_scale: 10_000.0,
        }
    }

    pub fn with_z(mut self, origin: f64, scale: f64) -> Self {
        self.z_origin = origin;
        self.z_scale = scale;
        self
    }

    pub fn with_m(mut self, origin: f64, scale: f64) -> Self {
        self.m_origin = origin;
        self.m_scale = scale;
        self
    }

    pub fn validate(&self) -> Result<(), DbError> {
        for (name, s) in [("xy", self.xy_scale), ("z", self.z_scale), ("m", self.m_scale)] {
            if !(s.is_finite() && s > 0.0) {
                return Err(DbError::constraint(format!("{} scale must be positive, got {}", name, s)));
            }
        }
        Ok(())
    }
}

// 2^63 and 2^64 are exact in f64
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

fn quantize(v: f64, origin: f64, scale: f64, last: i64, axis: &str) -> Result<i64, DbError> {
    let q = ((v - origin) * scale).round();
    if !(q >= -TWO_POW_63 && q < TWO_POW_63) {
        return Err(DbError::EncodingRange(format!("cannot encode {} value {}", axis, v)));
    }
    let n = q as i64;
    if n.checked_sub(last).is_none() {
        return Err(DbError::EncodingRange(format!("cannot encode {} delta for value {}", axis, v)));
    }
    Ok(n)
}

fn var_uint_value(v: f64, what: &str) -> Result<u64, DbError> {
    if !(v >= 0.0 && v < TWO_POW_64) {
        return Err(DbError::EncodingRange(format!("cannot encode {} on a varuint: {}", what, v)));
    }
    Ok((v + 0.5) as u64)
}

// ══════════════════════════════════════ ENCODER ══════════════════════════════════════

/// Coordinate streams of a multi-part geometry, filled part by part.
#[derive(Default)]
struct PartStreams {
    coords: Vec<Coord>,
    part_counts: Vec<u32>,
    curve_part: Vec<u8>,
    curve_count: u32,
}

impl PartStreams {
    fn push_part(&mut self, curve: &Curve) -> Result<(), DbError> {
        let before = self.coords.len();
        self.push_section(curve, true)?;
        self.part_counts.push((self.coords.len() - before) as u32);
        Ok(())
    }

    fn push_section(&mut self, curve: &Curve, first: bool) -> Result<(), DbError> {
        match curve {
            Curve::Line(pts) => {
                let skip = if first { 0 } else { 1 };
                self.coords.extend(pts.iter().skip(skip).copied());
            }
            Curve::Arc(pts) => {
                if pts.len() < 3 || pts.len() % 2 == 0 {
                    return Err(DbError::UnsupportedGeometry(format!(
                        "circular string needs an odd number of points >= 3, got {}",
                        pts.len()
                    )));
                }
                // only even vertices are stored, each odd one becomes a descriptor
                for i in (0..pts.len()).step_by(2) {
                    if i > 0 || first {
                        self.coords.push(pts[i]);
                    }
                    if i + 1 < pts.len() {
                        self.curve_count += 1;
                        write_var_uint(&mut self.curve_part, (self.coords.len() - 1) as u64);
                        SEGMENT_ARC.encode(&mut self.curve_part);
                        pts[i + 1].x.encode(&mut self.curve_part);
                        pts[i + 1].y.encode(&mut self.curve_part);
                        ARC_FLAG_DEFINED_IP.encode(&mut self.curve_part);
                    }
                }
            }
            Curve::Compound(parts) => {
                for (k, part) in parts.iter().enumerate() {
                    self.push_section(part, first && k == 0)?;
                }
            }
        }
        Ok(())
    }

    fn write_tail(&self, out: &mut Vec<u8>, q: &Quantization, env: Option<Envelope>, z: bool, m: bool) -> Result<(), DbError> {
        write_var_uint(out, self.coords.len() as u64);
        if self.coords.is_empty() {
            return Ok(());
        }
        write_var_uint(out, self.part_counts.len() as u64);
        if self.curve_count > 0 {
            write_var_uint(out, self.curve_count as u64);
        }
        write_envelope(out, q, env)?;
        for count in &self.part_counts[..self.part_counts.len().saturating_sub(1)] {
            write_var_uint(out, *count as u64);
        }
        write_coord_streams(out, q, &self.coords, z, m)?;
        out.extend_from_slice(&self.curve_part);
        Ok(())
    }
}

fn write_envelope(out: &mut Vec<u8>, q: &Quantization, env: Option<Envelope>) -> Result<(), DbError> {
    let env = env.ok_or_else(|| DbError::UnsupportedGeometry("geometry without vertices".to_string()))?;
    write_var_uint(out, var_uint_value((env.xmin - q.x_origin) * q.xy_scale, "envelope x")?);
    write_var_uint(out, var_uint_value((env.ymin - q.y_origin) * q.xy_scale, "envelope y")?);
    write_var_uint(out, var_uint_value((env.xmax - env.xmin) * q.xy_scale, "envelope width")?);
    write_var_uint(out, var_uint_value((env.ymax - env.ymin) * q.xy_scale, "envelope height")?);
    Ok(())
}

fn write_coord_streams(out: &mut Vec<u8>, q: &Quantization, coords: &[Coord], z: bool, m: bool) -> Result<(), DbError> {
    let (mut last_x, mut last_y) = (0i64, 0i64);
    for c in coords {
        let nx = quantize(c.x, q.x_origin, q.xy_scale, last_x, "X")?;
        write_var_int(out, nx - last_x);
        let ny = quantize(c.y, q.y_origin, q.xy_scale, last_y, "Y")?;
        write_var_int(out, ny - last_y);
        last_x = nx;
        last_y = ny;
    }
    if z {
        let mut last = 0i64;
        for c in coords {
            let n = quantize(c.z.unwrap_or(0.0), q.z_origin, q.z_scale, last, "Z")?;
            write_var_int(out, n - last);
            last = n;
        }
    }
    if m {
        let mut last = 0i64;
        for c in coords {
            let n = quantize(c.m.unwrap_or(0.0), q.m_origin, q.m_scale, last, "M")?;
            write_var_int(out, n - last);
            last = n;
        }
    }
    Ok(())
}

fn curve_tag(class: ShapeClass, has_curves: bool, z: bool, m: bool) -> u64 {
    if has_curves {
        let base = if class == ShapeClass::Polygon {
            ShapeType::GeneralPolygon
        } else {
            ShapeType::GeneralPolyline
        };
        let mut tag = base.code() | SHAPE_FLAG_CURVES;
        if m {
            tag |= SHAPE_FLAG_M;
        }
        if z {
            tag |= SHAPE_FLAG_Z;
        }
        tag as u64
    } else {
        ShapeType::for_class(class, z, m).code() as u64
    }
}

/// Encodes one geometry value. Fails with `EncodingRange` when a coordinate
/// does not fit the quantized streams and `UnsupportedGeometry` for shapes
/// the format cannot hold.
pub fn encode_geometry(geom: &Geometry, q: &Quantization) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::new();
    let z = geom.has_z();
    let m = geom.has_m();

    match geom {
        Geometry::Point(c) => {
            write_var_uint(&mut out, ShapeType::for_class(ShapeClass::Point, z, m).code() as u64);
            write_var_uint(&mut out, var_uint_value((c.x - q.x_origin) * q.xy_scale + 1.0, "X")?);
            write_var_uint(&mut out, var_uint_value((c.y - q.y_origin) * q.xy_scale + 1.0, "Y")?);
            if z {
                let v = c.z.unwrap_or(0.0);
                write_var_uint(&mut out, var_uint_value((v - q.z_origin) * q.z_scale + 1.0, "Z")?);
            }
            if m {
                let v = c.m.unwrap_or(0.0);
                write_var_uint(&mut out, var_uint_value((v - q.m_origin) * q.m_scale + 1.0, "M")?);
            }
        }
        Geometry::MultiPoint(pts) => {
            write_var_uint(&mut out, ShapeType::for_class(ShapeClass::MultiPoint, z, m).code() as u64);
            write_var_uint(&mut out, pts.len() as u64);
            if !pts.is_empty() {
                write_envelope(&mut out, q, geom.envelope())?;
                write_coord_streams(&mut out, q, pts, z, m)?;
            }
        }
        Geometry::Curve(_) | Geometry::MultiCurve(_) => {
            let mut streams = PartStreams::default();
            match geom {
                Geometry::Curve(c) => streams.push_part(c)?,
                Geometry::MultiCurve(cs) => {
                    for c in cs {
                        streams.push_part(c)?;
                    }
                }
                _ => {}
            }
            write_var_uint(&mut out, curve_tag(ShapeClass::Polyline, streams.curve_count > 0, z, m));
            streams.write_tail(&mut out, q, geom.envelope(), z, m)?;
        }
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) => {
            let mut streams = PartStreams::default();
            let polygons: Vec<&Vec<Curve>> = match geom {
                Geometry::Polygon(rings) => vec![rings],
                Geometry::MultiPolygon(polys) => polys.iter().collect(),
                _ => Vec::new(),
            };
            for rings in polygons {
                for (i, ring) in rings.iter().enumerate() {
                    // exterior clockwise, holes counter-clockwise
                    let reverse = (i == 0) != ring.is_clockwise();
                    if reverse {
                        streams.push_part(&ring.reversed())?;
                    } else {
                        streams.push_part(ring)?;
                    }
                }
            }
            write_var_uint(&mut out, curve_tag(ShapeClass::Polygon, streams.curve_count > 0, z, m));
            streams.write_tail(&mut out, q, geom.envelope(), z, m)?;
        }
        Geometry::Tin(_) | Geometry::PolyhedralSurface(_) | Geometry::GeometryCollection(_) | Geometry::MultiPatch(_) => {
            encode_multipatch(&mut out, q, &geom.to_patches()?)?;
        }
    }
    Ok(out)
}

fn encode_multipatch(out: &mut Vec<u8>, q: &Quantization, patches: &[Patch]) -> Result<(), DbError> {
    let coords: Vec<Coord> = patches.iter().flat_map(|p| p.points.iter().copied()).collect();
    write_var_uint(out, ShapeType::MultiPatch.code() as u64);
    write_var_uint(out, coords.len() as u64);
    if coords.is_empty() {
        return Ok(());
    }
    let n_parts = patches.len() as u64;
    let n_points = coords.len() as u64;
    // size of the equivalent extended shape buffer, kept for readers that expect it
    let shape_buffer_size = 4 + 16 * 2 + 4 + 4 + 4 * n_parts + 4 * n_parts + 16 * n_points + 16 + 8 * n_points;
    write_var_uint(out, shape_buffer_size);
    write_var_uint(out, n_parts);
    write_envelope(out, q, Envelope::from_coords(&coords))?;
    for p in &patches[..patches.len() - 1] {
        write_var_uint(out, p.points.len() as u64);
    }
    for p in patches {
        write_var_uint(out, p.kind.code() as u64);
    }
    write_coord_streams(out, q, &coords, true, false)
}

// ══════════════════════════════════════ DECODER ══════════════════════════════════════

struct Dims {
    z: bool,
    m: bool,
}

fn read_xy(r: &mut ByteReader, q: &Quantization, n: usize) -> Result<Vec<Coord>, DbError> {
    let mut out = Vec::with_capacity(n.min(r.remaining()));
    let (mut x, mut y) = (0i64, 0i64);
    for _ in 0..n {
        x = x.checked_add(r.read_var_int()?).ok_or_else(|| DbError::corrupt("X delta overflow"))?;
        y = y.checked_add(r.read_var_int()?).ok_or_else(|| DbError::corrupt("Y delta overflow"))?;
        out.push(Coord::xy(x as f64 / q.xy_scale + q.x_origin, y as f64 / q.xy_scale + q.y_origin));
    }
    Ok(out)
}

fn read_axis(r: &mut ByteReader, n: usize, origin: f64, scale: f64) -> Result<Vec<f64>, DbError> {
    let mut out = Vec::with_capacity(n.min(r.remaining()));
    let mut acc = 0i64;
    for _ in 0..n {
        acc = acc.checked_add(r.read_var_int()?).ok_or_else(|| DbError::corrupt("delta overflow"))?;
        out.push(acc as f64 / scale + origin);
    }
    Ok(out)
}

fn read_z_m(r: &mut ByteReader, q: &Quantization, coords: &mut [Coord], dims: &Dims) -> Result<(), DbError> {
    let n = coords.len();
    if dims.z {
        let zs = read_axis(r, n, q.z_origin, q.z_scale)?;
        for (c, z) in coords.iter_mut().zip(zs) {
            c.z = Some(z);
        }
    }
    if dims.m && n > 0 {
        // absent M is either a single marker byte or a truncated stream
        if r.peek_u8() == Some(M_ABSENT_MARKER) {
            r.skip(1)?;
            return Ok(());
        }
        if r.remaining() < n {
            debug!(points = n, left = r.remaining(), "geometry blob without M stream");
            return Ok(());
        }
        let ms = read_axis(r, n, q.m_origin, q.m_scale)?;
        for (c, m) in coords.iter_mut().zip(ms) {
            c.m = Some(m);
        }
    }
    Ok(())
}

fn skip_envelope(r: &mut ByteReader) -> Result<(), DbError> {
    for _ in 0..4 {
        r.read_var_uint()?;
    }
    Ok(())
}

fn read_part_counts(r: &mut ByteReader, n_parts: usize, n_points: usize) -> Result<Vec<usize>, DbError> {
    if n_parts == 0 {
        return Err(DbError::corrupt("geometry with points but no parts"));
    }
    let mut counts = Vec::with_capacity(n_parts.min(r.remaining() + 1));
    let mut used = 0usize;
    for _ in 0..n_parts - 1 {
        let c = r.read_var_u32()? as usize;
        used = used.checked_add(c).ok_or_else(|| DbError::corrupt("part count overflow"))?;
        counts.push(c);
    }
    if used > n_points {
        return Err(DbError::corrupt(format!("parts hold {} points, geometry declares {}", used, n_points)));
    }
    counts.push(n_points - used);
    Ok(counts)
}

/// Decodes a geometry blob. A null shape yields `None`.
pub fn decode_geometry(blob: &[u8], q: &Quantization) -> Result<Option<Geometry>, DbError> {
    let mut r = ByteReader::new(blob);
    let raw = r.read_var_uint()?;
    let raw = u32::try_from(raw).map_err(|_| DbError::corrupt(format!("shape type {} out of range", raw)))?;
    let shape = ShapeType::from_code(raw & SHAPE_TYPE_MASK)?;
    let (z, m) = shape.dimensions(raw);
    let dims = Dims { z, m };
    let has_curves = raw & SHAPE_FLAG_CURVES != 0;

    let geom = match shape.class() {
        ShapeClass::Null => return Ok(None),
        ShapeClass::Point => decode_point(&mut r, q, &dims)?,
        ShapeClass::MultiPoint => {
            let n = r.read_var_u32()? as usize;
            if n == 0 {
                Geometry::MultiPoint(Vec::new())
            } else {
                skip_envelope(&mut r)?;
                let mut pts = read_xy(&mut r, q, n)?;
                read_z_m(&mut r, q, &mut pts, &dims)?;
                Geometry::MultiPoint(pts)
            }
        }
        ShapeClass::Polyline | ShapeClass::Polygon => {
            let n = r.read_var_u32()? as usize;
            if n == 0 {
                return Ok(Some(if shape.class() == ShapeClass::Polygon {
                    Geometry::Polygon(Vec::new())
                } else {
                    Geometry::MultiCurve(Vec::new())
                }));
            }
            let n_parts = r.read_var_u32()? as usize;
            let n_curves = if has_curves { r.read_var_u32()? as usize } else { 0 };
            skip_envelope(&mut r)?;
            let counts = read_part_counts(&mut r, n_parts, n)?;
            let mut pts = read_xy(&mut r, q, n)?;
            read_z_m(&mut r, q, &mut pts, &dims)?;
            let arcs = read_curve_descriptors(&mut r, n_curves, n)?;
            let parts = build_parts(&pts, &counts, &arcs);
            if shape.class() == ShapeClass::Polygon {
                organize_rings(parts)
            } else if parts.len() == 1 {
                parts.into_iter().next().map(Geometry::Curve).unwrap_or(Geometry::MultiCurve(Vec::new()))
            } else {
                Geometry::MultiCurve(parts)
            }
        }
        ShapeClass::MultiPatch => {
            let n = r.read_var_u32()? as usize;
            if n == 0 {
                Geometry::MultiPatch(Vec::new())
            } else {
                r.read_var_uint()?; // extended shape buffer size
                let n_parts = r.read_var_u32()? as usize;
                skip_envelope(&mut r)?;
                let counts = read_part_counts(&mut r, n_parts, n)?;
                let mut kinds = Vec::with_capacity(n_parts.min(r.remaining()));
                for _ in 0..n_parts {
                    kinds.push(PatchKind::from_code(r.read_var_u32()?)?);
                }
                let mut pts = read_xy(&mut r, q, n)?;
                // multipatches always carry Z
                read_z_m(&mut r, q, &mut pts, &Dims { z: true, m: dims.m })?;
                let mut patches = Vec::with_capacity(n_parts);
                let mut start = 0;
                for (kind, count) in kinds.into_iter().zip(counts) {
                    patches.push(Patch { kind, points: pts[start..start + count].to_vec() });
                    start += count;
                }
                Geometry::MultiPatch(patches)
            }
        }
    };
    Ok(Some(geom))
}

fn decode_point(r: &mut ByteReader, q: &Quantization, dims: &Dims) -> Result<Geometry, DbError> {
    let vx = r.read_var_uint()?;
    let vy = r.read_var_uint()?;
    if vx == 0 {
        return Ok(Geometry::Point(Coord::xy(f64::NAN, f64::NAN)));
    }
    let mut c = Coord::xy(
        (vx - 1) as f64 / q.xy_scale + q.x_origin,
        vy.saturating_sub(1) as f64 / q.xy_scale + q.y_origin,
    );
    if dims.z {
        let v = r.read_var_uint()?;
        c.z = Some(v.saturating_sub(1) as f64 / q.z_scale + q.z_origin);
    }
    if dims.m {
        if r.remaining() > 0 {
            let v = r.read_var_uint()?;
            c.m = Some(v.saturating_sub(1) as f64 / q.m_scale + q.m_origin);
        }
    }
    Ok(Geometry::Point(c))
}

/// Mid points of circular arcs, keyed by the index of the arc start vertex.
fn read_curve_descriptors(r: &mut ByteReader, n_curves: usize, n_points: usize) -> Result<BTreeMap<usize, (f64, f64)>, DbError> {
    let mut arcs = BTreeMap::new();
    for _ in 0..n_curves {
        let start = r.read_var_u32()? as usize;
        if start + 1 >= n_points {
            return Err(DbError::corrupt(format!("curve starts at point {} of {}", start, n_points)));
        }
        let kind = r.read_u8()?;
        match kind {
            SEGMENT_ARC => {
                let mx = r.read::<f64>()?;
                let my = r.read::<f64>()?;
                let _flags = r.read::<u32>()?;
                arcs.insert(start, (mx, my));
            }
            SEGMENT_BEZIER => {
                r.skip(4 * 8)?;
                debug!(start, "bezier segment read back as a straight segment");
            }
            SEGMENT_ELLIPSE => {
                r.skip(5 * 8 + 4)?;
                debug!(start, "elliptic arc read back as a straight segment");
            }
            other => return Err(DbError::corrupt(format!("unknown curve segment type {}", other))),
        }
    }
    Ok(arcs)
}

fn interpolate(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        _ => None,
    }
}

fn build_parts(pts: &[Coord], counts: &[usize], arcs: &BTreeMap<usize, (f64, f64)>) -> Vec<Curve> {
    let mut parts = Vec::with_capacity(counts.len());
    let mut start = 0;
    for &count in counts {
        parts.push(build_curve(&pts[start..start + count], start, arcs));
        start += count;
    }
    parts
}

fn build_curve(pts: &[Coord], base: usize, arcs: &BTreeMap<usize, (f64, f64)>) -> Curve {
    if pts.len() < 2 || arcs.range(base..base + pts.len() - 1).next().is_none() {
        return Curve::Line(pts.to_vec());
    }
    let mut sections: Vec<Curve> = Vec::new();
    for j in 0..pts.len() - 1 {
        let (a, b) = (pts[j], pts[j + 1]);
        match arcs.get(&(base + j)) {
            Some(&(mx, my)) => {
                let mid = Coord { x: mx, y: my, z: interpolate(a.z, b.z), m: interpolate(a.m, b.m) };
                match sections.last_mut() {
                    Some(Curve::Arc(v)) => v.extend([mid, b]),
                    _ => sections.push(Curve::Arc(vec![a, mid, b])),
                }
            }
            None => match sections.last_mut() {
                Some(Curve::Line(v)) => v.push(b),
                _ => sections.push(Curve::Line(vec![a, b])),
            },
        }
    }
    if sections.len() == 1 {
        sections.pop().unwrap_or(Curve::Line(Vec::new()))
    } else {
        Curve::Compound(sections)
    }
}

/// Each clockwise ring opens a polygon; counter-clockwise rings are holes
/// of the polygon opened before them.
fn organize_rings(rings: Vec<Curve>) -> Geometry {
    let mut polygons: Vec<Vec<Curve>> = Vec::new();
    for ring in rings {
        if ring.is_clockwise() || polygons.is_empty() {
            polygons.push(vec![ring]);
        } else if let Some(last) = polygons.last_mut() {
            last.push(ring);
        }
    }
    if polygons.len() == 1 {
        Geometry::Polygon(polygons.pop().unwrap_or_default())
    } else {
        Geometry::MultiPolygon(polygons)
    }
}
