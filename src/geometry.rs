//! In-memory geometry model handed to and returned by the record codec.
//!
//! Only what the storage format can express is modelled: points, linear
//! and circular curves, polygons built from ring curves, and the 3D
//! surface classes that end up stored as a multipatch.

use crate::dberror::DbError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Coord { x, y, z: None, m: None }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Coord { x, y, z: Some(z), m: None }
    }

    pub fn xym(x: f64, y: f64, m: f64) -> Self {
        Coord { x, y, z: None, m: Some(m) }
    }

    pub fn xyzm(x: f64, y: f64, z: f64, m: f64) -> Self {
        Coord { x, y, z: Some(z), m: Some(m) }
    }
}

/// One part of a line or one ring of a polygon.
#[derive(Debug, Clone, PartialEq)]
pub enum Curve {
    Line(Vec<Coord>),
    /// Circular string: start, mid, end, mid, end...
    Arc(Vec<Coord>),
    /// Chain of `Line` and `Arc` sections sharing their end points.
    Compound(Vec<Curve>),
}

impl Curve {
    pub fn has_arcs(&self) -> bool {
        match self {
            Curve::Line(_) => false,
            Curve::Arc(_) => true,
            Curve::Compound(parts) => parts.iter().any(Curve::has_arcs),
        }
    }

    /// Every vertex in order, arc mid points included, shared compound
    /// end points once.
    pub fn vertices(&self) -> Vec<Coord> {
        match self {
            Curve::Line(pts) | Curve::Arc(pts) => pts.clone(),
            Curve::Compound(parts) => {
                let mut out: Vec<Coord> = Vec::new();
                for part in parts {
                    let pts = part.vertices();
                    let skip = if out.is_empty() { 0 } else { 1 };
                    out.extend(pts.into_iter().skip(skip));
                }
                out
            }
        }
    }

    pub fn reversed(&self) -> Curve {
        match self {
            Curve::Line(pts) => Curve::Line(pts.iter().rev().copied().collect()),
            Curve::Arc(pts) => Curve::Arc(pts.iter().rev().copied().collect()),
            Curve::Compound(parts) => Curve::Compound(parts.iter().rev().map(Curve::reversed).collect()),
        }
    }

    /// Shoelace over the vertex list. Arcs are approximated by their
    /// mid points, which keeps the sign for any non-degenerate ring.
    pub fn signed_area(&self) -> f64 {
        let pts = self.vertices();
        if pts.len() < 3 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..pts.len() {
            let a = pts[i];
            let b = pts[(i + 1) % pts.len()];
            sum += a.x * b.y - b.x * a.y;
        }
        sum / 2.0
    }

    pub fn is_clockwise(&self) -> bool {
        self.signed_area() < 0.0
    }
}

/// Multipatch part classes, numbered as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    TriangleStrip = 0,
    TriangleFan = 1,
    OuterRing = 2,
    InnerRing = 3,
    FirstRing = 4,
    Ring = 5,
    Triangles = 6,
}

impl PatchKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, DbError> {
        Ok(match code & 0xF {
            0 => PatchKind::TriangleStrip,
            1 => PatchKind::TriangleFan,
            2 => PatchKind::OuterRing,
            3 => PatchKind::InnerRing,
            4 => PatchKind::FirstRing,
            5 => PatchKind::Ring,
            6 => PatchKind::Triangles,
            other => return Err(DbError::corrupt(format!("unknown multipatch part type {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub kind: PatchKind,
    pub points: Vec<Coord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    /// LineString, CircularString or CompoundCurve.
    Curve(Curve),
    /// MultiLineString or MultiCurve.
    MultiCurve(Vec<Curve>),
    /// Rings, exterior first.
    Polygon(Vec<Curve>),
    MultiPolygon(Vec<Vec<Curve>>),
    Tin(Vec<[Coord; 3]>),
    /// Polygons made of linear rings.
    PolyhedralSurface(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
    MultiPatch(Vec<Patch>),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::Curve(_) => "Curve",
            Geometry::MultiCurve(_) => "MultiCurve",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
            Geometry::Tin(_) => "Tin",
            Geometry::PolyhedralSurface(_) => "PolyhedralSurface",
            Geometry::GeometryCollection(_) => "GeometryCollection",
            Geometry::MultiPatch(_) => "MultiPatch",
        }
    }

    /// All stored vertices, used for extents and Z/M detection.
    pub fn coords(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::MultiPoint(pts) => pts.clone(),
            Geometry::Curve(c) => c.vertices(),
            Geometry::MultiCurve(cs) | Geometry::Polygon(cs) => cs.iter().flat_map(Curve::vertices).collect(),
            Geometry::MultiPolygon(polys) => polys.iter().flatten().flat_map(Curve::vertices).collect(),
            Geometry::Tin(tris) => tris.iter().flat_map(|t| t.iter().copied()).collect(),
            Geometry::PolyhedralSurface(polys) => polys.iter().flatten().flatten().copied().collect(),
            Geometry::GeometryCollection(geoms) => geoms.iter().flat_map(Geometry::coords).collect(),
            Geometry::MultiPatch(patches) => patches.iter().flat_map(|p| p.points.iter().copied()).collect(),
        }
    }

    pub fn has_z(&self) -> bool {
        self.coords().iter().any(|c| c.z.is_some())
    }

    pub fn has_m(&self) -> bool {
        self.coords().iter().any(|c| c.m.is_some())
    }

    pub fn envelope(&self) -> Option<Envelope> {
        Envelope::from_coords(&self.coords())
    }

    /// Flattens TIN, polyhedral surface and collections of surfaces into
    /// multipatch parts.
    pub fn to_patches(&self) -> Result<Vec<Patch>, DbError> {
        let mut out = Vec::new();
        self.collect_patches(&mut out)?;
        Ok(out)
    }

    fn collect_patches(&self, out: &mut Vec<Patch>) -> Result<(), DbError> {
        match self {
            Geometry::MultiPatch(parts) => out.extend(parts.iter().cloned()),
            Geometry::Tin(tris) => {
                if !tris.is_empty() {
                    out.push(Patch {
                        kind: PatchKind::Triangles,
                        points: tris.iter().flat_map(|t| t.iter().copied()).collect(),
                    });
                }
            }
            Geometry::PolyhedralSurface(polys) => {
                for rings in polys {
                    push_ring_patches(out, rings.iter().map(|r| r.as_slice()))?;
                }
            }
            Geometry::Polygon(rings) => push_curve_rings(out, rings)?,
            Geometry::MultiPolygon(polys) => {
                for rings in polys {
                    push_curve_rings(out, rings)?;
                }
            }
            Geometry::GeometryCollection(geoms) => {
                for g in geoms {
                    g.collect_patches(out)?;
                }
            }
            other => {
                return Err(DbError::UnsupportedGeometry(format!(
                    "{} cannot be stored as a multipatch part",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }
}

fn push_curve_rings(out: &mut Vec<Patch>, rings: &[Curve]) -> Result<(), DbError> {
    let mut linear = Vec::with_capacity(rings.len());
    for ring in rings {
        match ring {
            Curve::Line(pts) => linear.push(pts.as_slice()),
            _ => return Err(DbError::UnsupportedGeometry("curved ring in a multipatch".to_string())),
        }
    }
    push_ring_patches(out, linear.into_iter())
}

fn push_ring_patches<'a>(out: &mut Vec<Patch>, rings: impl Iterator<Item = &'a [Coord]>) -> Result<(), DbError> {
    for (i, ring) in rings.enumerate() {
        let kind = if i == 0 { PatchKind::OuterRing } else { PatchKind::InnerRing };
        out.push(Patch { kind, points: ring.to_vec() });
    }
    Ok(())
}

/// 2D extent of a geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Envelope {
    pub fn from_coords(coords: &[Coord]) -> Option<Envelope> {
        let first = coords.first()?;
        let mut env = Envelope { xmin: first.x, ymin: first.y, xmax: first.x, ymax: first.y };
        for c in &coords[1..] {
            env.xmin = env.xmin.min(c.x);
            env.ymin = env.ymin.min(c.y);
            env.xmax = env.xmax.max(c.x);
            env.ymax = env.ymax.max(c.y);
        }
        Some(env)
    }

    pub fn merge(&mut self, other: &Envelope) {
        self.xmin = self.xmin.min(other.xmin);
        self.ymin = self.ymin.min(other.ymin);
        self.xmax = self.xmax.max(other.xmax);
        self.ymax = self.ymax.max(other.ymax);
    }
}

#[cfg(test)]
mod geometry_test {
    use super::*;

    fn square(clockwise: bool) -> Curve {
        let mut pts = vec![
            Coord::xy(0.0, 0.0),
            Coord::xy(0.0, 10.0),
            Coord::xy(10.0, 10.0),
            Coord::xy(10.0, 0.0),
            Coord::xy(0.0, 0.0),
        ];
        if !clockwise {
            pts.reverse();
        }
        Curve::Line(pts)
    }

    #[test]
    fn orientation_follows_vertex_order() {
        assert!(square(true).is_clockwise());
        assert!(!square(false).is_clockwise());
        assert!(!square(true).reversed().is_clockwise());
    }

    #[test]
    fn compound_vertices_share_end_points() {
        let c = Curve::Compound(vec![
            Curve::Line(vec![Coord::xy(0.0, 0.0), Coord::xy(1.0, 0.0)]),
            Curve::Arc(vec![Coord::xy(1.0, 0.0), Coord::xy(2.0, 1.0), Coord::xy(3.0, 0.0)]),
        ]);
        assert_eq!(c.vertices().len(), 4);
        let r = c.reversed();
        assert_eq!(r.vertices().first(), Some(&Coord::xy(3.0, 0.0)));
        assert!(matches!(&r, Curve::Compound(parts) if matches!(parts[0], Curve::Arc(_))));
    }

    #[test]
    fn tin_becomes_triangles_patch() {
        let tin = Geometry::Tin(vec![
            [Coord::xyz(0.0, 0.0, 1.0), Coord::xyz(1.0, 0.0, 1.0), Coord::xyz(0.0, 1.0, 1.0)],
            [Coord::xyz(1.0, 0.0, 1.0), Coord::xyz(1.0, 1.0, 2.0), Coord::xyz(0.0, 1.0, 1.0)],
        ]);
        let patches = tin.to_patches().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].kind, PatchKind::Triangles);
        assert_eq!(patches[0].points.len(), 6);

        let err = Geometry::Point(Coord::xy(0.0, 0.0)).to_patches().unwrap_err();
        assert!(matches!(err, DbError::UnsupportedGeometry(_)));
    }

    #[test]
    fn envelope_covers_all_vertices() {
        let g = Geometry::MultiPoint(vec![Coord::xy(-1.0, 5.0), Coord::xy(3.0, -2.0)]);
        let env = g.envelope().unwrap();
        assert_eq!(env, Envelope { xmin: -1.0, ymin: -2.0, xmax: 3.0, ymax: 5.0 });
        assert!(Geometry::MultiPoint(vec![]).envelope().is_none());
    }
}
