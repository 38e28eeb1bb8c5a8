//! Fake rows for the integration tests.
//! Coordinates stay inside the quantization grid of `roads_schema`.
// tests/test_utils.rs

use chrono::{Duration, NaiveDate, NaiveDateTime};
use fake::faker::address::en::StreetName;
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use rand::Rng;

use geotuco::geometry::{Coord, Curve, Geometry};
use geotuco::schema::{Field, FieldKind, FieldValue, GeometryDef, TableSchema};
use geotuco::shape::{Quantization, ShapeClass};

// --- Schemas ---

/// OBJECTID, name, lanes, length, opened, note, uid, SHAPE (polyline).
pub fn roads_schema() -> TableSchema {
    TableSchema::new(vec![
        Field::object_id("OBJECTID"),
        Field::new("name", FieldKind::String, false),
        Field::new("lanes", FieldKind::Int16, true),
        Field::new("length", FieldKind::Float64, true),
        Field::new("opened", FieldKind::DateTime, true),
        Field::new("note", FieldKind::String, true),
        Field::new("uid", FieldKind::Guid, true),
        Field::geometry(
            "SHAPE",
            GeometryDef::new(ShapeClass::Polyline, Quantization::new(-1000.0, -1000.0, 1e4)),
            true,
        ),
    ])
    .unwrap()
}

/// The two-column table of the basic walkthrough: nullable name, nullable point.
pub fn name_point_schema() -> TableSchema {
    TableSchema::new(vec![
        Field::new("name", FieldKind::String, true),
        Field::geometry("shape", GeometryDef::new(ShapeClass::Point, Quantization::new(0.0, 0.0, 1e4)), true),
    ])
    .unwrap()
}

/// OBJECTID, name, SHAPE of the given class. Z and M share a 1e-3 grid
/// around -1000.
pub fn shape_schema(class: ShapeClass, z: bool, m: bool) -> TableSchema {
    let quant = Quantization::new(-1000.0, -1000.0, 1e4).with_z(-1000.0, 1000.0).with_m(-1000.0, 1000.0);
    let mut def = GeometryDef::new(class, quant);
    if z {
        def = def.with_z();
    }
    if m {
        def = def.with_m();
    }
    TableSchema::new(vec![
        Field::object_id("OBJECTID"),
        Field::new("name", FieldKind::String, true),
        Field::geometry("SHAPE", def, true),
    ])
    .unwrap()
}

// --- Simulated Road Data ---

pub struct SimulatedRoad {
    pub values: Vec<Option<FieldValue>>,
    pub geometry: Option<Geometry>,
}

fn random_guid<R: Rng>(rng: &mut R) -> String {
    let b: [u8; 16] = rng.gen();
    format!(
        "{{{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

fn random_opened<R: Rng>(rng: &mut R) -> NaiveDateTime {
    let start = NaiveDate::from_ymd_opt(1950, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    start + Duration::seconds(rng.gen_range(0..2_000_000_000i64))
}

fn random_line<R: Rng>(rng: &mut R) -> Geometry {
    let n = rng.gen_range(2..12);
    let mut x: f64 = rng.gen_range(-500.0..500.0);
    let mut y: f64 = rng.gen_range(-500.0..500.0);
    let mut pts = Vec::with_capacity(n);
    for _ in 0..n {
        pts.push(Coord::xy(x, y));
        x += rng.gen_range(-10.0..10.0);
        y += rng.gen_range(-10.0..10.0);
    }
    Geometry::Curve(Curve::Line(pts))
}

/// A road with random nulls; long notes make some rows much bigger than others.
pub fn random_road<R: Rng>(rng: &mut R) -> SimulatedRoad {
    let name: String = StreetName().fake_with_rng(rng);
    let note: Option<String> = if rng.gen_bool(0.5) { Some(Sentence(3..40).fake_with_rng(rng)) } else { None };
    let values = vec![
        None,
        Some(FieldValue::String(name)),
        rng.gen_bool(0.8).then(|| FieldValue::Int16(rng.gen_range(1..8))),
        rng.gen_bool(0.8).then(|| FieldValue::Float64(rng.gen_range(0.0..25_000.0))),
        rng.gen_bool(0.5).then(|| FieldValue::DateTime(random_opened(rng))),
        note.map(FieldValue::String),
        rng.gen_bool(0.3).then(|| FieldValue::Guid(random_guid(rng))),
        None,
    ];
    let geometry = rng.gen_bool(0.9).then(|| random_line(rng));
    SimulatedRoad { values, geometry }
}
