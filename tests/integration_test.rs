// tests/integration_test.rs
pub mod test_utils;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use geotuco::config::{RepackStrategy, TableOptions, TextEncoding};
use geotuco::dberror::DbError;
use geotuco::geometry::{Coord, Curve, Geometry, Patch, PatchKind};
use geotuco::rewriter::RepackOutcome;
use geotuco::schema::{Extent, FieldValue};
use geotuco::shape::ShapeClass;
use geotuco::table::Table;

use test_utils::{name_point_schema, random_road, roads_schema, shape_schema, SimulatedRoad};

fn options(strategy: RepackStrategy) -> TableOptions {
    TableOptions::default().with_creator(Some("integration".to_string())).with_repack_strategy(strategy)
}

fn coords_close(a: &Geometry, b: &Geometry) -> bool {
    let (ca, cb) = (a.coords(), b.coords());
    ca.len() == cb.len() && ca.iter().zip(&cb).all(|(p, q)| (p.x - q.x).abs() <= 1e-4 && (p.y - q.y).abs() <= 1e-4)
}

/// Live bytes plus free bytes must cover the whole data area.
fn assert_conservation(t: &mut Table) {
    let mut live = 0u64;
    for id in t.row_ids().unwrap() {
        live += 4 + t.record_size(id).unwrap().unwrap() as u64;
    }
    assert_eq!(live + t.free_space(), t.file_size() - t.data_start());
}

fn assert_matches(t: &mut Table, expected: &BTreeMap<u32, SimulatedRoad>) {
    assert_eq!(t.row_count() as usize, expected.len());
    assert_eq!(t.row_ids().unwrap(), expected.keys().copied().collect::<Vec<_>>());
    for (id, road) in expected {
        let f = t.get_feature(*id).unwrap().unwrap();
        assert_eq!(f.values[0], Some(FieldValue::Int32(*id as i32)));
        assert_eq!(&f.values[1..], &road.values[1..]);
        match (&f.geometry, &road.geometry) {
            (Some(a), Some(b)) => assert!(coords_close(a, b), "row {} geometry differs", id),
            (None, None) => {}
            _ => panic!("row {} geometry presence differs", id),
        }
    }
}

#[test]
fn name_and_point_walkthrough() {
    let dir = tempdir().unwrap();
    let mut t = Table::create(&dir.path().join("places"), name_point_schema(), options(RepackStrategy::InPlace)).unwrap();

    let a = vec![Some(FieldValue::String("A".to_string())), None];
    assert_eq!(t.create_feature(&a, Some(&Geometry::Point(Coord::xy(1.23, 4.56)))).unwrap(), 1);
    assert_eq!(t.create_feature(&[None, None], None).unwrap(), 2);
    t.delete_feature(1).unwrap();
    let c = vec![Some(FieldValue::String("C".to_string())), None];
    assert_eq!(t.create_feature(&c, Some(&Geometry::Point(Coord::xy(7.0, 8.0)))).unwrap(), 3);

    assert_eq!(t.row_count(), 2);
    assert_eq!(t.total_record_count(), 3);
    assert_eq!(t.row_offset(1).unwrap(), 0);
    let f = t.get_feature(3).unwrap().unwrap();
    match f.geometry {
        Some(Geometry::Point(p)) => assert!((p.x - 7.0).abs() < 1e-4 && (p.y - 8.0).abs() < 1e-4),
        other => panic!("unexpected geometry {:?}", other),
    }
    let f = t.get_feature(2).unwrap().unwrap();
    assert_eq!(f.values, vec![None, None]);
    assert_eq!(f.geometry, None);
}

#[test]
fn huge_coordinate_fails_without_side_effects() {
    let dir = tempdir().unwrap();
    let mut t = Table::create(&dir.path().join("places"), name_point_schema(), options(RepackStrategy::InPlace)).unwrap();
    let size = t.file_size();
    let err = t.create_feature(&[None, None], Some(&Geometry::Point(Coord::xy(1e20, 1.0)))).unwrap_err();
    assert!(matches!(err, DbError::EncodingRange(_)));
    assert_eq!(t.file_size(), size);
    assert_eq!(t.total_record_count(), 0);
    assert!(t.geometry_bounds().is_none());
}

#[test]
fn null_in_required_field_is_rejected() {
    let dir = tempdir().unwrap();
    let mut t = Table::create(&dir.path().join("roads"), roads_schema(), options(RepackStrategy::InPlace)).unwrap();
    let mut values = vec![None; 8];
    values[2] = Some(FieldValue::Int16(2));
    assert!(matches!(t.create_feature(&values, None), Err(DbError::ConstraintViolation(_))));
    assert_eq!(t.row_count(), 0);
}

#[test]
fn random_edits_conserve_space_and_keep_index_dense() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut t = Table::create(&dir.path().join("roads"), roads_schema(), options(RepackStrategy::InPlace)).unwrap();
    let mut expected: BTreeMap<u32, SimulatedRoad> = BTreeMap::new();

    for step in 0..600 {
        let roll: f64 = rng.gen();
        if expected.is_empty() || roll < 0.5 {
            let road = random_road(&mut rng);
            let id = t.create_feature(&road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        } else if roll < 0.8 {
            let ids: Vec<u32> = expected.keys().copied().collect();
            let id = ids[rng.gen_range(0..ids.len())];
            let road = random_road(&mut rng);
            t.update_feature(id, &road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        } else {
            let ids: Vec<u32> = expected.keys().copied().collect();
            let id = ids[rng.gen_range(0..ids.len())];
            t.delete_feature(id).unwrap();
            expected.remove(&id);
        }
        if step % 50 == 0 {
            assert_conservation(&mut t);
        }
    }
    assert_conservation(&mut t);

    for id in 1..=t.total_record_count() {
        let live = t.row_offset(id).unwrap() != 0;
        assert_eq!(live, expected.contains_key(&id), "row {}", id);
    }
    assert_matches(&mut t, &expected);
}

#[test]
fn repack_is_idempotent_in_both_modes() {
    for strategy in [RepackStrategy::InPlace, RepackStrategy::TempFiles] {
        let dir = tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut t = Table::create(&dir.path().join("roads"), roads_schema(), options(strategy)).unwrap();
        let mut expected = BTreeMap::new();
        for _ in 0..300 {
            let road = random_road(&mut rng);
            let id = t.create_feature(&road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        }
        for id in (1..=300).step_by(3) {
            t.delete_feature(id).unwrap();
            expected.remove(&id);
        }
        let before = t.file_size();

        match t.repack().unwrap() {
            RepackOutcome::Rewritten { old_size, new_size } => {
                assert_eq!(old_size, before);
                assert!(new_size < before);
            }
            other => panic!("{:?}: expected a rewrite, got {:?}", strategy, other),
        }
        assert_eq!(t.free_space(), 0);
        assert_conservation(&mut t);
        assert_matches(&mut t, &expected);

        let size = t.file_size();
        assert_eq!(t.repack().unwrap(), RepackOutcome::AlreadyCompact);
        assert_eq!(t.file_size(), size);
    }
}

#[test]
fn repack_result_survives_reopen() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("roads");
    let mut rng = StdRng::seed_from_u64(3);
    let mut expected = BTreeMap::new();
    {
        let mut t = Table::create(&base, roads_schema(), options(RepackStrategy::TempFiles)).unwrap();
        for _ in 0..120 {
            let road = random_road(&mut rng);
            let id = t.create_feature(&road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        }
        for id in [1, 2, 50, 119] {
            t.delete_feature(id).unwrap();
            expected.remove(&id);
        }
        t.repack().unwrap();
    }
    let mut t = Table::open_with_options(&base, options(RepackStrategy::TempFiles)).unwrap();
    assert_eq!(t.total_record_count(), 120);
    assert_matches(&mut t, &expected);
    assert_eq!(t.repack().unwrap(), RepackOutcome::AlreadyCompact);
}

#[test]
fn sparse_ids_round_trip_through_reopen() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("roads");
    let mut rng = StdRng::seed_from_u64(5);
    let ids = [70_000u32, 2, 5_000, 1_025, 900_000];
    let mut expected = BTreeMap::new();
    {
        let mut t = Table::create(&base, roads_schema(), options(RepackStrategy::InPlace)).unwrap();
        for id in ids {
            let road = random_road(&mut rng);
            t.create_feature_with_id(id, &road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        }
        assert_eq!(t.total_record_count(), 900_000);
    }
    let mut t = Table::open(&base).unwrap();
    assert_matches(&mut t, &expected);
    assert_eq!(t.row_offset(3).unwrap(), 0);
    assert_eq!(t.row_offset(600_000).unwrap(), 0);

    let next = random_road(&mut rng);
    assert_eq!(t.create_feature(&next.values, next.geometry.as_ref()).unwrap(), 900_001);
}

#[test]
fn utf16_tables_store_text() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("roads");
    let opts = options(RepackStrategy::InPlace).with_text_encoding(TextEncoding::Utf16);
    let mut values = vec![None; 8];
    values[1] = Some(FieldValue::String("Straße über Brücke".to_string()));
    {
        let mut t = Table::create(&base, roads_schema(), opts).unwrap();
        t.create_feature(&values, None).unwrap();
    }
    let mut t = Table::open(&base).unwrap();
    assert_eq!(t.text_encoding(), TextEncoding::Utf16);
    assert_eq!(t.get_feature(1).unwrap().unwrap().values[1], values[1]);
}

#[test]
fn wide_offsets() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("roads");
    let mut rng = StdRng::seed_from_u64(9);
    let mut expected = BTreeMap::new();
    {
        let opts = options(RepackStrategy::InPlace).with_offset_width(8);
        let mut t = Table::create(&base, roads_schema(), opts).unwrap();
        for _ in 0..1500 {
            let road = random_road(&mut rng);
            let id = t.create_feature(&road.values, road.geometry.as_ref()).unwrap();
            expected.insert(id, road);
        }
    }
    let mut t = Table::open(&base).unwrap();
    assert_eq!(t.offset_width(), 8);
    assert_matches(&mut t, &expected);
    assert!(Table::create(&dir.path().join("bad"), roads_schema(), TableOptions::default().with_offset_width(6)).is_err());
}

#[test]
fn grown_update_moves_and_shrunk_update_stays() {
    let dir = tempdir().unwrap();
    let mut t = Table::create(&dir.path().join("roads"), roads_schema(), options(RepackStrategy::InPlace)).unwrap();
    let mut values = vec![None; 8];
    values[1] = Some(FieldValue::String("short".to_string()));
    t.create_feature(&values, None).unwrap();
    t.create_feature(&values, None).unwrap();
    let first = t.row_offset(1).unwrap();

    values[5] = Some(FieldValue::String("a note long enough to outgrow the original slot".to_string()));
    t.update_feature(1, &values, None).unwrap();
    let moved = t.row_offset(1).unwrap();
    assert_ne!(moved, first);
    assert!(t.free_space() > 0);

    values[5] = None;
    t.update_feature(1, &values, None).unwrap();
    assert_eq!(t.row_offset(1).unwrap(), moved);
    assert_conservation(&mut t);

    // same size as the original record: fills the hole left by the move
    t.create_feature(&values, None).unwrap();
    assert_eq!(t.row_offset(3).unwrap(), first);
    assert_conservation(&mut t);

    let line = Geometry::Curve(Curve::Line(vec![Coord::xy(0.0, 0.0), Coord::xy(3.0, 4.0)]));
    t.update_feature(2, &values, Some(&line)).unwrap();
    let f = t.get_feature(2).unwrap().unwrap();
    assert!(coords_close(f.geometry.as_ref().unwrap(), &line));
}

// --- Geometry families ---

fn same_geometry(a: &Geometry, b: &Geometry) -> bool {
    let axis = |p: Option<f64>, q: Option<f64>| match (p, q) {
        (Some(p), Some(q)) => (p - q).abs() <= 1e-3,
        (None, None) => true,
        _ => false,
    };
    let (ca, cb) = (a.coords(), b.coords());
    a.type_name() == b.type_name()
        && ca.len() == cb.len()
        && ca.iter().zip(&cb).all(|(p, q)| {
            (p.x - q.x).abs() <= 1e-4 && (p.y - q.y).abs() <= 1e-4 && axis(p.z, q.z) && axis(p.m, q.m)
        })
}

fn assert_shapes(t: &mut Table, expected: &BTreeMap<u32, Geometry>) {
    assert_eq!(t.row_ids().unwrap(), expected.keys().copied().collect::<Vec<_>>());
    for (id, g) in expected {
        let f = t.get_feature(*id).unwrap().unwrap();
        let got = f.geometry.unwrap_or_else(|| panic!("row {} lost its geometry", id));
        assert!(same_geometry(&got, g), "row {}: {:?} vs {:?}", id, got, g);
    }
}

fn assert_extent_covers(got: &Extent, expected: &BTreeMap<u32, Geometry>) {
    let mut want = Extent::empty();
    for g in expected.values() {
        if let Some(e) = Extent::of_geometry(g) {
            want.merge(&e);
        }
    }
    for (a, b) in [(got.xmin, want.xmin), (got.ymin, want.ymin), (got.xmax, want.xmax), (got.ymax, want.ymax)] {
        assert!((a - b).abs() <= 1e-3, "extent {:?} vs {:?}", got, want);
    }
    if !want.mmin.is_nan() {
        assert!((got.mmin - want.mmin).abs() <= 1e-3 && (got.mmax - want.mmax).abs() <= 1e-3);
    }
}

fn square(x0: f64, y0: f64, side: f64, clockwise: bool) -> Curve {
    let mut pts = vec![
        Coord::xy(x0, y0),
        Coord::xy(x0, y0 + side),
        Coord::xy(x0 + side, y0 + side),
        Coord::xy(x0 + side, y0),
        Coord::xy(x0, y0),
    ];
    if !clockwise {
        pts.reverse();
    }
    Curve::Line(pts)
}

/// Shape class, Z, M, and the geometries stored under it. Polygon
/// exteriors are clockwise and holes counter-clockwise, the stored order.
fn families() -> Vec<(ShapeClass, bool, bool, Vec<Geometry>)> {
    let arc = Curve::Arc(vec![
        Coord::xy(100.0, 0.0),
        Coord::xy(101.0, 1.0),
        Coord::xy(102.0, 0.0),
        Coord::xy(103.0, -1.0),
        Coord::xy(104.0, 0.0),
    ]);
    let compound = Curve::Compound(vec![
        Curve::Line(vec![Coord::xy(0.0, 0.0), Coord::xy(1.0, 0.0)]),
        Curve::Arc(vec![Coord::xy(1.0, 0.0), Coord::xy(2.0, 1.0), Coord::xy(3.0, 0.0)]),
        Curve::Line(vec![Coord::xy(3.0, 0.0), Coord::xy(-250.0, 40.0)]),
    ]);
    let circle = Curve::Arc(vec![
        Coord::xy(0.0, 0.0),
        Coord::xy(1.0, 1.0),
        Coord::xy(2.0, 0.0),
        Coord::xy(1.0, -1.0),
        Coord::xy(0.0, 0.0),
    ]);
    let measured_line = Curve::Line(vec![
        Coord::xyzm(-10.0, -10.0, 1.0, 0.0),
        Coord::xyzm(-5.0, 2.0, 2.5, 12.5),
        Coord::xyzm(8.0, 3.0, -4.0, 30.0),
    ]);
    let patches = vec![
        Patch {
            kind: PatchKind::TriangleFan,
            points: vec![
                Coord::xyz(0.0, 0.0, 0.0),
                Coord::xyz(1.0, 0.0, 0.0),
                Coord::xyz(1.0, 1.0, 1.0),
                Coord::xyz(0.0, 1.0, 2.0),
            ],
        },
        Patch {
            kind: PatchKind::OuterRing,
            points: vec![
                Coord::xyz(5.0, 5.0, 3.0),
                Coord::xyz(5.0, 6.0, 3.0),
                Coord::xyz(6.0, 6.0, 3.0),
                Coord::xyz(5.0, 5.0, 3.0),
            ],
        },
    ];
    vec![
        (
            ShapeClass::Point,
            true,
            true,
            vec![Geometry::Point(Coord::xym(10.0, 20.0, 5.0)), Geometry::Point(Coord::xyzm(-3.0, 4.0, 7.25, -40.0))],
        ),
        (
            ShapeClass::MultiPoint,
            false,
            true,
            vec![
                Geometry::MultiPoint(vec![Coord::xym(1.0, 2.0, 100.0), Coord::xym(5.0, -6.0, -0.5)]),
                Geometry::MultiPoint(vec![Coord::xym(0.0, 0.0, 1.0), Coord::xym(9.0, 9.0, 2.0), Coord::xym(-9.0, 3.0, 3.0)]),
            ],
        ),
        (
            ShapeClass::Polyline,
            true,
            true,
            vec![
                Geometry::Curve(arc.clone()),
                Geometry::Curve(compound),
                Geometry::MultiCurve(vec![Curve::Line(vec![Coord::xy(-50.0, -50.0), Coord::xy(-40.0, -45.0)]), arc]),
                Geometry::Curve(measured_line),
            ],
        ),
        (
            ShapeClass::Polygon,
            false,
            false,
            vec![
                Geometry::Polygon(vec![circle]),
                Geometry::Polygon(vec![square(0.0, 0.0, 10.0, true), square(2.0, 2.0, 2.0, false)]),
                Geometry::MultiPolygon(vec![
                    vec![square(20.0, 0.0, 5.0, true)],
                    vec![square(40.0, 0.0, 30.0, true), square(45.0, 5.0, 3.0, false), square(55.0, 5.0, 3.0, false)],
                ]),
            ],
        ),
        (ShapeClass::MultiPatch, true, false, vec![Geometry::MultiPatch(patches)]),
    ]
}

#[test]
fn every_geometry_family_survives_update_repack_and_reopen() {
    for (i, (class, z, m, geoms)) in families().into_iter().enumerate() {
        let dir = tempdir().unwrap();
        let base = dir.path().join(format!("shapes{}", i));
        let opts = options(RepackStrategy::TempFiles);
        let values = vec![None, Some(FieldValue::String(format!("family {}", i))), None];
        let filler = vec![None, Some(FieldValue::String("x".repeat(64))), None];
        let mut expected: BTreeMap<u32, Geometry> = BTreeMap::new();
        {
            let mut t = Table::create(&base, shape_schema(class, z, m), opts.clone()).unwrap();
            let mut fillers = Vec::new();
            for g in &geoms {
                fillers.push(t.create_feature(&filler, None).unwrap());
                let id = t.create_feature(&values, Some(g)).unwrap();
                expected.insert(id, g.clone());
            }
            for id in fillers {
                t.delete_feature(id).unwrap();
            }

            // the first row takes the last geometry of the family
            let first = *expected.keys().next().unwrap();
            let last = geoms.last().unwrap().clone();
            t.update_feature(first, &values, Some(&last)).unwrap();
            expected.insert(first, last);
            assert_shapes(&mut t, &expected);
            assert_conservation(&mut t);

            assert!(matches!(t.repack().unwrap(), RepackOutcome::Rewritten { .. }), "{:?}", class);
            assert_eq!(t.free_space(), 0);
            assert_shapes(&mut t, &expected);
            let ext = t.recompute_extent().unwrap().unwrap();
            assert_extent_covers(&ext, &expected);
        }
        let mut t = Table::open_with_options(&base, opts).unwrap();
        assert_shapes(&mut t, &expected);
        assert_extent_covers(&t.geometry_bounds().unwrap(), &expected);
        assert_eq!(t.repack().unwrap(), RepackOutcome::AlreadyCompact);
    }
}

#[test]
fn geometry_of_another_family_is_rejected() {
    let dir = tempdir().unwrap();
    let mut t = Table::create(&dir.path().join("lines"), shape_schema(ShapeClass::Polyline, false, false), options(RepackStrategy::InPlace)).unwrap();
    let ring = square(0.0, 0.0, 1.0, true);
    let values = vec![None, None, None];
    let size = t.file_size();
    assert!(matches!(
        t.create_feature(&values, Some(&Geometry::Polygon(vec![ring.clone()]))),
        Err(DbError::ConstraintViolation(_))
    ));
    assert_eq!(t.file_size(), size);

    let id = t.create_feature(&values, Some(&Geometry::Curve(ring))).unwrap();
    assert!(matches!(
        t.update_feature(id, &values, Some(&Geometry::Point(Coord::xy(1.0, 1.0)))),
        Err(DbError::ConstraintViolation(_))
    ));
    assert!(matches!(t.get_feature(id).unwrap().unwrap().geometry, Some(Geometry::Curve(_))));
}
