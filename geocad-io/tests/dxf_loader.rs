use std::path::PathBuf;

use glam::DVec2;

use geocad_core::{
    color::ColorRef,
    document::{Entity, GeoCoordinateType, HatchEdge},
    geometry::{Point2, Point3},
};
use geocad_io::{DocumentLoader, DxfFacade, GeodataInjector, read_source};

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/data");
    path.push(name);
    path
}

#[test]
fn load_site_plan_keeps_layer_table() {
    let doc = DxfFacade::new()
        .load(&fixture("site_plan.dxf"))
        .expect("读取 DXF 失败");

    let names: Vec<&str> = doc.layers().iter().map(|layer| layer.name.as_str()).collect();
    assert_eq!(names, ["0", "Walls", "Defpoints", "Trees"]);

    let walls = doc.layer("Walls").expect("缺少 Walls 图层");
    assert_eq!(walls.color, ColorRef::Aci(1));
    assert!(walls.is_continuous());

    let trees = doc.layer("Trees").expect("缺少 Trees 图层");
    assert_eq!(trees.effective_color(), ColorRef::Rgb(0, 170, 0));
    assert!(!trees.is_continuous());
}

#[test]
fn load_site_plan_reads_supported_entities() {
    let doc = DxfFacade::new()
        .load(&fixture("site_plan.dxf"))
        .expect("读取 DXF 失败");

    let kinds: Vec<&str> = doc.entities().map(|(_, entity)| entity.dxf_type()).collect();
    assert_eq!(
        kinds,
        [
            "LINE",
            "LWPOLYLINE",
            "LWPOLYLINE",
            "CIRCLE",
            "ARC",
            "POINT",
            "INSERT",
            "HATCH",
            "POLYLINE",
            "3DFACE",
            "ELLIPSE",
            "SPLINE",
        ]
    );

    let (circle_id, _) = doc
        .entities()
        .find(|(_, entity)| matches!(entity, Entity::Circle(_)))
        .expect("未找到圆");
    assert_eq!(doc.entity_handle(circle_id), Some("53"));
    assert_eq!(doc.entity_color(circle_id), Some(ColorRef::Aci(5)));

    let arc = doc
        .entities()
        .find_map(|(_, entity)| match entity {
            Entity::Arc(arc) => Some(arc),
            _ => None,
        })
        .expect("未找到圆弧");
    assert!((arc.end_angle - std::f64::consts::FRAC_PI_2).abs() < 1e-12);

    let polyline = doc
        .entities()
        .find_map(|(_, entity)| match entity {
            Entity::Polyline(polyline) if !polyline.is_lightweight => Some(polyline),
            _ => None,
        })
        .expect("未找到经典多段线");
    assert_eq!(polyline.vertices.len(), 3);
    assert!(!polyline.is_closed);
    assert_eq!(polyline.vertices[1].position, Point2::new(5.0, 25.0));

    let face = doc
        .entities()
        .find_map(|(_, entity)| match entity {
            Entity::Face3D(face) => Some(face),
            _ => None,
        })
        .expect("未找到 3DFACE");
    assert_eq!(face.vertices[2], face.vertices[3]);
}

#[test]
fn insert_carries_attributes_and_block_definition() {
    let doc = DxfFacade::new()
        .load(&fixture("site_plan.dxf"))
        .expect("读取 DXF 失败");

    let insert = doc
        .entities()
        .find_map(|(_, entity)| match entity {
            Entity::BlockReference(reference) => Some(reference),
            _ => None,
        })
        .expect("未找到块参照");
    assert_eq!(insert.name, "TREE");
    assert_eq!(insert.layer, "Trees");
    assert_eq!(insert.attributes.len(), 1);
    assert_eq!(insert.attributes[0].tag, "SPECIES");
    assert_eq!(insert.attributes[0].text, "Oak");

    let mapped = insert.transform().transform_point2(DVec2::new(1.0, 0.0));
    assert!((mapped.x - 22.0).abs() < 1e-9);
    assert!((mapped.y - 20.0).abs() < 1e-9);

    let block = doc.block("TREE").expect("未找到块定义 TREE");
    assert_eq!(block.entities.len(), 1);
    assert!(doc.block("*Model_Space").is_none());
}

#[test]
fn hatch_polyline_loop_becomes_closed_segments() {
    let doc = DxfFacade::new()
        .load(&fixture("site_plan.dxf"))
        .expect("读取 DXF 失败");

    let hatch = doc
        .entities()
        .find_map(|(_, entity)| match entity {
            Entity::Hatch(hatch) => Some(hatch),
            _ => None,
        })
        .expect("未找到 HATCH");
    assert!(hatch.is_solid);
    assert_eq!(hatch.pattern_name, "SOLID");
    assert_eq!(hatch.loops.len(), 1);

    let edges = &hatch.loops[0].edges;
    assert_eq!(edges.len(), 4);
    match edges.last() {
        Some(HatchEdge::PolylineSegment { start, end, .. }) => {
            assert_eq!(*start, Point2::new(40.0, 10.0));
            assert_eq!(*end, Point2::new(40.0, 0.0));
        }
        other => panic!("期望多段线边，实际为 {other:?}"),
    }
}

#[test]
fn geodata_owned_by_modelspace_is_loaded() {
    let doc = DxfFacade::new()
        .load(&fixture("site_plan.dxf"))
        .expect("读取 DXF 失败");

    assert_eq!(doc.modelspace_record(), Some("1F"));
    assert_eq!(doc.handle_seed(), Some("100"));

    let geodata = doc.geodata().expect("缺少 GEODATA");
    assert_eq!(geodata.handle.as_deref(), Some("70"));
    assert_eq!(geodata.owner.as_deref(), Some("1F"));
    assert_eq!(geodata.coordinate_type, GeoCoordinateType::ProjectedGrid);
    assert_eq!(geodata.reference_point, Point3::new(291_000.0, 4_653_000.0, 0.0));
    assert!(geodata.rotation_radians().abs() < 1e-12);

    let definition = &geodata.coordinate_system_definition;
    assert!(definition.contains("<ObjectId>EPSG=32633</ObjectId>"));
    assert!(definition.contains("\n    <CoordinateSystemAxis>"));
    assert!(!definition.contains("^J"));
}

#[test]
fn injecting_into_fixture_reuses_existing_handle() {
    let source = read_source(&fixture("site_plan.dxf")).expect("读取 DXF 失败");
    let loader = DxfFacade::new();
    let mut geodata = loader
        .load_str(&source)
        .expect("解析失败")
        .geodata()
        .cloned()
        .expect("缺少 GEODATA");
    geodata.design_point = Point3::new(5.0, 5.0, 0.0);

    let rewritten = GeodataInjector::new()
        .inject(&source, &geodata)
        .expect("写入 GEODATA 失败");
    let doc = loader.load_str(&rewritten).expect("重新解析失败");

    assert_eq!(doc.entity_count(), 12);
    let reloaded = doc.geodata().expect("缺少 GEODATA");
    assert_eq!(reloaded.handle.as_deref(), Some("70"));
    assert_eq!(reloaded.design_point, Point3::new(5.0, 5.0, 0.0));
    assert_eq!(
        reloaded.coordinate_system_definition,
        geodata.coordinate_system_definition
    );
}

#[test]
fn truncated_file_is_rejected() {
    let err = DxfFacade::new()
        .load_str("  0\nSECTION\n  2\nENTITIES\n  0\nLINE\n 10\n")
        .expect_err("截断的文件应当报错");
    assert!(err.to_string().contains("invalid document structure"));
}
