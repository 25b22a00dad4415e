use std::collections::HashMap;

use geo::{Coord, Geometry, GeometryCollection};
use glam::{DAffine2, DVec2};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use geocad_core::document::{BlockReference, Document, Entity, EntityId, Layer};

use crate::errors::EngineError;
use crate::geometry::{entity_geometry, is_valid_polygon, try_map_geometry};
use crate::records::{GeoPoint, Georef};
use crate::transform::Transforms;

const DEFAULT_APPROXIMATION: f64 = 0.1;
const DEFAULT_BLOCK_DEPTH: usize = 8;

/// 提取时的过滤与离散参数，由配置注入，提取过程中不可变。
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRules {
    /// 不生成图层记录的 DXF 图层名（不区分大小写）。
    pub layer_blacklist: Vec<String>,
    /// 不提取的块名。
    pub name_blacklist: Vec<String>,
    /// 曲线离散的最大弦高（图纸单位）。
    pub approximation_distance: f64,
    pub max_block_depth: usize,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            layer_blacklist: vec!["Defpoints".to_string()],
            name_blacklist: vec!["*Model_Space".to_string(), "DynamicInputDot".to_string()],
            approximation_distance: DEFAULT_APPROXIMATION,
            max_block_depth: DEFAULT_BLOCK_DEPTH,
        }
    }
}

impl ExtractionRules {
    pub fn is_layer_blacklisted(&self, name: &str) -> bool {
        self.layer_blacklist
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(name))
    }

    pub fn is_name_blacklisted(&self, name: &str) -> bool {
        self.name_blacklist.iter().any(|blocked| blocked == name)
    }

    fn tolerance(&self) -> f64 {
        if self.approximation_distance.is_finite() && self.approximation_distance > 0.0 {
            self.approximation_distance
        } else {
            DEFAULT_APPROXIMATION
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedLayer {
    pub name: String,
    pub color_hex: String,
    pub continuous_linetype: bool,
    pub is_block: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    /// `Extraction::layers` 中的下标。
    pub layer: usize,
    pub geometry: GeometryCollection<f64>,
    pub insertion_point: Option<GeoPoint>,
    pub label: Option<String>,
    pub data: Option<Value>,
}

/// 一次完整提取的结果，总是整体替换图纸原有的图层与实体。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub layers: Vec<ExtractedLayer>,
    pub entities: Vec<ExtractedEntity>,
}

impl Extraction {
    pub fn layer_named(&self, name: &str) -> Option<&ExtractedLayer> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    /// 指定图层下的实体。
    pub fn entities_on(&self, name: &str) -> impl Iterator<Item = &ExtractedEntity> {
        let index = self.layers.iter().position(|layer| layer.name == name);
        self.entities
            .iter()
            .filter(move |entity| Some(entity.layer) == index)
    }
}

/// 把模型空间实体转换为经纬度坐标下的图层与实体记录。
#[derive(Debug, Clone, Copy)]
pub struct EntityExtractor<'a> {
    rules: &'a ExtractionRules,
}

impl<'a> EntityExtractor<'a> {
    pub fn new(rules: &'a ExtractionRules) -> Self {
        Self { rules }
    }

    pub fn extract(
        &self,
        document: &Document,
        transforms: &Transforms,
        georef: &Georef,
    ) -> Result<Extraction, EngineError> {
        let matrix = transforms.local_to_projected(document, georef);
        let mut extraction = Extraction::default();
        // DXF 图层名不区分大小写
        let mut native_layers: HashMap<String, usize> = HashMap::new();
        let mut block_layers: HashMap<String, usize> = HashMap::new();

        for layer in document.layers() {
            if self.rules.is_layer_blacklisted(&layer.name) {
                debug!(layer = %layer.name, "跳过黑名单图层");
                continue;
            }
            native_layers
                .entry(layer.name.to_ascii_lowercase())
                .or_insert(extraction.layers.len());
            extraction.layers.push(layer_record(layer, &layer.name, false));
        }

        let mut dropped = 0usize;
        for (id, entity) in document.entities() {
            let layer_name = entity.layer_name();
            if self.rules.is_layer_blacklisted(layer_name) {
                continue;
            }

            if let Entity::BlockReference(reference) = entity {
                if self.rules.is_name_blacklisted(&reference.name) {
                    debug!(block = %reference.name, "跳过黑名单块");
                    continue;
                }
                let mut geometries = Vec::new();
                self.collect_block(document, reference, matrix, 0, transforms, &mut geometries)?;
                if geometries.is_empty() {
                    dropped += 1;
                    continue;
                }

                let layer = match block_layers.get(&reference.name) {
                    Some(index) => *index,
                    None => {
                        let source = document
                            .layer(layer_name)
                            .cloned()
                            .unwrap_or_else(|| Layer::new(layer_name));
                        let index = extraction.layers.len();
                        extraction
                            .layers
                            .push(layer_record(&source, &reference.name, true));
                        block_layers.insert(reference.name.clone(), index);
                        index
                    }
                };
                let insertion_point = transforms.to_world(
                    matrix.transform_point2(reference.insert.as_vec2()),
                )?;
                extraction.entities.push(ExtractedEntity {
                    layer,
                    geometry: GeometryCollection::from(geometries),
                    insertion_point: Some(insertion_point),
                    label: Some(reference.name.clone()),
                    data: attribute_data(reference),
                });
                continue;
            }

            let Some(layer) = native_layers.get(&layer_name.to_ascii_lowercase()).copied() else {
                warn!(layer = %layer_name, "实体引用了未登记的图层");
                continue;
            };
            let Some(geometry) = self.local_geometry(entity) else {
                dropped += 1;
                continue;
            };
            let geometry = project(&geometry, matrix, transforms)?;
            extraction.entities.push(ExtractedEntity {
                layer,
                geometry: GeometryCollection::from(vec![geometry]),
                insertion_point: None,
                label: None,
                data: Some(native_data(document, id, entity)),
            });
        }

        info!(
            epsg = georef.crs,
            layers = extraction.layers.len(),
            entities = extraction.entities.len(),
            dropped,
            "实体提取完成"
        );
        Ok(extraction)
    }

    /// 图纸坐标下的几何；无效多边形返回 `None`。
    fn local_geometry(&self, entity: &Entity) -> Option<Geometry<f64>> {
        let geometry = entity_geometry(entity, self.rules.tolerance())?;
        if let Geometry::Polygon(polygon) = &geometry {
            if !is_valid_polygon(polygon) {
                debug!(
                    dxftype = entity.dxf_type(),
                    layer = %entity.layer_name(),
                    "丢弃无效多边形"
                );
                return None;
            }
        }
        Some(geometry)
    }

    /// 展开块参照。`placement` 为插入者坐标到投影坐标的变换。
    fn collect_block(
        &self,
        document: &Document,
        reference: &BlockReference,
        placement: DAffine2,
        depth: usize,
        transforms: &Transforms,
        out: &mut Vec<Geometry<f64>>,
    ) -> Result<(), EngineError> {
        let Some(block) = document.block(&reference.name) else {
            warn!(block = %reference.name, "块定义不存在");
            return Ok(());
        };
        let placement = placement
            * reference.transform()
            * DAffine2::from_translation(-block.base_point.as_vec2());

        for entity in &block.entities {
            if self.rules.is_layer_blacklisted(entity.layer_name()) {
                continue;
            }
            match entity {
                Entity::BlockReference(inner) => {
                    if depth + 1 >= self.rules.max_block_depth {
                        debug!(block = %inner.name, depth, "块嵌套过深");
                        continue;
                    }
                    if self.rules.is_name_blacklisted(&inner.name) {
                        continue;
                    }
                    self.collect_block(document, inner, placement, depth + 1, transforms, out)?;
                }
                other => {
                    if let Some(geometry) = self.local_geometry(other) {
                        out.push(project(&geometry, placement, transforms)?);
                    }
                }
            }
        }
        Ok(())
    }
}

fn layer_record(source: &Layer, name: &str, is_block: bool) -> ExtractedLayer {
    ExtractedLayer {
        name: name.to_string(),
        color_hex: source.effective_color().to_hex(),
        continuous_linetype: source.is_continuous(),
        is_block,
    }
}

/// 图纸坐标 → 投影坐标 → 经纬度，逐顶点转换。
fn project(
    geometry: &Geometry<f64>,
    placement: DAffine2,
    transforms: &Transforms,
) -> Result<Geometry<f64>, EngineError> {
    try_map_geometry(geometry, &|coord: Coord<f64>| {
        let projected = placement.transform_point2(DVec2::new(coord.x, coord.y));
        let world = transforms.to_world(projected)?;
        Ok(Coord {
            x: world.longitude,
            y: world.latitude,
        })
    })
}

fn native_data(document: &Document, id: EntityId, entity: &Entity) -> Value {
    let mut data = Map::new();
    data.insert("dxftype".to_string(), json!(entity.dxf_type()));
    if let Some(handle) = document.entity_handle(id) {
        data.insert("handle".to_string(), json!(handle));
    }
    if let Some(color) = document.entity_color(id) {
        data.insert("color".to_string(), json!(color.to_hex()));
    }
    Value::Object(data)
}

fn attribute_data(reference: &BlockReference) -> Option<Value> {
    if reference.attributes.is_empty() {
        return None;
    }
    let attributes: Map<String, Value> = reference
        .attributes
        .iter()
        .map(|attribute| (attribute.tag.clone(), json!(attribute.text)))
        .collect();
    Some(Value::Object(attributes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::CrsRegistry;
    use crate::transform::CoordinateTransformer;
    use geocad_core::color::ColorRef;
    use geocad_core::document::{
        Attribute, BlockDefinition, Circle, Line, PointEntity, Polyline, PolylineVertex,
    };
    use geocad_core::geometry::{Point2, Vector2};

    fn georef() -> Georef {
        Georef {
            crs: 32633,
            anchor: GeoPoint::new(15.0, 45.0),
            design_point: Point2::new(0.0, 0.0),
            rotation: 0.0,
        }
    }

    fn closed(points: &[(f64, f64)], layer: &str) -> Entity {
        Entity::Polyline(Polyline {
            vertices: points
                .iter()
                .map(|(x, y)| PolylineVertex::new(Point2::new(*x, *y)))
                .collect(),
            is_closed: true,
            is_lightweight: true,
            layer: layer.to_string(),
        })
    }

    fn document() -> Document {
        let mut document = Document::new();
        let mut walls = Layer::new("Walls");
        walls.color = ColorRef::Aci(1);
        document.add_layer(walls);
        document.add_layer(Layer::new("Defpoints"));
        let mut trees = Layer::new("Trees");
        trees.true_color = Some(ColorRef::Rgb(0, 170, 0));
        trees.linetype = "DASHED".to_string();
        document.add_layer(trees);

        document.add_entity_with_meta(
            Entity::Line(Line {
                start: Point2::new(0.0, 0.0),
                end: Point2::new(10.0, 0.0),
                layer: "Walls".to_string(),
            }),
            Some("50".to_string()),
            None,
        );
        document.add_entity(closed(
            &[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            "Walls",
        ));
        document.add_entity(closed(
            &[(20.0, 0.0), (30.0, 10.0), (30.0, 0.0), (20.0, 10.0)],
            "Walls",
        ));
        document.add_entity(Entity::Point(PointEntity {
            location: Point2::new(1.0, 1.0),
            layer: "Defpoints".to_string(),
        }));

        document.add_block_definition(BlockDefinition {
            name: "TREE".to_string(),
            base_point: Point2::new(0.0, 0.0),
            entities: vec![Entity::Circle(Circle {
                center: Point2::new(0.0, 0.0),
                radius: 1.0,
                layer: "0".to_string(),
            })],
        });
        document.add_entity(Entity::BlockReference(BlockReference {
            name: "TREE".to_string(),
            insert: Point2::new(20.0, 20.0),
            scale: Vector2::new(2.0, 2.0),
            rotation: 0.0,
            attributes: vec![Attribute {
                tag: "SPECIES".to_string(),
                text: "Oak".to_string(),
            }],
            layer: "Trees".to_string(),
        }));
        document
    }

    fn run(document: &Document, rules: &ExtractionRules) -> (Extraction, Transforms) {
        let registry = CrsRegistry::new();
        let transforms = CoordinateTransformer::new(&registry)
            .build(&georef())
            .expect("构造转换失败");
        let extraction = EntityExtractor::new(rules)
            .extract(document, &transforms, &georef())
            .expect("提取失败");
        (extraction, transforms)
    }

    #[test]
    fn blacklisted_layers_produce_no_records() {
        let (extraction, _) = run(&document(), &ExtractionRules::default());
        let names: Vec<&str> = extraction.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["Walls", "Trees", "TREE"]);
        assert_eq!(extraction.layers[0].color_hex, "#FF0000");
        assert_eq!(extraction.layers[1].color_hex, "#00aa00");
        assert!(!extraction.layers[1].continuous_linetype);
        assert!(extraction.layers[2].is_block);
    }

    #[test]
    fn self_intersecting_polygon_is_dropped_and_siblings_kept() {
        let (extraction, _) = run(&document(), &ExtractionRules::default());
        let walls: Vec<&ExtractedEntity> = extraction.entities_on("Walls").collect();
        assert_eq!(walls.len(), 2);
        assert_eq!(walls[0].data.as_ref().expect("应有元数据")["handle"], "50");
        assert!(matches!(walls[1].geometry.0[0], Geometry::Polygon(_)));
    }

    #[test]
    fn design_point_maps_to_anchor() {
        let (extraction, _) = run(&document(), &ExtractionRules::default());
        let line = extraction.entities_on("Walls").next().expect("应有直线");
        let Geometry::LineString(line) = &line.geometry.0[0] else {
            panic!("期望折线");
        };
        assert!((line.0[0].x - 15.0).abs() < 1e-8);
        assert!((line.0[0].y - 45.0).abs() < 1e-8);
        assert!(line.0[1].x > 15.0);
    }

    #[test]
    fn block_reference_becomes_block_layer_entity() {
        let (extraction, transforms) = run(&document(), &ExtractionRules::default());
        let tree = extraction.entities_on("TREE").next().expect("应有块实体");
        assert_eq!(tree.label.as_deref(), Some("TREE"));
        assert_eq!(
            tree.data.as_ref().expect("应有属性"),
            &json!({"SPECIES": "Oak"})
        );
        let expected = transforms
            .to_world(transforms.projected_anchor + DVec2::new(20.0, 20.0))
            .expect("反算失败");
        let insertion = tree.insertion_point.expect("应有插入点");
        assert!((insertion.longitude - expected.longitude).abs() < 1e-9);
        assert!((insertion.latitude - expected.latitude).abs() < 1e-9);
        assert_eq!(tree.geometry.0.len(), 1);
    }

    #[test]
    fn blacklisted_block_names_are_skipped() {
        let rules = ExtractionRules {
            name_blacklist: vec!["TREE".to_string()],
            ..ExtractionRules::default()
        };
        let (extraction, _) = run(&document(), &rules);
        assert!(extraction.layer_named("TREE").is_none());
        assert_eq!(extraction.entities.len(), 2);
    }

    #[test]
    fn layer_blacklist_ignores_case() {
        let rules = ExtractionRules::default();
        assert!(rules.is_layer_blacklisted("DEFPOINTS"));
        assert!(!rules.is_layer_blacklisted("Walls"));
    }

    #[test]
    fn entity_layer_names_match_table_ignoring_case() {
        let mut document = document();
        document.add_entity(Entity::Line(Line {
            start: Point2::new(0.0, 5.0),
            end: Point2::new(10.0, 5.0),
            layer: "WALLS".to_string(),
        }));
        let (extraction, _) = run(&document, &ExtractionRules::default());
        let names: Vec<&str> = extraction.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["Walls", "Trees", "TREE"]);
        assert_eq!(extraction.entities_on("Walls").count(), 3);
    }

    #[test]
    fn extraction_is_idempotent() {
        let document = document();
        let rules = ExtractionRules::default();
        let (first, _) = run(&document, &rules);
        let (second, _) = run(&document, &rules);
        assert_eq!(first, second);
    }
}
