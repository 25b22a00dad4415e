pub mod color;

pub mod geometry {
    use glam::{DVec2, DVec3};
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 三维点，GEODATA 的设计点、参考点与 3DFACE 顶点使用。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point3(pub DVec3);

    impl Point3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        /// 丢弃 Z 分量。
        #[inline]
        pub fn truncate(self) -> Point2 {
            Point2(self.0.truncate())
        }
    }

    impl From<DVec3> for Point3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }
}

pub mod document {
    use std::collections::HashMap;

    use glam::{DAffine2, DVec2};
    use serde::{Deserialize, Serialize};

    use crate::color::ColorRef;
    use crate::geometry::{Point2, Point3, Vector2};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    /// LAYER 表中的一条记录。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Layer {
        pub name: String,
        pub color: ColorRef,
        /// 组码 420，存在时优先于 `color`。
        pub true_color: Option<ColorRef>,
        pub linetype: String,
    }

    impl Layer {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                color: ColorRef::default(),
                true_color: None,
                linetype: "Continuous".to_string(),
            }
        }

        /// 图层的有效颜色：真彩色优先，否则使用调色板索引。
        #[inline]
        pub fn effective_color(&self) -> ColorRef {
            self.true_color.unwrap_or(self.color)
        }

        pub fn is_continuous(&self) -> bool {
            let linetype = self.linetype.trim();
            linetype.is_empty()
                || linetype.eq_ignore_ascii_case("continuous")
                || linetype.eq_ignore_ascii_case("bylayer")
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum Entity {
        Point(PointEntity),
        Line(Line),
        Polyline(Polyline),
        Face3D(ThreeDFace),
        Circle(Circle),
        Arc(Arc),
        Ellipse(Ellipse),
        Spline(Spline),
        Hatch(Hatch),
        BlockReference(BlockReference),
    }

    impl Entity {
        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Point(point) => &point.layer,
                Entity::Line(line) => &line.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Face3D(face) => &face.layer,
                Entity::Circle(circle) => &circle.layer,
                Entity::Arc(arc) => &arc.layer,
                Entity::Ellipse(ellipse) => &ellipse.layer,
                Entity::Spline(spline) => &spline.layer,
                Entity::Hatch(hatch) => &hatch.layer,
                Entity::BlockReference(reference) => &reference.layer,
            }
        }

        /// DXF 实体类型名，便于日志与元数据输出。
        pub fn dxf_type(&self) -> &'static str {
            match self {
                Entity::Point(_) => "POINT",
                Entity::Line(_) => "LINE",
                Entity::Polyline(polyline) if polyline.is_lightweight => "LWPOLYLINE",
                Entity::Polyline(_) => "POLYLINE",
                Entity::Face3D(_) => "3DFACE",
                Entity::Circle(_) => "CIRCLE",
                Entity::Arc(_) => "ARC",
                Entity::Ellipse(_) => "ELLIPSE",
                Entity::Spline(_) => "SPLINE",
                Entity::Hatch(_) => "HATCH",
                Entity::BlockReference(_) => "INSERT",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PointEntity {
        pub location: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Line {
        pub start: Point2,
        pub end: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PolylineVertex {
        pub position: Point2,
        pub bulge: f64,
    }

    impl PolylineVertex {
        #[inline]
        pub fn new(position: Point2) -> Self {
            Self {
                position,
                bulge: 0.0,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<PolylineVertex>,
        pub is_closed: bool,
        /// LWPOLYLINE 为 true，经典 POLYLINE 为 false。
        pub is_lightweight: bool,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ThreeDFace {
        pub vertices: [Point3; 4],
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Circle {
        pub center: Point2,
        pub radius: f64,
        pub layer: String,
    }

    /// 角度均为弧度，逆时针。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Arc {
        pub center: Point2,
        pub radius: f64,
        pub start_angle: f64,
        pub end_angle: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Ellipse {
        pub center: Point2,
        pub major_axis: Vector2,
        pub ratio: f64,
        pub start_parameter: f64,
        pub end_parameter: f64,
        pub layer: String,
    }

    impl Ellipse {
        pub fn is_full(&self) -> bool {
            let span = (self.end_parameter - self.start_parameter).abs();
            (span - std::f64::consts::TAU).abs() < 1e-9 || span < 1e-12
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Spline {
        pub degree: i32,
        pub is_closed: bool,
        pub control_points: Vec<Point2>,
        pub fit_points: Vec<Point2>,
        pub knot_values: Vec<f64>,
        pub weights: Vec<f64>,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum HatchEdge {
        Line {
            start: Point2,
            end: Point2,
        },
        Arc {
            center: Point2,
            radius: f64,
            start_angle: f64,
            end_angle: f64,
            is_counter_clockwise: bool,
        },
        PolylineSegment {
            start: Point2,
            end: Point2,
            bulge: f64,
        },
        Ellipse {
            center: Point2,
            major_axis: Vector2,
            minor_ratio: f64,
            start_angle: f64,
            end_angle: f64,
            is_counter_clockwise: bool,
        },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct HatchLoop {
        pub is_polyline: bool,
        pub edges: Vec<HatchEdge>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Hatch {
        pub pattern_name: String,
        pub is_solid: bool,
        pub loops: Vec<HatchLoop>,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Attribute {
        pub tag: String,
        pub text: String,
    }

    /// 块参照（INSERT）。`rotation` 为弧度。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BlockReference {
        pub name: String,
        pub insert: Point2,
        pub scale: Vector2,
        pub rotation: f64,
        pub attributes: Vec<Attribute>,
        pub layer: String,
    }

    impl BlockReference {
        /// 块坐标到插入者坐标的变换（不含块基点偏移）。
        pub fn transform(&self) -> DAffine2 {
            DAffine2::from_scale_angle_translation(
                self.scale.as_vec2(),
                self.rotation,
                self.insert.as_vec2(),
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BlockDefinition {
        pub name: String,
        pub base_point: Point2,
        pub entities: Vec<Entity>,
    }

    /// GEODATA 对象的坐标类型（组码 70）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum GeoCoordinateType {
        Unknown,
        LocalGrid,
        ProjectedGrid,
        Geographic,
    }

    impl GeoCoordinateType {
        pub fn from_code(code: i16) -> Self {
            match code {
                1 => GeoCoordinateType::LocalGrid,
                2 => GeoCoordinateType::ProjectedGrid,
                3 => GeoCoordinateType::Geographic,
                _ => GeoCoordinateType::Unknown,
            }
        }

        pub fn code(self) -> i16 {
            match self {
                GeoCoordinateType::Unknown => 0,
                GeoCoordinateType::LocalGrid => 1,
                GeoCoordinateType::ProjectedGrid => 2,
                GeoCoordinateType::Geographic => 3,
            }
        }
    }

    /// 模型空间的地理数据扩展（GEODATA 对象）。
    ///
    /// 设计点位于图纸 WCS，参考点位于 `coordinate_system_definition` 描述的投影坐标系，
    /// 北向向量为 WCS 中指向正北的二维方向。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GeoData {
        pub handle: Option<String>,
        pub owner: Option<String>,
        pub version: i32,
        pub coordinate_type: GeoCoordinateType,
        pub design_point: Point3,
        pub reference_point: Point3,
        pub horizontal_unit_scale: f64,
        pub horizontal_units: i32,
        pub north_direction: Vector2,
        pub coordinate_system_definition: String,
    }

    impl GeoData {
        pub fn new(
            design_point: Point3,
            reference_point: Point3,
            north_direction: Vector2,
            coordinate_system_definition: impl Into<String>,
        ) -> Self {
            Self {
                handle: None,
                owner: None,
                version: 2,
                coordinate_type: GeoCoordinateType::ProjectedGrid,
                design_point,
                reference_point,
                horizontal_unit_scale: 1.0,
                horizontal_units: 6,
                north_direction,
                coordinate_system_definition: coordinate_system_definition.into(),
            }
        }

        /// 北向向量相对 WCS +Y 的顺时针角（弧度）。
        #[inline]
        pub fn rotation_radians(&self) -> f64 {
            self.north_direction.x().atan2(self.north_direction.y())
        }

        #[inline]
        pub fn rotation_degrees(&self) -> f64 {
            self.rotation_radians().to_degrees()
        }

        /// WCS 到投影坐标系的变换矩阵：平移设计点至原点、缩放、旋转使北向对齐 +Y，
        /// 再平移到参考点。不做任何一致性检查。
        pub fn crs_transformation_matrix(&self) -> DAffine2 {
            let scale = if self.horizontal_unit_scale.abs() < f64::EPSILON {
                1.0
            } else {
                self.horizontal_unit_scale
            };
            DAffine2::from_translation(self.reference_point.truncate().as_vec2())
                * DAffine2::from_angle(self.rotation_radians())
                * DAffine2::from_scale(DVec2::splat(scale))
                * DAffine2::from_translation(-self.design_point.truncate().as_vec2())
        }
    }

    /// 解析后的 DXF 文档，仅保留地理配准与提取所需的内容。
    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Document {
        /// 按声明顺序保存的图层表。
        layers: Vec<Layer>,
        entities: Vec<(EntityId, Entity)>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        handles: HashMap<EntityId, String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        entity_colors: HashMap<EntityId, ColorRef>,
        next_entity_id: u64,
        blocks: HashMap<String, BlockDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geodata: Option<GeoData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modelspace_record: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle_seed: Option<String>,
    }

    impl Document {
        pub fn new() -> Self {
            Self::default()
        }

        /// 登记图层；同名图层只保留首次声明。
        pub fn add_layer(&mut self, layer: Layer) {
            if self.layer(&layer.name).is_none() {
                self.layers.push(layer);
            }
        }

        /// 确保实体引用的图层存在；未在 LAYER 表声明的图层使用默认属性追加到末尾。
        pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
            let name = name.as_ref();
            if self.layer(name).is_none() {
                self.layers.push(Layer::new(name));
            }
        }

        #[inline]
        pub fn layers(&self) -> &[Layer] {
            &self.layers
        }

        /// 按名称查找图层，不区分大小写。
        pub fn layer(&self, name: &str) -> Option<&Layer> {
            self.layers
                .iter()
                .find(|layer| layer.name.eq_ignore_ascii_case(name))
        }

        pub fn add_entity(&mut self, entity: Entity) -> EntityId {
            self.ensure_layer(entity.layer_name().to_string());
            let id = EntityId::new(self.next_entity_id);
            self.next_entity_id += 1;
            self.entities.push((id, entity));
            id
        }

        pub fn add_entity_with_meta(
            &mut self,
            entity: Entity,
            handle: Option<String>,
            color: Option<ColorRef>,
        ) -> EntityId {
            let id = self.add_entity(entity);
            if let Some(handle) = handle {
                self.handles.insert(id, handle);
            }
            if let Some(color) = color {
                self.entity_colors.insert(id, color);
            }
            id
        }

        /// 模型空间实体，按文件顺序。
        pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
            self.entities.iter().map(|(id, entity)| (*id, entity))
        }

        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.entities
                .iter()
                .find(|(entity_id, _)| *entity_id == id)
                .map(|(_, entity)| entity)
        }

        #[inline]
        pub fn entity_count(&self) -> usize {
            self.entities.len()
        }

        pub fn entity_handle(&self, id: EntityId) -> Option<&str> {
            self.handles.get(&id).map(String::as_str)
        }

        pub fn entity_color(&self, id: EntityId) -> Option<ColorRef> {
            self.entity_colors.get(&id).copied()
        }

        pub fn add_block_definition(&mut self, definition: BlockDefinition) {
            self.blocks.insert(definition.name.clone(), definition);
        }

        pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
            self.blocks.get(name)
        }

        #[inline]
        pub fn geodata(&self) -> Option<&GeoData> {
            self.geodata.as_ref()
        }

        pub fn set_geodata(&mut self, geodata: GeoData) {
            self.geodata = Some(geodata);
        }

        pub fn take_geodata(&mut self) -> Option<GeoData> {
            self.geodata.take()
        }

        #[inline]
        pub fn modelspace_record(&self) -> Option<&str> {
            self.modelspace_record.as_deref()
        }

        pub fn set_modelspace_record(&mut self, handle: impl Into<String>) {
            self.modelspace_record = Some(handle.into());
        }

        #[inline]
        pub fn handle_seed(&self) -> Option<&str> {
            self.handle_seed.as_deref()
        }

        pub fn set_handle_seed(&mut self, seed: impl Into<String>) {
            self.handle_seed = Some(seed.into());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::f64::consts::FRAC_PI_2;

        #[test]
        fn document_keeps_layer_declaration_order() {
            let mut doc = Document::new();
            doc.add_layer(Layer::new("Walls"));
            doc.add_layer(Layer::new("Doors"));
            doc.add_entity(Entity::Line(Line {
                start: Point2::new(0.0, 0.0),
                end: Point2::new(1.0, 0.0),
                layer: "Furniture".to_string(),
            }));
            doc.add_layer(Layer::new("Walls"));

            let names: Vec<&str> = doc.layers().iter().map(|l| l.name.as_str()).collect();
            assert_eq!(names, ["Walls", "Doors", "Furniture"]);
            assert_eq!(doc.entity_count(), 1);
        }

        #[test]
        fn layer_linetype_and_color_rules() {
            let mut layer = Layer::new("Hidden");
            assert!(layer.is_continuous());
            layer.linetype = "DASHED".to_string();
            assert!(!layer.is_continuous());

            layer.color = ColorRef::Aci(1);
            assert_eq!(layer.effective_color(), ColorRef::Aci(1));
            layer.true_color = Some(ColorRef::Rgb(1, 2, 3));
            assert_eq!(layer.effective_color(), ColorRef::Rgb(1, 2, 3));
        }

        #[test]
        fn geodata_rotation_follows_north_direction() {
            let geodata = GeoData::new(
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(0.0, 0.0, 0.0),
                Vector2::new(1.0, 0.0),
                "",
            );
            assert!((geodata.rotation_radians() - FRAC_PI_2).abs() < 1e-12);
            assert!((geodata.rotation_degrees() - 90.0).abs() < 1e-9);
        }

        #[test]
        fn crs_matrix_maps_design_point_to_reference_point() {
            let rotation: f64 = 30f64.to_radians();
            let geodata = GeoData::new(
                Point3::new(10.0, 20.0, 0.0),
                Point3::new(500_000.0, 4_650_000.0, 0.0),
                Vector2::new(rotation.sin(), rotation.cos()),
                "",
            );
            let matrix = geodata.crs_transformation_matrix();

            let mapped = matrix.transform_point2(DVec2::new(10.0, 20.0));
            assert!((mapped.x - 500_000.0).abs() < 1e-6);
            assert!((mapped.y - 4_650_000.0).abs() < 1e-6);

            // 北向向量必须映射到投影坐标系的 +Y
            let north = matrix.transform_vector2(geodata.north_direction.as_vec2());
            assert!(north.x.abs() < 1e-12);
            assert!((north.y - 1.0).abs() < 1e-12);
        }
    }
}
