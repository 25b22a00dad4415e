use std::fs;
use std::path::Path;

use geocad_core::{
    color::ColorRef,
    document::{
        Arc, Attribute, BlockDefinition, BlockReference, Circle, Document, Ellipse, Entity,
        GeoCoordinateType, GeoData, Hatch, HatchEdge, HatchLoop, Layer, Line, PointEntity,
        Polyline, PolylineVertex, Spline, ThreeDFace,
    },
    geometry::{Point2, Point3, Vector2},
};
use thiserror::Error;
use tracing::{debug, warn};

mod geodata;

pub use geodata::GeodataInjector;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

pub trait DocumentLoader {
    /// 从内存中的 DXF 文本解析文档。
    fn load_str(&self, source: &str) -> Result<Document, IoError>;

    fn load(&self, path: &Path) -> Result<Document, IoError> {
        let source = read_source(path)?;
        self.load_str(&source)
    }
}

/// 读取 DXF 文件为文本。旧版本 DXF 可能不是 UTF-8，按有损方式解码。
pub fn read_source(path: &Path) -> Result<String, IoError> {
    let bytes = fs::read(path).map_err(|source| IoError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn write_source(path: &Path, content: &str) -> Result<(), IoError> {
    fs::write(path, content).map_err(|source| IoError::WriteError {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DxfFacade;

impl DxfFacade {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentLoader for DxfFacade {
    fn load_str(&self, source: &str) -> Result<Document, IoError> {
        if source.starts_with("AutoCAD Binary DXF") {
            return Err(IoError::UnsupportedFeature("二进制 DXF".to_string()));
        }
        let parser = DxfParser::new(source);
        parser.parse().map_err(IoError::from)
    }
}

#[derive(Debug)]
pub(crate) enum DxfError {
    Unsupported { feature: String },
    Invalid { message: String },
}

impl DxfError {
    fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<DxfError> for IoError {
    fn from(err: DxfError) -> Self {
        match err {
            DxfError::Unsupported { feature } => IoError::UnsupportedFeature(feature),
            DxfError::Invalid { message } => IoError::InvalidDocument(message),
        }
    }
}

/// 每个实体都可能携带的公共字段。
#[derive(Debug, Default)]
struct CommonFields {
    layer: Option<String>,
    handle: Option<String>,
    color: Option<ColorRef>,
    true_color: Option<ColorRef>,
}

impl CommonFields {
    /// 消费公共组码，返回 true 表示已处理。
    fn accept(&mut self, code: i32, value: &str, context: &str) -> Result<bool, DxfError> {
        match code {
            8 => self.layer = Some(value.trim().to_string()),
            5 => self.handle = Some(value.trim().to_string()),
            62 => {
                let raw = parse_i32(value, context)?;
                // 0 与 256 分别表示 BYBLOCK/BYLAYER，不作为实体颜色
                if raw != 0 && raw.abs() != 256 {
                    self.color = ColorRef::from_aci(raw).ok();
                }
            }
            420 => {
                let raw = parse_i32(value, context)?;
                self.true_color = Some(ColorRef::from_true_color(raw as u32));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn layer(&mut self) -> String {
        self.layer.take().unwrap_or_else(|| "0".to_string())
    }

    fn color(&self) -> Option<ColorRef> {
        self.true_color.or(self.color)
    }
}

struct ParsedEntity {
    entity: Entity,
    handle: Option<String>,
    color: Option<ColorRef>,
}

impl ParsedEntity {
    fn new(entity: Entity, common: &CommonFields) -> Self {
        Self {
            entity,
            handle: common.handle.clone(),
            color: common.color(),
        }
    }
}

struct DxfParser<'a> {
    reader: DxfReader<'a>,
    geodata: Vec<GeoData>,
}

impl<'a> DxfParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
            geodata: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Document, DxfError> {
        let mut document = Document::new();
        while let Some((code, value)) = self.reader.next_pair()? {
            if code == 999 {
                continue;
            }
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "意外的组码 {code}（期望 0 表示 SECTION/EOF）"
                )));
            }
            match value.trim() {
                "SECTION" => {
                    let (name_code, name) = self
                        .reader
                        .next_pair()?
                        .ok_or_else(|| DxfError::invalid("SECTION 缺少名称（组码 2）"))?;
                    if name_code != 2 {
                        return Err(DxfError::invalid(format!(
                            "SECTION 名称使用了组码 {name_code}（期望 2）"
                        )));
                    }
                    match name.trim() {
                        "HEADER" => self.parse_header(&mut document)?,
                        "TABLES" => self.parse_tables(&mut document)?,
                        "BLOCKS" => self.parse_blocks(&mut document)?,
                        "ENTITIES" => self.parse_entities(&mut document)?,
                        "OBJECTS" => self.parse_objects()?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => break,
                unexpected => {
                    return Err(DxfError::invalid(format!(
                        "意外的标记 {unexpected}，期望 SECTION 或 EOF"
                    )));
                }
            }
        }

        self.attach_geodata(&mut document);
        Ok(document)
    }

    /// 多个 GEODATA 时优先选择属于模型空间块记录的那个。
    fn attach_geodata(&mut self, document: &mut Document) {
        if self.geodata.is_empty() {
            return;
        }
        if self.geodata.len() > 1 {
            warn!(count = self.geodata.len(), "文档包含多个 GEODATA 对象");
        }
        let index = document
            .modelspace_record()
            .and_then(|record| {
                self.geodata
                    .iter()
                    .position(|geo| geo.owner.as_deref() == Some(record))
            })
            .unwrap_or(0);
        let geodata = self.geodata.swap_remove(index);
        document.set_geodata(geodata);
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    return Err(DxfError::invalid("SECTION 未找到 ENDSEC 终止标记"));
                }
            }
        }
        Ok(())
    }

    fn parse_header(&mut self, document: &mut Document) -> Result<(), DxfError> {
        let mut variable: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some((9, name)) => variable = Some(name.trim().to_string()),
                Some((5, value)) if variable.as_deref() == Some("$HANDSEED") => {
                    document.set_handle_seed(value.trim());
                }
                Some(_) => {}
                None => return Err(DxfError::invalid("HEADER 段提前结束")),
            }
        }
        Ok(())
    }

    fn parse_tables(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("TABLES 段提前结束")),
            };
            if code != 0 {
                continue;
            }
            match value.trim() {
                "ENDSEC" => break,
                "LAYER" => {
                    let layer = self.parse_layer_record()?;
                    document.add_layer(layer);
                }
                "BLOCK_RECORD" => {
                    if let Some(handle) = self.parse_modelspace_record()? {
                        document.set_modelspace_record(handle);
                    }
                }
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    fn parse_layer_record(&mut self) -> Result<Layer, DxfError> {
        let mut name: Option<String> = None;
        let mut color = ColorRef::default();
        let mut true_color = None;
        let mut linetype = "Continuous".to_string();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    62 => {
                        let raw = parse_i32(&value, "LAYER 颜色（组码 62）")?;
                        color = ColorRef::from_aci(raw).map_err(|err| {
                            DxfError::invalid(format!("LAYER 颜色无效：{err}"))
                        })?;
                    }
                    420 => {
                        let raw = parse_i32(&value, "LAYER 真彩色（组码 420）")?;
                        true_color = Some(ColorRef::from_true_color(raw as u32));
                    }
                    6 => linetype = value.trim().to_string(),
                    _ => {}
                },
                None => return Err(DxfError::invalid("LAYER 记录未正确结束")),
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("LAYER 记录缺少名称（组码 2）"))?;
        Ok(Layer {
            name,
            color,
            true_color,
            linetype,
        })
    }

    /// 仅关心 `*Model_Space` 的块记录句柄，其余记录返回 None。
    fn parse_modelspace_record(&mut self) -> Result<Option<String>, DxfError> {
        let mut name: Option<String> = None;
        let mut handle: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((2, value)) => name = Some(value.trim().to_string()),
                Some((5, value)) => handle = Some(value.trim().to_string()),
                Some(_) => {}
                None => return Err(DxfError::invalid("BLOCK_RECORD 记录未正确结束")),
            }
        }
        let is_modelspace = name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case("*Model_Space"));
        Ok(if is_modelspace { handle } else { None })
    }

    fn parse_entities(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("ENTITIES 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "ENTITIES 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                kind => {
                    if let Some(parsed) = self.parse_entity(kind)? {
                        document.add_entity_with_meta(parsed.entity, parsed.handle, parsed.color);
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_blocks(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("BLOCKS 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "BLOCKS 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                "BLOCK" => {
                    if let Some(definition) = self.parse_block_definition()? {
                        document.add_block_definition(definition);
                    }
                }
                _ => {
                    // 未预期的条目（例如孤立的 ENDBLK），直接跳过
                    self.skip_entity_body()?;
                }
            }
        }
        Ok(())
    }

    fn parse_block_definition(&mut self) -> Result<Option<BlockDefinition>, DxfError> {
        let mut name: Option<String> = None;
        let mut base_x: f64 = 0.0;
        let mut base_y: f64 = 0.0;
        let mut collect_entities = true;
        let mut entities: Vec<Entity> = Vec::new();

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ENDBLK" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    kind => {
                        if collect_entities {
                            if let Some(parsed) = self.parse_entity(kind)? {
                                entities.push(parsed.entity);
                            }
                        } else {
                            self.skip_entity_body()?;
                        }
                    }
                },
                Some((code, value)) => match code {
                    2 => {
                        let trimmed = value.trim().to_string();
                        // 匿名块（*Model_Space、*D1 等）不收集实体
                        collect_entities = !trimmed.starts_with('*');
                        name = Some(trimmed);
                    }
                    10 => base_x = parse_f64(&value, "BLOCK 基点 X")?,
                    20 => base_y = parse_f64(&value, "BLOCK 基点 Y")?,
                    _ => {}
                },
                None => {
                    return Err(DxfError::invalid("BLOCK 定义未找到 ENDBLK 终止标记"));
                }
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("BLOCK 缺少名称（组码 2）"))?;
        if !collect_entities {
            return Ok(None);
        }

        Ok(Some(BlockDefinition {
            name,
            base_point: Point2::new(base_x, base_y),
            entities,
        }))
    }

    fn parse_objects(&mut self) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("OBJECTS 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "OBJECTS 段遇到组码 {code}（期望 0 表示对象起始）"
                )));
            }
            match value.trim() {
                "ENDSEC" => break,
                "GEODATA" => {
                    let geodata = self.parse_geodata()?;
                    self.geodata.push(geodata);
                }
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    fn parse_geodata(&mut self) -> Result<GeoData, DxfError> {
        let mut handle: Option<String> = None;
        let mut owner: Option<String> = None;
        let mut in_reactors = false;
        let mut version: i32 = 2;
        let mut coordinate_type = GeoCoordinateType::Unknown;
        let mut design = [None; 3];
        let mut reference = [None; 3];
        let mut north = [None; 2];
        let mut unit_scale: f64 = 1.0;
        let mut units: i32 = 6;
        let mut definition_chunks: Vec<String> = Vec::new();
        let mut definition_last: Option<String> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    5 => handle = Some(value.trim().to_string()),
                    102 => in_reactors = value.trim().starts_with('{'),
                    330 if !in_reactors => owner = Some(value.trim().to_string()),
                    90 => version = parse_i32(&value, "GEODATA 版本（组码 90）")?,
                    70 => {
                        coordinate_type = GeoCoordinateType::from_code(parse_i16(
                            &value,
                            "GEODATA 坐标类型（组码 70）",
                        )?)
                    }
                    10 => assign_coord(&mut design[0], &value, "GEODATA 设计点 X（组码 10）")?,
                    20 => assign_coord(&mut design[1], &value, "GEODATA 设计点 Y（组码 20）")?,
                    30 => assign_coord(&mut design[2], &value, "GEODATA 设计点 Z（组码 30）")?,
                    11 => {
                        assign_coord(&mut reference[0], &value, "GEODATA 参考点 X（组码 11）")?
                    }
                    21 => {
                        assign_coord(&mut reference[1], &value, "GEODATA 参考点 Y（组码 21）")?
                    }
                    31 => {
                        assign_coord(&mut reference[2], &value, "GEODATA 参考点 Z（组码 31）")?
                    }
                    12 => assign_coord(&mut north[0], &value, "GEODATA 北向 X（组码 12）")?,
                    22 => assign_coord(&mut north[1], &value, "GEODATA 北向 Y（组码 22）")?,
                    40 => unit_scale = parse_f64(&value, "GEODATA 水平单位比例（组码 40）")?,
                    91 => units = parse_i32(&value, "GEODATA 水平单位（组码 91）")?,
                    303 => definition_chunks.push(value),
                    301 => definition_last = Some(value),
                    _ => {
                        // 垂直单位、海平面修正、网格点等暂不使用
                    }
                },
                None => return Err(DxfError::invalid("GEODATA 未正确结束")),
            }
        }

        let design_point = Point3::new(
            design[0].ok_or_else(|| DxfError::invalid("GEODATA 缺少设计点 X（组码 10）"))?,
            design[1].ok_or_else(|| DxfError::invalid("GEODATA 缺少设计点 Y（组码 20）"))?,
            design[2].unwrap_or(0.0),
        );
        let reference_point = Point3::new(
            reference[0].ok_or_else(|| DxfError::invalid("GEODATA 缺少参考点 X（组码 11）"))?,
            reference[1].ok_or_else(|| DxfError::invalid("GEODATA 缺少参考点 Y（组码 21）"))?,
            reference[2].unwrap_or(0.0),
        );
        let north_direction = Vector2::new(north[0].unwrap_or(0.0), north[1].unwrap_or(1.0));

        let mut definition = definition_chunks.concat();
        if let Some(last) = definition_last {
            definition.push_str(&last);
        }
        debug!(
            handle = handle.as_deref().unwrap_or("-"),
            version, "解析 GEODATA 对象"
        );

        Ok(GeoData {
            handle,
            owner,
            version,
            coordinate_type,
            design_point,
            reference_point,
            horizontal_unit_scale: unit_scale,
            horizontal_units: units,
            north_direction,
            coordinate_system_definition: decode_caret(&definition),
        })
    }

    /// 解析单个实体；不支持的类型跳过并返回 None。
    fn parse_entity(&mut self, kind: &str) -> Result<Option<ParsedEntity>, DxfError> {
        let parsed = match kind {
            "POINT" => self.parse_point()?,
            "LINE" => self.parse_line()?,
            "LWPOLYLINE" => self.parse_lwpolyline()?,
            "POLYLINE" => match self.parse_polyline()? {
                Some(parsed) => parsed,
                None => return Ok(None),
            },
            "3DFACE" => self.parse_3dface()?,
            "CIRCLE" => self.parse_circle()?,
            "ARC" => self.parse_arc()?,
            "ELLIPSE" => self.parse_ellipse()?,
            "SPLINE" => self.parse_spline()?,
            "HATCH" => self.parse_hatch()?,
            "INSERT" => self.parse_insert()?,
            other => {
                debug!(kind = other, "跳过暂不支持的实体类型");
                self.skip_entity_body()?;
                return Ok(None);
            }
        };
        Ok(Some(parsed))
    }

    fn parse_point(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut x = None;
        let mut y = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "POINT 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut x, &value, "POINT 位置 X（组码 10）")?,
                        20 => assign_coord(&mut y, &value, "POINT 位置 Y（组码 20）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("POINT 未正确结束")),
            }
        }

        let x = x.ok_or_else(|| DxfError::invalid("POINT 缺少位置 X（组码 10）"))?;
        let y = y.ok_or_else(|| DxfError::invalid("POINT 缺少位置 Y（组码 20）"))?;
        let entity = Entity::Point(PointEntity {
            location: Point2::new(x, y),
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_line(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut start_x = None;
        let mut start_y = None;
        let mut end_x = None;
        let mut end_y = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "LINE 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut start_x, &value, "LINE 起点 X（组码 10）")?,
                        20 => assign_coord(&mut start_y, &value, "LINE 起点 Y（组码 20）")?,
                        11 => assign_coord(&mut end_x, &value, "LINE 终点 X（组码 11）")?,
                        21 => assign_coord(&mut end_y, &value, "LINE 终点 Y（组码 21）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("LINE 未正确结束")),
            }
        }

        let sx = start_x.ok_or_else(|| DxfError::invalid("LINE 缺少起点 X（组码 10）"))?;
        let sy = start_y.ok_or_else(|| DxfError::invalid("LINE 缺少起点 Y（组码 20）"))?;
        let ex = end_x.ok_or_else(|| DxfError::invalid("LINE 缺少终点 X（组码 11）"))?;
        let ey = end_y.ok_or_else(|| DxfError::invalid("LINE 缺少终点 Y（组码 21）"))?;

        let entity = Entity::Line(Line {
            start: Point2::new(sx, sy),
            end: Point2::new(ex, ey),
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_lwpolyline(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut is_closed = false;
        let mut vertices: Vec<PolylineVertex> = Vec::new();
        let mut pending_x: Option<f64> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "LWPOLYLINE 公共字段")? {
                        continue;
                    }
                    match code {
                        70 => {
                            let flag = parse_i32(&value, "LWPOLYLINE 标志")?;
                            is_closed = flag & 0x01 == 0x01;
                        }
                        10 => {
                            let x = parse_f64(&value, "LWPOLYLINE 顶点 X")?;
                            if pending_x.replace(x).is_some() {
                                return Err(DxfError::invalid(
                                    "LWPOLYLINE 顶点缺少对应的 Y（组码 20）",
                                ));
                            }
                        }
                        20 => {
                            let y = parse_f64(&value, "LWPOLYLINE 顶点 Y")?;
                            let x = pending_x.take().ok_or_else(|| {
                                DxfError::invalid("LWPOLYLINE 顶点缺少对应的 X（组码 10）")
                            })?;
                            vertices.push(PolylineVertex::new(Point2::new(x, y)));
                        }
                        42 => {
                            let bulge = parse_f64(&value, "LWPOLYLINE 顶点 bulge")?;
                            let vertex = vertices.last_mut().ok_or_else(|| {
                                DxfError::invalid(
                                    "LWPOLYLINE 在定义首个顶点前遇到 bulge（组码 42）",
                                )
                            })?;
                            vertex.bulge = bulge;
                        }
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("LWPOLYLINE 未正确结束")),
            }
        }

        if pending_x.is_some() {
            return Err(DxfError::invalid(
                "LWPOLYLINE 顶点坐标成对出现（组码 10/20），检测到不完整的顶点",
            ));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("LWPOLYLINE 未解析到任何顶点"));
        }

        let entity = Entity::Polyline(Polyline {
            vertices,
            is_closed,
            is_lightweight: true,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    /// 经典 POLYLINE（含 VERTEX/SEQEND 序列）。三维多段线与网格跳过。
    fn parse_polyline(&mut self) -> Result<Option<ParsedEntity>, DxfError> {
        let mut common = CommonFields::default();
        let mut flags: i16 = 0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "POLYLINE 公共字段")? {
                        continue;
                    }
                    if code == 70 {
                        flags = parse_i16(&value, "POLYLINE 标志（组码 70）")?;
                    }
                }
                None => return Err(DxfError::invalid("POLYLINE 未正确结束")),
            }
        }

        let mut vertices: Vec<PolylineVertex> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" => {
                        if let Some(vertex) = self.parse_polyline_vertex()? {
                            vertices.push(vertex);
                        }
                    }
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        // 缺少 SEQEND 的文件：交还给上层继续解析
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "POLYLINE 顶点序列出现意外组码 {code} 值 {value}"
                    )));
                }
                None => return Err(DxfError::invalid("POLYLINE 顶点序列未正确结束")),
            }
        }

        // 0x08 三维多段线、0x10 多边形网格、0x40 多面网格
        if flags & (0x08 | 0x10 | 0x40) != 0 {
            debug!(flags, "跳过三维多段线或网格");
            return Ok(None);
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("POLYLINE 未解析到任何顶点"));
        }

        let entity = Entity::Polyline(Polyline {
            vertices,
            is_closed: flags & 0x01 != 0,
            is_lightweight: false,
            layer: common.layer(),
        });
        Ok(Some(ParsedEntity::new(entity, &common)))
    }

    fn parse_polyline_vertex(&mut self) -> Result<Option<PolylineVertex>, DxfError> {
        let mut x = None;
        let mut y = None;
        let mut bulge = 0.0;
        let mut flags: i16 = 0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    10 => assign_coord(&mut x, &value, "VERTEX X（组码 10）")?,
                    20 => assign_coord(&mut y, &value, "VERTEX Y（组码 20）")?,
                    42 => bulge = parse_f64(&value, "VERTEX bulge（组码 42）")?,
                    70 => flags = parse_i16(&value, "VERTEX 标志（组码 70）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("VERTEX 未正确结束")),
            }
        }
        // 0x10 为样条拟合的控制点，不参与轮廓
        if flags & 0x10 != 0 {
            return Ok(None);
        }
        let x = x.ok_or_else(|| DxfError::invalid("VERTEX 缺少 X（组码 10）"))?;
        let y = y.ok_or_else(|| DxfError::invalid("VERTEX 缺少 Y（组码 20）"))?;
        Ok(Some(PolylineVertex {
            position: Point2::new(x, y),
            bulge,
        }))
    }

    fn parse_3dface(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut vx = [None; 4];
        let mut vy = [None; 4];
        let mut vz = [None; 4];

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "3DFACE 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut vx[0], &value, "3DFACE 顶点 1 X（组码 10）")?,
                        20 => assign_coord(&mut vy[0], &value, "3DFACE 顶点 1 Y（组码 20）")?,
                        30 => assign_coord(&mut vz[0], &value, "3DFACE 顶点 1 Z（组码 30）")?,
                        11 => assign_coord(&mut vx[1], &value, "3DFACE 顶点 2 X（组码 11）")?,
                        21 => assign_coord(&mut vy[1], &value, "3DFACE 顶点 2 Y（组码 21）")?,
                        31 => assign_coord(&mut vz[1], &value, "3DFACE 顶点 2 Z（组码 31）")?,
                        12 => assign_coord(&mut vx[2], &value, "3DFACE 顶点 3 X（组码 12）")?,
                        22 => assign_coord(&mut vy[2], &value, "3DFACE 顶点 3 Y（组码 22）")?,
                        32 => assign_coord(&mut vz[2], &value, "3DFACE 顶点 3 Z（组码 32）")?,
                        13 => assign_coord(&mut vx[3], &value, "3DFACE 顶点 4 X（组码 13）")?,
                        23 => assign_coord(&mut vy[3], &value, "3DFACE 顶点 4 Y（组码 23）")?,
                        33 => assign_coord(&mut vz[3], &value, "3DFACE 顶点 4 Z（组码 33）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("3DFACE 未正确结束")),
            }
        }

        let v1 = build_face_vertex(1, vx[0], vy[0], vz[0])?
            .ok_or_else(|| DxfError::invalid("3DFACE 缺少第 1 个顶点"))?;
        let v2 = build_face_vertex(2, vx[1], vy[1], vz[1])?
            .ok_or_else(|| DxfError::invalid("3DFACE 缺少第 2 个顶点"))?;
        let v3 = build_face_vertex(3, vx[2], vy[2], vz[2])?
            .ok_or_else(|| DxfError::invalid("3DFACE 缺少第 3 个顶点"))?;
        let v4 = build_face_vertex(4, vx[3], vy[3], vz[3])?.unwrap_or(v3);

        let entity = Entity::Face3D(ThreeDFace {
            vertices: [v1, v2, v3, v4],
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_circle(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "CIRCLE 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "CIRCLE 圆心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "CIRCLE 圆心 Y（组码 20）")?,
                        40 => assign_coord(&mut radius, &value, "CIRCLE 半径（组码 40）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("CIRCLE 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("CIRCLE 缺少半径（组码 40）"))?;

        let entity = Entity::Circle(Circle {
            center: Point2::new(cx, cy),
            radius,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_arc(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "ARC 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "ARC 圆心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "ARC 圆心 Y（组码 20）")?,
                        40 => assign_coord(&mut radius, &value, "ARC 半径（组码 40）")?,
                        50 => assign_coord(&mut start_angle, &value, "ARC 起始角（组码 50）")?,
                        51 => assign_coord(&mut end_angle, &value, "ARC 终止角（组码 51）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("ARC 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("ARC 缺少半径（组码 40）"))?;
        let start_angle =
            start_angle.ok_or_else(|| DxfError::invalid("ARC 缺少起始角（组码 50）"))?;
        let end_angle = end_angle.ok_or_else(|| DxfError::invalid("ARC 缺少终止角（组码 51）"))?;

        let entity = Entity::Arc(Arc {
            center: Point2::new(cx, cy),
            radius,
            start_angle: start_angle.to_radians(),
            end_angle: end_angle.to_radians(),
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_ellipse(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut major_x = None;
        let mut major_y = None;
        let mut ratio = None;
        let mut start_parameter = 0.0;
        let mut end_parameter = std::f64::consts::TAU;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "ELLIPSE 公共字段")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "ELLIPSE 圆心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "ELLIPSE 圆心 Y（组码 20）")?,
                        11 => {
                            assign_coord(&mut major_x, &value, "ELLIPSE 主轴向量 X（组码 11）")?
                        }
                        21 => {
                            assign_coord(&mut major_y, &value, "ELLIPSE 主轴向量 Y（组码 21）")?
                        }
                        40 => assign_coord(&mut ratio, &value, "ELLIPSE 半径比（组码 40）")?,
                        41 => start_parameter = parse_f64(&value, "ELLIPSE 起始参数")?,
                        42 => end_parameter = parse_f64(&value, "ELLIPSE 终止参数")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("ELLIPSE 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少圆心 Y（组码 20）"))?;
        let major_x =
            major_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少主轴向量 X（组码 11）"))?;
        let major_y =
            major_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少主轴向量 Y（组码 21）"))?;

        if major_x.abs() < f64::EPSILON && major_y.abs() < f64::EPSILON {
            return Err(DxfError::invalid("ELLIPSE 主轴向量长度为 0，无法创建实体"));
        }

        let ratio = ratio.unwrap_or(1.0);
        if ratio <= 0.0 {
            return Err(DxfError::invalid(format!(
                "ELLIPSE 半径比必须为正数，实际为 {ratio}"
            )));
        }

        let entity = Entity::Ellipse(Ellipse {
            center: Point2::new(cx, cy),
            major_axis: Vector2::new(major_x, major_y),
            ratio,
            start_parameter,
            end_parameter,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_spline(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut flags: i16 = 0;
        let mut degree: Option<i16> = None;
        let mut knot_values: Vec<f64> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut control_points: Vec<Point2> = Vec::new();
        let mut fit_points: Vec<Point2> = Vec::new();
        let mut pending_control_x: Option<f64> = None;
        let mut pending_fit_x: Option<f64> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "SPLINE 公共字段")? {
                        continue;
                    }
                    match code {
                        70 => flags = parse_i16(&value, "SPLINE 类型标志（组码 70）")?,
                        71 => degree = Some(parse_i16(&value, "SPLINE 阶数（组码 71）")?),
                        40 => knot_values.push(parse_f64(&value, "SPLINE 节点值（组码 40）")?),
                        41 => weights.push(parse_f64(&value, "SPLINE 权重（组码 41）")?),
                        10 => {
                            if pending_control_x
                                .replace(parse_f64(&value, "SPLINE 控制点 X（组码 10）")?)
                                .is_some()
                            {
                                return Err(DxfError::invalid(
                                    "SPLINE 控制点 X（组码 10）在未提供 Y 之前重复出现",
                                ));
                            }
                        }
                        20 => {
                            let y = parse_f64(&value, "SPLINE 控制点 Y（组码 20）")?;
                            let x = pending_control_x.take().ok_or_else(|| {
                                DxfError::invalid("SPLINE 控制点 Y（组码 20）缺少对应的 X")
                            })?;
                            control_points.push(Point2::new(x, y));
                        }
                        11 => {
                            if pending_fit_x
                                .replace(parse_f64(&value, "SPLINE 拟合点 X（组码 11）")?)
                                .is_some()
                            {
                                return Err(DxfError::invalid(
                                    "SPLINE 拟合点 X（组码 11）在未提供 Y 之前重复出现",
                                ));
                            }
                        }
                        21 => {
                            let y = parse_f64(&value, "SPLINE 拟合点 Y（组码 21）")?;
                            let x = pending_fit_x.take().ok_or_else(|| {
                                DxfError::invalid("SPLINE 拟合点 Y（组码 21）缺少对应的 X")
                            })?;
                            fit_points.push(Point2::new(x, y));
                        }
                        _ => {
                            // 切向量、法向量、拟合公差暂不使用
                        }
                    }
                }
                None => return Err(DxfError::invalid("SPLINE 未正确结束")),
            }
        }

        if let Some(x) = pending_control_x {
            return Err(DxfError::invalid(format!(
                "SPLINE 控制点 X={x} 缺少对应的 Y（组码 20）"
            )));
        }
        if let Some(x) = pending_fit_x {
            return Err(DxfError::invalid(format!(
                "SPLINE 拟合点 X={x} 缺少对应的 Y（组码 21）"
            )));
        }

        let degree = degree.ok_or_else(|| DxfError::invalid("SPLINE 缺少阶数（组码 71）"))?;
        let entity = Entity::Spline(Spline {
            degree: i32::from(degree),
            is_closed: flags & 0x01 != 0,
            control_points,
            fit_points,
            knot_values,
            weights,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_hatch(&mut self) -> Result<ParsedEntity, DxfError> {
        /// 正在构建的边界环路。
        struct PartialLoop {
            is_polyline: bool,
            has_bulge: bool,
            is_closed: bool,
            poly_vertices: Vec<(Point2, f64)>,
            edges: Vec<HatchEdge>,
            pending_x: Option<f64>,
        }

        impl PartialLoop {
            fn new(flags: i32) -> Self {
                Self {
                    is_polyline: flags & 0x02 != 0,
                    has_bulge: false,
                    is_closed: true,
                    poly_vertices: Vec::new(),
                    edges: Vec::new(),
                    pending_x: None,
                }
            }

            fn finish(mut self, edge: Option<EdgeBuilder>) -> Result<HatchLoop, DxfError> {
                if let Some(edge) = edge {
                    self.edges.extend(edge.finish()?);
                }
                if self.is_polyline {
                    let count = self.poly_vertices.len();
                    let segments = if self.is_closed { count } else { count.saturating_sub(1) };
                    for index in 0..segments {
                        let (start, bulge) = self.poly_vertices[index];
                        let (end, _) = self.poly_vertices[(index + 1) % count];
                        self.edges.push(HatchEdge::PolylineSegment { start, end, bulge });
                    }
                }
                Ok(HatchLoop {
                    is_polyline: self.is_polyline,
                    edges: self.edges,
                })
            }
        }

        /// 非多段线环路中的单条边，字段按组码逐一填充。
        #[derive(Default)]
        struct EdgeBuilder {
            edge_type: i32,
            points: [[Option<f64>; 2]; 2],
            radius: Option<f64>,
            start_angle: f64,
            end_angle: f64,
            is_counter_clockwise: bool,
            spline_points: Vec<Point2>,
            pending_spline_x: Option<f64>,
        }

        impl EdgeBuilder {
            fn new(edge_type: i32) -> Result<Self, DxfError> {
                if !(1..=4).contains(&edge_type) {
                    return Err(DxfError::invalid(format!(
                        "HATCH 边类型 {edge_type} 不受支持"
                    )));
                }
                Ok(Self {
                    edge_type,
                    is_counter_clockwise: true,
                    ..Self::default()
                })
            }

            fn point(&self, index: usize, context: &str) -> Result<Point2, DxfError> {
                match self.points[index] {
                    [Some(x), Some(y)] => Ok(Point2::new(x, y)),
                    _ => Err(DxfError::invalid(format!("HATCH {context} 缺少坐标"))),
                }
            }

            fn finish(self) -> Result<Vec<HatchEdge>, DxfError> {
                let edges = match self.edge_type {
                    1 => vec![HatchEdge::Line {
                        start: self.point(0, "直线边起点")?,
                        end: self.point(1, "直线边终点")?,
                    }],
                    2 => vec![HatchEdge::Arc {
                        center: self.point(0, "圆弧边圆心")?,
                        radius: self
                            .radius
                            .ok_or_else(|| DxfError::invalid("HATCH 圆弧边缺少半径（组码 40）"))?,
                        start_angle: self.start_angle.to_radians(),
                        end_angle: self.end_angle.to_radians(),
                        is_counter_clockwise: self.is_counter_clockwise,
                    }],
                    3 => {
                        let axis = self.point(1, "椭圆边主轴")?;
                        vec![HatchEdge::Ellipse {
                            center: self.point(0, "椭圆边圆心")?,
                            major_axis: Vector2::new(axis.x(), axis.y()),
                            minor_ratio: self.radius.unwrap_or(1.0),
                            start_angle: self.start_angle.to_radians(),
                            end_angle: self.end_angle.to_radians(),
                            is_counter_clockwise: self.is_counter_clockwise,
                        }]
                    }
                    // 样条边按控制多边形近似
                    _ => self
                        .spline_points
                        .windows(2)
                        .map(|pair| HatchEdge::Line {
                            start: pair[0],
                            end: pair[1],
                        })
                        .collect(),
                };
                Ok(edges)
            }
        }

        let mut common = CommonFields::default();
        let mut pattern_name = String::new();
        let mut is_solid = false;
        let mut loops: Vec<HatchLoop> = Vec::new();
        let mut current: Option<PartialLoop> = None;
        let mut edge: Option<EdgeBuilder> = None;
        let mut boundary_done = false;

        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(pair) => pair,
                None => return Err(DxfError::invalid("HATCH 未正确结束")),
            };
            if common.accept(code, &value, "HATCH 公共字段")? {
                continue;
            }
            if boundary_done {
                // 图案定义与种子点不参与几何
                continue;
            }
            match code {
                2 => pattern_name = value.trim().to_string(),
                70 => is_solid = parse_i16(&value, "HATCH 填充标志（组码 70）")? & 1 != 0,
                92 => {
                    if let Some(partial) = current.take() {
                        loops.push(partial.finish(edge.take())?);
                    }
                    current = Some(PartialLoop::new(parse_i32(
                        &value,
                        "HATCH 环路类型（组码 92）",
                    )?));
                }
                75 => {
                    if let Some(partial) = current.take() {
                        loops.push(partial.finish(edge.take())?);
                    }
                    boundary_done = true;
                }
                _ => {
                    let Some(partial) = current.as_mut() else {
                        // 环路之前的高程点、法向量
                        continue;
                    };
                    if partial.is_polyline {
                        match code {
                            72 => partial.has_bulge = parse_i32(&value, "HATCH bulge 标记")? != 0,
                            73 => partial.is_closed = parse_i32(&value, "HATCH 闭合标记")? != 0,
                            10 => {
                                partial.pending_x = Some(parse_f64(&value, "HATCH 顶点 X")?);
                            }
                            20 => {
                                let y = parse_f64(&value, "HATCH 顶点 Y")?;
                                let x = partial.pending_x.take().ok_or_else(|| {
                                    DxfError::invalid("HATCH 顶点 Y（组码 20）缺少对应的 X")
                                })?;
                                partial.poly_vertices.push((Point2::new(x, y), 0.0));
                            }
                            42 if partial.has_bulge => {
                                let bulge = parse_f64(&value, "HATCH 顶点 bulge")?;
                                if let Some(last) = partial.poly_vertices.last_mut() {
                                    last.1 = bulge;
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }

                    if code == 72 {
                        if let Some(finished) = edge.take() {
                            partial.edges.extend(finished.finish()?);
                        }
                        edge = Some(EdgeBuilder::new(parse_i32(
                            &value,
                            "HATCH 边类型（组码 72）",
                        )?)?);
                        continue;
                    }
                    let Some(builder) = edge.as_mut() else {
                        continue;
                    };
                    if builder.edge_type == 4 {
                        match code {
                            10 => {
                                builder.pending_spline_x =
                                    Some(parse_f64(&value, "HATCH 样条控制点 X")?)
                            }
                            20 => {
                                let y = parse_f64(&value, "HATCH 样条控制点 Y")?;
                                if let Some(x) = builder.pending_spline_x.take() {
                                    builder.spline_points.push(Point2::new(x, y));
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }
                    match code {
                        10 => builder.points[0][0] = Some(parse_f64(&value, "HATCH 边 X")?),
                        20 => builder.points[0][1] = Some(parse_f64(&value, "HATCH 边 Y")?),
                        11 => builder.points[1][0] = Some(parse_f64(&value, "HATCH 边 X")?),
                        21 => builder.points[1][1] = Some(parse_f64(&value, "HATCH 边 Y")?),
                        40 => builder.radius = Some(parse_f64(&value, "HATCH 边半径")?),
                        50 => builder.start_angle = parse_f64(&value, "HATCH 边起始角")?,
                        51 => builder.end_angle = parse_f64(&value, "HATCH 边终止角")?,
                        73 => {
                            builder.is_counter_clockwise =
                                parse_i32(&value, "HATCH 边方向标记（组码 73）")? != 0
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(partial) = current.take() {
            loops.push(partial.finish(edge.take())?);
        }

        let entity = Entity::Hatch(Hatch {
            pattern_name,
            is_solid,
            loops,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_insert(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut name = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut scale_x: Option<f64> = None;
        let mut scale_y: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "INSERT 公共字段")? {
                        continue;
                    }
                    match code {
                        2 => {
                            if name.is_some() {
                                return Err(DxfError::invalid("INSERT 遇到重复的块名（组码 2）"));
                            }
                            name = Some(value.trim().to_string());
                        }
                        10 => assign_coord(&mut insert_x, &value, "INSERT 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "INSERT 插入点 Y（组码 20）")?,
                        41 => scale_x = Some(parse_f64(&value, "INSERT 缩放 X")?),
                        42 => scale_y = Some(parse_f64(&value, "INSERT 缩放 Y")?),
                        50 => rotation_deg = parse_f64(&value, "INSERT 旋转角")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("INSERT 未正确结束")),
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("INSERT 缺少块名（组码 2）"))?;
        let ix = insert_x.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 Y（组码 20）"))?;
        let sx = scale_x.unwrap_or(1.0);
        let sy = scale_y.unwrap_or(sx);

        let mut attributes: Vec<Attribute> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ATTRIB" => attributes.push(self.parse_attrib()?),
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "INSERT 属性段出现意外组码 {code} 值 {value}"
                    )));
                }
                None => break,
            }
        }

        let entity = Entity::BlockReference(BlockReference {
            name,
            insert: Point2::new(ix, iy),
            scale: Vector2::new(sx, sy),
            rotation: rotation_deg.to_radians(),
            attributes,
            layer: common.layer(),
        });
        Ok(ParsedEntity::new(entity, &common))
    }

    fn parse_attrib(&mut self) -> Result<Attribute, DxfError> {
        let mut tag: Option<String> = None;
        let mut text = String::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((2, value)) => tag = Some(value.trim().to_string()),
                Some((1, value)) => text = value,
                Some(_) => {}
                None => return Err(DxfError::invalid("ATTRIB 未正确结束")),
            }
        }
        let tag = tag.ok_or_else(|| DxfError::invalid("ATTRIB 缺少标记（组码 2）"))?;
        Ok(Attribute { tag, text })
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }
}

pub(crate) struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        Self {
            lines: source.trim_start_matches('\u{feff}').lines(),
            buffer: None,
            line_number: 0,
        }
    }

    pub(crate) fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }

        let code_line = loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    // 容忍文件末尾的空行
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(None),
            }
        };

        let value_line = match self.lines.next() {
            Some(line) => {
                self.line_number += 1;
                line
            }
            None => {
                return Err(DxfError::invalid(format!(
                    "文件在第 {} 行结束，缺少与组码对应的值行",
                    self.line_number
                )));
            }
        };

        let code = code_line.trim().parse::<i32>().map_err(|_| {
            DxfError::invalid(format!(
                "第 {} 行的组码 \"{}\" 无法解析为整数",
                self.line_number - 1,
                code_line.trim()
            ))
        })?;
        let value = value_line.trim_end_matches('\r').to_string();
        Ok(Some((code, value)))
    }

    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "尝试多次回退 DXF pair");
        self.buffer = Some(pair);
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn build_face_vertex(
    index: usize,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
) -> Result<Option<Point3>, DxfError> {
    match (x, y, z) {
        (None, None, None) => Ok(None),
        (Some(x), Some(y), z) => Ok(Some(Point3::new(x, y, z.unwrap_or(0.0)))),
        _ => Err(DxfError::invalid(format!(
            "3DFACE 顶点 {index} 缺少完整的 XY 坐标"
        ))),
    }
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 超出 i16 范围（值：{value}）")))
}

/// DXF 字符串中的控制字符转义：`^J` 换行、`^M` 回车、`^I` 制表符、`^ ` 表示 `^` 本身。
pub(crate) fn decode_caret(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '^' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('J') => result.push('\n'),
            Some('M') => result.push('\r'),
            Some('I') => result.push('\t'),
            Some(' ') => result.push('^'),
            Some(other) => {
                result.push('^');
                result.push(other);
            }
            None => result.push('^'),
        }
    }
    result
}

pub(crate) fn encode_caret(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\n' => result.push_str("^J"),
            '\r' => result.push_str("^M"),
            '\t' => result.push_str("^I"),
            '^' => result.push_str("^ "),
            other => result.push(other),
        }
    }
    result
}
