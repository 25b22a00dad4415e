pub mod crs;
pub mod definition;
pub mod extract;
pub mod geometry;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod transform;
pub mod utm;
pub mod writer;

pub mod errors {
    use geocad_core::color::ColorError;
    use geocad_io::IoError;
    use thiserror::Error;

    use crate::records::{DrawingId, LayerId};

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("invalid anchor: {field} = {value} is out of range")]
        InvalidAnchor { field: &'static str, value: f64 },
        #[error(transparent)]
        Io(#[from] IoError),
        #[error("unknown coordinate reference system EPSG:{0}")]
        UnknownCrs(u32),
        #[error("projection EPSG:{code} failed: {message}")]
        Projection { code: u32, message: String },
        #[error("no UTM zone covers latitude {latitude}, longitude {longitude}")]
        NoUtmZone { latitude: f64, longitude: f64 },
        #[error("drawing {0} not found")]
        DrawingNotFound(DrawingId),
        #[error("parent drawing {0} not found")]
        ParentNotFound(DrawingId),
        #[error("drawing {0} cannot be its own parent")]
        InvalidParent(DrawingId),
        #[error("layer {0} not found")]
        LayerNotFound(LayerId),
        #[error("drawing {id} changed concurrently (expected version {expected}, found {found})")]
        ConcurrentModification {
            id: DrawingId,
            expected: u64,
            found: u64,
        },
        #[error(transparent)]
        Color(#[from] ColorError),
        #[error("invalid layer color {0:?}, expected #RRGGBB")]
        InvalidColor(String),
    }

    /// 嵌入坐标系定义无法使用。解析方视其为“未找到锚点”，不会中断保存。
    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum GeodataError {
        #[error("coordinate system definition is empty")]
        Empty,
        #[error("coordinate system definition has no EPSG alias")]
        MissingEpsgAlias,
        #[error("EPSG code {0:?} is not a number")]
        InvalidEpsgCode(String),
        #[error("coordinate system definition declares no axis order")]
        MissingAxisOrder,
    }
}

pub mod records {
    use std::fmt;
    use std::path::PathBuf;

    use geocad_core::geometry::Point2;
    use geocad_io::IoError;
    use serde::{Deserialize, Serialize, Serializer};
    use serde_json::Value;
    use sha2::{Digest, Sha256};

    use crate::errors::EngineError;
    use crate::geometry::geometry_collection_to_geojson;

    macro_rules! record_id {
        ($name:ident) => {
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            )]
            pub struct $name(u64);

            impl $name {
                #[inline]
                pub fn new(raw: u64) -> Self {
                    Self(raw)
                }

                #[inline]
                pub fn get(self) -> u64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        };
    }

    record_id!(DrawingId);
    record_id!(LayerId);
    record_id!(EntityRecordId);

    /// WGS 84 经纬度（度）。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct GeoPoint {
        pub longitude: f64,
        pub latitude: f64,
    }

    impl GeoPoint {
        #[inline]
        pub fn new(longitude: f64, latitude: f64) -> Self {
            Self {
                longitude,
                latitude,
            }
        }
    }

    /// 用户手动给出的锚点。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct ManualAnchor {
        pub point: GeoPoint,
        pub design_point: Point2,
        /// 度，图纸 +Y 相对正北的顺时针角。
        pub rotation: f64,
    }

    impl ManualAnchor {
        pub fn new(point: GeoPoint) -> Self {
            Self {
                point,
                design_point: Point2::new(0.0, 0.0),
                rotation: 0.0,
            }
        }

        /// 在任何解析之前拒绝越界的经纬度。
        pub fn validate(&self) -> Result<(), EngineError> {
            let latitude = self.point.latitude;
            let longitude = self.point.longitude;
            if !(-90.0..=90.0).contains(&latitude) {
                return Err(EngineError::InvalidAnchor {
                    field: "latitude",
                    value: latitude,
                });
            }
            if !(-180.0..=180.0).contains(&longitude) {
                return Err(EngineError::InvalidAnchor {
                    field: "longitude",
                    value: longitude,
                });
            }
            for (field, value) in [
                ("design_x", self.design_point.x()),
                ("design_y", self.design_point.y()),
                ("rotation", self.rotation),
            ] {
                if !value.is_finite() {
                    return Err(EngineError::InvalidAnchor { field, value });
                }
            }
            Ok(())
        }
    }

    /// 已解析的地理配准。坐标系与锚点总是同时存在。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Georef {
        pub crs: u32,
        pub anchor: GeoPoint,
        pub design_point: Point2,
        pub rotation: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum SourceFile {
        Path(PathBuf),
        Memory { name: String, content: String },
    }

    impl SourceFile {
        pub fn memory(name: impl Into<String>, content: impl Into<String>) -> Self {
            SourceFile::Memory {
                name: name.into(),
                content: content.into(),
            }
        }

        pub fn name(&self) -> String {
            match self {
                SourceFile::Path(path) => path.display().to_string(),
                SourceFile::Memory { name, .. } => name.clone(),
            }
        }

        pub fn read(&self) -> Result<String, IoError> {
            match self {
                SourceFile::Path(path) => geocad_io::read_source(path),
                SourceFile::Memory { content, .. } => Ok(content.clone()),
            }
        }

        pub fn write(&mut self, text: String) -> Result<(), IoError> {
            match self {
                SourceFile::Path(path) => geocad_io::write_source(path, &text),
                SourceFile::Memory { content, .. } => {
                    *content = text;
                    Ok(())
                }
            }
        }
    }

    /// 源文件内容的 SHA-256 摘要（十六进制）。
    pub fn source_digest(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Drawing {
        pub id: DrawingId,
        pub title: String,
        pub parent: Option<DrawingId>,
        pub source: SourceFile,
        pub source_digest: String,
        pub manual: Option<ManualAnchor>,
        pub georef: Option<Georef>,
        pub needs_refresh: bool,
        pub version: u64,
    }

    impl Drawing {
        #[inline]
        pub fn crs_code(&self) -> Option<u32> {
            self.georef.map(|georef| georef.crs)
        }

        #[inline]
        pub fn anchor(&self) -> Option<GeoPoint> {
            self.georef.map(|georef| georef.anchor)
        }

        #[inline]
        pub fn is_anchored(&self) -> bool {
            self.georef.is_some()
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct LayerRecord {
        pub id: LayerId,
        pub drawing: DrawingId,
        pub name: String,
        pub color_hex: String,
        pub continuous_linetype: bool,
        pub is_block: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct EntityRecord {
        pub id: EntityRecordId,
        pub layer: LayerId,
        #[serde(serialize_with = "serialize_geometry")]
        pub geometry: geo::GeometryCollection<f64>,
        pub insertion_point: Option<GeoPoint>,
        pub label: Option<String>,
        pub data: Option<Value>,
    }

    impl EntityRecord {
        /// GeoJSON `GeometryCollection`，坐标为经纬度。
        pub fn geometry_geojson(&self) -> Value {
            geometry_collection_to_geojson(&self.geometry)
        }
    }

    fn serialize_geometry<S>(
        geometry: &geo::GeometryCollection<f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        geometry_collection_to_geojson(geometry).serialize(serializer)
    }

    #[derive(Debug, Clone)]
    pub struct NewDrawing {
        pub title: String,
        pub parent: Option<DrawingId>,
        pub source: SourceFile,
        pub manual: Option<ManualAnchor>,
    }

    impl NewDrawing {
        pub fn new(title: impl Into<String>, source: SourceFile) -> Self {
            Self {
                title: title.into(),
                parent: None,
                source,
                manual: None,
            }
        }

        pub fn with_parent(mut self, parent: DrawingId) -> Self {
            self.parent = Some(parent);
            self
        }

        pub fn with_manual(mut self, manual: ManualAnchor) -> Self {
            self.manual = Some(manual);
            self
        }
    }

    /// 对已有图纸的修改。`None` 表示字段保持不变。
    #[derive(Debug, Clone, Default)]
    pub struct DrawingUpdate {
        pub title: Option<String>,
        pub parent: Option<Option<DrawingId>>,
        pub source: Option<SourceFile>,
        pub manual: Option<Option<ManualAnchor>>,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn manual_anchor_rejects_out_of_range_coordinates() {
            let valid = ManualAnchor::new(GeoPoint::new(12.0, 42.0));
            assert!(valid.validate().is_ok());

            let err = ManualAnchor::new(GeoPoint::new(12.0, 91.0))
                .validate()
                .expect_err("纬度越界应被拒绝");
            assert!(matches!(
                err,
                EngineError::InvalidAnchor {
                    field: "latitude",
                    ..
                }
            ));

            let err = ManualAnchor::new(GeoPoint::new(-180.5, 0.0))
                .validate()
                .expect_err("经度越界应被拒绝");
            assert!(matches!(
                err,
                EngineError::InvalidAnchor {
                    field: "longitude",
                    ..
                }
            ));

            let edge = ManualAnchor::new(GeoPoint::new(180.0, -90.0));
            assert!(edge.validate().is_ok());
        }

        #[test]
        fn digest_changes_with_content() {
            let first = source_digest("0\nEOF\n");
            assert_eq!(first.len(), 64);
            assert_eq!(first, source_digest("0\nEOF\n"));
            assert_ne!(first, source_digest("0\nEOF\n\n"));
        }

        #[test]
        fn memory_source_round_trips_content() {
            let mut source = SourceFile::memory("plan.dxf", "a");
            assert_eq!(source.read().expect("读取失败"), "a");
            source.write("b".to_string()).expect("写入失败");
            assert_eq!(source.read().expect("读取失败"), "b");
            assert_eq!(source.name(), "plan.dxf");
        }
    }
}
