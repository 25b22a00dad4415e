//! 按优先顺序确定图纸的坐标系与锚点：嵌入 GEODATA、父图纸继承、手动锚点。

use geocad_core::document::GeoData;
use tracing::{debug, info, warn};

use crate::crs::CrsRegistry;
use crate::definition;
use crate::errors::EngineError;
use crate::records::{Drawing, DrawingId, Georef};
use crate::utm::{AreaOfInterest, UtmZoneLookup};

/// 锚点的来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    EmbeddedGeodata,
    Parent(DrawingId),
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorResult {
    pub georef: Georef,
    pub source: AnchorSource,
}

/// 一次解析的输入。
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub drawing: &'a Drawing,
    /// 仅在源文件变更或图纸尚未配准时提供。
    pub geodata: Option<&'a GeoData>,
    pub parent: Option<&'a Drawing>,
}

type Strategy = fn(&CrsResolver<'_>, &ResolveContext<'_>) -> Result<Option<AnchorResult>, EngineError>;

const STRATEGIES: [(&str, Strategy); 3] = [
    ("embedded", from_embedded_geodata),
    ("parent", from_parent),
    ("manual", from_manual_anchor),
];

pub struct CrsResolver<'a> {
    registry: &'a CrsRegistry,
    utm: &'a dyn UtmZoneLookup,
}

impl<'a> CrsResolver<'a> {
    pub fn new(registry: &'a CrsRegistry, utm: &'a dyn UtmZoneLookup) -> Self {
        Self { registry, utm }
    }

    /// 返回第一个给出结果的策略；都不适用时返回 `None`，图纸保持未配准。
    pub fn resolve(&self, context: &ResolveContext<'_>) -> Result<Option<AnchorResult>, EngineError> {
        for (name, strategy) in STRATEGIES {
            if let Some(result) = strategy(self, context)? {
                info!(
                    drawing = %context.drawing.id,
                    strategy = name,
                    epsg = result.georef.crs,
                    "锚点已解析"
                );
                return Ok(Some(result));
            }
        }
        debug!(drawing = %context.drawing.id, "没有可用的锚点来源");
        Ok(None)
    }
}

/// 嵌入 GEODATA：坐标系定义不可用时记录警告并交给后续策略。
fn from_embedded_geodata(
    resolver: &CrsResolver<'_>,
    context: &ResolveContext<'_>,
) -> Result<Option<AnchorResult>, EngineError> {
    let Some(geodata) = context.geodata else {
        return Ok(None);
    };
    let info = match definition::parse(&geodata.coordinate_system_definition) {
        Ok(info) => info,
        Err(err) => {
            warn!(drawing = %context.drawing.id, error = %err, "忽略无法使用的 GEODATA");
            return Ok(None);
        }
    };
    if !info.easting_first {
        debug!(epsg = info.epsg, "坐标系声明北向轴在前，仍按 x/经度在前转换");
    }

    let projection = resolver.registry.projection(info.epsg)?;
    let reference = geodata.reference_point.truncate().as_vec2();
    let anchor = projection.unproject(reference)?;
    Ok(Some(AnchorResult {
        georef: Georef {
            crs: info.epsg,
            anchor,
            design_point: geodata.design_point.truncate(),
            rotation: geodata.rotation_degrees(),
        },
        source: AnchorSource::EmbeddedGeodata,
    }))
}

/// 父图纸继承：图纸自身没有锚点时，原样复制父图纸的配准。
fn from_parent(
    _resolver: &CrsResolver<'_>,
    context: &ResolveContext<'_>,
) -> Result<Option<AnchorResult>, EngineError> {
    if context.drawing.is_anchored() {
        return Ok(None);
    }
    let Some(parent) = context.parent else {
        return Ok(None);
    };
    Ok(parent.georef.map(|georef| AnchorResult {
        georef,
        source: AnchorSource::Parent(parent.id),
    }))
}

/// 手动锚点：以该点为退化范围查询 UTM 分带，取第一个结果。
fn from_manual_anchor(
    resolver: &CrsResolver<'_>,
    context: &ResolveContext<'_>,
) -> Result<Option<AnchorResult>, EngineError> {
    let drawing = context.drawing;
    if drawing.is_anchored() {
        return Ok(None);
    }
    let Some(manual) = drawing.manual else {
        return Ok(None);
    };
    manual.validate()?;

    let zones = resolver.utm.query(&AreaOfInterest::point(manual.point));
    let crs = zones.first().copied().ok_or(EngineError::NoUtmZone {
        latitude: manual.point.latitude,
        longitude: manual.point.longitude,
    })?;
    if !resolver.registry.contains(crs) {
        return Err(EngineError::UnknownCrs(crs));
    }
    Ok(Some(AnchorResult {
        georef: Georef {
            crs,
            anchor: manual.point,
            design_point: manual.design_point,
            rotation: manual.rotation,
        },
        source: AnchorSource::Manual,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::synthesize;
    use crate::records::{GeoPoint, ManualAnchor, SourceFile};
    use crate::utm::WgsUtmZones;
    use geocad_core::geometry::{Point2, Point3, Vector2};

    struct FixedZone(Vec<u32>);

    impl UtmZoneLookup for FixedZone {
        fn query(&self, _area: &AreaOfInterest) -> Vec<u32> {
            self.0.clone()
        }
    }

    fn drawing(id: u64) -> Drawing {
        Drawing {
            id: DrawingId::new(id),
            title: format!("Drawing {id}"),
            parent: None,
            source: SourceFile::memory("plan.dxf", ""),
            source_digest: String::new(),
            manual: None,
            georef: None,
            needs_refresh: true,
            version: 0,
        }
    }

    fn anchored(id: u64) -> Drawing {
        let mut parent = drawing(id);
        parent.georef = Some(Georef {
            crs: 32632,
            anchor: GeoPoint::new(9.19, 45.46),
            design_point: Point2::new(3.0, 4.0),
            rotation: 12.5,
        });
        parent
    }

    #[test]
    fn manual_anchor_in_central_italy_resolves_to_zone_33() {
        let registry = CrsRegistry::new();
        let utm = FixedZone(vec![32633]);
        let resolver = CrsResolver::new(&registry, &utm);

        let mut target = drawing(1);
        target.manual = Some(ManualAnchor::new(GeoPoint::new(12.0, 42.0)));
        let result = resolver
            .resolve(&ResolveContext {
                drawing: &target,
                geodata: None,
                parent: None,
            })
            .expect("解析失败")
            .expect("应得到锚点");

        assert_eq!(result.source, AnchorSource::Manual);
        assert_eq!(result.georef.crs, 32633);
        assert_eq!(result.georef.anchor, GeoPoint::new(12.0, 42.0));
        assert_eq!(result.georef.design_point, Point2::new(0.0, 0.0));
        assert_eq!(result.georef.rotation, 0.0);
    }

    #[test]
    fn parent_anchor_is_copied_verbatim() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let parent = anchored(1);
        let mut child = drawing(2);
        child.parent = Some(parent.id);

        let result = resolver
            .resolve(&ResolveContext {
                drawing: &child,
                geodata: None,
                parent: Some(&parent),
            })
            .expect("解析失败")
            .expect("应继承父图纸锚点");
        assert_eq!(result.source, AnchorSource::Parent(parent.id));
        assert_eq!(Some(result.georef), parent.georef);
    }

    #[test]
    fn anchored_parent_wins_over_manual_point() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let parent = anchored(1);
        let mut child = drawing(2);
        child.parent = Some(parent.id);
        child.manual = Some(ManualAnchor::new(GeoPoint::new(12.0, 42.0)));

        let result = resolver
            .resolve(&ResolveContext {
                drawing: &child,
                geodata: None,
                parent: Some(&parent),
            })
            .expect("解析失败")
            .expect("应继承父图纸锚点");
        assert_eq!(result.source, AnchorSource::Parent(parent.id));
        assert_eq!(result.georef.crs, 32632);
    }

    #[test]
    fn embedded_geodata_wins_over_parent_and_manual() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let parent = anchored(1);
        let mut child = drawing(2);
        child.manual = Some(ManualAnchor::new(GeoPoint::new(12.0, 42.0)));

        let geodata = GeoData::new(
            Point3::new(10.0, 20.0, 0.0),
            Point3::new(500_000.0, 0.0, 0.0),
            Vector2::new(0.0, 1.0),
            synthesize(32633),
        );
        let result = resolver
            .resolve(&ResolveContext {
                drawing: &child,
                geodata: Some(&geodata),
                parent: Some(&parent),
            })
            .expect("解析失败")
            .expect("应得到锚点");

        assert_eq!(result.source, AnchorSource::EmbeddedGeodata);
        assert_eq!(result.georef.crs, 32633);
        assert!((result.georef.anchor.longitude - 15.0).abs() < 1e-9);
        assert!(result.georef.anchor.latitude.abs() < 1e-9);
        assert_eq!(result.georef.design_point, Point2::new(10.0, 20.0));
        assert!(result.georef.rotation.abs() < 1e-12);
    }

    #[test]
    fn malformed_geodata_falls_through_to_manual() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let mut target = drawing(1);
        target.manual = Some(ManualAnchor::new(GeoPoint::new(12.0, 42.0)));
        let geodata = GeoData::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Vector2::new(0.0, 1.0),
            "<Dictionary/>",
        );

        let result = resolver
            .resolve(&ResolveContext {
                drawing: &target,
                geodata: Some(&geodata),
                parent: None,
            })
            .expect("解析失败")
            .expect("应回退到手动锚点");
        assert_eq!(result.source, AnchorSource::Manual);
        assert_eq!(result.georef.crs, 32633);
    }

    #[test]
    fn nothing_to_resolve_leaves_drawing_unanchored() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let target = drawing(1);
        let result = resolver
            .resolve(&ResolveContext {
                drawing: &target,
                geodata: None,
                parent: None,
            })
            .expect("解析失败");
        assert!(result.is_none());
    }

    #[test]
    fn empty_utm_lookup_is_fatal() {
        let registry = CrsRegistry::new();
        let utm = FixedZone(Vec::new());
        let resolver = CrsResolver::new(&registry, &utm);
        let mut target = drawing(1);
        target.manual = Some(ManualAnchor::new(GeoPoint::new(0.0, 89.0)));
        let err = resolver
            .resolve(&ResolveContext {
                drawing: &target,
                geodata: None,
                parent: None,
            })
            .expect_err("没有 UTM 分带应报错");
        assert!(matches!(err, EngineError::NoUtmZone { .. }));
    }

    #[test]
    fn manual_anchor_does_not_override_existing_georef() {
        let registry = CrsRegistry::new();
        let resolver = CrsResolver::new(&registry, &WgsUtmZones);
        let mut target = anchored(1);
        target.manual = Some(ManualAnchor::new(GeoPoint::new(12.0, 42.0)));
        let result = resolver
            .resolve(&ResolveContext {
                drawing: &target,
                geodata: None,
                parent: None,
            })
            .expect("解析失败");
        assert!(result.is_none());
    }
}
