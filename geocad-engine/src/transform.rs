use glam::{DAffine2, DVec2};
use tracing::debug;

use geocad_core::document::{Document, GeoData};
use geocad_core::geometry::{Point3, Vector2};

use crate::crs::{CrsRegistry, Projection};
use crate::definition;
use crate::errors::EngineError;
use crate::records::{GeoPoint, Georef};

/// 投影坐标比较容差（米）。
const PROJECTED_TOLERANCE: f64 = 1e-3;
const DESIGN_TOLERANCE: f64 = 1e-9;
const ROTATION_TOLERANCE: f64 = 1e-9;

/// 由锚点构造的一组转换。
#[derive(Debug)]
pub struct Transforms {
    projection: Projection,
    pub projected_anchor: DVec2,
    pub rotation_radians: f64,
}

impl Transforms {
    #[inline]
    pub fn crs(&self) -> u32 {
        self.projection.code()
    }

    /// 投影坐标 → WGS 84 经纬度。
    pub fn to_world(&self, projected: DVec2) -> Result<GeoPoint, EngineError> {
        self.projection.unproject(projected)
    }

    /// WGS 84 经纬度 → 投影坐标。
    pub fn to_local_crs(&self, point: GeoPoint) -> Result<DVec2, EngineError> {
        self.projection.project(point)
    }

    /// 文件缺少地理数据时按锚点合成的 GEODATA。
    pub fn synthesize_geodata(&self, georef: &Georef) -> GeoData {
        let design = georef.design_point;
        GeoData::new(
            Point3::new(design.x(), design.y(), 0.0),
            Point3::new(self.projected_anchor.x, self.projected_anchor.y, 0.0),
            Vector2::new(self.rotation_radians.sin(), self.rotation_radians.cos()),
            definition::synthesize(georef.crs),
        )
    }

    /// 文件中的 GEODATA 与锚点一致时沿用它（保留单位比例），否则使用合成结果。
    pub fn effective_geodata(&self, document: &Document, georef: &Georef) -> GeoData {
        match document.geodata() {
            Some(geodata) if self.agrees_with(geodata, georef) => geodata.clone(),
            Some(_) => {
                debug!(epsg = georef.crs, "文件中的 GEODATA 与锚点不一致，改用合成结果");
                self.synthesize_geodata(georef)
            }
            None => self.synthesize_geodata(georef),
        }
    }

    /// 图纸 WCS → 投影坐标系。
    pub fn local_to_projected(&self, document: &Document, georef: &Georef) -> DAffine2 {
        self.effective_geodata(document, georef)
            .crs_transformation_matrix()
    }

    fn agrees_with(&self, geodata: &GeoData, georef: &Georef) -> bool {
        let Ok(info) = definition::parse(&geodata.coordinate_system_definition) else {
            return false;
        };
        if info.epsg != georef.crs {
            return false;
        }
        let design = geodata.design_point.truncate().as_vec2();
        if !design.abs_diff_eq(georef.design_point.as_vec2(), DESIGN_TOLERANCE) {
            return false;
        }
        let rotation_delta = angle_delta(geodata.rotation_radians(), self.rotation_radians);
        if rotation_delta > ROTATION_TOLERANCE {
            return false;
        }
        geodata
            .reference_point
            .truncate()
            .as_vec2()
            .abs_diff_eq(self.projected_anchor, PROJECTED_TOLERANCE)
    }
}

/// 两个角之间的最小差值（弧度）。
fn angle_delta(a: f64, b: f64) -> f64 {
    let delta = (a - b).rem_euclid(std::f64::consts::TAU);
    delta.min(std::f64::consts::TAU - delta)
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinateTransformer<'a> {
    registry: &'a CrsRegistry,
}

impl<'a> CoordinateTransformer<'a> {
    pub fn new(registry: &'a CrsRegistry) -> Self {
        Self { registry }
    }

    /// 构造经纬度 ↔ 投影坐标的转换，并把锚点投影到 `crs`。
    pub fn build(&self, georef: &Georef) -> Result<Transforms, EngineError> {
        let projection = self.registry.projection(georef.crs)?;
        let projected_anchor = projection.project(georef.anchor)?;
        Ok(Transforms {
            projection,
            projected_anchor,
            rotation_radians: georef.rotation.to_radians(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocad_core::geometry::Point2;

    fn georef(rotation: f64) -> Georef {
        Georef {
            crs: 32633,
            anchor: GeoPoint::new(12.0, 42.0),
            design_point: Point2::new(100.0, 50.0),
            rotation,
        }
    }

    #[test]
    fn synthesized_geodata_maps_design_point_to_anchor() {
        let registry = CrsRegistry::new();
        let georef = georef(30.0);
        let transforms = CoordinateTransformer::new(&registry)
            .build(&georef)
            .expect("构造转换失败");
        let geodata = transforms.synthesize_geodata(&georef);

        assert!((geodata.rotation_degrees() - 30.0).abs() < 1e-9);
        let matrix = geodata.crs_transformation_matrix();
        let projected = matrix.transform_point2(DVec2::new(100.0, 50.0));
        let world = transforms.to_world(projected).expect("反算失败");
        assert!((world.longitude - 12.0).abs() < 1e-8);
        assert!((world.latitude - 42.0).abs() < 1e-8);
    }

    #[test]
    fn rotation_recovers_for_all_whole_degrees() {
        let registry = CrsRegistry::new();
        for degrees in (0..360).step_by(15) {
            let georef = georef(f64::from(degrees));
            let transforms = CoordinateTransformer::new(&registry)
                .build(&georef)
                .expect("构造转换失败");
            let recovered = transforms
                .synthesize_geodata(&georef)
                .rotation_degrees()
                .rem_euclid(360.0);
            let delta = (recovered - f64::from(degrees)).abs();
            assert!(delta < 1e-9 || (360.0 - delta) < 1e-9, "旋转角 {degrees} 恢复为 {recovered}");
        }
    }

    #[test]
    fn stale_document_geodata_is_replaced() {
        let registry = CrsRegistry::new();
        let georef = georef(0.0);
        let transforms = CoordinateTransformer::new(&registry)
            .build(&georef)
            .expect("构造转换失败");

        let mut document = Document::new();
        let mut stale = transforms.synthesize_geodata(&georef);
        stale.reference_point = Point3::new(0.0, 0.0, 0.0);
        document.set_geodata(stale);
        let effective = transforms.effective_geodata(&document, &georef);
        assert!((effective.reference_point.x() - transforms.projected_anchor.x).abs() < 1e-9);

        let mut scaled = transforms.synthesize_geodata(&georef);
        scaled.horizontal_unit_scale = 0.001;
        document.set_geodata(scaled);
        let effective = transforms.effective_geodata(&document, &georef);
        assert!((effective.horizontal_unit_scale - 0.001).abs() < 1e-12);
    }

    #[test]
    fn unknown_crs_fails_to_build() {
        let registry = CrsRegistry::new();
        let mut georef = georef(0.0);
        georef.crs = 1;
        let err = CoordinateTransformer::new(&registry)
            .build(&georef)
            .expect_err("未知坐标系应报错");
        assert!(matches!(err, EngineError::UnknownCrs(1)));
    }
}
