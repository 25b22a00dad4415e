//! EPSG 代码到坐标参考系的登记表，以及基于 `proj4rs` 的经纬度 ↔ 投影坐标转换。

use std::collections::BTreeMap;
use std::fmt;

use glam::DVec2;
use proj4rs::Proj;
use tracing::debug;

use crate::errors::EngineError;
use crate::records::GeoPoint;

pub const WGS84: u32 = 4326;

const WGS84_PROJ: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// EPSG 代码到坐标参考系的登记表：配置中追加的 proj 字符串优先，其余查 proj4rs 自带的 EPSG 库。
#[derive(Debug, Clone, Default)]
pub struct CrsRegistry {
    custom: BTreeMap<u32, String>,
}

impl CrsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions<I, S>(definitions: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (code, proj) in definitions {
            registry.register(code, proj);
        }
        registry
    }

    /// 追加或覆盖一个定义。
    pub fn register(&mut self, code: u32, proj: impl Into<String>) {
        self.custom.insert(code, proj.into());
    }

    pub fn contains(&self, code: u32) -> bool {
        self.custom.contains_key(&code) || epsg_database(code).is_ok()
    }

    /// 构造 WGS 84 经纬度与 `code` 之间的双向转换。
    pub fn projection(&self, code: u32) -> Result<Projection, EngineError> {
        let target = match self.custom.get(&code) {
            Some(proj) => {
                debug!(epsg = code, proj = %proj, "使用配置中的坐标系定义");
                Proj::from_proj_string(proj).map_err(|err| EngineError::Projection {
                    code,
                    message: format!("{err:?}"),
                })?
            }
            None => epsg_database(code)?,
        };
        Projection::new(code, target)
    }
}

/// 库中没有的代码（含超出 u16 的代码）报告为 `UnknownCrs`。
fn epsg_database(code: u32) -> Result<Proj, EngineError> {
    let short = u16::try_from(code).map_err(|_| EngineError::UnknownCrs(code))?;
    Proj::from_epsg_code(short).map_err(|err| {
        debug!(epsg = code, error = ?err, "EPSG 库中没有可用定义");
        EngineError::UnknownCrs(code)
    })
}

/// WGS 84 经纬度（度）与某一坐标系之间的转换，始终按 x/经度在前的轴序。
pub struct Projection {
    code: u32,
    geographic: bool,
    wgs84: Proj,
    target: Proj,
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("code", &self.code)
            .field("geographic", &self.geographic)
            .finish()
    }
}

impl Projection {
    fn new(code: u32, target: Proj) -> Result<Self, EngineError> {
        let wgs84 = Proj::from_proj_string(WGS84_PROJ).map_err(|err| EngineError::Projection {
            code: WGS84,
            message: format!("{err:?}"),
        })?;
        Ok(Self {
            code,
            // 地理坐标系的输入输出为度，proj4rs 内部使用弧度
            geographic: target.is_latlong(),
            wgs84,
            target,
        })
    }

    #[inline]
    pub fn code(&self) -> u32 {
        self.code
    }

    /// 经纬度 → 投影坐标。
    pub fn project(&self, point: GeoPoint) -> Result<DVec2, EngineError> {
        let mut coords = (point.longitude.to_radians(), point.latitude.to_radians(), 0.0);
        proj4rs::transform::transform(&self.wgs84, &self.target, &mut coords).map_err(|err| {
            EngineError::Projection {
                code: self.code,
                message: format!("{err:?}"),
            }
        })?;
        let projected = if self.geographic {
            DVec2::new(coords.0.to_degrees(), coords.1.to_degrees())
        } else {
            DVec2::new(coords.0, coords.1)
        };
        check_finite(self.code, projected)
    }

    /// 投影坐标 → 经纬度。
    pub fn unproject(&self, point: DVec2) -> Result<GeoPoint, EngineError> {
        let mut coords = if self.geographic {
            (point.x.to_radians(), point.y.to_radians(), 0.0)
        } else {
            (point.x, point.y, 0.0)
        };
        proj4rs::transform::transform(&self.target, &self.wgs84, &mut coords).map_err(|err| {
            EngineError::Projection {
                code: self.code,
                message: format!("{err:?}"),
            }
        })?;
        let geographic = check_finite(
            self.code,
            DVec2::new(coords.0.to_degrees(), coords.1.to_degrees()),
        )?;
        Ok(GeoPoint::new(geographic.x, geographic.y))
    }
}

fn check_finite(code: u32, point: DVec2) -> Result<DVec2, EngineError> {
    if point.is_finite() {
        Ok(point)
    } else {
        Err(EngineError::Projection {
            code,
            message: "转换结果不是有限数".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epsg_database_covers_utm_and_national_grids() {
        let registry = CrsRegistry::new();
        for code in [32633, 32733, 25832, 3004, WGS84] {
            assert!(registry.contains(code), "缺少 EPSG:{code}");
        }

        let south = registry.projection(32733).expect("构造投影失败");
        let projected = south.project(GeoPoint::new(15.0, -10.0)).expect("正算失败");
        assert!((projected.x - 500_000.0).abs() < 1e-3);
        assert!(projected.y > 8_000_000.0);
    }

    #[test]
    fn geographic_crs_keeps_degrees() {
        let projection = CrsRegistry::new().projection(WGS84).expect("构造投影失败");
        let projected = projection
            .project(GeoPoint::new(12.0, 42.0))
            .expect("正算失败");
        assert!((projected.x - 12.0).abs() < 1e-9);
        assert!((projected.y - 42.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_code_is_reported() {
        let registry = CrsRegistry::new();
        for code in [999_999, 65_000] {
            let err = registry.projection(code).expect_err("未知坐标系应报错");
            assert!(matches!(err, EngineError::UnknownCrs(found) if found == code));
            assert!(!registry.contains(code));
        }
    }

    #[test]
    fn custom_definition_overrides_registry() {
        let registry = CrsRegistry::with_definitions([(
            3003,
            "+proj=tmerc +lon_0=9 +k=0.9996 +x_0=1500000 +ellps=intl +units=m +no_defs",
        )]);
        assert!(registry.contains(3003));
        let projected = registry
            .projection(3003)
            .expect("构造投影失败")
            .project(GeoPoint::new(9.0, 0.0))
            .expect("正算失败");
        assert!((projected.x - 1_500_000.0).abs() < 1e-3);
    }

    #[test]
    fn utm_projection_round_trips() {
        let projection = CrsRegistry::new().projection(32633).expect("构造投影失败");
        let anchor = GeoPoint::new(12.0, 42.0);
        let projected = projection.project(anchor).expect("正算失败");
        // 33 带中央经线为 15°，12°E 位于其西侧
        assert!(projected.x < 500_000.0);
        assert!(projected.y > 4_600_000.0 && projected.y < 4_700_000.0);

        let back = projection.unproject(projected).expect("反算失败");
        assert!((back.longitude - 12.0).abs() < 1e-7);
        assert!((back.latitude - 42.0).abs() < 1e-7);
    }

    #[test]
    fn central_meridian_maps_to_false_easting() {
        let projection = CrsRegistry::new().projection(32633).expect("构造投影失败");
        let projected = projection
            .project(GeoPoint::new(15.0, 0.0))
            .expect("正算失败");
        assert!((projected.x - 500_000.0).abs() < 1e-3);
        assert!(projected.y.abs() < 1e-3);
    }
}
