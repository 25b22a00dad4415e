use std::collections::BTreeSet;

use crate::records::GeoPoint;

/// 经纬度范围（度）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaOfInterest {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl AreaOfInterest {
    /// 左下角与右上角重合的退化范围。
    pub fn point(point: GeoPoint) -> Self {
        Self {
            west: point.longitude,
            south: point.latitude,
            east: point.longitude,
            north: point.latitude,
        }
    }
}

/// 查询覆盖某一范围的 UTM 坐标系，结果按优先顺序返回 EPSG 代码。
pub trait UtmZoneLookup: Send + Sync {
    fn query(&self, area: &AreaOfInterest) -> Vec<u32>;
}

/// WGS 84 / UTM 分带（EPSG 326xx 北半球，327xx 南半球），包含挪威与斯瓦尔巴的特例。
#[derive(Debug, Default, Clone, Copy)]
pub struct WgsUtmZones;

const MIN_LATITUDE: f64 = -80.0;
const MAX_LATITUDE: f64 = 84.0;

impl UtmZoneLookup for WgsUtmZones {
    fn query(&self, area: &AreaOfInterest) -> Vec<u32> {
        if area.north < MIN_LATITUDE || area.south > MAX_LATITUDE || area.west > area.east {
            return Vec::new();
        }
        let south = area.south.max(MIN_LATITUDE);
        let north = area.north.min(MAX_LATITUDE);

        let mut zones = BTreeSet::new();
        for latitude in sample(south, north, 1.0) {
            for longitude in sample(area.west, area.east, 1.0) {
                zones.insert(zone_number(longitude, latitude));
            }
        }

        let mut codes = Vec::with_capacity(zones.len() * 2);
        if north >= 0.0 {
            codes.extend(zones.iter().map(|zone| 32600 + zone));
        }
        if south < 0.0 {
            codes.extend(zones.iter().map(|zone| 32700 + zone));
        }
        codes
    }
}

/// 在闭区间内按步长取样，总是包含两个端点。
fn sample(start: f64, end: f64, step: f64) -> Vec<f64> {
    let mut values = vec![start];
    let mut current = start + step;
    while current < end {
        values.push(current);
        current += step;
    }
    if end > start {
        values.push(end);
    }
    values
}

pub fn zone_number(longitude: f64, latitude: f64) -> u32 {
    let longitude = if longitude >= 180.0 { longitude - 360.0 } else { longitude };
    if (56.0..64.0).contains(&latitude) && (3.0..12.0).contains(&longitude) {
        return 32;
    }
    if (72.0..=MAX_LATITUDE).contains(&latitude) && (0.0..42.0).contains(&longitude) {
        return match longitude {
            lon if lon < 9.0 => 31,
            lon if lon < 21.0 => 33,
            lon if lon < 33.0 => 35,
            _ => 37,
        };
    }
    let zone = ((longitude + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_italy_is_zone_33_north() {
        let zones = WgsUtmZones.query(&AreaOfInterest::point(GeoPoint::new(12.0, 42.0)));
        assert_eq!(zones, [32633]);
    }

    #[test]
    fn southern_hemisphere_uses_327xx() {
        let zones = WgsUtmZones.query(&AreaOfInterest::point(GeoPoint::new(151.2, -33.9)));
        assert_eq!(zones, [32756]);
    }

    #[test]
    fn norway_and_svalbard_exceptions() {
        assert_eq!(zone_number(5.0, 60.0), 32);
        assert_eq!(zone_number(2.0, 60.0), 31);
        assert_eq!(zone_number(10.0, 78.0), 33);
        assert_eq!(zone_number(25.0, 78.0), 35);
        assert_eq!(zone_number(40.0, 78.0), 37);
    }

    #[test]
    fn wide_area_lists_zones_west_to_east() {
        let area = AreaOfInterest {
            west: 5.0,
            south: 44.0,
            east: 14.0,
            north: 46.0,
        };
        assert_eq!(WgsUtmZones.query(&area), [32631, 32632, 32633]);
    }

    #[test]
    fn polar_points_have_no_zone() {
        let zones = WgsUtmZones.query(&AreaOfInterest::point(GeoPoint::new(0.0, 88.0)));
        assert!(zones.is_empty());
    }

    #[test]
    fn antimeridian_maps_to_last_zone() {
        assert_eq!(zone_number(180.0, 0.0), 1);
        assert_eq!(zone_number(179.9, 0.0), 60);
    }
}
